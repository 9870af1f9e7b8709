use crate::storage::Device;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// TTL cache for the per-user active-device listing.
///
/// Key scheme: owner principal id -> device list. Entries age out after the
/// configured TTL and are dropped synchronously by the mutating operations
/// (confirm, revoke) through invalidate, so a stale listing never outlives
/// the write that changed it.
pub struct DeviceListCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    stored_at: Instant,
    devices: Vec<Device>,
}

impl DeviceListCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, owner_id: &str) -> Option<Vec<Device>> {
        let mut entries = self.entries.lock().expect("device cache poisoned");
        match entries.get(owner_id) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.devices.clone()),
            Some(_) => {
                entries.remove(owner_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, owner_id: &str, devices: Vec<Device>) {
        let mut entries = self.entries.lock().expect("device cache poisoned");
        entries.insert(
            owner_id.to_string(),
            CacheEntry {
                stored_at: Instant::now(),
                devices,
            },
        );
    }

    pub fn invalidate(&self, owner_id: &str) {
        let mut entries = self.entries.lock().expect("device cache poisoned");
        entries.remove(owner_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            device_code: format!("code-{id}"),
            user_code: "BCDF-GHJK".to_string(),
            device_name: "laptop".to_string(),
            device_type: "vscode-extension".to_string(),
            device_id: format!("client-{id}"),
            owner_id: Some("user-1".to_string()),
            owner_email: Some("u1@example.com".to_string()),
            status: "approved".to_string(),
            session_issued: 0,
            expires_at: 0,
            last_seen_at: None,
            active: 1,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = DeviceListCache::new(Duration::from_secs(30));

        assert!(cache.get("user-1").is_none());

        cache.put("user-1", vec![device("a")]);
        let hit = cache.get("user-1").expect("expected cache hit");
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].id, "a");

        cache.invalidate("user-1");
        assert!(cache.get("user-1").is_none());
    }

    #[test]
    fn test_entries_age_out() {
        let cache = DeviceListCache::new(Duration::ZERO);

        cache.put("user-1", vec![device("a")]);
        // Zero TTL: the entry is stale the moment it lands
        assert!(cache.get("user-1").is_none());
    }

    #[test]
    fn test_keys_are_independent() {
        let cache = DeviceListCache::new(Duration::from_secs(30));

        cache.put("user-1", vec![device("a")]);
        cache.put("user-2", vec![device("b")]);
        cache.invalidate("user-1");

        assert!(cache.get("user-1").is_none());
        assert!(cache.get("user-2").is_some());
    }
}
