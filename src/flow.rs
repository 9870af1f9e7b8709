use crate::cache::DeviceListCache;
use crate::errors::LodestarError;
use crate::settings::DeviceAuth as DeviceAuthCfg;
use crate::storage::{self, Device};
use crate::token::TokenCodec;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

/// What a poll with a device code can come back with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not approved yet; keep polling at the returned interval
    Pending,
    /// Approved and this poll won the one-time session hand-out
    Approved { access_token: String },
    /// Approved, but a session was already handed out for this code
    Claimed,
    Expired,
    NotFound,
}

/// Everything the unattended client needs to start the flow
#[derive(Debug, Clone)]
pub struct DeviceGrant {
    pub device_code: String,
    pub user_code: String,
    pub verification_url: String,
    pub expires_in: i64,
    pub interval: u64,
}

/// Orchestrates the device authorization flow: the registry in storage
/// holds the records, the codec mints sessions, the cache fronts the
/// listing read path.
#[derive(Clone)]
pub struct DeviceFlow {
    db: DatabaseConnection,
    codec: TokenCodec,
    cfg: DeviceAuthCfg,
    cache: Arc<DeviceListCache>,
}

impl DeviceFlow {
    pub fn new(db: DatabaseConnection, codec: TokenCodec, cfg: DeviceAuthCfg) -> Self {
        let cache = Arc::new(DeviceListCache::new(Duration::from_secs(cfg.cache_ttl_secs)));
        Self {
            db,
            codec,
            cfg,
            cache,
        }
    }

    /// Start the flow: create a pending record and hand the client its codes
    pub async fn initiate(
        &self,
        device_name: &str,
        device_type: &str,
        device_id: &str,
    ) -> Result<DeviceGrant, LodestarError> {
        let device = storage::create_device(
            &self.db,
            device_name,
            device_type,
            device_id,
            self.cfg.ttl_secs,
        )
        .await?;

        let verification_url = format!(
            "{}/auth/device/confirm?code={}",
            self.cfg.verification_base_url.trim_end_matches('/'),
            device.device_code
        );

        tracing::info!(device = %device.id, device_type, "initiated device authorization");

        Ok(DeviceGrant {
            device_code: device.device_code,
            user_code: device.user_code,
            verification_url,
            expires_in: self.cfg.ttl_secs,
            interval: self.cfg.poll_interval_secs,
        })
    }

    /// Client-driven poll. An approved record hands out a session exactly
    /// once; the claim is a conditional update, so concurrent polls with a
    /// leaked device code cannot mint extra sessions.
    pub async fn poll(&self, device_code: &str) -> Result<PollOutcome, LodestarError> {
        let device = match storage::get_device_by_code(&self.db, device_code).await? {
            Some(d) => d,
            None => return Ok(PollOutcome::NotFound),
        };

        match device.status.as_str() {
            "pending" => {
                if Utc::now().timestamp() >= device.expires_at {
                    storage::expire_device(&self.db, device_code).await?;
                    Ok(PollOutcome::Expired)
                } else {
                    Ok(PollOutcome::Pending)
                }
            }
            "approved" => {
                if storage::claim_session(&self.db, device_code).await? {
                    let owner_id = device.owner_id.ok_or_else(|| {
                        LodestarError::Other("approved device has no owner".to_string())
                    })?;
                    let owner_email = device.owner_email.unwrap_or_default();
                    let access_token = self.codec.issue(&owner_id, &owner_email)?;
                    tracing::info!(device = %device.id, owner = %owner_id, "issued device session");
                    Ok(PollOutcome::Approved { access_token })
                } else {
                    Ok(PollOutcome::Claimed)
                }
            }
            "expired" => Ok(PollOutcome::Expired),
            // A revoked code is dead to the polling client
            _ => Ok(PollOutcome::NotFound),
        }
    }

    /// Approve a pending device code on behalf of an authenticated user
    pub async fn confirm(
        &self,
        device_code: &str,
        approver_id: &str,
        approver_email: &str,
    ) -> Result<Device, LodestarError> {
        let device = storage::get_device_by_code(&self.db, device_code)
            .await?
            .ok_or(LodestarError::NotFound)?;

        match device.status.as_str() {
            "pending" => {
                if Utc::now().timestamp() >= device.expires_at {
                    storage::expire_device(&self.db, device_code).await?;
                    return Err(LodestarError::Expired);
                }

                if storage::approve_device(&self.db, device_code, approver_id, approver_email)
                    .await?
                {
                    self.cache.invalidate(approver_id);
                    tracing::info!(device = %device.id, owner = %approver_id, "device approved");
                    storage::get_device_by_code(&self.db, device_code)
                        .await?
                        .ok_or(LodestarError::NotFound)
                } else {
                    // Lost the conditional update: either another approval
                    // won or the deadline passed in between
                    match storage::get_device_by_code(&self.db, device_code).await? {
                        Some(d) if d.status == "pending" => {
                            storage::expire_device(&self.db, device_code).await?;
                            Err(LodestarError::Expired)
                        }
                        Some(_) => Err(LodestarError::Conflict),
                        None => Err(LodestarError::NotFound),
                    }
                }
            }
            "expired" => Err(LodestarError::Expired),
            _ => Err(LodestarError::Conflict),
        }
    }

    /// Read-only status probe for the polling client
    pub async fn status(&self, device_code: &str) -> Result<String, LodestarError> {
        let device = match storage::get_device_by_code(&self.db, device_code).await? {
            Some(d) => d,
            None => return Ok("not_found".to_string()),
        };

        if device.status == "pending" && Utc::now().timestamp() >= device.expires_at {
            storage::expire_device(&self.db, device_code).await?;
            return Ok("expired".to_string());
        }

        Ok(device.status)
    }

    /// A user's approved devices, served through the listing cache
    pub async fn list_devices(&self, owner_id: &str) -> Result<Vec<Device>, LodestarError> {
        if let Some(devices) = self.cache.get(owner_id) {
            return Ok(devices);
        }

        let devices = storage::list_active_devices(&self.db, owner_id).await?;
        self.cache.put(owner_id, devices.clone());
        Ok(devices)
    }

    pub async fn has_active_devices(&self, owner_id: &str) -> Result<bool, LodestarError> {
        storage::has_active_devices(&self.db, owner_id).await
    }

    /// Revoke an approved device. Only its owner may do this; a mismatch
    /// leaves the record untouched.
    pub async fn revoke(&self, id: &str, requester_id: &str) -> Result<bool, LodestarError> {
        let device = storage::get_device_by_id(&self.db, id)
            .await?
            .ok_or(LodestarError::NotFound)?;

        if device.owner_id.as_deref() != Some(requester_id) {
            return Err(LodestarError::Forbidden);
        }

        let revoked = storage::revoke_device(&self.db, id).await?;
        if revoked {
            self.cache.invalidate(requester_id);
            tracing::info!(device = %id, owner = %requester_id, "device revoked");
        }
        Ok(revoked)
    }

    /// Retention sweep over records past their deadline
    pub async fn cleanup(&self) -> Result<u64, LodestarError> {
        let removed =
            storage::cleanup_expired_devices(&self.db, self.cfg.retention_margin_secs).await?;
        if removed > 0 {
            tracing::info!(removed, "cleaned up expired device codes");
        }
        Ok(removed)
    }
}
