use crate::entities;
use crate::errors::LodestarError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use rand::{Rng, RngCore};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub device_code: String,
    pub user_code: String,
    pub device_name: String,
    pub device_type: String,
    pub device_id: String,
    pub owner_id: Option<String>,
    pub owner_email: Option<String>,
    pub status: String, // "pending" | "approved" | "expired" | "revoked"
    pub session_issued: i64,
    pub expires_at: i64,
    pub last_seen_at: Option<i64>,
    pub active: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<entities::device::Model> for Device {
    fn from(m: entities::device::Model) -> Self {
        Device {
            id: m.id,
            device_code: m.device_code,
            user_code: m.user_code,
            device_name: m.device_name,
            device_type: m.device_type,
            device_id: m.device_id,
            owner_id: m.owner_id,
            owner_email: m.owner_email,
            status: m.status,
            session_issued: m.session_issued,
            expires_at: m.expires_at,
            last_seen_at: m.last_seen_at,
            active: m.active,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, LodestarError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

/// Create a pending device authorization record
pub async fn create_device(
    db: &DatabaseConnection,
    device_name: &str,
    device_type: &str,
    device_id: &str,
    ttl_secs: i64,
) -> Result<Device, LodestarError> {
    let id = random_id();
    let device_code = random_id();
    let user_code = generate_user_code();
    let now = Utc::now().timestamp();
    let expires_at = now + ttl_secs;

    let device = entities::device::ActiveModel {
        id: Set(id.clone()),
        device_code: Set(device_code.clone()),
        user_code: Set(user_code.clone()),
        device_name: Set(device_name.to_string()),
        device_type: Set(device_type.to_string()),
        device_id: Set(device_id.to_string()),
        owner_id: Set(None),
        owner_email: Set(None),
        status: Set("pending".to_string()),
        session_issued: Set(0),
        expires_at: Set(expires_at),
        last_seen_at: Set(None),
        active: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    };

    device.insert(db).await?;

    Ok(Device {
        id,
        device_code,
        user_code,
        device_name: device_name.to_string(),
        device_type: device_type.to_string(),
        device_id: device_id.to_string(),
        owner_id: None,
        owner_email: None,
        status: "pending".to_string(),
        session_issued: 0,
        expires_at,
        last_seen_at: None,
        active: 0,
        created_at: now,
        updated_at: now,
    })
}

pub async fn get_device_by_code(
    db: &DatabaseConnection,
    device_code: &str,
) -> Result<Option<Device>, LodestarError> {
    use entities::device::{Column, Entity};

    let model = Entity::find()
        .filter(Column::DeviceCode.eq(device_code))
        .one(db)
        .await?;

    Ok(model.map(Device::from))
}

pub async fn get_device_by_id(
    db: &DatabaseConnection,
    id: &str,
) -> Result<Option<Device>, LodestarError> {
    use entities::device::{Column, Entity};

    let model = Entity::find().filter(Column::Id.eq(id)).one(db).await?;

    Ok(model.map(Device::from))
}

/// Flip a pending record past its deadline to expired.
///
/// Guarded on status so terminal records are never resurrected; returns
/// whether this call performed the flip.
pub async fn expire_device(
    db: &DatabaseConnection,
    device_code: &str,
) -> Result<bool, LodestarError> {
    use entities::device::{Column, Entity};

    let now = Utc::now().timestamp();

    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value("expired"))
        .col_expr(Column::Active, Expr::value(0))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::DeviceCode.eq(device_code))
        .filter(Column::Status.eq("pending"))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// Approve a pending device code, binding it to the approving user.
///
/// Conditional update: only a record that is still pending and inside its
/// deadline is written, so of two concurrent approvals at most one wins.
pub async fn approve_device(
    db: &DatabaseConnection,
    device_code: &str,
    owner_id: &str,
    owner_email: &str,
) -> Result<bool, LodestarError> {
    use entities::device::{Column, Entity};

    let now = Utc::now().timestamp();

    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value("approved"))
        .col_expr(Column::OwnerId, Expr::value(owner_id))
        .col_expr(Column::OwnerEmail, Expr::value(owner_email))
        .col_expr(Column::Active, Expr::value(1))
        .col_expr(Column::LastSeenAt, Expr::value(now))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::DeviceCode.eq(device_code))
        .filter(Column::Status.eq("pending"))
        .filter(Column::ExpiresAt.gt(now))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// Mark the one-time session hand-out on an approved record.
///
/// Conditional update on session_issued = 0: only the first poll after
/// approval wins, every later poll sees the record as already claimed.
pub async fn claim_session(
    db: &DatabaseConnection,
    device_code: &str,
) -> Result<bool, LodestarError> {
    use entities::device::{Column, Entity};

    let now = Utc::now().timestamp();

    let result = Entity::update_many()
        .col_expr(Column::SessionIssued, Expr::value(1))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::DeviceCode.eq(device_code))
        .filter(Column::Status.eq("approved"))
        .filter(Column::SessionIssued.eq(0))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// Revoke an approved device. Ownership is checked by the caller;
/// revocation keeps owner_id so the audit trail survives.
pub async fn revoke_device(db: &DatabaseConnection, id: &str) -> Result<bool, LodestarError> {
    use entities::device::{Column, Entity};

    let now = Utc::now().timestamp();

    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value("revoked"))
        .col_expr(Column::Active, Expr::value(0))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::Id.eq(id))
        .filter(Column::Status.eq("approved"))
        .exec(db)
        .await?;

    Ok(result.rows_affected == 1)
}

/// List a user's approved devices, refreshing last_seen_at on the way out
pub async fn list_active_devices(
    db: &DatabaseConnection,
    owner_id: &str,
) -> Result<Vec<Device>, LodestarError> {
    use entities::device::{Column, Entity};

    let now = Utc::now().timestamp();

    Entity::update_many()
        .col_expr(Column::LastSeenAt, Expr::value(now))
        .filter(Column::OwnerId.eq(owner_id))
        .filter(Column::Status.eq("approved"))
        .exec(db)
        .await?;

    let models = Entity::find()
        .filter(Column::OwnerId.eq(owner_id))
        .filter(Column::Status.eq("approved"))
        .order_by_desc(Column::CreatedAt)
        .all(db)
        .await?;

    Ok(models.into_iter().map(Device::from).collect())
}

pub async fn has_active_devices(
    db: &DatabaseConnection,
    owner_id: &str,
) -> Result<bool, LodestarError> {
    use entities::device::{Column, Entity};

    let count = Entity::find()
        .filter(Column::OwnerId.eq(owner_id))
        .filter(Column::Status.eq("approved"))
        .count(db)
        .await?;

    Ok(count > 0)
}

/// Delete device records whose deadline passed more than the retention
/// margin ago. Plain delete-by-predicate, safe next to any other operation.
pub async fn cleanup_expired_devices(
    db: &DatabaseConnection,
    retention_margin_secs: i64,
) -> Result<u64, LodestarError> {
    use entities::device::{Column, Entity};

    let cutoff = Utc::now().timestamp() - retention_margin_secs;

    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lt(cutoff))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

/// Generate 8-character base-20 user code in format XXXX-XXXX
/// Alphabet: BCDFGHJKLMNPQRSTVWXZ (consonants only, no ambiguous chars)
/// Entropy: 20^8 = ~43 bits
fn generate_user_code() -> String {
    const ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(9);

    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rng.gen_range(0..ALPHABET.len());
        code.push(ALPHABET[idx] as char);
    }

    code
}
