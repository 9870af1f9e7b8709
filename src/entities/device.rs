use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "devices")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
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

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
