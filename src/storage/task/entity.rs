use sea_orm::entity::prelude::*;
use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub seq: i64,        // insertion order, drives "oldest first"
    #[sea_orm(unique)]
    pub task_id: String,
    pub task_type: String,
    pub status: String,
    pub progress: i32,
    pub payload: String,  // JSON text
    pub result: Option<String>,  // JSON text
    pub depends_on: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
