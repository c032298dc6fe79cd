//! `newsletter_generations` table

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "newsletter_generations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Legacy free-text mirror of `job_status`
    pub status: String,
    pub job_status: String,
    pub priority: i32,
    pub created_at: DateTimeUtc,
    #[sea_orm(column_type = "Text")]
    pub prompt: String,
    pub trace_id: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub output: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,
    pub current_step: Option<String>,
    /// JSON-encoded `{ logs, metadata }`
    #[sea_orm(column_type = "Text")]
    pub progress: String,
    pub last_heartbeat: Option<DateTimeUtc>,
    pub processed_at: Option<DateTimeUtc>,
    pub completed_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
