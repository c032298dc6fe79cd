//! Create the newsletter_generations table
//!
//! Holds generation jobs and their progress. The `status` column is the
//! legacy mirror of `job_status` kept for older consumers.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // SQLite only auto-increments an INTEGER primary key, which is 64-bit there
        let mut id = ColumnDef::new(NewsletterGenerations::Id);
        match manager.get_database_backend() {
            DatabaseBackend::Sqlite => id.integer(),
            _ => id.big_integer(),
        };
        id.not_null().auto_increment().primary_key();

        manager
            .create_table(
                Table::create()
                    .table(NewsletterGenerations::Table)
                    .if_not_exists()
                    .col(&mut id)
                    .col(
                        ColumnDef::new(NewsletterGenerations::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(NewsletterGenerations::JobStatus)
                            .string()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(NewsletterGenerations::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(NewsletterGenerations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(NewsletterGenerations::Prompt).text().not_null())
                    .col(ColumnDef::new(NewsletterGenerations::TraceId).string().null())
                    .col(ColumnDef::new(NewsletterGenerations::Output).text().null())
                    .col(ColumnDef::new(NewsletterGenerations::Error).text().null())
                    .col(ColumnDef::new(NewsletterGenerations::CurrentStep).string().null())
                    .col(
                        ColumnDef::new(NewsletterGenerations::Progress)
                            .text()
                            .not_null()
                            .default("{\"logs\":[],\"metadata\":{}}"),
                    )
                    .col(
                        ColumnDef::new(NewsletterGenerations::LastHeartbeat)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NewsletterGenerations::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NewsletterGenerations::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // dequeue scan: queued rows by priority then age
        manager
            .create_index(
                Index::create()
                    .name("idx_newsletter_generations_queue")
                    .table(NewsletterGenerations::Table)
                    .col(NewsletterGenerations::JobStatus)
                    .col(NewsletterGenerations::Priority)
                    .col(NewsletterGenerations::CreatedAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(NewsletterGenerations::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum NewsletterGenerations {
    Table,
    Id,
    Status,
    JobStatus,
    Priority,
    CreatedAt,
    Prompt,
    TraceId,
    Output,
    Error,
    CurrentStep,
    Progress,
    LastHeartbeat,
    ProcessedAt,
    CompletedAt,
}
