//! SeaORM-based database access
//!
//! Supports SQLite (including `sqlite::memory:`) and PostgreSQL. The job
//! table schema is owned by the embedded migrations.

use sea_orm::{ConnectOptions, Database as SeaOrmDatabase, DatabaseBackend, DatabaseConnection};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::config::defaults::DEFAULT_MAX_CONNECTIONS;
use crate::errors::{AppError, AppResult, RepositoryError};

pub mod migrations;
pub mod repositories;
pub mod retry;

use repositories::GenerationJobSeaOrmRepository;

/// Database connection manager
#[derive(Clone)]
pub struct Database {
    connection: Arc<DatabaseConnection>,
    backend: DatabaseBackend,
    database_type: DatabaseType,
    /// SQLite only: serializes writes issued through this connection pool
    write_lock: Option<Arc<Mutex<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    SQLite,
    PostgreSQL,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::SQLite => "SQLite",
            DatabaseType::PostgreSQL => "PostgreSQL",
        }
    }
}

impl Database {
    /// Connect using `config`, creating the SQLite file when missing
    pub async fn new(config: &DatabaseConfig) -> AppResult<Self> {
        let database_type = Self::detect_database_type(&config.url)?;
        let backend = match database_type {
            DatabaseType::SQLite => DatabaseBackend::Sqlite,
            DatabaseType::PostgreSQL => DatabaseBackend::Postgres,
        };

        info!("Connecting to {} database", database_type.as_str());

        let in_memory = Self::is_in_memory(&config.url);
        let connection_url = match database_type {
            DatabaseType::SQLite => Self::ensure_sqlite_auto_creation(&config.url)?,
            DatabaseType::PostgreSQL => config.url.clone(),
        };

        let mut connect_options = ConnectOptions::new(connection_url);
        if in_memory {
            // every pooled connection would otherwise open its own empty database
            connect_options.max_connections(1).min_connections(1);
        } else {
            connect_options
                .max_connections(config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
                .min_connections(1)
                .idle_timeout(Duration::from_secs(600))
                .max_lifetime(Duration::from_secs(1800));
        }
        connect_options
            .connect_timeout(Duration::from_secs(5))
            .acquire_timeout(Duration::from_secs(30))
            .sqlx_logging_level(tracing::log::LevelFilter::Debug);

        let connection = match SeaOrmDatabase::connect(connect_options).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("Database connection failed: {:?}", e);
                let mut source = e.source();
                let mut level = 0;
                while let Some(err) = source {
                    tracing::error!("  Level {}: {}", level, err);
                    source = err.source();
                    level += 1;
                }
                return Err(RepositoryError::ConnectionFailed {
                    message: format!("failed to connect to '{}': {}", config.url, e),
                }
                .into());
            }
        };

        debug!("Database connection established successfully");

        let write_lock = match database_type {
            DatabaseType::SQLite => Some(Arc::new(Mutex::new(()))),
            DatabaseType::PostgreSQL => None,
        };

        Ok(Self {
            connection: Arc::new(connection),
            backend,
            database_type,
            write_lock,
        })
    }

    fn detect_database_type(url: &str) -> AppResult<DatabaseType> {
        if url.starts_with("sqlite:") {
            Ok(DatabaseType::SQLite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(DatabaseType::PostgreSQL)
        } else {
            Err(AppError::configuration(format!(
                "Unsupported database URL format: {url}"
            )))
        }
    }

    fn is_in_memory(url: &str) -> bool {
        url.contains(":memory:") || url.contains("mode=memory")
    }

    /// Add `mode=rwc` to file-backed SQLite URLs whose file does not exist yet
    fn ensure_sqlite_auto_creation(url: &str) -> AppResult<String> {
        if url.contains("mode=") || url.contains(":memory:") {
            return Ok(url.to_string());
        }

        let file_path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .ok_or_else(|| AppError::configuration(format!("Invalid SQLite URL format: {url}")))?;
        let file_path = file_path.split('?').next().unwrap_or(file_path);

        let path = Path::new(file_path);
        if path.exists() {
            debug!("SQLite database file already exists: {}", file_path);
            return Ok(url.to_string());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::configuration(format!(
                        "Failed to create directory for SQLite database {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
                info!("Created directory for SQLite database: {}", parent.display());
            }
        }

        let separator = if url.contains('?') { '&' } else { '?' };
        Ok(format!("{url}{separator}mode=rwc"))
    }

    /// Run the embedded migrations
    pub async fn migrate(&self) -> AppResult<()> {
        use migrations::Migrator;
        use sea_orm_migration::MigratorTrait;

        info!(
            "Running database migrations for {}",
            self.database_type.as_str()
        );

        Migrator::up(&*self.connection, None)
            .await
            .map_err(|e| RepositoryError::MigrationFailed {
                message: e.to_string(),
            })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn connection(&self) -> Arc<DatabaseConnection> {
        self.connection.clone()
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    /// Durable job store over this connection
    pub fn job_repository(&self) -> GenerationJobSeaOrmRepository {
        GenerationJobSeaOrmRepository::new(self.connection(), self.write_lock.clone())
    }
}
