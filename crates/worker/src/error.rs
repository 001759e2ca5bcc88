//! Worker startup and runtime errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("saga setup failed: {0}")]
    Saga(#[from] saga::SagaError),

    #[error("sweeper task failed: {0}")]
    Sweeper(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
