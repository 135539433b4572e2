use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::embedder::EmbedderError;
use crate::schema::SchemaError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fatal errors. Inference gaps (unmappable storage types, failed joins,
/// columns without a statistical type) are never reported through this type:
/// they are logged and recorded in a [`BuildReport`](crate::builder::BuildReport).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Embedder(#[from] EmbedderError),

    #[error("column {table}.{column}: {reason}")]
    Convert {
        table: String,
        column: String,
        reason: String,
    },

    #[error("malformed file {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },
}
