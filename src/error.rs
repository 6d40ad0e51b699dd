use thiserror::Error;

/// Result alias for every store operation.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the device, recording, ledger and detection stores.
///
/// `DuplicateDevice`, `InvalidTransition`, `NotUploaded` and `NotFound` are
/// rejections of the caller's request and never leave a partial write behind.
/// `Conflict` means a concurrent writer won the optimistic version check more
/// often than the retry budget allows; the caller may simply try again.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device already registered: {0}")]
    DuplicateDevice(String),

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("concurrent update conflict on recording {0}")]
    Conflict(i64),

    #[error("recording {0} has not been uploaded and cannot be deleted locally")]
    NotUploaded(i64),

    #[error("unknown {kind} value: {value:?}")]
    UnknownValue { kind: &'static str, value: String },

    #[error("setting {key} does not have the expected shape: {source}")]
    SettingShape {
        key: String,
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}
