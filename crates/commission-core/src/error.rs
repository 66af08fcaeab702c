use thiserror::Error;
use uuid::Uuid;

/// Infrastructure faults raised by a commission store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("commission store unavailable: {0}")]
    Unavailable(String),

    #[error("commission store backend error: {0}")]
    Backend(String),

    #[error("corrupt {entity} row {id}: {message}")]
    Corrupt {
        entity: &'static str,
        id: Uuid,
        message: String,
    },

    #[error("{entity} {id} already exists")]
    Conflict { entity: &'static str, id: Uuid },
}

#[derive(Debug, Error)]
pub enum CommissionError {
    #[error("invalid commission: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
