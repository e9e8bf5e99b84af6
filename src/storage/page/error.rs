use thiserror::Error;
use crate::transaction::wal::log_manager::LogManagerError;

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Not enough space in page")]
    InsufficientSpace,
    #[error("Invalid slot number")]
    InvalidSlot,
    #[error("Tuple not found or deleted")]
    TupleNotFound,
    #[error("Failed to acquire row lock")]
    LockFailed,
    #[error("WAL error: {0}")]
    WalError(#[from] LogManagerError),
}
