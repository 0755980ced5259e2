use ethereum_types::H256;
use hexary_rlp::error::RLPDecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrieError {
    #[error("Inconsistent internal tree structure: missing node {0:#x}")]
    MissingNode(H256),
    #[error("Corrupt node encoding: {0}")]
    CorruptNode(#[from] RLPDecodeError),
    #[error("Cannot insert or remove an empty key")]
    EmptyKey,
    #[error("Lock Error: Panicked when trying to acquire a lock")]
    LockError,
    #[error("Database error: {0}")]
    DbError(anyhow::Error),
}
