//! MME error types

use thiserror::Error;

use crate::context::{Ebi, MmeUeS1apId, PdnCid};
use crate::path::PeerTask;

/// UE context store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
}

/// Bearer/PDN arena errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BearerError {
    #[error("Capacity exceeded")]
    CapacityExceeded,
    #[error("Invalid id: {0}")]
    InvalidId(String),
}

/// Session procedure errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid transport address length: {0}")]
    InvalidIpLength(usize),
    #[error("Too many bearers: {0}")]
    TooManyBearers(usize),
    #[error("No PDN context: {0}")]
    NoPdn(PdnCid),
    #[error("No bearer context: EBI[{0}]")]
    NoBearer(Ebi),
    #[error("No SGW S11 tunnel for PDN {0}")]
    NoSgwTunnel(PdnCid),
    #[error(transparent)]
    Bearer(#[from] BearerError),
}

/// MME core error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MmeError {
    #[error("Context not found: {0}")]
    ContextNotFound(String),
    #[error("Message allocation failed towards {0}")]
    AllocationFailed(PeerTask),
    #[error("Invalid state for UE[{0}]: {1}")]
    InvalidState(MmeUeS1apId, String),
    #[error("Paging failed for UE[{0}]: {1}")]
    Paging(MmeUeS1apId, String),
    #[error("Congestion: {0} UEs")]
    Congestion(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bearer(#[from] BearerError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type MmeResult<T> = Result<T, MmeError>;
