//! Error Types for Substream Core
//!
//! ### Parsing Errors
//! - `InvalidPartition`: a partition key that is not `<event_type>:<index>`
//! - `InvalidSessionId`: a session identifier that is not a UUID
//!
//! ### Encoding Errors
//! - `Serialization`: a stream batch could not be rendered as JSON

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid partition key: {0}")]
    InvalidPartition(String),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
