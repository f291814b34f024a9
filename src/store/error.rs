use crate::error::{ErrorCode, SwarmError};
use std::fmt;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Ticket not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid seed data: {0}")]
    Seed(String),
}

impl StoreError {
    pub fn query<E: fmt::Display>(err: E) -> Self {
        Self::Query(err.to_string())
    }

    pub fn serialization<E: fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<StoreError> for SwarmError {
    fn from(err: StoreError) -> Self {
        let (code, ticket_id) = match &err {
            StoreError::Connection(_) => (ErrorCode::STORE_CONNECTION, None),
            StoreError::Query(_) => (ErrorCode::STORE_QUERY, None),
            StoreError::NotFound(id) => (ErrorCode::STORE_NOT_FOUND, Some(id.clone())),
            StoreError::Serialization(_) | StoreError::Seed(_) => {
                (ErrorCode::STORE_SERIALIZATION, None)
            }
        };
        SwarmError::store_with_code(code, err.to_string(), ticket_id).with_source(err)
    }
}
