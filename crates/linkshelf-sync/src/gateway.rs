//! Mutation gateway contract: bulk fetch, create and delete against the store.

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{Draft, OwnerId, Record, RecordId};

/// Gateway error classes for caller retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorClass {
    Auth,
    RateLimited,
    Transport,
    Validation,
    NotFound,
    Unknown,
}

/// Structured gateway call failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class:?}: {message}")]
pub struct GatewayError {
    pub class: GatewayErrorClass,
    pub message: String,
}

impl GatewayError {
    #[must_use]
    pub fn new(class: GatewayErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorClass::Transport, message)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.class == GatewayErrorClass::NotFound
    }
}

/// Request/response access to the authoritative row store.
#[async_trait]
pub trait MutationGateway: Send + Sync {
    /// All rows visible to `owner`, newest first.
    async fn fetch_records(&self, owner: &OwnerId) -> Result<Vec<Record>, GatewayError>;

    /// Commits a new row and returns it with its store-assigned identity.
    async fn create(&self, owner: &OwnerId, draft: &Draft) -> Result<Record, GatewayError>;

    /// Deletes a row. Fails with [`GatewayErrorClass::NotFound`] when the row
    /// does not exist server-side.
    async fn delete(&self, id: RecordId) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::{GatewayError, GatewayErrorClass};

    #[test]
    fn error_message_carries_class_and_detail() {
        let error = GatewayError::new(GatewayErrorClass::RateLimited, "slow down");
        assert_eq!(error.to_string(), "RateLimited: slow down");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(error);
        assert_eq!(boxed.to_string(), "RateLimited: slow down");
        assert!(GatewayError::new(GatewayErrorClass::NotFound, "gone").is_not_found());
        assert!(!GatewayError::transport("reset").is_not_found());
    }
}
