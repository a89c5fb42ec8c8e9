// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Callback Contracts
//!
//! This module defines the contract between the message pump and the surrounding
//! framework: the `MessageHandler` invoked for every delivery, the transient
//! `HandlerError` it may return (or raise, which the pump treats the same way),
//! and the critical-error callback the pump fires when the circuit breaker trips.

use crate::message::IncomingMessage;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// A transient processing failure; triggers an immediate requeue attempt,
/// bounded by the pump's `immediate_retry_attempts`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler failure: {0}")]
pub struct HandlerError(pub String);

/// User callback invoked by the pump for each reconstructed delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> Result<(), HandlerError>;
}

/// Invoked with a human-readable reason when the circuit breaker trips past its
/// threshold; the framework decides what to do (typically halt the endpoint).
pub type CriticalErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn failures_carry_their_reason() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(2)
            .returning(|_| Err(HandlerError("database unavailable".to_owned())));

        let message = IncomingMessage {
            message_id: "msg-1".to_owned(),
            headers: HashMap::default(),
            body: vec![],
        };

        let err = handler.handle(&message).await.unwrap_err();
        assert_eq!(err, HandlerError("database unavailable".to_owned()));
        // A second attempt fails the same way; the pump counts both.
        assert!(handler.handle(&message).await.is_err());
    }
}
