// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Transport
//!
//! This module provides the error taxonomy for the transport. The `AmqpError` enum
//! covers connection and channel faults, publisher-confirm timeouts, routing and
//! dispatch failures, poison-message forwarding failures, and topology setup errors.
//! Callback (handler) failures are a separate type, `crate::handler::HandlerError`,
//! because they drive the retry/poison path rather than propagating to callers.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ transport operations.
///
/// Connection and channel faults are recoverable: the owning component discards
/// the faulted resource and recreates it on next use. Everything else is surfaced
/// synchronously to the immediate caller.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// The connection to the broker failed or was lost
    #[error("connection failure: {0}")]
    ConnectionFault(String),

    /// A channel-level fault; the channel is discarded, not pooled
    #[error("channel failure: {0}")]
    ChannelFault(String),

    /// The broker did not confirm a publish within the bounded wait
    #[error("publisher confirm timed out after {0:?}")]
    ConfirmTimeout(Duration),

    /// No topology route exists for the destination
    #[error("no route to destination `{0}`")]
    RoutingError(String),

    /// A broker-level fault while dispatching; transient, eligible for caller retry
    #[error("failure to dispatch message: {0}")]
    DispatchFailure(String),

    /// The error-queue republish of a poison message was rejected
    #[error("failure to forward message `{0}` to the error queue: {1}")]
    ForwardError(String, String),

    /// The connection manager was closed and can no longer hand out connections
    #[error("connection manager is closed")]
    ManagerClosed,

    /// Error declaring or binding an exchange or queue during setup
    #[error("failure to install topology entity `{0}`")]
    TopologyError(String),

    /// Error purging a queue during startup
    #[error("failure to purge queue `{0}`")]
    PurgeError(String),

    /// Error acknowledging a delivery
    #[error("failure to ack message")]
    AckFailure,

    /// Error negative-acknowledging a delivery
    #[error("failure to nack message")]
    NackFailure,

    /// The requested delivery delay exceeds what the delay infrastructure supports
    #[error("delay of {0} seconds exceeds the maximum supported delay")]
    DelayOutOfRange(u64),

    /// The pump was asked to do something its current state does not allow
    #[error("message pump cannot {0} in its current state")]
    PumpStateError(String),
}

impl AmqpError {
    /// Whether the transport recovers from this error locally with retry and
    /// backoff, as opposed to surfacing it to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionFault(_) | AmqpError::ChannelFault(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_and_channel_faults_are_recoverable() {
        assert!(AmqpError::ConnectionFault("reset".to_owned()).is_recoverable());
        assert!(AmqpError::ChannelFault("closed".to_owned()).is_recoverable());
        assert!(!AmqpError::RoutingError("billing".to_owned()).is_recoverable());
        assert!(!AmqpError::ConfirmTimeout(Duration::from_secs(30)).is_recoverable());
        assert!(!AmqpError::ManagerClosed.is_recoverable());
    }
}
