// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Poison Message Forwarding
//!
//! Moves permanently-failed messages out of the main flow: the message is
//! republished unchanged (headers and body) to the configured error queue through
//! the channel provider, after which the pump acknowledges the original delivery.
//! A rejected republish is fatal for that delivery; the pump leaves it
//! unacknowledged so the broker redelivers it rather than losing it.

use crate::{channel::ChannelProvider, errors::AmqpError, message::IncomingMessage};
use crate::message::preserved_properties;
use std::sync::Arc;
use tracing::{error, warn};

pub struct PoisonForwarder {
    provider: Arc<ChannelProvider>,
}

impl PoisonForwarder {
    pub fn new(provider: Arc<ChannelProvider>) -> PoisonForwarder {
        PoisonForwarder { provider }
    }

    /// Republishes the message to the error queue via the default exchange.
    ///
    /// # Parameters
    /// * `message` - The failed message; id, headers, and body are preserved
    /// * `error_queue` - Queue the message is moved to
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the republish; `ForwardError` carrying
    /// the message id and the refusal otherwise, in which case the caller must
    /// leave the original delivery unacknowledged.
    pub async fn forward(
        &self,
        message: &IncomingMessage,
        error_queue: &str,
    ) -> Result<(), AmqpError> {
        warn!(
            message_id = message.message_id,
            error_queue, "moving poison message to the error queue"
        );

        match self
            .provider
            .publish(
                "",
                error_queue,
                &message.body,
                preserved_properties(message),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    message_id = message.message_id,
                    "error republishing to the error queue"
                );
                Err(AmqpError::ForwardError(
                    message.message_id.clone(),
                    err.to_string(),
                ))
            }
        }
    }
}
