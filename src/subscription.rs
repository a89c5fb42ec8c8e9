// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Management
//!
//! Binds and unbinds the local queue to the exchanges representing event types,
//! through the configured routing topology. Both operations run on a one-shot
//! administration channel and are idempotent at the broker level: re-subscribing
//! re-declares the same binding, which AMQP treats as a no-op.

use crate::{channel::ChannelProvider, errors::AmqpError, topology::RoutingTopology};
use std::sync::Arc;
use tracing::debug;

pub struct SubscriptionManager {
    provider: Arc<ChannelProvider>,
    topology: Arc<dyn RoutingTopology>,
    local_address: String,
}

impl SubscriptionManager {
    pub fn new(
        provider: Arc<ChannelProvider>,
        topology: Arc<dyn RoutingTopology>,
        local_address: &str,
    ) -> SubscriptionManager {
        SubscriptionManager {
            provider,
            topology,
            local_address: local_address.to_owned(),
        }
    }

    /// Routes the event type to the local queue.
    ///
    /// # Parameters
    /// * `event_type` - Event type to start receiving
    ///
    /// # Returns
    /// `Ok(())` once the binding exists; `TopologyError` when the broker
    /// refuses it.
    pub async fn subscribe(&self, event_type: &str) -> Result<(), AmqpError> {
        debug!(event_type, address = self.local_address, "subscribing");

        self.provider
            .with_admin_channel(|channel| async move {
                self.topology
                    .setup_subscription(&channel, event_type, &self.local_address)
                    .await
            })
            .await
    }

    /// Removes the event-type routing to the local queue.
    ///
    /// # Parameters
    /// * `event_type` - Event type to stop receiving
    pub async fn unsubscribe(&self, event_type: &str) -> Result<(), AmqpError> {
        debug!(event_type, address = self.local_address, "unsubscribing");

        self.provider
            .with_admin_channel(|channel| async move {
                self.topology
                    .teardown_subscription(&channel, event_type, &self.local_address)
                    .await
            })
            .await
    }
}
