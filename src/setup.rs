// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # One-Shot Setup Operations
//!
//! Startup-time topology creation and queue purging. Both run on throwaway
//! administration channels and sit outside the hot path: `QueueCreator` declares
//! the endpoint queues, their topology entities, and (when enabled) the
//! delayed-delivery chain; `QueuePurger` empties the input queue when the
//! endpoint requests a purge on startup.

use crate::{
    channel::ChannelProvider, delay, errors::AmqpError, queue::QueueDefinition,
    topology::RoutingTopology,
};
use lapin::{
    options::{ExchangeDeleteOptions, QueueDeclareOptions, QueuePurgeOptions},
    Channel,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Name of the single delay exchange used before the leveled chain existed.
const LEGACY_DELAY_EXCHANGE: &str = "delay";

pub struct QueueCreator {
    provider: Arc<ChannelProvider>,
    topology: Arc<dyn RoutingTopology>,
    with_delayed_delivery: bool,
}

impl QueueCreator {
    pub fn new(
        provider: Arc<ChannelProvider>,
        topology: Arc<dyn RoutingTopology>,
        with_delayed_delivery: bool,
    ) -> QueueCreator {
        QueueCreator {
            provider,
            topology,
            with_delayed_delivery,
        }
    }

    /// Declares every endpoint address: a durable queue, the topology's entities
    /// for it, and its binding into the delay infrastructure.
    ///
    /// # Parameters
    /// * `addresses` - Endpoint addresses to declare; typically the input queue,
    ///   the error queue, and any satellite addresses
    ///
    /// # Returns
    /// `Ok(())` once every address exists; `TopologyError` naming the entity
    /// that could not be declared.
    pub async fn create_queues(&self, addresses: &[&str]) -> Result<(), AmqpError> {
        self.provider
            .with_admin_channel(|channel| async move {
                if self.with_delayed_delivery {
                    // Stale infrastructure from earlier versions; failure to
                    // remove it must not abort setup.
                    if let Err(err) = channel
                        .exchange_delete(LEGACY_DELAY_EXCHANGE, ExchangeDeleteOptions::default())
                        .await
                    {
                        debug!(
                            error = err.to_string(),
                            "could not delete legacy delay exchange"
                        );
                    }

                    delay::build(&channel).await?;
                }

                for address in addresses {
                    declare_queue(&channel, address).await?;
                    self.topology.initialize_endpoint(&channel, address).await?;

                    if self.with_delayed_delivery {
                        self.topology
                            .bind_to_delay_infrastructure(&channel, address)
                            .await?;
                    }
                }

                Ok(())
            })
            .await
    }
}

async fn declare_queue(channel: &Channel, address: &str) -> Result<(), AmqpError> {
    let def = QueueDefinition::new(address).durable();

    debug!(queue = address, "declaring queue");
    match channel
        .queue_declare(
            &def.name,
            QueueDeclareOptions {
                durable: def.durable,
                ..QueueDeclareOptions::default()
            },
            def.arguments(),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(err) => {
            error!(error = err.to_string(), queue = address, "error declaring queue");
            Err(AmqpError::TopologyError(address.to_string()))
        }
    }
}

pub struct QueuePurger {
    provider: Arc<ChannelProvider>,
}

impl QueuePurger {
    pub fn new(provider: Arc<ChannelProvider>) -> QueuePurger {
        QueuePurger { provider }
    }

    /// Empties the queue.
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to purge
    ///
    /// # Returns
    /// The number of messages removed, or `PurgeError` when the broker refuses
    /// the purge (typically because the queue does not exist).
    pub async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.provider
            .with_admin_channel(|channel| async move {
                match channel
                    .queue_purge(queue, QueuePurgeOptions::default())
                    .await
                {
                    Ok(count) => {
                        debug!(queue, count, "queue purged");
                        Ok(count)
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue, "error purging queue");
                        Err(AmqpError::PurgeError(queue.to_owned()))
                    }
                }
            })
            .await
    }
}
