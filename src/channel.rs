// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Provision
//!
//! This module leases short-lived logical channels over the administration
//! connection. Publish channels are pooled: a publish leases a channel, optionally
//! awaits the publisher confirm bounded by the configured timeout, and returns the
//! channel to the pool on success. A channel that faulted is never pooled again; a
//! fresh one is created on the next lease. One-shot setup operations (declare,
//! purge, bind) run on a throwaway channel that is closed on every exit path.

use crate::{config::ProviderSettings, connection::ConnectionManager, errors::AmqpError};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    BasicProperties, Channel,
};
use std::{future::Future, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Leases publish channels and runs scoped one-shot channel operations.
pub struct ChannelProvider {
    manager: Arc<ConnectionManager>,
    settings: ProviderSettings,
    pool: Mutex<Vec<Channel>>,
}

impl ChannelProvider {
    pub fn new(manager: Arc<ConnectionManager>, settings: ProviderSettings) -> ChannelProvider {
        ChannelProvider {
            manager,
            settings,
            pool: Mutex::new(vec![]),
        }
    }

    /// Publishes a message on a leased channel, awaiting the broker confirm when
    /// publisher confirms are enabled.
    ///
    /// The channel returns to the pool only on success; any fault discards it.
    ///
    /// # Parameters
    /// * `exchange` - Exchange to publish to; empty string for the default exchange
    /// * `routing_key` - Routing key within that exchange
    /// * `payload` - Message body, passed through untouched
    /// * `properties` - AMQP basic properties attached to the message
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted (and, when enabled, confirmed) the
    /// publish. Fails with `ConfirmTimeout` when no confirm arrives in time,
    /// `ChannelFault` when the channel goes away, and `DispatchFailure` when
    /// the publish itself is refused.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let channel = self.lease().await?;

        match self
            .publish_on(&channel, exchange, routing_key, payload, properties)
            .await
        {
            Ok(()) => {
                self.release(channel).await;
                Ok(())
            }
            Err(err) => {
                // Discarded, not pooled. The broker tears faulted channels down
                // on its side; dropping our handle releases the rest.
                Err(err)
            }
        }
    }

    async fn publish_on(
        &self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                return Err(AmqpError::DispatchFailure(err.to_string()));
            }
        };

        if !self.settings.use_publisher_confirms {
            return Ok(());
        }

        match tokio::time::timeout(self.settings.confirm_timeout, confirm).await {
            Err(_) => {
                warn!(exchange, "publisher confirm was not received in time");
                Err(AmqpError::ConfirmTimeout(self.settings.confirm_timeout))
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), "channel fault awaiting confirm");
                Err(AmqpError::ChannelFault(err.to_string()))
            }
            Ok(Ok(Confirmation::Nack(_))) => Err(AmqpError::DispatchFailure(
                "broker refused the publish".to_owned(),
            )),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn lease(&self) -> Result<Channel, AmqpError> {
        {
            let mut pool = self.pool.lock().await;
            while let Some(channel) = pool.pop() {
                if channel.status().connected() {
                    return Ok(channel);
                }
                debug!("dropping stale pooled channel");
            }
        }

        let conn = self.manager.administration_connection().await?;

        let channel = match conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error creating publish channel");
                return Err(AmqpError::ChannelFault(err.to_string()));
            }
        };

        if self.settings.use_publisher_confirms {
            if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
                error!(error = err.to_string(), "error enabling publisher confirms");
                return Err(AmqpError::ChannelFault(err.to_string()));
            }
        }

        Ok(channel)
    }

    async fn release(&self, channel: Channel) {
        if channel.status().connected() {
            self.pool.lock().await.push(channel);
        }
    }

    /// Runs `op` on a throwaway channel over the administration connection.
    ///
    /// The channel is closed after the operation regardless of outcome; close
    /// failures are best-effort cleanup and only logged.
    ///
    /// # Parameters
    /// * `op` - The operation to run; receives the channel and returns its result
    ///
    /// # Returns
    /// The operation's result, or `ChannelFault` when no channel could be opened.
    pub async fn with_admin_channel<F, Fut, T>(&self, op: F) -> Result<T, AmqpError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let conn = self.manager.administration_connection().await?;

        let channel = match conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error creating one-shot channel");
                return Err(AmqpError::ChannelFault(err.to_string()));
            }
        };

        let result = op(channel.clone()).await;

        if let Err(err) = channel.close(200, "one-shot operation finished").await {
            debug!(error = err.to_string(), "error closing one-shot channel");
        }

        result
    }
}
