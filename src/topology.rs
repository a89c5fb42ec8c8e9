// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Topologies
//!
//! The mapping convention from logical destinations and event types to broker
//! exchanges, queues, and bindings. Two variants are provided, selected at
//! configuration time: `ConventionalRoutingTopology` gives every endpoint and
//! every event type its own fanout exchange, `DirectRoutingTopology` sends
//! through the default exchange and routes events over a single topic exchange.

use crate::{delay, errors::AmqpError, exchange::ExchangeDefinition};
use async_trait::async_trait;
use lapin::{
    options::{
        ExchangeBindOptions, ExchangeDeclareOptions, ExchangeUnbindOptions, QueueBindOptions,
    },
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Exchange and routing key a message is published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// Capability interface for a routing convention.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoutingTopology: Send + Sync {
    /// Declares the broker entities an endpoint address needs beyond its queue.
    async fn initialize_endpoint(&self, channel: &Channel, address: &str)
        -> Result<(), AmqpError>;

    /// Resolves the publish target for a point-to-point send.
    fn publish_target(&self, destination: &str) -> PublishTarget;

    /// Resolves the publish target for an event type.
    fn event_target(&self, event_type: &str) -> PublishTarget;

    /// Binds the local queue's routing to an event type. Idempotent at broker level.
    async fn setup_subscription(
        &self,
        channel: &Channel,
        event_type: &str,
        address: &str,
    ) -> Result<(), AmqpError>;

    /// Removes the event-type binding. Idempotent at broker level.
    async fn teardown_subscription(
        &self,
        channel: &Channel,
        event_type: &str,
        address: &str,
    ) -> Result<(), AmqpError>;

    /// Connects the endpoint address to the delayed-delivery exchange.
    async fn bind_to_delay_infrastructure(
        &self,
        channel: &Channel,
        address: &str,
    ) -> Result<(), AmqpError>;
}

/// Fanout exchange per endpoint and per event type; an endpoint's queue is bound
/// to its same-named exchange, subscriptions bind event exchanges into it.
pub struct ConventionalRoutingTopology;

#[async_trait]
impl RoutingTopology for ConventionalRoutingTopology {
    async fn initialize_endpoint(
        &self,
        channel: &Channel,
        address: &str,
    ) -> Result<(), AmqpError> {
        declare_fanout(channel, address).await?;

        match channel
            .queue_bind(
                address,
                address,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), address, "error binding endpoint queue");
                Err(AmqpError::TopologyError(address.to_owned()))
            }
        }
    }

    fn publish_target(&self, destination: &str) -> PublishTarget {
        PublishTarget {
            exchange: destination.to_owned(),
            routing_key: "".to_owned(),
        }
    }

    fn event_target(&self, event_type: &str) -> PublishTarget {
        PublishTarget {
            exchange: event_type.to_owned(),
            routing_key: "".to_owned(),
        }
    }

    async fn setup_subscription(
        &self,
        channel: &Channel,
        event_type: &str,
        address: &str,
    ) -> Result<(), AmqpError> {
        declare_fanout(channel, event_type).await?;

        debug!(event_type, address, "binding event exchange into endpoint exchange");
        match channel
            .exchange_bind(
                address,
                event_type,
                "",
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), event_type, "error binding subscription");
                Err(AmqpError::TopologyError(event_type.to_owned()))
            }
        }
    }

    async fn teardown_subscription(
        &self,
        channel: &Channel,
        event_type: &str,
        address: &str,
    ) -> Result<(), AmqpError> {
        match channel
            .exchange_unbind(
                address,
                event_type,
                "",
                ExchangeUnbindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), event_type, "error unbinding subscription");
                Err(AmqpError::TopologyError(event_type.to_owned()))
            }
        }
    }

    async fn bind_to_delay_infrastructure(
        &self,
        channel: &Channel,
        address: &str,
    ) -> Result<(), AmqpError> {
        // Elapsed messages flow delivery exchange -> endpoint exchange -> queue.
        match channel
            .exchange_bind(
                address,
                delay::DELIVERY_EXCHANGE,
                &delay::delivery_binding_key(address),
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), address, "error binding delay delivery");
                Err(AmqpError::TopologyError(address.to_owned()))
            }
        }
    }
}

/// Default-exchange sends with the queue name as routing key; events go through
/// one shared topic exchange keyed by event type.
pub struct DirectRoutingTopology {
    events_exchange: String,
}

impl DirectRoutingTopology {
    pub fn new(events_exchange: &str) -> DirectRoutingTopology {
        DirectRoutingTopology {
            events_exchange: events_exchange.to_owned(),
        }
    }
}

impl Default for DirectRoutingTopology {
    fn default() -> Self {
        DirectRoutingTopology::new("amq.topic")
    }
}

#[async_trait]
impl RoutingTopology for DirectRoutingTopology {
    async fn initialize_endpoint(
        &self,
        _channel: &Channel,
        _address: &str,
    ) -> Result<(), AmqpError> {
        // The default exchange routes straight to the queue; nothing to declare.
        Ok(())
    }

    fn publish_target(&self, destination: &str) -> PublishTarget {
        PublishTarget {
            exchange: "".to_owned(),
            routing_key: destination.to_owned(),
        }
    }

    fn event_target(&self, event_type: &str) -> PublishTarget {
        PublishTarget {
            exchange: self.events_exchange.clone(),
            routing_key: event_type.to_owned(),
        }
    }

    async fn setup_subscription(
        &self,
        channel: &Channel,
        event_type: &str,
        address: &str,
    ) -> Result<(), AmqpError> {
        match channel
            .queue_bind(
                address,
                &self.events_exchange,
                event_type,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), event_type, "error binding subscription");
                Err(AmqpError::TopologyError(event_type.to_owned()))
            }
        }
    }

    async fn teardown_subscription(
        &self,
        channel: &Channel,
        event_type: &str,
        address: &str,
    ) -> Result<(), AmqpError> {
        match channel
            .queue_unbind(address, &self.events_exchange, event_type, FieldTable::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), event_type, "error unbinding subscription");
                Err(AmqpError::TopologyError(event_type.to_owned()))
            }
        }
    }

    async fn bind_to_delay_infrastructure(
        &self,
        channel: &Channel,
        address: &str,
    ) -> Result<(), AmqpError> {
        match channel
            .queue_bind(
                address,
                delay::DELIVERY_EXCHANGE,
                &delay::delivery_binding_key(address),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), address, "error binding delay delivery");
                Err(AmqpError::TopologyError(address.to_owned()))
            }
        }
    }
}

async fn declare_fanout(channel: &Channel, name: &str) -> Result<(), AmqpError> {
    let def = ExchangeDefinition::new(name).fanout().durable();

    match channel
        .exchange_declare(
            &def.name,
            def.kind.into(),
            ExchangeDeclareOptions {
                durable: def.durable,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(err) => {
            error!(error = err.to_string(), exchange = name, "error declaring exchange");
            Err(AmqpError::TopologyError(name.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_routes_through_named_exchanges() {
        let topology = ConventionalRoutingTopology;

        assert_eq!(
            topology.publish_target("billing"),
            PublishTarget {
                exchange: "billing".to_owned(),
                routing_key: "".to_owned(),
            }
        );
        assert_eq!(
            topology.event_target("OrderPlaced"),
            PublishTarget {
                exchange: "OrderPlaced".to_owned(),
                routing_key: "".to_owned(),
            }
        );
    }

    #[test]
    fn direct_routes_through_default_and_topic_exchanges() {
        let topology = DirectRoutingTopology::default();

        assert_eq!(
            topology.publish_target("billing"),
            PublishTarget {
                exchange: "".to_owned(),
                routing_key: "billing".to_owned(),
            }
        );
        assert_eq!(
            topology.event_target("OrderPlaced"),
            PublishTarget {
                exchange: "amq.topic".to_owned(),
                routing_key: "OrderPlaced".to_owned(),
            }
        );
    }

    #[test]
    fn direct_topology_events_exchange_is_configurable() {
        let topology = DirectRoutingTopology::new("events");
        assert_eq!(topology.event_target("OrderPlaced").exchange, "events");
    }
}
