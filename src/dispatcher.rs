// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outgoing Message Dispatch
//!
//! The dispatcher maps an `OutgoingMessage` and its delivery constraints to AMQP
//! basic properties and publishes it through the channel provider. Destinations
//! resolve through the configured routing topology; delayed messages and events
//! are routed into the delay infrastructure instead of their destination
//! exchange. Trace context is injected into the outgoing headers.

use crate::{
    channel::ChannelProvider,
    delay,
    errors::AmqpError,
    message::{outgoing_properties, DeliveryConstraints, OutgoingMessage},
    otel,
    topology::{PublishTarget, RoutingTopology},
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error};

/// Publishes outgoing messages, awaiting confirms when enabled.
pub struct MessageDispatcher {
    provider: Arc<ChannelProvider>,
    topology: Arc<dyn RoutingTopology>,
}

impl MessageDispatcher {
    /// Creates a dispatcher publishing through `provider` and resolving
    /// destinations through `topology`.
    ///
    /// # Parameters
    /// * `provider` - Channel provider every publish goes through
    /// * `topology` - Routing convention resolving destinations and event types
    pub fn new(
        provider: Arc<ChannelProvider>,
        topology: Arc<dyn RoutingTopology>,
    ) -> MessageDispatcher {
        MessageDispatcher { provider, topology }
    }

    /// Sends a message to its destination.
    ///
    /// A `delay_by` or `not_before` constraint of at least one second routes the
    /// message into the delay infrastructure instead of the destination exchange.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the outgoing headers
    /// * `message` - The message, its headers, body, and delivery constraints
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the publish (and confirmed it, when
    /// confirms are enabled). Fails with `RoutingError` when no route to the
    /// destination exists, `ConfirmTimeout` when the broker confirm is not
    /// received in time, `DelayOutOfRange` when the requested delay exceeds the
    /// encodable maximum, and `DispatchFailure` for other broker-level faults
    /// (transient, caller may retry).
    pub async fn dispatch(
        &self,
        ctx: &Context,
        message: &OutgoingMessage,
    ) -> Result<(), AmqpError> {
        let target = self.resolve_target(message)?;
        self.publish(ctx, message, target).await
    }

    /// Publishes an event to every subscribed endpoint.
    ///
    /// Delay constraints apply as in `dispatch`, with the resolved events
    /// exchange as the address the delay chain delivers to.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the outgoing headers
    /// * `event_type` - Event type resolved through the topology
    /// * `message` - The event payload, headers, and delivery constraints
    pub async fn dispatch_event(
        &self,
        ctx: &Context,
        event_type: &str,
        message: &OutgoingMessage,
    ) -> Result<(), AmqpError> {
        let target = self.resolve_event_target(event_type, message)?;
        self.publish(ctx, message, target).await
    }

    fn resolve_target(&self, message: &OutgoingMessage) -> Result<PublishTarget, AmqpError> {
        let direct = self.topology.publish_target(&message.destination);
        apply_delay(&message.destination, &message.constraints, direct)
    }

    fn resolve_event_target(
        &self,
        event_type: &str,
        message: &OutgoingMessage,
    ) -> Result<PublishTarget, AmqpError> {
        let direct = self.topology.event_target(event_type);
        let address = direct.exchange.clone();
        apply_delay(&address, &message.constraints, direct)
    }

    async fn publish(
        &self,
        ctx: &Context,
        message: &OutgoingMessage,
        target: PublishTarget,
    ) -> Result<(), AmqpError> {
        let mut headers = message.headers.clone();
        otel::inject(ctx, &mut headers);

        let properties = outgoing_properties(message, &headers);

        self.provider
            .publish(&target.exchange, &target.routing_key, &message.body, properties)
            .await
            .map_err(|err| map_publish_error(err, &message.destination))
    }
}

/// Routes through the delay infrastructure when the constraints ask for at
/// least one second of delay, keeping the direct target otherwise.
fn apply_delay(
    address: &str,
    constraints: &DeliveryConstraints,
    direct: PublishTarget,
) -> Result<PublishTarget, AmqpError> {
    match delay_seconds(constraints) {
        Some(seconds) => {
            let route = delay::routing_key(seconds, address)?;
            debug!(address, seconds, "routing through the delay infrastructure");
            Ok(PublishTarget {
                exchange: route.exchange,
                routing_key: route.routing_key,
            })
        }
        None => Ok(direct),
    }
}

/// Seconds of delay requested by the constraints, if any.
fn delay_seconds(constraints: &DeliveryConstraints) -> Option<u64> {
    constraints
        .delay_by
        .or(constraints.not_before)
        .map(|d| d.as_secs())
        .filter(|&secs| secs > 0)
}

// A publish refused because the destination entity does not exist is fatal for
// this send, not transient. The broker reports it by closing the channel with a
// 404: without confirms that lands on the publish itself, with confirms enabled
// it surfaces while awaiting the confirm, as a channel fault.
fn map_publish_error(err: AmqpError, destination: &str) -> AmqpError {
    match err {
        AmqpError::DispatchFailure(reason) | AmqpError::ChannelFault(reason)
            if reason.contains("NOT_FOUND") =>
        {
            error!(destination, "no route to destination");
            AmqpError::RoutingError(destination.to_owned())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConnectionSettings, ProviderSettings},
        connection::ConnectionManager,
        topology::MockRoutingTopology,
    };
    use std::time::Duration;

    fn dispatcher(topology: MockRoutingTopology) -> MessageDispatcher {
        let manager = Arc::new(ConnectionManager::new(ConnectionSettings::default()));
        let provider = Arc::new(ChannelProvider::new(manager, ProviderSettings::default()));
        MessageDispatcher::new(provider, Arc::new(topology))
    }

    #[test]
    fn delay_is_taken_from_either_constraint() {
        assert_eq!(delay_seconds(&DeliveryConstraints::default()), None);

        let by = DeliveryConstraints {
            delay_by: Some(Duration::from_secs(90)),
            ..DeliveryConstraints::default()
        };
        assert_eq!(delay_seconds(&by), Some(90));

        let not_before = DeliveryConstraints {
            not_before: Some(Duration::from_secs(30)),
            ..DeliveryConstraints::default()
        };
        assert_eq!(delay_seconds(&not_before), Some(30));
    }

    #[test]
    fn sub_second_delays_publish_directly() {
        let constraints = DeliveryConstraints {
            delay_by: Some(Duration::from_millis(200)),
            ..DeliveryConstraints::default()
        };
        assert_eq!(delay_seconds(&constraints), None);
    }

    #[test]
    fn destination_resolution_goes_through_the_topology() {
        let mut topology = MockRoutingTopology::new();
        topology
            .expect_publish_target()
            .withf(|destination| destination == "billing")
            .times(1)
            .returning(|destination| PublishTarget {
                exchange: destination.to_owned(),
                routing_key: "".to_owned(),
            });

        let dispatcher = dispatcher(topology);
        let message = OutgoingMessage::new("billing", vec![]);

        let target = dispatcher.resolve_target(&message).unwrap();
        assert_eq!(target.exchange, "billing");
        assert_eq!(target.routing_key, "");
    }

    #[test]
    fn delayed_messages_resolve_to_the_delay_entry_exchange() {
        // The topology is never consulted for a delayed send.
        let mut topology = MockRoutingTopology::new();
        topology.expect_publish_target().times(0);

        let dispatcher = dispatcher(topology);
        let message = OutgoingMessage::new("billing", vec![]).constraints(DeliveryConstraints {
            delay_by: Some(Duration::from_secs(5)),
            ..DeliveryConstraints::default()
        });

        let target = dispatcher.resolve_target(&message).unwrap();
        assert_eq!(target.exchange, "delay-level-02");
        assert!(target.routing_key.ends_with("1.0.1.billing"));
    }

    #[test]
    fn delayed_events_route_through_the_delay_chain() {
        let mut topology = MockRoutingTopology::new();
        topology
            .expect_event_target()
            .times(1)
            .returning(|event_type| PublishTarget {
                exchange: event_type.to_owned(),
                routing_key: "".to_owned(),
            });

        let dispatcher = dispatcher(topology);
        let message =
            OutgoingMessage::new("OrderPlaced", vec![]).constraints(DeliveryConstraints {
                delay_by: Some(Duration::from_secs(1)),
                ..DeliveryConstraints::default()
            });

        let target = dispatcher
            .resolve_event_target("OrderPlaced", &message)
            .unwrap();
        assert_eq!(target.exchange, "delay-level-00");
        assert!(target.routing_key.ends_with("0.1.OrderPlaced"));
    }

    #[test]
    fn missing_destination_maps_to_a_routing_error() {
        let refusal = "NOT_FOUND - no exchange 'billing' in vhost '/'";

        assert_eq!(
            map_publish_error(AmqpError::DispatchFailure(refusal.to_owned()), "billing"),
            AmqpError::RoutingError("billing".to_owned())
        );
        // With confirms enabled the 404 close lands on the confirm wait instead.
        assert_eq!(
            map_publish_error(AmqpError::ChannelFault(refusal.to_owned()), "billing"),
            AmqpError::RoutingError("billing".to_owned())
        );
    }

    #[test]
    fn other_publish_failures_pass_through_unchanged() {
        assert_eq!(
            map_publish_error(AmqpError::ConfirmTimeout(Duration::from_secs(30)), "billing"),
            AmqpError::ConfirmTimeout(Duration::from_secs(30))
        );
        assert_eq!(
            map_publish_error(
                AmqpError::ChannelFault("connection reset".to_owned()),
                "billing"
            ),
            AmqpError::ChannelFault("connection reset".to_owned())
        );
    }
}
