// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed-Delivery Infrastructure
//!
//! Native delayed delivery built from a chain of topic exchanges and TTL queues,
//! one per bit of the delay value. A delayed message's routing key encodes the
//! delay in seconds as 28 dot-separated bits (most-significant first) followed by
//! the destination address. The message enters the chain at the exchange of its
//! highest set bit; at each level a `1` bit parks it in that level's queue for
//! `2^level` seconds before dead-lettering one level down, while a `0` bit routes
//! it straight to the next exchange. Level zero drains into the delivery exchange,
//! which endpoint queues bind to with `#.<address>`.

use crate::{errors::AmqpError, exchange::ExchangeDefinition, queue::QueueDefinition};
use lapin::{
    options::{ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Highest bit level of the delay encoding.
pub const MAX_LEVEL: u32 = 27;
/// Longest expressible delay: all 28 bits set.
pub const MAX_DELAY_SECONDS: u64 = (1 << (MAX_LEVEL + 1)) - 1;
/// Exchange that drains fully-elapsed messages to their destination.
pub const DELIVERY_EXCHANGE: &str = "delay-delivery";

pub(crate) fn level_name(level: u32) -> String {
    format!("delay-level-{:02}", level)
}

/// Where to publish a delayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayRoute {
    pub exchange: String,
    pub routing_key: String,
}

/// Encodes a delay and destination into the chain entry point and routing key.
///
/// # Parameters
/// * `delay_seconds` - Requested delay; at most `MAX_DELAY_SECONDS`
/// * `address` - Destination the delivery exchange routes to once elapsed
///
/// # Returns
/// The entry exchange (the level of the delay's highest set bit) and the full
/// bit-encoded routing key, or `DelayOutOfRange` when the delay is not encodable.
pub fn routing_key(delay_seconds: u64, address: &str) -> Result<DelayRoute, AmqpError> {
    if delay_seconds > MAX_DELAY_SECONDS {
        return Err(AmqpError::DelayOutOfRange(delay_seconds));
    }

    let mut key = String::with_capacity(2 * (MAX_LEVEL as usize + 1) + address.len());
    let mut starting_level = 0;

    for level in (0..=MAX_LEVEL).rev() {
        if delay_seconds & (1 << level) != 0 {
            key.push('1');
            if starting_level == 0 {
                starting_level = level;
            }
        } else {
            key.push('0');
        }
        key.push('.');
    }
    key.push_str(address);

    Ok(DelayRoute {
        exchange: level_name(starting_level),
        routing_key: key,
    })
}

// The token for level N sits at position MAX_LEVEL - N of the routing key.
fn queue_binding_key(level: u32) -> String {
    format!("{}1.#", "*.".repeat((MAX_LEVEL - level) as usize))
}

fn forward_binding_key(level: u32) -> String {
    format!("{}0.#", "*.".repeat((MAX_LEVEL - level) as usize))
}

/// Pattern binding an endpoint queue to the delivery exchange.
pub(crate) fn delivery_binding_key(address: &str) -> String {
    format!("#.{}", address)
}

/// Declares the whole chain: delivery exchange, one exchange and TTL queue per
/// level, queue bindings for `1` bits, and exchange-to-exchange forwards for
/// `0` bits. Every entity is durable and the declarations are idempotent.
///
/// # Parameters
/// * `channel` - Administration channel the declarations run on
///
/// # Returns
/// `Ok(())` once the chain exists; `TopologyError` naming the level that could
/// not be declared or bound.
pub async fn build(channel: &Channel) -> Result<(), AmqpError> {
    declare_exchange(channel, &ExchangeDefinition::new(DELIVERY_EXCHANGE).topic().durable())
        .await?;

    for level in 0..=MAX_LEVEL {
        let name = level_name(level);
        debug!(level, "declaring delay level {}", name);

        declare_exchange(channel, &ExchangeDefinition::new(&name).topic().durable()).await?;

        let queue = QueueDefinition::new(&name)
            .durable()
            .ttl((1i64 << level) * 1_000)
            .dead_letter_to(&next_exchange(level));

        if let Err(err) = channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..QueueDeclareOptions::default()
                },
                queue.arguments(),
            )
            .await
        {
            error!(error = err.to_string(), queue = name, "error declaring delay queue");
            return Err(AmqpError::TopologyError(name));
        }

        if let Err(err) = channel
            .queue_bind(
                &name,
                &name,
                &queue_binding_key(level),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            error!(error = err.to_string(), queue = name, "error binding delay queue");
            return Err(AmqpError::TopologyError(name));
        }

        if let Err(err) = channel
            .exchange_bind(
                &next_exchange(level),
                &name,
                &forward_binding_key(level),
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            error!(
                error = err.to_string(),
                exchange = name,
                "error binding delay exchange forward"
            );
            return Err(AmqpError::TopologyError(name));
        }
    }

    Ok(())
}

fn next_exchange(level: u32) -> String {
    if level == 0 {
        DELIVERY_EXCHANGE.to_owned()
    } else {
        level_name(level - 1)
    }
}

async fn declare_exchange(
    channel: &Channel,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    match channel
        .exchange_declare(
            &def.name,
            def.kind.into(),
            ExchangeDeclareOptions {
                durable: def.durable,
                auto_delete: def.auto_delete,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(err) => {
            error!(error = err.to_string(), exchange = def.name, "error declaring exchange");
            Err(AmqpError::TopologyError(def.name.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_second_enters_at_level_zero() {
        let route = routing_key(1, "orders").unwrap();

        assert_eq!(route.exchange, "delay-level-00");
        assert!(route.routing_key.starts_with("0.0.0."));
        assert!(route.routing_key.ends_with("0.1.orders"));
    }

    #[test]
    fn five_seconds_enters_at_its_highest_bit() {
        // 5 = 0b101 -> highest set bit is level 2.
        let route = routing_key(5, "orders").unwrap();

        assert_eq!(route.exchange, "delay-level-02");
        assert!(route.routing_key.ends_with("1.0.1.orders"));
    }

    #[test]
    fn zero_delay_drains_straight_through() {
        let route = routing_key(0, "orders").unwrap();

        assert_eq!(route.exchange, "delay-level-00");
        assert!(!route.routing_key.contains('1'));
    }

    #[test]
    fn routing_key_carries_one_token_per_level() {
        let route = routing_key(MAX_DELAY_SECONDS, "orders").unwrap();

        assert_eq!(route.exchange, "delay-level-27");
        assert_eq!(route.routing_key.split('.').count() as u32, MAX_LEVEL + 2);
    }

    #[test]
    fn delay_past_the_maximum_is_rejected() {
        assert_eq!(
            routing_key(MAX_DELAY_SECONDS + 1, "orders").unwrap_err(),
            AmqpError::DelayOutOfRange(MAX_DELAY_SECONDS + 1)
        );
    }

    #[test]
    fn binding_keys_select_the_level_bit() {
        assert_eq!(queue_binding_key(MAX_LEVEL), "1.#");
        assert_eq!(forward_binding_key(MAX_LEVEL), "0.#");
        assert_eq!(queue_binding_key(MAX_LEVEL - 2), "*.*.1.#");
        assert_eq!(delivery_binding_key("orders"), "#.orders");
    }

    #[test]
    fn level_names_are_zero_padded() {
        assert_eq!(level_name(0), "delay-level-00");
        assert_eq!(level_name(27), "delay-level-27");
    }
}
