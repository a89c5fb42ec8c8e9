// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builder types describing the queues the transport declares: the endpoint input
//! queue, the error queue, and the delay-level queues with their TTL and
//! dead-letter arguments.

use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::collections::BTreeMap;

pub(crate) const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub(crate) const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Definition of a queue to declare.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) ttl_millis: Option<i64>,
    pub(crate) dead_letter_exchange: Option<String>,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Survives broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Per-queue message TTL in milliseconds.
    pub fn ttl(mut self, millis: i64) -> Self {
        self.ttl_millis = Some(millis);
        self
    }

    /// Expired or rejected messages are republished to this exchange.
    pub fn dead_letter_to(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.ttl_millis {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongLongInt(LongLongInt::from(ttl)),
            );
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }

        FieldTable::from(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_flags() {
        let def = QueueDefinition::new("orders").durable();

        assert_eq!(def.name, "orders");
        assert!(def.durable);
        assert!(!def.exclusive);
        assert!(!def.auto_delete);
    }

    #[test]
    fn arguments_carry_ttl_and_dead_letter() {
        let def = QueueDefinition::new("delay-level-03")
            .durable()
            .ttl(8_000)
            .dead_letter_to("delay-level-02");

        let args = def.arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongLongInt(LongLongInt::from(8_000i64)))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("delay-level-02")))
        );
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        assert!(QueueDefinition::new("orders").arguments().inner().is_empty());
    }
}
