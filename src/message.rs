// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model and Conversion
//!
//! This module defines the transport's message types and the conversion between
//! them and lapin's wire types. `IncomingMessage` is reconstructed from a broker
//! delivery; `OutgoingMessage` is built by the caller and mapped to AMQP basic
//! properties by the dispatcher. `MessageConverter` owns the message-id strategy:
//! by default the AMQP `message-id` property is required, but hosts may install a
//! custom strategy deriving an id from the raw delivery.

use crate::errors::AmqpError;
use lapin::{
    message::Delivery,
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

/// A message reconstructed from a broker delivery, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message_id: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Delivery constraints attached to an outgoing message.
///
/// `time_to_live` maps to the per-message expiration, `non_durable` to the
/// delivery mode, and `delay_by`/`not_before` route the message through the
/// delay infrastructure instead of publishing directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryConstraints {
    pub time_to_live: Option<Duration>,
    pub non_durable: bool,
    pub delay_by: Option<Duration>,
    pub not_before: Option<Duration>,
}

/// A message to be dispatched to the broker.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub destination: String,
    pub message_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub constraints: DeliveryConstraints,
}

impl OutgoingMessage {
    pub fn new(destination: &str, body: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage {
            destination: destination.to_owned(),
            message_id: None,
            headers: HashMap::default(),
            body,
            constraints: DeliveryConstraints::default(),
        }
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn constraints(mut self, constraints: DeliveryConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Strategy deriving a message id from a raw delivery.
pub type MessageIdStrategy = Arc<dyn Fn(&Delivery) -> Option<String> + Send + Sync>;

/// Converts broker deliveries into `IncomingMessage`s.
#[derive(Clone, Default)]
pub struct MessageConverter {
    custom_id_strategy: Option<MessageIdStrategy>,
}

impl MessageConverter {
    pub fn new() -> MessageConverter {
        MessageConverter {
            custom_id_strategy: None,
        }
    }

    /// Installs a custom message-id strategy, replacing the default that reads
    /// the AMQP `message-id` property.
    pub fn with_id_strategy(strategy: MessageIdStrategy) -> MessageConverter {
        MessageConverter {
            custom_id_strategy: Some(strategy),
        }
    }

    /// Builds an `IncomingMessage` from a delivery.
    ///
    /// # Parameters
    /// * `delivery` - The raw broker delivery
    ///
    /// # Returns
    /// The reconstructed message, or `DispatchFailure` when no message id can
    /// be derived; the pump treats that as a poison delivery.
    pub fn incoming(&self, delivery: &Delivery) -> Result<IncomingMessage, AmqpError> {
        let message_id = match &self.custom_id_strategy {
            Some(strategy) => strategy(delivery),
            None => delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.to_string()),
        }
        .ok_or_else(|| {
            AmqpError::DispatchFailure("delivery carries no usable message id".to_owned())
        })?;

        Ok(IncomingMessage {
            message_id,
            headers: headers_from_table(&delivery.properties),
            body: delivery.data.clone(),
        })
    }
}

/// Maps an outgoing message and its constraints to AMQP basic properties.
///
/// Headers are passed separately so the dispatcher can hand in the message
/// headers enriched with trace context.
pub(crate) fn outgoing_properties(
    message: &OutgoingMessage,
    headers: &HashMap<String, String>,
) -> BasicProperties {
    let id = message
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(id))
        .with_headers(table_from_headers(headers))
        .with_delivery_mode(if message.constraints.non_durable { 1 } else { 2 });

    if let Some(ttl) = message.constraints.time_to_live {
        props = props.with_expiration(ShortString::from(ttl.as_millis().to_string()));
    }

    props
}

/// Rebuilds AMQP properties for a republish that must preserve the original
/// message untouched (the poison-forward path).
pub(crate) fn preserved_properties(message: &IncomingMessage) -> BasicProperties {
    BasicProperties::default()
        .with_message_id(ShortString::from(message.message_id.clone()))
        .with_headers(table_from_headers(&message.headers))
        .with_delivery_mode(2)
}

pub(crate) fn headers_from_table(props: &AMQPProperties) -> HashMap<String, String> {
    let table = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    let mut headers = HashMap::default();
    for (key, value) in table.inner() {
        let rendered = match value {
            AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).to_string(),
            AMQPValue::ShortString(v) => v.to_string(),
            AMQPValue::Boolean(v) => v.to_string(),
            AMQPValue::ShortShortInt(v) => v.to_string(),
            AMQPValue::ShortShortUInt(v) => v.to_string(),
            AMQPValue::ShortInt(v) => v.to_string(),
            AMQPValue::ShortUInt(v) => v.to_string(),
            AMQPValue::LongInt(v) => v.to_string(),
            AMQPValue::LongUInt(v) => v.to_string(),
            AMQPValue::LongLongInt(v) => v.to_string(),
            AMQPValue::Float(v) => v.to_string(),
            AMQPValue::Double(v) => v.to_string(),
            AMQPValue::Timestamp(v) => v.to_string(),
            // Nested tables and arrays carry broker bookkeeping (x-death and
            // friends); they are not part of the string header contract.
            _ => continue,
        };
        headers.insert(key.to_string(), rendered);
    }

    headers
}

pub(crate) fn table_from_headers(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery_with_properties(properties: BasicProperties) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: ShortString::from(""),
            routing_key: ShortString::from("orders"),
            redelivered: false,
            properties,
            data: b"payload".to_vec(),
            acker: Default::default(),
        }
    }

    #[test]
    fn incoming_requires_message_id_by_default() {
        let converter = MessageConverter::new();
        let delivery = delivery_with_properties(BasicProperties::default());

        assert!(converter.incoming(&delivery).is_err());
    }

    #[test]
    fn incoming_reads_id_headers_and_body() {
        let mut headers = HashMap::default();
        headers.insert("origin".to_owned(), "orders".to_owned());

        let props = BasicProperties::default()
            .with_message_id(ShortString::from("msg-1"))
            .with_headers(table_from_headers(&headers));

        let converter = MessageConverter::new();
        let msg = converter
            .incoming(&delivery_with_properties(props))
            .unwrap();

        assert_eq!(msg.message_id, "msg-1");
        assert_eq!(msg.headers.get("origin").unwrap(), "orders");
        assert_eq!(msg.body, b"payload");
    }

    #[test]
    fn custom_id_strategy_overrides_default() {
        let converter = MessageConverter::with_id_strategy(Arc::new(|d: &Delivery| {
            Some(format!("tag-{}", d.delivery_tag))
        }));

        let msg = converter
            .incoming(&delivery_with_properties(BasicProperties::default()))
            .unwrap();

        assert_eq!(msg.message_id, "tag-1");
    }

    #[test]
    fn constraints_map_to_expiration_and_delivery_mode() {
        let message = OutgoingMessage::new("orders", vec![]).constraints(DeliveryConstraints {
            time_to_live: Some(Duration::from_secs(30)),
            non_durable: true,
            ..DeliveryConstraints::default()
        });

        let props = outgoing_properties(&message, &message.headers);
        assert_eq!(props.expiration().as_ref().unwrap().as_str(), "30000");
        assert_eq!(props.delivery_mode().unwrap(), 1);
    }

    #[test]
    fn durable_is_the_default_delivery_mode() {
        let message = OutgoingMessage::new("orders", vec![]);
        let props = outgoing_properties(&message, &message.headers);
        assert_eq!(props.delivery_mode().unwrap(), 2);
        assert!(props.expiration().is_none());
        assert!(props.message_id().is_some());
    }

    #[test]
    fn header_round_trip_preserves_entries() {
        let mut headers = HashMap::default();
        headers.insert("a".to_owned(), "1".to_owned());
        headers.insert("b".to_owned(), "two".to_owned());

        let props = BasicProperties::default().with_headers(table_from_headers(&headers));
        assert_eq!(headers_from_table(&props), headers);
    }
}
