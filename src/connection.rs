// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the broker connections. The transport keeps at most two live
//! connections: an administration connection for setup operations and publishes,
//! and a consumption connection used exclusively by the message pump. Creation is
//! lazy and serialized per role; a connection that faulted is replaced on the next
//! request. Broker-initiated shutdowns are funneled into an explicit event channel
//! that the pump consumes to drive its circuit breaker.

use crate::{config::ConnectionSettings, errors::AmqpError};
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error};

/// The role a connection plays; at most one live connection exists per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Administration,
    Consumption,
}

/// A connection-level fault observed by the broker-client layer.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub role: ConnectionRole,
    pub reason: String,
}

/// Owns the administration and consumption connections.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    administration: AsyncMutex<Option<Arc<Connection>>>,
    consumption: AsyncMutex<Option<Arc<Connection>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    fault_events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> ConnectionManager {
        let (events, receiver) = mpsc::unbounded_channel();

        ConnectionManager {
            settings,
            administration: AsyncMutex::new(None),
            consumption: AsyncMutex::new(None),
            events,
            fault_events: Mutex::new(Some(receiver)),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the live administration connection, creating it on first use or
    /// after a fault.
    ///
    /// # Returns
    /// The shared connection handle, or `ConnectionFault` when the broker is
    /// unreachable and `ManagerClosed` after `close`.
    pub async fn administration_connection(&self) -> Result<Arc<Connection>, AmqpError> {
        self.connection(ConnectionRole::Administration, &self.administration)
            .await
    }

    /// Returns the live consumption connection, creating it on first use or
    /// after a fault.
    pub async fn consumption_connection(&self) -> Result<Arc<Connection>, AmqpError> {
        self.connection(ConnectionRole::Consumption, &self.consumption)
            .await
    }

    /// Hands the fault-event receiver to the single consumer of connection
    /// events (the pump).
    ///
    /// # Returns
    /// The receiver on the first call; `None` on every call after that.
    pub fn take_fault_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.fault_events.lock().unwrap().take()
    }

    async fn connection(
        &self,
        role: ConnectionRole,
        slot: &AsyncMutex<Option<Arc<Connection>>>,
    ) -> Result<Arc<Connection>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ManagerClosed);
        }

        // The per-role lock serializes creation: concurrent requesters wait here
        // and observe either the connection the winner created or its failure.
        let mut guard = slot.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            debug!(?role, "stored connection is no longer live, recreating");
            *guard = None;
        }

        let conn = self.create(role).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn create(&self, role: ConnectionRole) -> Result<Arc<Connection>, AmqpError> {
        debug!(?role, "creating amqp connection...");

        let name = match role {
            ConnectionRole::Administration => {
                format!("{} (administration)", self.settings.endpoint_name)
            }
            ConnectionRole::Consumption => {
                format!("{} (consumption)", self.settings.endpoint_name)
            }
        };

        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(name));

        let conn = match Connection::connect(&self.settings.uri(), options).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), ?role, "failure to connect");
                return Err(AmqpError::ConnectionFault(err.to_string()));
            }
        };

        let events = self.events.clone();
        conn.on_error(move |err| {
            let _ = events.send(ConnectionEvent {
                role,
                reason: err.to_string(),
            });
        });

        debug!(?role, "amqp connected");
        Ok(Arc::new(conn))
    }

    /// Closes both connections and marks the manager closed; later connection
    /// requests fail with `ManagerClosed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        for slot in [&self.administration, &self.consumption] {
            if let Some(conn) = slot.lock().await.take() {
                if let Err(err) = conn.close(200, "connection manager closed").await {
                    debug!(error = err.to_string(), "error closing connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_manager_refuses_connections() {
        let manager = ConnectionManager::new(ConnectionSettings::default());
        manager.close().await;

        assert_eq!(
            manager.administration_connection().await.unwrap_err(),
            AmqpError::ManagerClosed
        );
        assert_eq!(
            manager.consumption_connection().await.unwrap_err(),
            AmqpError::ManagerClosed
        );
    }

    #[tokio::test]
    async fn fault_events_are_taken_once() {
        let manager = ConnectionManager::new(ConnectionSettings::default());

        assert!(manager.take_fault_events().is_some());
        assert!(manager.take_fault_events().is_none());
    }
}
