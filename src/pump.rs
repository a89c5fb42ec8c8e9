// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # The Message Pump
//!
//! The consumption engine. `init` wires up the handler, the critical-error
//! callback, and the push settings (purging the input queue first when
//! requested); `start` opens the consuming channel, applies the prefetch limit,
//! and feeds deliveries into a bounded worker pool; `stop` drains in-flight
//! workers within the shutdown timeout and closes everything down.
//!
//! Failed deliveries are requeued up to the configured number of immediate
//! attempts, tracked per message id, then forwarded to the error queue. A
//! circuit breaker watches connection faults: the receive loop keeps
//! reconnecting with backoff, and only when the outage outlasts the configured
//! threshold does the critical-error callback fire, once per episode.

use crate::{
    breaker::{BreakerAction, RepeatedFailuresCircuitBreaker},
    channel::ChannelProvider,
    config::{PumpSettings, PushSettings, TransportTransactionMode},
    connection::{ConnectionEvent, ConnectionManager, ConnectionRole},
    errors::AmqpError,
    forwarder::PoisonForwarder,
    handler::{CriticalErrorHandler, MessageHandler},
    message::{headers_from_table, IncomingMessage, MessageConverter},
    otel,
    setup::QueuePurger,
};
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{collections::HashMap, sync::Arc, sync::Mutex};
use tokio::{
    sync::{mpsc::UnboundedReceiver, watch, Mutex as AsyncMutex, Semaphore},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Tracks immediate-retry attempts per message id.
///
/// Shared by all workers; entries are cleared on success and when a message
/// leaves for the error queue.
#[derive(Default)]
struct RetryRegistry {
    counts: Mutex<HashMap<String, u32>>,
}

impl RetryRegistry {
    fn record_failure(&self, message_id: &str) -> u32 {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(message_id.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear(&self, message_id: &str) {
        self.counts.lock().unwrap().remove(message_id);
    }
}

fn prefetch_limit(prefetch_count: u16, multiplier: u16, max_concurrency: u16) -> u16 {
    if prefetch_count == 0 {
        max_concurrency.saturating_mul(multiplier)
    } else {
        prefetch_count.max(max_concurrency)
    }
}

#[derive(Clone)]
struct PumpInit {
    handler: Arc<dyn MessageHandler>,
    critical: CriticalErrorHandler,
    push: PushSettings,
}

/// State shared between the receive loop and its workers.
struct PumpCore {
    manager: Arc<ConnectionManager>,
    forwarder: PoisonForwarder,
    converter: MessageConverter,
    settings: PumpSettings,
    init: PumpInit,
    breaker: RepeatedFailuresCircuitBreaker,
    retries: RetryRegistry,
    semaphore: Arc<Semaphore>,
    consumer_tag: String,
    prefetch: u16,
}

type FaultEvents = Option<UnboundedReceiver<ConnectionEvent>>;

/// The consumption engine; one per input queue.
pub struct MessagePump {
    manager: Arc<ConnectionManager>,
    provider: Arc<ChannelProvider>,
    converter: MessageConverter,
    settings: PumpSettings,
    state: PumpState,
    init: Option<PumpInit>,
    shutdown: Option<watch::Sender<bool>>,
    loop_handle: Option<JoinHandle<()>>,
    // Shared with the receive loop, which holds the lock while it runs. The
    // receiver stays in the slot when the loop ends, however it ends, so a
    // later start observes connection faults again.
    fault_events: Arc<AsyncMutex<FaultEvents>>,
    semaphore: Option<Arc<Semaphore>>,
    max_concurrency: u32,
}

impl MessagePump {
    /// Creates a stopped pump.
    ///
    /// The pump claims the manager's fault-event stream; create it before any
    /// other component that might want those events.
    ///
    /// # Parameters
    /// * `manager` - Connection manager providing the consumption connection
    /// * `provider` - Channel provider used for purges and error-queue forwards
    /// * `converter` - Conversion from broker deliveries to incoming messages
    /// * `settings` - Prefetch, retry, circuit-breaker, and shutdown tuning
    pub fn new(
        manager: Arc<ConnectionManager>,
        provider: Arc<ChannelProvider>,
        converter: MessageConverter,
        settings: PumpSettings,
    ) -> MessagePump {
        let fault_events = Arc::new(AsyncMutex::new(manager.take_fault_events()));

        MessagePump {
            manager,
            provider,
            converter,
            settings,
            state: PumpState::Stopped,
            init: None,
            shutdown: None,
            loop_handle: None,
            fault_events,
            semaphore: None,
            max_concurrency: 0,
        }
    }

    /// Configures the callbacks and push settings without starting consumption.
    /// Purges the input queue first when the settings ask for it.
    ///
    /// # Parameters
    /// * `handler` - Callback invoked for every reconstructed delivery
    /// * `critical` - Callback fired when the circuit breaker trips
    /// * `push` - Input queue, error queue, and transaction mode for this endpoint
    ///
    /// # Returns
    /// `Ok(())` once the pump is ready to start; `PumpStateError` when the pump
    /// is not stopped, `PurgeError` when a requested startup purge fails.
    pub async fn init(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        critical: CriticalErrorHandler,
        push: PushSettings,
    ) -> Result<(), AmqpError> {
        if self.state != PumpState::Stopped {
            return Err(AmqpError::PumpStateError("init".to_owned()));
        }

        if push.purge_on_startup {
            let purged = QueuePurger::new(self.provider.clone())
                .purge(&push.input_queue)
                .await?;
            debug!(queue = push.input_queue, purged, "input queue purged on startup");
        }

        self.init = Some(PumpInit {
            handler,
            critical,
            push,
        });
        Ok(())
    }

    /// Opens the consuming channel and begins feeding the worker pool.
    ///
    /// # Parameters
    /// * `max_concurrency` - Upper bound on concurrently processed deliveries;
    ///   values below one are raised to one
    ///
    /// # Returns
    /// `Ok(())` once the receive loop is running; `PumpStateError` when the
    /// pump is not stopped or `init` has not been called.
    pub async fn start(&mut self, max_concurrency: usize) -> Result<(), AmqpError> {
        if self.state != PumpState::Stopped {
            return Err(AmqpError::PumpStateError("start".to_owned()));
        }
        let init = self
            .init
            .clone()
            .ok_or_else(|| AmqpError::PumpStateError("start before init".to_owned()))?;

        self.state = PumpState::Starting;

        let concurrency = max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let core = Arc::new(PumpCore {
            manager: self.manager.clone(),
            forwarder: PoisonForwarder::new(self.provider.clone()),
            converter: self.converter.clone(),
            settings: self.settings.clone(),
            breaker: RepeatedFailuresCircuitBreaker::new(
                &format!("'{}' message pump", init.push.input_queue),
                self.settings.time_to_wait_before_triggering_circuit_breaker,
            ),
            retries: RetryRegistry::default(),
            semaphore: semaphore.clone(),
            consumer_tag: format!("{} - {}", init.push.input_queue, Uuid::new_v4()),
            prefetch: prefetch_limit(
                self.settings.prefetch_count,
                self.settings.prefetch_multiplier,
                concurrency.min(u16::MAX as usize) as u16,
            ),
            init,
        });

        self.loop_handle = Some(tokio::spawn(run_loop(
            core,
            shutdown_rx,
            self.fault_events.clone(),
        )));
        self.shutdown = Some(shutdown_tx);
        self.semaphore = Some(semaphore);
        self.max_concurrency = concurrency as u32;
        self.state = PumpState::Running;
        Ok(())
    }

    /// Stops consuming and drains in-flight workers. Idempotent; safe to call
    /// from any state.
    ///
    /// The loop join and the worker drain share a single deadline of
    /// `shutdown_timeout` from the moment `stop` is called. Workers still
    /// running at the deadline are abandoned; their unacknowledged deliveries
    /// are redelivered by the broker.
    pub async fn stop(&mut self) -> Result<(), AmqpError> {
        if self.state == PumpState::Stopped {
            return Ok(());
        }
        self.state = PumpState::Stopping;

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }

        // One deadline bounds the loop join and the worker drain together.
        let deadline = Instant::now() + self.settings.shutdown_timeout;

        if let Some(mut handle) = self.loop_handle.take() {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = err.to_string(), "receive loop panicked"),
                Err(_) => {
                    warn!("receive loop did not stop within the shutdown timeout, aborting it");
                    handle.abort();
                }
            }
        }

        if let Some(semaphore) = self.semaphore.take() {
            match timeout_at(deadline, semaphore.acquire_many(self.max_concurrency)).await {
                Ok(_) => debug!("all workers drained"),
                Err(_) => warn!(
                    "in-flight workers did not finish within the shutdown timeout, abandoning them"
                ),
            }
        }

        self.state = PumpState::Stopped;
        Ok(())
    }
}

async fn run_loop(
    core: Arc<PumpCore>,
    mut shutdown: watch::Receiver<bool>,
    faults: Arc<AsyncMutex<FaultEvents>>,
) {
    // Held for the loop's lifetime; released back to the pump when the task
    // ends or is aborted.
    let mut faults = faults.lock().await;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match consume_once(&core, &mut shutdown, &mut faults).await {
            Ok(()) => break,
            Err(err) => {
                warn!(error = err.to_string(), "receive loop failed, reconnecting");

                if let BreakerAction::Tripped(reason) =
                    core.breaker.record_failure(&err.to_string())
                {
                    (core.init.critical.as_ref())(&reason);
                }

                tokio::select! {
                    _ = tokio::time::sleep(core.settings.reconnect_backoff) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

async fn consume_once(
    core: &Arc<PumpCore>,
    shutdown: &mut watch::Receiver<bool>,
    faults: &mut FaultEvents,
) -> Result<(), AmqpError> {
    let conn = core.manager.consumption_connection().await?;

    let channel = match conn.create_channel().await {
        Ok(c) => c,
        Err(err) => {
            error!(error = err.to_string(), "error creating consuming channel");
            return Err(AmqpError::ChannelFault(err.to_string()));
        }
    };

    if let Err(err) = channel
        .basic_qos(core.prefetch, BasicQosOptions::default())
        .await
    {
        error!(error = err.to_string(), "error setting prefetch limit");
        return Err(AmqpError::ChannelFault(err.to_string()));
    }

    let mut consumer = match channel
        .basic_consume(
            &core.init.push.input_queue,
            &core.consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
    {
        Ok(c) => c,
        Err(err) => {
            error!(error = err.to_string(), "error creating the consumer");
            return Err(AmqpError::ConnectionFault(err.to_string()));
        }
    };

    core.breaker.record_success();
    debug!(
        queue = core.init.push.input_queue,
        prefetch = core.prefetch,
        "consuming"
    );

    let result = loop {
        tokio::select! {
            _ = shutdown.changed() => break Ok(()),

            event = next_fault(faults) => {
                if event.role == ConnectionRole::Consumption {
                    break Err(AmqpError::ConnectionFault(event.reason));
                }
                // Administration faults heal on the next lease; not ours to handle.
                debug!(reason = event.reason, "administration connection fault observed");
            }

            delivery = consumer.next() => match delivery {
                Some(Ok(delivery)) => {
                    core.breaker.record_success();

                    let permit = match core.semaphore.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break Ok(()),
                    };

                    let worker = core.clone();
                    tokio::spawn(async move {
                        worker.process(delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(err)) => break Err(AmqpError::ConnectionFault(err.to_string())),
                None => break Err(AmqpError::ConnectionFault("consumer stream ended".to_owned())),
            }
        }
    };

    if let Err(err) = channel.close(200, "pump stopped").await {
        debug!(error = err.to_string(), "error closing consuming channel");
    }

    result
}

async fn next_fault(faults: &mut FaultEvents) -> ConnectionEvent {
    match faults {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

impl PumpCore {
    async fn process(&self, delivery: Delivery) {
        let message = match self.converter.incoming(&delivery) {
            Ok(m) => m,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "unusable delivery, moving straight to the error queue"
                );
                let raw = IncomingMessage {
                    message_id: Uuid::new_v4().to_string(),
                    headers: headers_from_table(&delivery.properties),
                    body: delivery.data.clone(),
                };
                if self
                    .forwarder
                    .forward(&raw, &self.init.push.error_queue)
                    .await
                    .is_ok()
                {
                    let _ = ack(&delivery).await;
                }
                return;
            }
        };

        let tracer = global::tracer("amqp pump");
        let (_ctx, mut span) = otel::consumer_span(&tracer, &message);

        let ack_early =
            self.init.push.required_transaction_mode == TransportTransactionMode::None;
        if ack_early && ack(&delivery).await.is_err() {
            return;
        }

        match self.init.handler.handle(&message).await {
            Ok(()) => {
                self.retries.clear(&message.message_id);
                span.set_status(Status::Ok);

                if !ack_early && ack(&delivery).await.is_err() {
                    span.set_status(Status::error("failure to ack message"));
                }
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::error(err.to_string()));

                if ack_early {
                    // Already acknowledged; at-most-once mode accepts the loss.
                    warn!(
                        message_id = message.message_id,
                        error = err.to_string(),
                        "handler failed after early ack"
                    );
                    return;
                }

                self.handle_failure(&delivery, &message, &err.to_string())
                    .await;
            }
        }
    }

    async fn handle_failure(&self, delivery: &Delivery, message: &IncomingMessage, reason: &str) {
        let attempts = self.retries.record_failure(&message.message_id);

        if attempts <= self.settings.immediate_retry_attempts {
            warn!(
                message_id = message.message_id,
                attempts, reason, "handler failed, requeueing for an immediate retry"
            );

            if let Err(err) = delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
            {
                error!(error = err.to_string(), "error requeueing message");
            }
            return;
        }

        self.retries.clear(&message.message_id);

        match self
            .forwarder
            .forward(message, &self.init.push.error_queue)
            .await
        {
            Ok(()) => {
                let _ = ack(delivery).await;
            }
            Err(err) => {
                // Neither acked nor retried: the broker redelivers it once the
                // channel goes away, so the message is not silently lost.
                error!(
                    error = err.to_string(),
                    message_id = message.message_id,
                    "error-queue forward failed, leaving message unacknowledged"
                );
            }
        }
    }
}

async fn ack(delivery: &Delivery) -> Result<(), AmqpError> {
    match delivery.ack(BasicAckOptions { multiple: false }).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = err.to_string(), "error acking message");
            Err(AmqpError::AckFailure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, ProviderSettings};
    use std::time::Duration;

    fn pump() -> MessagePump {
        let manager = Arc::new(ConnectionManager::new(ConnectionSettings::default()));
        let provider = Arc::new(ChannelProvider::new(
            manager.clone(),
            ProviderSettings::default(),
        ));
        MessagePump::new(
            manager,
            provider,
            MessageConverter::new(),
            PumpSettings::default(),
        )
    }

    #[test]
    fn prefetch_derives_from_concurrency_when_unset() {
        assert_eq!(prefetch_limit(0, 3, 10), 30);
        assert_eq!(prefetch_limit(0, 3, u16::MAX), u16::MAX);
    }

    #[test]
    fn explicit_prefetch_is_never_below_concurrency() {
        assert_eq!(prefetch_limit(5, 3, 10), 10);
        assert_eq!(prefetch_limit(50, 3, 10), 50);
    }

    #[test]
    fn retry_registry_counts_per_message() {
        let retries = RetryRegistry::default();

        assert_eq!(retries.record_failure("a"), 1);
        assert_eq!(retries.record_failure("a"), 2);
        assert_eq!(retries.record_failure("b"), 1);

        retries.clear("a");
        assert_eq!(retries.record_failure("a"), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_from_stopped() {
        let mut pump = pump();
        assert!(pump.stop().await.is_ok());
        assert!(pump.stop().await.is_ok());
    }

    #[tokio::test]
    async fn stop_bounds_join_and_drain_by_one_shutdown_window() {
        let mut pump = pump();
        pump.settings.shutdown_timeout = Duration::from_millis(100);
        pump.state = PumpState::Running;
        // A receive loop that never reacts to shutdown and a worker that never
        // finishes; each wait alone would run to the deadline.
        pump.loop_handle = Some(tokio::spawn(std::future::pending::<()>()));

        let semaphore = Arc::new(Semaphore::new(4));
        let busy_worker = semaphore.clone().acquire_owned().await.unwrap();
        pump.semaphore = Some(semaphore);
        pump.max_concurrency = 4;

        let started = std::time::Instant::now();
        assert!(pump.stop().await.is_ok());

        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_millis(180),
            "stop took {elapsed:?}, longer than one shutdown window"
        );
        drop(busy_worker);
    }

    #[tokio::test]
    async fn start_requires_init() {
        let mut pump = pump();
        assert!(matches!(
            pump.start(4).await,
            Err(AmqpError::PumpStateError(_))
        ));
    }
}
