use super::{DeliveryHandler, DeliveryRecord, DestinationIdentity};
use crate::error::{BrokerError, StartError};
use crate::log::{EventLog, LogConsumer, LogRecord};
use async_trait::async_trait;
use event_schema::Event;
use parking_lot::{Mutex, RwLock};
use resilience::{retry_until_stopped, RetryOutcome, RetryPolicy};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub retry: RetryPolicy,
    /// Upper bound on a single poll, and so on how long `stop()` waits for an idle loop
    pub poll_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[async_trait]
pub trait Controller: Send + Sync {
    async fn start(&self) -> Result<(), StartError>;

    /// Signal the poll loop, wait for it to exit, and leave the consumer group
    async fn stop(&self);

    fn handler(&self) -> Arc<dyn DeliveryHandler>;

    /// Takes effect from the next record; an in-flight retry sequence keeps its handler
    fn set_handler(&self, handler: Arc<dyn DeliveryHandler>);

    fn state(&self) -> ControllerState;

    fn identity(&self) -> &DestinationIdentity;
}

type HandlerSlot = Arc<RwLock<Arc<dyn DeliveryHandler>>>;

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Consumes one destination's view of the topic and drives its handler.
///
/// Poll, decode, retry and commit run strictly in sequence on one task, so there is
/// never more than one delivery in flight per instance.
pub struct DestinationController {
    identity: DestinationIdentity,
    log: Arc<dyn EventLog>,
    handler: HandlerSlot,
    settings: ControllerSettings,
    state: Arc<Mutex<ControllerState>>,
    running: tokio::sync::Mutex<Option<RunningLoop>>,
}

impl DestinationController {
    pub fn new(
        identity: DestinationIdentity,
        log: Arc<dyn EventLog>,
        handler: Arc<dyn DeliveryHandler>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            identity,
            log,
            handler: Arc::new(RwLock::new(handler)),
            settings,
            state: Arc::new(Mutex::new(ControllerState::Stopped)),
            running: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Controller for DestinationController {
    async fn start(&self) -> Result<(), StartError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.take() {
            if *self.state.lock() != ControllerState::Stopped {
                *running = Some(current);
                debug!(group_id = %self.identity.group_id, "Controller already running");
                return Ok(());
            }
            // The loop ended on its own after its consumer closed
            let _ = current.task.await;
        }

        *self.state.lock() = ControllerState::Starting;

        let consumer = match self.log.subscribe(&self.identity) {
            Ok(consumer) => consumer,
            Err(e) => {
                *self.state.lock() = ControllerState::Stopped;
                error!(
                    group_id = %self.identity.group_id,
                    topic = %self.identity.topic,
                    error = %e,
                    "Failed to start destination controller"
                );
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let poll_loop = PollLoop {
            identity: self.identity.clone(),
            consumer,
            handler: Arc::clone(&self.handler),
            settings: self.settings,
            stop_rx,
            state: Arc::clone(&self.state),
        };
        // Published before spawning so a loop that exits at once is not overwritten
        *self.state.lock() = ControllerState::Running;
        let task = tokio::spawn(poll_loop.run());
        *running = Some(RunningLoop { stop_tx, task });

        info!(
            group_id = %self.identity.group_id,
            topic = %self.identity.topic,
            max_retries = self.settings.retry.max_retries,
            "Destination controller started"
        );
        Ok(())
    }

    async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(RunningLoop { stop_tx, task }) = running.take() else {
            return;
        };

        *self.state.lock() = ControllerState::Stopping;
        let _ = stop_tx.send(true);

        if let Err(e) = task.await {
            error!(
                group_id = %self.identity.group_id,
                error = %e,
                "Destination poll task failed"
            );
        }

        *self.state.lock() = ControllerState::Stopped;
        info!(
            group_id = %self.identity.group_id,
            topic = %self.identity.topic,
            "Destination controller stopped"
        );
    }

    fn handler(&self) -> Arc<dyn DeliveryHandler> {
        Arc::clone(&*self.handler.read())
    }

    fn set_handler(&self, handler: Arc<dyn DeliveryHandler>) {
        *self.handler.write() = handler;
    }

    fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    fn identity(&self) -> &DestinationIdentity {
        &self.identity
    }
}

/// State owned by the spawned task
struct PollLoop {
    identity: DestinationIdentity,
    consumer: Box<dyn LogConsumer>,
    handler: HandlerSlot,
    settings: ControllerSettings,
    stop_rx: watch::Receiver<bool>,
    state: Arc<Mutex<ControllerState>>,
}

impl PollLoop {
    async fn run(mut self) {
        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => break,
                polled = self.consumer.poll(self.settings.poll_timeout) => polled,
            };

            let record = match polled {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(BrokerError::Closed) => {
                    warn!(group_id = %self.identity.group_id, "Consumer closed, leaving poll loop");
                    break;
                }
                Err(e) => {
                    warn!(group_id = %self.identity.group_id, error = %e, "Consumer error");
                    continue;
                }
            };

            let Some(delivery) = self.decode(&record) else {
                if !*self.stop_rx.borrow() {
                    self.commit(record.partition, record.offset + 1);
                }
                continue;
            };

            if !self.deliver(&delivery).await {
                break;
            }

            if *self.stop_rx.borrow() {
                break;
            }
            self.commit(delivery.partition, delivery.next_offset());
        }

        self.consumer.unsubscribe();
        *self.state.lock() = ControllerState::Stopped;
        debug!(group_id = %self.identity.group_id, "Poll loop exited");
    }

    /// Undecodable records are logged and skipped; the caller still commits past them
    fn decode(&self, record: &LogRecord) -> Option<DeliveryRecord> {
        match Event::from_record_value(record.payload.as_deref()) {
            Ok(event) => Some(DeliveryRecord {
                event,
                partition: record.partition,
                offset: record.offset,
                key: record.key.clone().unwrap_or_default(),
            }),
            Err(e) => {
                warn!(
                    group_id = %self.identity.group_id,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping undecodable message"
                );
                None
            }
        }
    }

    /// Run the retry sequence for one record. Returns `false` when stop interrupted it.
    async fn deliver(&mut self, delivery: &DeliveryRecord) -> bool {
        let snapshot = Arc::clone(&*self.handler.read());
        let span = info_span!(
            "delivery",
            group_id = %self.identity.group_id,
            topic = %self.identity.topic,
            key = %delivery.key_str(),
            partition = delivery.partition,
            offset = delivery.offset,
        );

        let handler = snapshot.as_ref();
        let event = &delivery.event;
        let outcome = retry_until_stopped(&self.settings.retry, &mut self.stop_rx, move || {
            handler.handle(event)
        })
        .instrument(span.clone())
        .await;

        let _entered = span.enter();
        match outcome {
            RetryOutcome::Succeeded { retries, .. } => {
                info!(retries, "Handled message");
                true
            }
            RetryOutcome::Exhausted { error, retries } => {
                warn!(retries, error = %error, "Skipped message after exhausting retries");
                true
            }
            RetryOutcome::Cancelled { retries } => {
                info!(retries, "Delivery interrupted by stop, offset left uncommitted");
                false
            }
        }
    }

    fn commit(&mut self, partition: i32, next_offset: i64) {
        if let Err(e) = self.consumer.commit(partition, next_offset) {
            warn!(
                group_id = %self.identity.group_id,
                partition,
                offset = next_offset,
                error = %e,
                "Failed to commit offset"
            );
        }
    }
}

async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    // A dropped sender also ends the loop
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::MockHandler;
    use crate::log::MemoryLog;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Log whose consumers report closed on every poll
    #[derive(Default)]
    struct ClosedLog {
        subscriptions: AtomicUsize,
    }

    struct ClosedConsumer;

    #[async_trait]
    impl LogConsumer for ClosedConsumer {
        async fn poll(&mut self, _timeout: Duration) -> Result<Option<LogRecord>, BrokerError> {
            Err(BrokerError::Closed)
        }

        fn commit(&mut self, _partition: i32, _next_offset: i64) -> Result<(), BrokerError> {
            Err(BrokerError::Closed)
        }

        fn unsubscribe(&mut self) {}
    }

    impl EventLog for ClosedLog {
        fn subscribe(
            &self,
            _destination: &DestinationIdentity,
        ) -> Result<Box<dyn LogConsumer>, StartError> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ClosedConsumer))
        }
    }

    fn controller(log: &MemoryLog, handler: Arc<dyn DeliveryHandler>) -> DestinationController {
        let settings = ControllerSettings {
            retry: RetryPolicy::new(2, Duration::from_millis(5)),
            poll_timeout: Duration::from_millis(20),
        };
        DestinationController::new(
            DestinationIdentity::new("events", "unit"),
            Arc::new(log.clone()),
            handler,
            settings,
        )
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let log = MemoryLog::new(2);
        let ctrl = controller(&log, Arc::new(MockHandler::succeeding(Duration::ZERO)));
        assert_eq!(ctrl.state(), ControllerState::Stopped);

        ctrl.start().await.unwrap();
        assert_eq!(ctrl.state(), ControllerState::Running);
        assert_eq!(log.group_members("events", "unit"), 1);

        // second start is a no-op, not a second group member
        ctrl.start().await.unwrap();
        assert_eq!(log.group_members("events", "unit"), 1);

        ctrl.stop().await;
        assert_eq!(ctrl.state(), ControllerState::Stopped);
        assert_eq!(log.group_members("events", "unit"), 0);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let log = MemoryLog::new(1);
        let ctrl = controller(&log, Arc::new(MockHandler::succeeding(Duration::ZERO)));

        ctrl.stop().await;
        ctrl.stop().await;
        assert_eq!(ctrl.state(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn test_commits_after_success() {
        let log = MemoryLog::new(1);
        let handler = Arc::new(MockHandler::succeeding(Duration::ZERO));
        let ctrl = controller(&log, handler.clone());
        log.append("events", Some(b"k"), Some(br#"{"user_id":"k","payload":"p"}"#));

        ctrl.start().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while log.committed_offset("events", "unit", 0) != Some(1) {
            assert!(tokio::time::Instant::now() < deadline, "offset never committed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ctrl.stop().await;

        assert_eq!(handler.success_count(), 1);
    }

    #[tokio::test]
    async fn test_set_handler_replaces_handler() {
        let log = MemoryLog::new(1);
        let first: Arc<dyn DeliveryHandler> = Arc::new(MockHandler::failing(Duration::ZERO));
        let ctrl = controller(&log, Arc::clone(&first));

        let second: Arc<dyn DeliveryHandler> = Arc::new(MockHandler::succeeding(Duration::ZERO));
        ctrl.set_handler(Arc::clone(&second));

        assert!(Arc::ptr_eq(&ctrl.handler(), &second));
    }

    #[tokio::test]
    async fn test_closed_consumer_reports_stopped_and_restarts() {
        let log = Arc::new(ClosedLog::default());
        let ctrl = DestinationController::new(
            DestinationIdentity::new("events", "unit"),
            log.clone(),
            Arc::new(MockHandler::succeeding(Duration::ZERO)),
            ControllerSettings::default(),
        );

        ctrl.start().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while ctrl.state() != ControllerState::Stopped {
            assert!(tokio::time::Instant::now() < deadline, "state never became stopped");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // a dead loop does not block a fresh start
        ctrl.start().await.unwrap();
        assert_eq!(log.subscriptions.load(Ordering::SeqCst), 2);
        ctrl.stop().await;
        assert_eq!(ctrl.state(), ControllerState::Stopped);
    }
}
