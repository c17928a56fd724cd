//! The replay loop.
//!
//! Producers talk to the loop through a [`RetryQueueHandle`], which only
//! pushes commands onto an unbounded channel and so never waits on replays.
//! The loop owns every task, keeps them in a time-ordered heap and runs due
//! replays concurrently in a `JoinSet`. Results leave through an outcome
//! channel; the queue never touches scheduler state itself.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::task::{RetryOutcome, RetryTask};
use crate::config::BackendRegistry;
use crate::error::{InferenceError, RetryQueueError};
use crate::inference::{BackoffPolicy, InferenceClient, InferenceResponse};
use crate::metrics::MetricsCollector;

enum Command {
    Enqueue { task: RetryTask, delay: Duration },
    Cancel(Uuid),
}

/// Cloneable producer side of the retry queue.
#[derive(Clone)]
pub struct RetryQueueHandle {
    commands: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
}

impl RetryQueueHandle {
    /// Registers a task to be replayed after `delay`.
    ///
    /// A task for a job that already has one replaces it.
    pub fn enqueue(&self, task: RetryTask, delay: Duration) -> Result<(), RetryQueueError> {
        if task.max_attempts == 0 {
            return Err(RetryQueueError::Disabled(task.backend));
        }

        self.commands
            .send(Command::Enqueue { task, delay })
            .map_err(|_| RetryQueueError::Closed)
    }

    /// Drops any task for `job_id`. A replay already in flight finishes but
    /// its result is discarded.
    pub fn cancel(&self, job_id: Uuid) -> Result<(), RetryQueueError> {
        self.commands
            .send(Command::Cancel(job_id))
            .map_err(|_| RetryQueueError::Closed)
    }

    /// Tasks currently owned by the loop, in flight or waiting.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Consumer side handed to [`RetryQueue::new`].
pub struct RetryCommands {
    commands: mpsc::UnboundedReceiver<Command>,
    pending: Arc<AtomicUsize>,
}

/// Creates a connected handle and command receiver.
///
/// The two halves are created before the loop so the inference client can
/// hold the handle while the loop holds the client.
pub fn channel() -> (RetryQueueHandle, RetryCommands) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        RetryQueueHandle {
            commands: tx,
            pending: Arc::clone(&pending),
        },
        RetryCommands {
            commands: rx,
            pending,
        },
    )
}

struct Slot {
    task: RetryTask,
    /// Bumped on every (re)schedule; stale heap entries carry an old value.
    generation: u64,
    in_flight: bool,
}

type ReplayResult = (Uuid, u64, Result<InferenceResponse, InferenceError>);

/// Replay loop state.
pub struct RetryQueue {
    client: Arc<InferenceClient>,
    registry: Arc<BackendRegistry>,
    commands: mpsc::UnboundedReceiver<Command>,
    outcomes: mpsc::UnboundedSender<RetryOutcome>,
    pending: Arc<AtomicUsize>,
    slots: HashMap<Uuid, Slot>,
    due: BinaryHeap<Reverse<(Instant, u64, Uuid)>>,
    next_generation: u64,
    replays: JoinSet<ReplayResult>,
    metrics: MetricsCollector,
}

impl RetryQueue {
    /// Builds the loop. Returns it with the outcome receiver.
    pub fn new(
        commands: RetryCommands,
        client: Arc<InferenceClient>,
        registry: Arc<BackendRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<RetryOutcome>) {
        let (outcomes, outcome_rx) = mpsc::unbounded_channel();
        let queue = Self {
            client,
            registry,
            commands: commands.commands,
            outcomes,
            pending: commands.pending,
            slots: HashMap::new(),
            due: BinaryHeap::new(),
            next_generation: 0,
            replays: JoinSet::new(),
            metrics: MetricsCollector::new(),
        };
        (queue, outcome_rx)
    }

    /// Runs until `shutdown` fires, or until every handle is dropped and no
    /// work is left.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Retry queue started");
        let mut commands_open = true;

        loop {
            let next_due = self.next_due();
            let deadline = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(pending = self.slots.len(), "Retry queue shutting down");
                    break;
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
                Some(joined) = self.replays.join_next(), if !self.replays.is_empty() => match joined {
                    Ok((job_id, generation, result)) => self.handle_result(job_id, generation, result),
                    Err(e) => error!(error = %e, "Replay task panicked"),
                },
                _ = tokio::time::sleep_until(deadline), if next_due.is_some() => {
                    self.dispatch_due(Instant::now());
                }
            }

            self.publish_depth();

            if !commands_open && self.slots.is_empty() && self.replays.is_empty() {
                break;
            }
        }

        self.replays.abort_all();
        info!("Retry queue stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { task, delay } => {
                let job_id = task.job_id;
                info!(
                    job_id = %job_id,
                    backend = %task.backend,
                    max_attempts = task.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retry task enqueued"
                );
                let generation = self.bump_generation();
                self.slots.insert(
                    job_id,
                    Slot {
                        task,
                        generation,
                        in_flight: false,
                    },
                );
                self.due
                    .push(Reverse((Instant::now() + delay, generation, job_id)));
            }
            Command::Cancel(job_id) => {
                if let Some(slot) = self.slots.remove(&job_id) {
                    info!(
                        job_id = %job_id,
                        attempts = slot.task.attempts,
                        in_flight = slot.in_flight,
                        "Retry task cancelled"
                    );
                }
            }
        }
    }

    /// Earliest valid deadline, discarding stale heap entries.
    fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, generation, job_id))) = self.due.peek().copied() {
            if self.is_current(job_id, generation) {
                return Some(at);
            }
            self.due.pop();
        }
        None
    }

    fn is_current(&self, job_id: Uuid, generation: u64) -> bool {
        self.slots
            .get(&job_id)
            .is_some_and(|slot| slot.generation == generation && !slot.in_flight)
    }

    fn dispatch_due(&mut self, now: Instant) {
        while let Some(Reverse((at, generation, job_id))) = self.due.peek().copied() {
            if at > now {
                break;
            }
            self.due.pop();

            if !self.is_current(job_id, generation) {
                continue;
            }

            let Some(slot) = self.slots.get_mut(&job_id) else {
                continue;
            };
            slot.in_flight = true;

            let client = Arc::clone(&self.client);
            let registry = Arc::clone(&self.registry);
            let backend = slot.task.backend.clone();
            let request = slot.task.request.clone();
            let replay = slot.task.attempts + 1;

            debug!(job_id = %job_id, backend = %backend, replay = replay, "Replaying backend call");

            self.replays.spawn(async move {
                let result = match registry.get(&backend) {
                    Some(config) => client.attempt(&backend, &config, &request, replay).await,
                    None => Err(InferenceError::UnknownBackend(backend.clone())),
                };
                (job_id, generation, result)
            });
        }
    }

    fn handle_result(
        &mut self,
        job_id: Uuid,
        generation: u64,
        result: Result<InferenceResponse, InferenceError>,
    ) {
        let Some(slot) = self.slots.get_mut(&job_id) else {
            debug!(job_id = %job_id, "Discarding replay result for cancelled task");
            return;
        };
        if slot.generation != generation {
            debug!(job_id = %job_id, "Discarding replay result for replaced task");
            return;
        }
        slot.in_flight = false;

        match result {
            Ok(mut response) => {
                slot.task.record_attempt(None);
                let attempts = slot.task.attempts;
                response.attempts = attempts;
                let backend = slot.task.backend.clone();
                self.slots.remove(&job_id);

                info!(job_id = %job_id, backend = %backend, replays = attempts, "Replay succeeded");
                self.emit(RetryOutcome::Resolved {
                    job_id,
                    backend,
                    attempts,
                    response,
                });
            }
            Err(err) => {
                slot.task.record_attempt(Some(&err));
                let attempts = slot.task.attempts;
                let max_attempts = slot.task.max_attempts;
                let backend = slot.task.backend.clone();

                if !err.is_retryable() || slot.task.is_exhausted() {
                    let error = if err.is_retryable() {
                        InferenceError::RetryExhausted {
                            job_id,
                            attempts,
                            last_error: err.to_string(),
                        }
                    } else {
                        err
                    };
                    self.slots.remove(&job_id);

                    error!(
                        job_id = %job_id,
                        backend = %backend,
                        replays = attempts,
                        error = %error,
                        "Retry task abandoned"
                    );
                    self.emit(RetryOutcome::Abandoned {
                        job_id,
                        backend,
                        attempts,
                        error,
                    });
                    return;
                }

                let policy = match self.registry.get(&backend) {
                    Some(config) => BackoffPolicy::for_replays(&config),
                    None => BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(60)),
                };
                let retry_in = policy.delay(attempts + 1);

                slot.task.reschedule(retry_in);
                let generation = self.bump_generation();
                if let Some(slot) = self.slots.get_mut(&job_id) {
                    slot.generation = generation;
                }
                self.due
                    .push(Reverse((Instant::now() + retry_in, generation, job_id)));

                warn!(
                    job_id = %job_id,
                    backend = %backend,
                    replays = attempts,
                    max_attempts = max_attempts,
                    retry_in_ms = retry_in.as_millis() as u64,
                    error = %err,
                    "Replay failed, rescheduled"
                );
                self.emit(RetryOutcome::Rescheduled {
                    job_id,
                    backend,
                    attempts,
                    max_attempts,
                    retry_in,
                    error: err.to_string(),
                });
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn emit(&self, outcome: RetryOutcome) {
        if self.outcomes.send(outcome).is_err() {
            warn!("Retry outcome receiver dropped");
        }
    }

    fn publish_depth(&self) {
        let depth = self.slots.len();
        self.pending.store(depth, Ordering::SeqCst);
        self.metrics.update_retry_queue_depth(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::inference::{HealthTracker, InferenceRequest, InferenceTransport};
    use crate::scheduler::JobKind;
    use crate::telemetry::TelemetryAggregator;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport that plays back a fixed script, then keeps failing.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<(), InferenceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<(), InferenceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    fn transient(backend: &str) -> InferenceError {
        InferenceError::Rejected {
            backend: backend.to_string(),
            status: 503,
            message: "busy".to_string(),
            retryable: true,
        }
    }

    #[async_trait]
    impl InferenceTransport for ScriptedTransport {
        async fn send(
            &self,
            backend: &str,
            _config: &BackendConfig,
            _request: &InferenceRequest,
        ) -> Result<InferenceResponse, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(transient(backend)));
            next.map(|_| InferenceResponse::new(backend))
        }
    }

    struct Fixture {
        handle: RetryQueueHandle,
        outcomes: mpsc::UnboundedReceiver<RetryOutcome>,
        transport: Arc<ScriptedTransport>,
        shutdown: CancellationToken,
    }

    fn start(script: Vec<Result<(), InferenceError>>) -> Fixture {
        let config = BackendConfig::default()
            .with_backoff(Duration::from_millis(5), 2.0, Duration::from_millis(20))
            .with_local_queue(3, Duration::from_millis(5));
        let registry = Arc::new(
            BackendRegistry::new(vec![("gpu-a".to_string(), config)]).unwrap(),
        );
        let transport = Arc::new(ScriptedTransport::new(script));
        let client = Arc::new(InferenceClient::new(
            Arc::clone(&registry),
            transport.clone(),
            Arc::new(HealthTracker::new()),
            Arc::new(TelemetryAggregator::new(32)),
        ));

        let (handle, commands) = channel();
        let (queue, outcomes) = RetryQueue::new(commands, client, registry);
        let shutdown = CancellationToken::new();
        tokio::spawn(queue.run(shutdown.clone()));

        Fixture {
            handle,
            outcomes,
            transport,
            shutdown,
        }
    }

    fn task(max_attempts: u32) -> RetryTask {
        let request = InferenceRequest::new(Uuid::new_v4(), JobKind::Image, "retry me");
        RetryTask::new("gpu-a", request, max_attempts, Duration::from_millis(5), "timeout")
    }

    async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<RetryOutcome>) -> RetryOutcome {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("outcome in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_resolves_on_second_replay() {
        let mut fx = start(vec![Err(transient("gpu-a")), Ok(())]);
        let task = task(3);
        let job_id = task.job_id;
        fx.handle.enqueue(task, Duration::from_millis(5)).unwrap();

        match next_outcome(&mut fx.outcomes).await {
            RetryOutcome::Rescheduled { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
        match next_outcome(&mut fx.outcomes).await {
            RetryOutcome::Resolved {
                job_id: resolved,
                attempts,
                response,
                ..
            } => {
                assert_eq!(resolved, job_id);
                assert_eq!(attempts, 2);
                assert_eq!(response.attempts, 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_abandons_at_ceiling_exactly_once() {
        let mut fx = start(vec![]);
        fx.handle.enqueue(task(2), Duration::from_millis(5)).unwrap();

        assert!(matches!(
            next_outcome(&mut fx.outcomes).await,
            RetryOutcome::Rescheduled { attempts: 1, .. }
        ));
        match next_outcome(&mut fx.outcomes).await {
            RetryOutcome::Abandoned { attempts, error, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(error, InferenceError::RetryExhausted { attempts: 2, .. }));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fx.outcomes.try_recv().is_err());
        assert_eq!(fx.transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.handle.pending(), 0);

        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_permanent_error_abandons_immediately() {
        let mut fx = start(vec![Err(InferenceError::Rejected {
            backend: "gpu-a".to_string(),
            status: 400,
            message: "bad prompt".to_string(),
            retryable: false,
        })]);
        fx.handle.enqueue(task(5), Duration::from_millis(5)).unwrap();

        match next_outcome(&mut fx.outcomes).await {
            RetryOutcome::Abandoned { attempts, error, .. } => {
                assert_eq!(attempts, 1);
                assert!(matches!(error, InferenceError::Rejected { status: 400, .. }));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_task_never_replays() {
        let mut fx = start(vec![Ok(())]);
        let task = task(3);
        let job_id = task.job_id;
        fx.handle.enqueue(task, Duration::from_millis(30)).unwrap();
        fx.handle.cancel(job_id).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(fx.outcomes.try_recv().is_err());
        assert_eq!(fx.transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.handle.pending(), 0);

        fx.shutdown.cancel();
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let (handle, _commands) = channel();
        let err = handle.enqueue(task(0), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RetryQueueError::Disabled(_)));
    }
}
