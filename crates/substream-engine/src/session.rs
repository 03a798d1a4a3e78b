//! Session - one client connection streaming a subscription
//!
//! ## Tasks
//!
//! ```text
//!  partition puller ─┐
//!  partition puller ─┼─ mpsc ─► session loop ─ mpsc ─► SessionHandle (client)
//!  partition puller ─┘            ▲   ▲
//!                                 │   └── closed flag (disconnect monitor)
//!                                 └────── shutdown flag (close / store failure)
//! ```
//!
//! - **Pullers**: one task per owned partition. Reads the log from
//!   `max(committed + 1, earliest)` in order and suspends once
//!   `max_uncommitted_events` read events are not yet committed.
//! - **Session loop**: collects events per partition and emits a batch when it
//!   holds `batch_limit` events or `batch_flush_timeout` passed since its first
//!   event. A cycle with nothing to send emits a keep-alive batch. Enforces
//!   `stream_limit`, `stream_timeout`, `stream_keep_alive_limit` and
//!   `commit_timeout`.
//!
//! ## Assignment Changes
//!
//! `apply_assignment` ignores records older than the last generation acted
//! on. Released partitions are stopped before anything else happens; their
//! buffered events are dropped, never delivered. Added partitions start only
//! after the generation is validated against the store.
//!
//! ## Teardown
//!
//! Whatever ends the stream, the loop records the first end reason, stops
//! every puller, discards cursor state, closes the client channel and asks the
//! streamer to deregister the session and rebalance.
//! A supervisor task does the same if the loop task itself dies.

use crate::assignment::AssignmentManager;
use crate::config::StreamParameters;
use crate::cursor_tracker::{CommitOutcome, CursorTracker, InvalidCursorReason};
use crate::disconnect::{raised, ConnectionProbe, DisconnectMonitor};
use crate::error::{EngineError, Result};
use crate::log::EventLog;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use substream_coordination::{
    retry_with_backoff, AssignmentRecord, CoordinationStore, RetryPolicy,
};
use substream_core::{Cursor, Event, Partition, SessionId, StreamBatch, SubscriptionId};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Sessions owned by this streamer, by id
pub(crate) type SessionRegistry = Arc<RwLock<HashMap<SessionId, Arc<Session>>>>;

const PULLER_CHANNEL_CAPACITY: usize = 64;
const OUTPUT_CHANNEL_CAPACITY: usize = 16;
const MAX_COMMIT_CHECK_PERIOD: Duration = Duration::from_secs(1);
const MIN_COMMIT_CHECK_PERIOD: Duration = Duration::from_millis(10);

/// Why a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// `stream_limit` events were delivered
    StreamLimitReached,
    /// `stream_timeout` elapsed
    StreamTimeout,
    /// `stream_keep_alive_limit` consecutive keep-alive batches were sent
    KeepAliveLimit,
    /// Delivered events stayed uncommitted for `commit_timeout`
    CommitTimeout,
    /// The client went away
    ConnectionLost,
    /// Closed on request
    Closed,
    /// The coordination store stayed unreachable
    CoordinationUnavailable,
    /// The session loop task died
    Failed,
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::StreamLimitReached => "stream_limit_reached",
            SessionEnd::StreamTimeout => "stream_timeout",
            SessionEnd::KeepAliveLimit => "keep_alive_limit",
            SessionEnd::CommitTimeout => "commit_timeout",
            SessionEnd::ConnectionLost => "connection_lost",
            SessionEnd::Closed => "closed",
            SessionEnd::CoordinationUnavailable => "coordination_unavailable",
            SessionEnd::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one commit cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub cursor: Cursor,
    pub outcome: CommitOutcome,
}

/// Client side of a session: the batch stream
pub struct SessionHandle {
    session_id: SessionId,
    subscription_id: SubscriptionId,
    batches: mpsc::Receiver<StreamBatch>,
    end_rx: watch::Receiver<Option<SessionEnd>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn subscription_id(&self) -> &SubscriptionId {
        &self.subscription_id
    }

    /// Next batch, or `None` once the stream ended
    pub async fn next_batch(&mut self) -> Option<StreamBatch> {
        self.batches.recv().await
    }

    /// Why the stream ended (`None` while it is still running)
    pub fn end_reason(&self) -> Option<SessionEnd> {
        *self.end_rx.borrow()
    }
}

/// Collaborators shared by every session of a streamer
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) store: Arc<dyn CoordinationStore>,
    pub(crate) log: Arc<dyn EventLog>,
    pub(crate) assignments: AssignmentManager,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) log_poll_interval: Duration,
    pub(crate) disconnect_poll_interval: Duration,
}

struct PullerHandle {
    generation: u64,
    handle: JoinHandle<()>,
}

struct SessionState {
    /// Newest assignment generation acted on
    generation: u64,
    tracker: CursorTracker,
    pullers: HashMap<Partition, PullerHandle>,
    closed: bool,
}

impl SessionState {
    fn owns(&self, partition: &Partition, generation: u64) -> bool {
        !self.closed
            && self
                .pullers
                .get(partition)
                .is_some_and(|p| p.generation == generation)
    }

    fn stop_puller(&mut self, partition: &Partition) {
        if let Some(puller) = self.pullers.remove(partition) {
            puller.handle.abort();
        }
        self.tracker.release(partition);
    }
}

pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) subscription_id: SubscriptionId,
    pub(crate) client_id: String,
    pub(crate) created_at: i64,
    params: StreamParameters,
    ctx: SessionContext,
    state: Mutex<SessionState>,
    puller_tx: mpsc::Sender<PullerMessage>,
    end_tx: watch::Sender<Option<SessionEnd>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Everything `Session::new` hands back to the streamer
pub(crate) struct SessionParts {
    pub(crate) session: Arc<Session>,
    pub(crate) handle: SessionHandle,
    pub(crate) session_loop: SessionLoop,
    pub(crate) monitor: DisconnectMonitor,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: SessionContext,
        id: SessionId,
        subscription_id: SubscriptionId,
        client_id: String,
        params: StreamParameters,
        created_at: i64,
        probe: Arc<dyn ConnectionProbe>,
        teardown_tx: mpsc::UnboundedSender<SessionId>,
    ) -> SessionParts {
        let (puller_tx, puller_rx) = mpsc::channel(PULLER_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (end_tx, end_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (monitor, closed_rx) = DisconnectMonitor::new(
            format!("session-{}", id),
            probe,
            ctx.disconnect_poll_interval,
            shutdown_tx.subscribe(),
        );

        let session = Arc::new(Session {
            id,
            subscription_id: subscription_id.clone(),
            client_id,
            created_at,
            params,
            ctx,
            state: Mutex::new(SessionState {
                generation: 0,
                tracker: CursorTracker::new(),
                pullers: HashMap::new(),
                closed: false,
            }),
            puller_tx,
            end_tx,
            shutdown_tx,
        });

        let session_loop = SessionLoop {
            session: Arc::clone(&session),
            rx: puller_rx,
            out_tx,
            closed_rx,
            shutdown_rx,
            teardown_tx,
        };

        SessionParts {
            session,
            handle: SessionHandle {
                session_id: id,
                subscription_id,
                batches: out_rx,
                end_rx,
            },
            session_loop,
            monitor,
        }
    }

    /// End the stream. The first recorded reason wins.
    pub(crate) fn stop(&self, reason: SessionEnd) {
        self.record_end(reason);
        self.shutdown_tx.send_replace(true);
    }

    fn record_end(&self, reason: SessionEnd) {
        self.end_tx.send_if_modified(|end| {
            if end.is_none() {
                *end = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn end_reason(&self) -> Option<SessionEnd> {
        *self.end_tx.borrow()
    }

    /// Stop all pullers and discard cursor state. Idempotent.
    pub(crate) async fn release_all(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        for (_, puller) in state.pullers.drain() {
            puller.handle.abort();
        }
        state.tracker = CursorTracker::new();
    }

    /// Partitions currently streamed by this session
    pub(crate) async fn assigned_partitions(&self) -> Vec<Partition> {
        self.state.lock().await.tracker.assigned()
    }

    /// Act on an assignment record.
    ///
    /// Records with a generation not newer than the last one acted on are
    /// ignored. Released partitions stop immediately; added partitions start
    /// from their committed offset once the generation is confirmed current.
    /// The state lock is never held across a store or log call.
    pub(crate) async fn apply_assignment(&self, record: &AssignmentRecord) -> Result<()> {
        let added: Vec<Partition> = {
            let mut state = self.state.lock().await;
            if state.closed || record.generation <= state.generation {
                return Ok(());
            }

            let owned: BTreeSet<Partition> = record.partitions_of(&self.id).into_iter().collect();
            let current: BTreeSet<Partition> = state.pullers.keys().cloned().collect();

            for partition in current.difference(&owned) {
                state.stop_puller(partition);
                info!(
                    session_id = %self.id,
                    partition = %partition,
                    generation = record.generation,
                    "Released partition"
                );
            }
            state.generation = record.generation;
            owned.difference(&current).cloned().collect()
        };
        if added.is_empty() {
            return Ok(());
        }

        match self
            .ctx
            .assignments
            .validate_generation(&self.subscription_id, record.generation)
            .await
        {
            Ok(()) => {}
            Err(EngineError::StaleGeneration { expected, actual }) => {
                debug!(
                    session_id = %self.id,
                    expected,
                    actual,
                    "Assignment superseded before start, waiting for newer record"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let committed = retry_with_backoff(&self.ctx.retry_policy, || {
            self.ctx.store.get_committed_offsets(&self.subscription_id)
        })
        .await?;
        let mut starts = Vec::with_capacity(added.len());
        for partition in added {
            let committed_offset = committed.get(&partition).copied();
            let earliest = self.ctx.log.earliest_offset(&partition).await?;
            let start = committed_offset.map_or(earliest, |c| (c + 1).max(earliest));
            starts.push((partition, committed_offset, start));
        }

        let mut state = self.state.lock().await;
        // closed, or a newer record was applied while the store was read
        if state.closed || state.generation != record.generation {
            return Ok(());
        }
        for (partition, committed_offset, start) in starts {
            if state.pullers.contains_key(&partition) {
                continue;
            }
            let acked_rx = state.tracker.assign(partition.clone(), committed_offset, start);

            let puller = PartitionPuller {
                session_id: self.id,
                partition: partition.clone(),
                generation: record.generation,
                next: start,
                max_uncommitted: self.params.max_uncommitted_events as u64,
                chunk: self.params.batch_size(),
                log: Arc::clone(&self.ctx.log),
                acked_rx,
                tx: self.puller_tx.clone(),
                poll_interval: self.ctx.log_poll_interval,
            };
            let handle = tokio::spawn(puller.run());

            info!(
                session_id = %self.id,
                partition = %partition,
                generation = record.generation,
                start_offset = start,
                committed = ?committed_offset,
                "Acquired partition"
            );
            state.pullers.insert(
                partition,
                PullerHandle {
                    generation: record.generation,
                    handle,
                },
            );
        }

        Ok(())
    }

    /// Acknowledge cursors. Entries are independent of each other.
    ///
    /// A valid cursor is stored durably before the in-memory committed cursor
    /// moves; the state lock is released while the store is written. If the
    /// store stays unreachable the session is closed.
    pub(crate) async fn commit(&self, cursors: Vec<Cursor>) -> Result<Vec<CommitResult>> {
        let mut results = Vec::with_capacity(cursors.len());

        for cursor in cursors {
            let outcome = {
                let state = self.state.lock().await;
                if state.closed {
                    CommitOutcome::InvalidCursor(InvalidCursorReason::PartitionNotAssigned)
                } else {
                    state.tracker.check_commit(&cursor.partition, cursor.offset)
                }
            };

            match outcome {
                CommitOutcome::Committed => {
                    let stored = retry_with_backoff(&self.ctx.retry_policy, || {
                        self.ctx.store.commit_offset(
                            &self.subscription_id,
                            &cursor.partition,
                            cursor.offset,
                        )
                    })
                    .await;

                    if let Err(e) = stored {
                        warn!(
                            session_id = %self.id,
                            cursor = %cursor,
                            error = %e,
                            "Commit could not be stored, closing session"
                        );
                        self.stop(SessionEnd::CoordinationUnavailable);
                        return Err(e.into());
                    }

                    let mut state = self.state.lock().await;
                    // the partition may have been released during the write
                    if !state.closed && state.tracker.is_assigned(&cursor.partition) {
                        state.tracker.apply_commit(&cursor.partition, cursor.offset);
                    }
                    debug!(session_id = %self.id, cursor = %cursor, "Committed cursor");
                }
                CommitOutcome::InvalidCursor(reason) => {
                    debug!(
                        session_id = %self.id,
                        cursor = %cursor,
                        reason = reason.as_str(),
                        "Rejected commit cursor"
                    );
                }
                CommitOutcome::Outdated => {}
            }

            results.push(CommitResult { cursor, outcome });
        }

        Ok(results)
    }
}

// ============================================================
// PARTITION PULLER
// ============================================================

struct PullerMessage {
    partition: Partition,
    generation: u64,
    events: Vec<Event>,
}

struct PartitionPuller {
    session_id: SessionId,
    partition: Partition,
    generation: u64,
    /// Next offset to read
    next: u64,
    max_uncommitted: u64,
    chunk: usize,
    log: Arc<dyn EventLog>,
    /// First offset not yet committed
    acked_rx: watch::Receiver<u64>,
    tx: mpsc::Sender<PullerMessage>,
    poll_interval: Duration,
}

impl PartitionPuller {
    async fn run(mut self) {
        loop {
            let acked = *self.acked_rx.borrow_and_update();
            let in_flight = self.next.saturating_sub(acked);
            if in_flight >= self.max_uncommitted {
                debug!(
                    session_id = %self.session_id,
                    partition = %self.partition,
                    in_flight,
                    "Uncommitted ceiling reached, pausing partition"
                );
                if self.acked_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }

            let budget = (self.max_uncommitted - in_flight).min(self.chunk as u64) as usize;
            match self.log.read(&self.partition, self.next, budget).await {
                Ok(events) => {
                    let Some(last) = events.last() else {
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    };
                    self.next = last.offset + 1;

                    let message = PullerMessage {
                        partition: self.partition.clone(),
                        generation: self.generation,
                        events,
                    };
                    if self.tx.send(message).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(
                        session_id = %self.session_id,
                        partition = %self.partition,
                        error = %e,
                        "Event log read failed"
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

// ============================================================
// SESSION LOOP
// ============================================================

struct PendingBatch {
    generation: u64,
    first_at: Instant,
    events: Vec<Event>,
}

pub(crate) struct SessionLoop {
    session: Arc<Session>,
    rx: mpsc::Receiver<PullerMessage>,
    out_tx: mpsc::Sender<StreamBatch>,
    closed_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    teardown_tx: mpsc::UnboundedSender<SessionId>,
}

/// Counters of one running stream
struct StreamProgress {
    started: Instant,
    last_emit: Instant,
    sent: u64,
    empty_flushes: u32,
}

impl SessionLoop {
    /// Run the loop on its own task. Teardown is requested even if the task
    /// dies.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        let teardown_tx = self.teardown_tx.clone();
        let task = tokio::spawn(self.run());
        tokio::spawn(supervise(session, teardown_tx, task))
    }

    async fn run(mut self) {
        let session = Arc::clone(&self.session);
        info!(
            session_id = %session.id,
            subscription_id = %session.subscription_id,
            client_id = %session.client_id,
            batch_limit = session.params.batch_limit,
            "Session streaming"
        );

        let reason = self.stream().await;
        session.record_end(reason);
        let reason = session.end_reason().unwrap_or(reason);
        session.release_all().await;

        info!(
            session_id = %session.id,
            subscription_id = %session.subscription_id,
            reason = %reason,
            "Session ended"
        );

        // closes the client channel before teardown is requested
        drop(self.out_tx);
        let _ = self.teardown_tx.send(session.id);
    }

    async fn stream(&mut self) -> SessionEnd {
        let params = self.session.params.clone();
        let batch_size = params.batch_size();
        let now = Instant::now();
        let mut progress = StreamProgress {
            started: now,
            last_emit: now,
            sent: 0,
            empty_flushes: 0,
        };
        let mut buffers: BTreeMap<Partition, PendingBatch> = BTreeMap::new();
        let commit_check = commit_check_period(params.commit_timeout);
        // a deadline past the clock's range never fires
        let stream_deadline = if params.stream_timeout.is_zero() {
            None
        } else {
            progress.started.checked_add(params.stream_timeout)
        };

        loop {
            let flush_deadline = if buffers.is_empty() {
                progress.last_emit.checked_add(params.batch_flush_timeout)
            } else {
                buffers
                    .values()
                    .filter_map(|b| b.first_at.checked_add(params.batch_flush_timeout))
                    .min()
            };
            let mut wake = Instant::now() + commit_check;
            for deadline in [flush_deadline, stream_deadline].into_iter().flatten() {
                wake = wake.min(deadline);
            }

            tokio::select! {
                biased;
                _ = raised(&mut self.shutdown_rx) => {
                    return self.session.end_reason().unwrap_or(SessionEnd::Closed);
                }
                _ = raised(&mut self.closed_rx) => return SessionEnd::ConnectionLost,
                message = self.rx.recv() => {
                    let Some(message) = message else {
                        return SessionEnd::Closed;
                    };
                    if !self.session.state.lock().await.owns(&message.partition, message.generation) {
                        continue;
                    }

                    let buffer = buffers
                        .entry(message.partition.clone())
                        .or_insert_with(|| PendingBatch {
                            generation: message.generation,
                            first_at: Instant::now(),
                            events: Vec::new(),
                        });
                    if buffer.generation != message.generation {
                        // partition was released and re-acquired meanwhile
                        *buffer = PendingBatch {
                            generation: message.generation,
                            first_at: Instant::now(),
                            events: Vec::new(),
                        };
                    }
                    buffer.events.extend(message.events);

                    while buffer.events.len() >= batch_size {
                        let rest = buffer.events.split_off(batch_size);
                        let full = std::mem::replace(&mut buffer.events, rest);
                        buffer.first_at = Instant::now();
                        let generation = buffer.generation;
                        if let Some(end) = self
                            .emit(&message.partition, generation, full, &params, &mut progress)
                            .await
                        {
                            return end;
                        }
                    }
                    if buffer.events.is_empty() {
                        buffers.remove(&message.partition);
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    let now = Instant::now();
                    if stream_deadline.is_some_and(|deadline| now >= deadline) {
                        return SessionEnd::StreamTimeout;
                    }
                    if !params.commit_timeout.is_zero() {
                        let state = self.session.state.lock().await;
                        if let Some(partition) = state.tracker.commit_overdue(params.commit_timeout) {
                            warn!(
                                session_id = %self.session.id,
                                partition = %partition,
                                "Commit timeout exceeded"
                            );
                            return SessionEnd::CommitTimeout;
                        }
                    }

                    let expired: Vec<Partition> = buffers
                        .iter()
                        .filter(|(_, b)| is_due(b.first_at, params.batch_flush_timeout, now))
                        .map(|(p, _)| p.clone())
                        .collect();
                    for partition in expired {
                        if let Some(batch) = buffers.remove(&partition) {
                            if let Some(end) = self
                                .emit(&partition, batch.generation, batch.events, &params, &mut progress)
                                .await
                            {
                                return end;
                            }
                        }
                    }

                    if buffers.is_empty()
                        && is_due(progress.last_emit, params.batch_flush_timeout, now)
                    {
                        if let Some(end) = self.keep_alive(&params, &mut progress).await {
                            return end;
                        }
                    }
                }
            }
        }
    }

    /// Deliver one data batch; returns the end reason if the stream must stop
    async fn emit(
        &mut self,
        partition: &Partition,
        generation: u64,
        mut events: Vec<Event>,
        params: &StreamParameters,
        progress: &mut StreamProgress,
    ) -> Option<SessionEnd> {
        let mut limit_reached = false;
        if params.stream_limit > 0 {
            let remaining = params.stream_limit.saturating_sub(progress.sent);
            if events.len() as u64 >= remaining {
                events.truncate(remaining as usize);
                limit_reached = true;
            }
        }
        let last = events.last()?.offset;
        let count = events.len();

        {
            let mut state = self.session.state.lock().await;
            if !state.owns(partition, generation) {
                return None;
            }
            state.tracker.mark_delivered(partition, last);
        }

        let batch = StreamBatch::new(Cursor::new(partition.clone(), last), events);
        if let Err(end) = self.push(batch).await {
            return Some(end);
        }

        progress.sent += count as u64;
        progress.empty_flushes = 0;
        progress.last_emit = Instant::now();
        debug!(
            session_id = %self.session.id,
            partition = %partition,
            offset = last,
            events = count,
            "Delivered batch"
        );

        limit_reached.then_some(SessionEnd::StreamLimitReached)
    }

    async fn keep_alive(
        &mut self,
        params: &StreamParameters,
        progress: &mut StreamProgress,
    ) -> Option<SessionEnd> {
        if let Err(end) = self.push(StreamBatch::keep_alive()).await {
            return Some(end);
        }
        progress.empty_flushes += 1;
        progress.last_emit = Instant::now();

        if params.stream_keep_alive_limit > 0
            && progress.empty_flushes >= params.stream_keep_alive_limit
        {
            return Some(SessionEnd::KeepAliveLimit);
        }
        None
    }

    async fn push(&mut self, batch: StreamBatch) -> std::result::Result<(), SessionEnd> {
        tokio::select! {
            biased;
            _ = raised(&mut self.shutdown_rx) => {
                Err(self.session.end_reason().unwrap_or(SessionEnd::Closed))
            }
            _ = raised(&mut self.closed_rx) => Err(SessionEnd::ConnectionLost),
            sent = self.out_tx.send(batch) => sent.map_err(|_| SessionEnd::ConnectionLost),
        }
    }
}

/// `after` has passed since `at`; never true when the sum overflows
fn is_due(at: Instant, after: Duration, now: Instant) -> bool {
    at.checked_add(after).is_some_and(|due| due <= now)
}

/// Wait for the loop task and clean up after it if it did not finish
async fn supervise(
    session: Arc<Session>,
    teardown_tx: mpsc::UnboundedSender<SessionId>,
    task: JoinHandle<()>,
) {
    let Err(e) = task.await else {
        return;
    };
    error!(
        session_id = %session.id,
        subscription_id = %session.subscription_id,
        error = %e,
        "Session loop failed"
    );
    session.stop(SessionEnd::Failed);
    session.release_all().await;
    let _ = teardown_tx.send(session.id);
}

fn commit_check_period(commit_timeout: Duration) -> Duration {
    if commit_timeout.is_zero() {
        return MAX_COMMIT_CHECK_PERIOD;
    }
    (commit_timeout / 4).clamp(MIN_COMMIT_CHECK_PERIOD, MAX_COMMIT_CHECK_PERIOD)
}
