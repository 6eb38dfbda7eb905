//! Generation slots and the per-exchange reader task.
//!
//! One slot per agent role. `start` is synchronous: it validates the slot and
//! its prerequisite, moves the slot to `Generating` and spawns the reader.
//! Every chunk's frames are folded under a single lock, so the ledger never
//! observes half a chunk, and a slot that is no longer current (canceled or
//! superseded) is never folded into again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::errors::{ExchangeError, StartError, StoreError};
use crate::event::{AgentEvent, classify};
use crate::frame::{Frame, frame_batches};
use crate::hook::CompletionHook;
use crate::ledger::{Ledger, LedgerDelta, Message};
use crate::model::{AgentRole, FieldMap};
use crate::request::{ExchangeRequest, GenerationRequest};
use crate::transport::ExchangeTransport;

/// Generation state of one agent role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub enum SlotState {
    #[default]
    Idle,
    Generating,
    Complete,
    Failed,
}

impl SlotState {
    /// True for `Complete` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SlotState::Complete | SlotState::Failed)
    }
}

/// How one exchange ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub exchange_id: uuid::Uuid,
    pub agent: AgentRole,
    /// `Complete`, `Failed`, or `Idle` when canceled or released.
    pub state: SlotState,
    /// Finalized artifact, only for `Complete`.
    pub artifact: Option<String>,
    /// Failure reason, only for `Failed`.
    pub failure: Option<String>,
    /// Result of the completion hook, when it ran.
    pub persisted: Option<Result<(), StoreError>>,
}

/// Progress reported to the screen while an exchange runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// First event of every exchange.
    Started {
        exchange_id: uuid::Uuid,
        agent: AgentRole,
    },
    /// One event was folded into the ledger.
    Folded {
        exchange_id: uuid::Uuid,
        change: LedgerDelta,
    },
    /// A malformed frame was skipped.
    Skipped {
        exchange_id: uuid::Uuid,
        reason: String,
    },
    /// Terminal event.
    Finished { outcome: ExchangeOutcome },
}

#[derive(Default)]
struct Slot {
    state: SlotState,
    exchange: Option<uuid::Uuid>,
    abort: Option<watch::Sender<bool>>,
    artifact: String,
    turn_result: Option<String>,
}

struct Workspace {
    ledger: Ledger,
    slots: [Slot; 3],
}

impl Workspace {
    fn slot(&self, role: AgentRole) -> &Slot {
        &self.slots[role.index()]
    }

    fn slot_mut(&mut self, role: AgentRole) -> &mut Slot {
        &mut self.slots[role.index()]
    }

    fn is_current(&self, role: AgentRole, exchange_id: uuid::Uuid) -> bool {
        let slot = self.slot(role);
        slot.state == SlotState::Generating && slot.exchange == Some(exchange_id)
    }

    fn fill_context(&self, request: &mut ExchangeRequest) {
        match request.agent {
            AgentRole::Planner => {}
            AgentRole::Writer => {
                if request.section_outline.trim().is_empty() {
                    request.section_outline = self.slot(AgentRole::Planner).artifact.clone();
                }
                if request.critique.trim().is_empty() {
                    request.critique = self.slot(AgentRole::Reviewer).artifact.clone();
                }
            }
            AgentRole::Reviewer => {
                if request.draft.trim().is_empty() {
                    request.draft = self.slot(AgentRole::Writer).artifact.clone();
                }
            }
        }
    }
}

struct ControllerInner {
    transport: Arc<dyn ExchangeTransport>,
    hook: Option<Arc<dyn CompletionHook>>,
    buffer_capacity: usize,
    workspace: Mutex<Workspace>,
}

enum BatchEnd {
    Ended,
    BackendError(String),
}

struct FoldReport {
    events: Vec<ExchangeEvent>,
    end: Option<BatchEnd>,
}

impl ControllerInner {
    fn lock(&self) -> MutexGuard<'_, Workspace> {
        self.workspace.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds one chunk's frames. `None` when the exchange is no longer current.
    fn fold_batch(
        &self,
        agent: AgentRole,
        exchange_id: uuid::Uuid,
        frames: Vec<Frame>,
    ) -> Option<FoldReport> {
        let mut ws = self.lock();
        if !ws.is_current(agent, exchange_id) {
            return None;
        }
        let mut report = FoldReport {
            events: Vec::new(),
            end: None,
        };
        for frame in frames {
            let event = match frame {
                Frame::Done => AgentEvent::StreamEnd,
                Frame::Payload(payload) => match classify(&payload) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(%exchange_id, %agent, error = %err, "skipping malformed frame");
                        report.events.push(ExchangeEvent::Skipped {
                            exchange_id,
                            reason: err.reason,
                        });
                        continue;
                    }
                },
            };
            let end = match &event {
                AgentEvent::StreamEnd => Some(BatchEnd::Ended),
                AgentEvent::Error { message } => Some(BatchEnd::BackendError(message.clone())),
                _ => None,
            };
            let change = ws.ledger.apply(event);
            if let LedgerDelta::Finalized { index, agent: owner } = change
                && owner == agent
            {
                let text = ws.ledger.display_text(&ws.ledger.messages()[index]).to_string();
                ws.slot_mut(agent).turn_result = Some(text);
            }
            report.events.push(ExchangeEvent::Folded {
                exchange_id,
                change,
            });
            if end.is_some() {
                report.end = end;
                break;
            }
        }
        Some(report)
    }

    /// Moves a current exchange to `Complete`, returning its artifact.
    fn complete(&self, agent: AgentRole, exchange_id: uuid::Uuid) -> Option<String> {
        let mut ws = self.lock();
        if !ws.is_current(agent, exchange_id) {
            return None;
        }
        let sealed = ws
            .ledger
            .seal(agent)
            .map(|index| ws.ledger.display_text(&ws.ledger.messages()[index]).to_string());
        let slot = ws.slot_mut(agent);
        let artifact = sealed.or_else(|| slot.turn_result.take()).unwrap_or_default();
        slot.state = SlotState::Complete;
        slot.exchange = None;
        slot.abort = None;
        slot.turn_result = None;
        slot.artifact = artifact.clone();
        Some(artifact)
    }

    /// Moves a current exchange to `Failed`. The open message stays open.
    fn fail(&self, agent: AgentRole, exchange_id: uuid::Uuid) -> bool {
        let mut ws = self.lock();
        if !ws.is_current(agent, exchange_id) {
            return false;
        }
        let slot = ws.slot_mut(agent);
        slot.state = SlotState::Failed;
        slot.exchange = None;
        slot.abort = None;
        slot.turn_result = None;
        true
    }

    /// Moves a generating slot back to `Idle` and wakes its reader.
    fn release(&self, agent: AgentRole, exchange_id: Option<uuid::Uuid>) -> bool {
        let mut ws = self.lock();
        let slot = ws.slot_mut(agent);
        if slot.state != SlotState::Generating
            || exchange_id.is_some_and(|id| slot.exchange != Some(id))
        {
            return false;
        }
        slot.state = SlotState::Idle;
        slot.exchange = None;
        slot.turn_result = None;
        if let Some(abort) = slot.abort.take() {
            let _ = abort.send(true);
        }
        true
    }
}

/// Builder for a `GenerationController`.
pub struct ControllerBuilder {
    transport: Arc<dyn ExchangeTransport>,
    hook: Option<Arc<dyn CompletionHook>>,
    fields: FieldMap,
    buffer_capacity: usize,
}

impl ControllerBuilder {
    /// Designated-field mapping for this screen context.
    pub fn field_map(mut self, fields: FieldMap) -> Self {
        self.fields = fields;
        self
    }

    /// Hook invoked after exchanges that declare a persist target complete.
    pub fn completion_hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Bounded buffer between the reader task and `ExchangeHandle`.
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> GenerationController {
        GenerationController {
            inner: Arc::new(ControllerInner {
                transport: self.transport,
                hook: self.hook,
                buffer_capacity: self.buffer_capacity,
                workspace: Mutex::new(Workspace {
                    ledger: Ledger::new(self.fields),
                    slots: Default::default(),
                }),
            }),
        }
    }
}

/// Owns the ledger and the three generation slots of one screen context.
#[derive(Clone)]
pub struct GenerationController {
    inner: Arc<ControllerInner>,
}

impl GenerationController {
    /// Starts a builder around a transport.
    pub fn builder(transport: Arc<dyn ExchangeTransport>) -> ControllerBuilder {
        ControllerBuilder {
            transport,
            hook: None,
            fields: FieldMap::default(),
            buffer_capacity: 128,
        }
    }

    /// Starts one exchange for the request's role.
    ///
    /// Rejections happen before any network activity. Must be called inside a
    /// Tokio runtime; the reader runs as a spawned task.
    pub fn start(&self, request: GenerationRequest) -> Result<ExchangeHandle, StartError> {
        let GenerationRequest { mut wire, persist } = request;
        let agent = wire.agent;
        let exchange_id = uuid::Uuid::new_v4();
        let (abort_tx, abort_rx) = watch::channel(false);
        {
            let mut ws = self.inner.lock();
            if ws.slot(agent).state == SlotState::Generating {
                debug!(%agent, "start rejected: already running");
                return Err(StartError::AlreadyRunning { role: agent });
            }
            if let Some(requires) = agent.prerequisite()
                && ws.slot(requires).artifact.trim().is_empty()
            {
                debug!(%agent, %requires, "start rejected: prerequisite missing");
                return Err(StartError::MissingPrerequisite {
                    role: agent,
                    requires,
                });
            }
            ws.fill_context(&mut wire);
            if let Some((designated, expected)) = field_mismatch(ws.ledger.field_map(), &wire) {
                warn!(
                    %exchange_id,
                    %agent,
                    granularity = %wire.granularity,
                    %designated,
                    %expected,
                    "field map does not match request granularity; structured results may not fold"
                );
            }
            if ws.ledger.reset_open(agent).is_some() {
                debug!(%agent, "discarded stale open message");
            }
            let slot = ws.slot_mut(agent);
            slot.state = SlotState::Generating;
            slot.exchange = Some(exchange_id);
            slot.abort = Some(abort_tx.clone());
            slot.artifact.clear();
            slot.turn_result = None;
        }
        info!(%exchange_id, %agent, project = %wire.project_name, granularity = %wire.granularity, "generation started");

        let (tx, rx) = mpsc::channel(self.inner.buffer_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        tokio::spawn(exchange_task(
            self.inner.clone(),
            exchange_id,
            ExchangeJob { wire, persist },
            tx,
            final_tx,
            abort_rx,
        ));

        Ok(ExchangeHandle {
            exchange_id,
            agent,
            rx,
            final_rx,
            abort_handle: AbortHandle {
                inner: self.inner.clone(),
                agent,
                exchange_id,
                tx: abort_tx,
            },
            saw_terminal: false,
        })
    }

    /// Cancels whatever exchange the role is running. Returns false when idle.
    pub fn cancel(&self, agent: AgentRole) -> bool {
        let released = self.inner.release(agent, None);
        if released {
            info!(%agent, "generation canceled");
        }
        released
    }

    /// Current slot state for a role.
    pub fn slot_state(&self, agent: AgentRole) -> SlotState {
        self.inner.lock().slot(agent).state
    }

    /// Latest finalized (or seeded) artifact for a role; empty when none.
    pub fn artifact(&self, agent: AgentRole) -> String {
        self.inner.lock().slot(agent).artifact.clone()
    }

    /// Loads a stored artifact, for example a section outline read from the
    /// store. Refused while the role is generating.
    pub fn seed_artifact(&self, agent: AgentRole, text: impl Into<String>) -> bool {
        let mut ws = self.inner.lock();
        let slot = ws.slot_mut(agent);
        if slot.state == SlotState::Generating {
            return false;
        }
        slot.artifact = text.into();
        true
    }

    /// Appends the user's instruction to the ledger.
    pub fn note_user(&self, text: impl Into<String>) {
        self.inner.lock().ledger.push_user(text);
    }

    /// Copy of the ledger's messages.
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().ledger.messages().to_vec()
    }

    /// Runs a pure projection over the ledger.
    pub fn render<R>(&self, project: impl FnOnce(&Ledger) -> R) -> R {
        project(&self.inner.lock().ledger)
    }
}

/// Handle used to cancel one running exchange.
#[derive(Clone)]
pub struct AbortHandle {
    inner: Arc<ControllerInner>,
    agent: AgentRole,
    exchange_id: uuid::Uuid,
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Cancels the exchange. The slot is `Idle` when this returns and nothing
    /// more is folded; a no-op once the exchange has ended.
    pub fn abort(&self) {
        if self.inner.release(self.agent, Some(self.exchange_id)) {
            info!(exchange_id = %self.exchange_id, agent = %self.agent, "generation canceled");
        }
        let _ = self.tx.send(true);
    }
}

/// Streaming handle returned by `GenerationController::start`.
///
/// Dropping it releases the exchange.
pub struct ExchangeHandle {
    exchange_id: uuid::Uuid,
    agent: AgentRole,
    rx: mpsc::Receiver<ExchangeEvent>,
    final_rx: oneshot::Receiver<ExchangeOutcome>,
    abort_handle: AbortHandle,
    saw_terminal: bool,
}

impl ExchangeHandle {
    pub fn exchange_id(&self) -> uuid::Uuid {
        self.exchange_id
    }

    pub fn agent(&self) -> AgentRole {
        self.agent
    }

    /// Returns a handle that can cancel the exchange.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Cancels the exchange.
    pub fn cancel(&self) {
        self.abort_handle.abort();
    }

    /// Waits for the next progress event. `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<ExchangeEvent> {
        let event = self.rx.recv().await;
        if let Some(ExchangeEvent::Finished { .. }) = &event {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events and returns the outcome.
    pub async fn finish(mut self) -> Result<ExchangeOutcome, ExchangeError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(ExchangeEvent::Finished { .. }) => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }
        self.final_rx.await.map_err(|_| {
            ExchangeError::protocol(format!(
                "exchange task ended without an outcome (agent={})",
                self.agent
            ))
        })
    }
}

struct ExchangeJob {
    wire: ExchangeRequest,
    persist: Option<crate::hook::PersistTarget>,
}

/// Designated and expected field names when the controller's mapping differs
/// from what the backend uses for the request's granularity.
fn field_mismatch(fields: &FieldMap, wire: &ExchangeRequest) -> Option<(String, String)> {
    let designated = fields.field(wire.agent);
    let expected = FieldMap::for_granularity(wire.granularity);
    let expected = expected.field(wire.agent);
    (designated != expected).then(|| (designated.to_owned(), expected.to_owned()))
}

async fn aborted(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn exchange_task(
    inner: Arc<ControllerInner>,
    exchange_id: uuid::Uuid,
    job: ExchangeJob,
    tx: mpsc::Sender<ExchangeEvent>,
    final_tx: oneshot::Sender<ExchangeOutcome>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let agent = job.wire.agent;
    let mut outcome = ExchangeOutcome {
        exchange_id,
        agent,
        state: SlotState::Idle,
        artifact: None,
        failure: None,
        persisted: None,
    };

    let started = send_event(
        &tx,
        ExchangeEvent::Started {
            exchange_id,
            agent,
        },
    )
    .await;
    if !started {
        inner.release(agent, Some(exchange_id));
        let _ = final_tx.send(outcome);
        return;
    }

    let opened = tokio::select! {
        biased;
        _ = aborted(&mut abort_rx) => None,
        _ = tx.closed() => None,
        opened = inner.transport.open(&job.wire) => Some(opened),
    };
    let bytes = match opened {
        Some(Ok(bytes)) => bytes,
        Some(Err(err)) => {
            warn!(%exchange_id, %agent, error = %err, "exchange failed to open");
            if inner.fail(agent, exchange_id) {
                outcome.state = SlotState::Failed;
                outcome.failure = Some(err.to_string());
            }
            return finish(&tx, final_tx, outcome).await;
        }
        None => {
            inner.release(agent, Some(exchange_id));
            return finish(&tx, final_tx, outcome).await;
        }
    };

    let mut batches = Box::pin(frame_batches(bytes));
    loop {
        let next = tokio::select! {
            biased;
            _ = aborted(&mut abort_rx) => {
                debug!(%exchange_id, %agent, "reader stopped by cancellation");
                return finish(&tx, final_tx, outcome).await;
            }
            _ = tx.closed() => {
                debug!(%exchange_id, %agent, "exchange released by consumer");
                inner.release(agent, Some(exchange_id));
                return finish(&tx, final_tx, outcome).await;
            }
            next = batches.next() => next,
        };

        let end = match next {
            Some(Ok(frames)) => {
                let Some(report) = inner.fold_batch(agent, exchange_id, frames) else {
                    return finish(&tx, final_tx, outcome).await;
                };
                for event in report.events {
                    if !send_event(&tx, event).await {
                        inner.release(agent, Some(exchange_id));
                        return finish(&tx, final_tx, outcome).await;
                    }
                }
                match report.end {
                    Some(end) => end,
                    None => continue,
                }
            }
            Some(Err(err)) => {
                warn!(%exchange_id, %agent, error = %err, "exchange transport failed");
                if inner.fail(agent, exchange_id) {
                    outcome.state = SlotState::Failed;
                    outcome.failure = Some(err.to_string());
                }
                return finish(&tx, final_tx, outcome).await;
            }
            None => BatchEnd::Ended,
        };

        match end {
            BatchEnd::Ended => {
                let Some(artifact) = inner.complete(agent, exchange_id) else {
                    return finish(&tx, final_tx, outcome).await;
                };
                info!(%exchange_id, %agent, chars = artifact.chars().count(), "generation complete");
                outcome.state = SlotState::Complete;
                outcome.persisted = persist(&inner, &job, &artifact).await;
                outcome.artifact = Some(artifact);
            }
            BatchEnd::BackendError(message) => {
                warn!(%exchange_id, %agent, %message, "backend signaled an error");
                if inner.fail(agent, exchange_id) {
                    outcome.state = SlotState::Failed;
                    outcome.failure = Some(message);
                }
            }
        }
        return finish(&tx, final_tx, outcome).await;
    }
}

async fn persist(
    inner: &ControllerInner,
    job: &ExchangeJob,
    artifact: &str,
) -> Option<Result<(), StoreError>> {
    let hook = inner.hook.as_ref()?;
    let target = job.persist.as_ref()?;
    if artifact.trim().is_empty() {
        debug!(?target, "nothing to persist");
        return None;
    }
    let result = hook.on_complete(target, artifact).await;
    if let Err(err) = &result {
        error!(?target, error = %err, "failed to persist artifact");
    }
    Some(result)
}

async fn finish(
    tx: &mpsc::Sender<ExchangeEvent>,
    final_tx: oneshot::Sender<ExchangeOutcome>,
    outcome: ExchangeOutcome,
) {
    let _ = send_event(
        tx,
        ExchangeEvent::Finished {
            outcome: outcome.clone(),
        },
    )
    .await;
    let _ = final_tx.send(outcome);
}

async fn send_event(tx: &mpsc::Sender<ExchangeEvent>, event: ExchangeEvent) -> bool {
    tx.send(event).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::PersistTarget;
    use crate::model::{Author, Granularity};
    use crate::transport::ByteStream;
    use futures::StreamExt as _;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PLANNER_WIRE: &str = concat!(
        "data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"第一章\"}\n\n",
        "data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"：觉醒\"}\n\n",
        "data: {\"type\":\"end\",\"agent\":\"planner\",\"data\":{\"novel_outline\":\"第一章：觉醒（终稿）\"}}\n\n",
        "data: [DONE]\n\n",
    );

    #[derive(Clone)]
    enum Behavior {
        ImmediateError(ExchangeError),
        Chunks(Vec<Result<&'static str, ExchangeError>>),
        ChunksThenStall(Vec<&'static str>),
    }

    struct FakeTransport {
        calls: AtomicUsize,
        requests: Mutex<Vec<ExchangeRequest>>,
        behavior: Mutex<Behavior>,
    }

    impl FakeTransport {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                behavior: Mutex::new(behavior),
            })
        }

        fn set(&self, behavior: Behavior) {
            *self.behavior.lock().expect("lock") = behavior;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ExchangeTransport for FakeTransport {
        async fn open(&self, request: &ExchangeRequest) -> Result<ByteStream, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().expect("lock").push(request.clone());
            let behavior = self.behavior.lock().expect("lock").clone();
            match behavior {
                Behavior::ImmediateError(err) => Err(err),
                Behavior::Chunks(chunks) => Ok(Box::pin(stream::iter(
                    chunks
                        .into_iter()
                        .map(|c| c.map(|s| bytes::Bytes::from_static(s.as_bytes()))),
                ))),
                Behavior::ChunksThenStall(chunks) => Ok(Box::pin(
                    stream::iter(
                        chunks
                            .into_iter()
                            .map(|s| Ok(bytes::Bytes::from_static(s.as_bytes()))),
                    )
                    .chain(stream::pending()),
                )),
            }
        }
    }

    #[derive(Default)]
    struct CountingHook {
        calls: Mutex<Vec<(PersistTarget, String)>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CompletionHook for CountingHook {
        async fn on_complete(
            &self,
            target: &PersistTarget,
            artifact: &str,
        ) -> Result<(), StoreError> {
            self.calls
                .lock()
                .expect("lock")
                .push((target.clone(), artifact.to_string()));
            if self.fail {
                return Err(StoreError::Transport("store offline".into()));
            }
            Ok(())
        }
    }

    fn controller(transport: Arc<FakeTransport>) -> GenerationController {
        GenerationController::builder(transport).build()
    }

    fn chapter_target() -> PersistTarget {
        PersistTarget::ChapterOutline {
            project: "p".into(),
            chapter_id: "c1".into(),
            title: "觉醒".into(),
        }
    }

    fn split_at_odd_points(wire: &'static str) -> Vec<Result<&'static str, ExchangeError>> {
        let mut chunks = Vec::new();
        let mut rest = wire;
        while !rest.is_empty() {
            let mut cut = rest.len().min(13);
            while !rest.is_char_boundary(cut) {
                cut += 1;
            }
            let (head, tail) = rest.split_at(cut);
            chunks.push(Ok(head));
            rest = tail;
        }
        chunks
    }

    #[tokio::test]
    async fn completion_payload_wins_over_concatenated_deltas() {
        let transport = FakeTransport::new(Behavior::Chunks(split_at_odd_points(PLANNER_WIRE)));
        let controller = controller(transport.clone());

        let handle = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p").topic("觉醒"))
            .expect("start");
        let outcome = handle.finish().await.expect("outcome");

        assert_eq!(outcome.state, SlotState::Complete);
        assert_eq!(outcome.artifact.as_deref(), Some("第一章：觉醒（终稿）"));
        let messages = controller.snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].author, Author::Agent(AgentRole::Planner));
        assert!(messages[0].finalized);
        assert_eq!(messages[0].field("novel_outline"), Some("第一章：觉醒（终稿）"));
        assert_eq!(controller.slot_state(AgentRole::Planner), SlotState::Complete);
        assert_eq!(controller.artifact(AgentRole::Planner), "第一章：觉醒（终稿）");
    }

    #[tokio::test]
    async fn writer_without_planner_artifact_is_rejected_before_any_request() {
        let transport = FakeTransport::new(Behavior::Chunks(vec![]));
        let controller = controller(transport.clone());

        let err = controller
            .start(GenerationRequest::new(AgentRole::Writer, "p"))
            .err()
            .expect("rejected");
        assert_eq!(
            err,
            StartError::MissingPrerequisite {
                role: AgentRole::Writer,
                requires: AgentRole::Planner
            }
        );
        let err = controller
            .start(GenerationRequest::new(AgentRole::Reviewer, "p"))
            .err()
            .expect("rejected");
        assert!(matches!(err, StartError::MissingPrerequisite { requires: AgentRole::Writer, .. }));
        tokio::task::yield_now().await;
        assert_eq!(transport.calls(), 0);
        assert_eq!(controller.slot_state(AgentRole::Writer), SlotState::Idle);
        assert!(controller.snapshot().is_empty());
    }

    #[tokio::test]
    async fn retrigger_while_generating_is_a_no_op() {
        let transport = FakeTransport::new(Behavior::ChunksThenStall(vec![
            "data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"一\"}\n\n",
        ]));
        let controller = controller(transport.clone());

        let mut handle = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("start");
        assert!(matches!(handle.next_event().await, Some(ExchangeEvent::Started { .. })));
        assert!(matches!(handle.next_event().await, Some(ExchangeEvent::Folded { .. })));

        let before = controller.snapshot();
        let err = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .err()
            .expect("rejected");
        assert_eq!(err, StartError::AlreadyRunning { role: AgentRole::Planner });
        assert_eq!(controller.snapshot(), before);
        assert_eq!(transport.calls(), 1);

        handle.cancel();
        let outcome = handle.finish().await.expect("outcome");
        assert_eq!(outcome.state, SlotState::Idle);
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let valid_a = "data: {\"type\":\"stream\",\"agent\":\"writer\",\"content\":\"甲\"}\n\n";
        let malformed = "data: {\"type\":\"stream\",\"agent\":\n\n";
        let valid_b = "data: {\"type\":\"stream\",\"agent\":\"writer\",\"content\":\"乙\"}\n\n";
        let transport = FakeTransport::new(Behavior::Chunks(vec![
            Ok(valid_a),
            Ok(malformed),
            Ok(valid_b),
        ]));
        let controller = controller(transport.clone());
        controller.seed_artifact(AgentRole::Planner, "outline");

        let mut handle = controller
            .start(GenerationRequest::new(AgentRole::Writer, "p"))
            .expect("start");
        let mut skipped = 0;
        while let Some(event) = handle.next_event().await {
            match event {
                ExchangeEvent::Skipped { .. } => skipped += 1,
                ExchangeEvent::Finished { outcome } => {
                    assert_eq!(outcome.state, SlotState::Complete);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(skipped, 1);

        let mut expected = Ledger::default();
        expected.apply(AgentEvent::StreamDelta {
            agent: AgentRole::Writer,
            content: "甲".into(),
        });
        expected.apply(AgentEvent::StreamDelta {
            agent: AgentRole::Writer,
            content: "乙".into(),
        });
        expected.seal(AgentRole::Writer);
        assert_eq!(controller.snapshot(), expected.messages());
        assert_eq!(controller.artifact(AgentRole::Writer), "甲乙");
    }

    #[tokio::test]
    async fn cancel_mid_stream_keeps_partial_message_and_returns_to_idle() {
        let transport = FakeTransport::new(Behavior::ChunksThenStall(vec![
            "data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"第一\"}\n\n",
            "data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"章\"}\n\n",
        ]));
        let hook = Arc::new(CountingHook::default());
        let controller = GenerationController::builder(transport.clone())
            .completion_hook(hook.clone())
            .build();

        let mut handle = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p").persist_to(chapter_target()))
            .expect("start");
        let mut folded = 0;
        while folded < 2 {
            if let Some(ExchangeEvent::Folded { .. }) = handle.next_event().await {
                folded += 1;
            }
        }
        handle.cancel();
        assert_eq!(controller.slot_state(AgentRole::Planner), SlotState::Idle);

        let outcome = handle.finish().await.expect("outcome");
        assert_eq!(outcome.state, SlotState::Idle);
        assert_eq!(outcome.artifact, None);
        let messages = controller.snapshot();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].finalized);
        assert_eq!(messages[0].field("novel_outline"), Some("第一章"));
        assert!(hook.calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn controller_cancel_reports_whether_anything_was_running() {
        let transport = FakeTransport::new(Behavior::ChunksThenStall(vec![]));
        let controller = controller(transport);
        assert!(!controller.cancel(AgentRole::Planner));
        let handle = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("start");
        assert!(controller.cancel(AgentRole::Planner));
        let outcome = handle.finish().await.expect("outcome");
        assert_eq!(outcome.state, SlotState::Idle);
    }

    #[tokio::test]
    async fn transport_error_fails_slot_without_finalizing() {
        let transport = FakeTransport::new(Behavior::Chunks(vec![
            Ok("data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"半\"}\n\ndata: {\"ty"),
            Err(ExchangeError::transport("connection reset")),
        ]));
        let hook = Arc::new(CountingHook::default());
        let controller = GenerationController::builder(transport)
            .completion_hook(hook.clone())
            .build();

        let outcome = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p").persist_to(chapter_target()))
            .expect("start")
            .finish()
            .await
            .expect("outcome");
        assert_eq!(outcome.state, SlotState::Failed);
        assert!(outcome.failure.as_deref().is_some_and(|f| f.contains("connection reset")));
        let messages = controller.snapshot();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].finalized);
        assert_eq!(messages[0].field("novel_outline"), Some("半"));
        assert_eq!(controller.artifact(AgentRole::Planner), "");
        assert!(hook.calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn close_mid_frame_fails_slot() {
        let transport = FakeTransport::new(Behavior::Chunks(vec![Ok(
            "data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"x\"}",
        )]));
        let controller = controller(transport);
        let outcome = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("start")
            .finish()
            .await
            .expect("outcome");
        assert_eq!(outcome.state, SlotState::Failed);
        assert!(controller.snapshot().is_empty());
    }

    #[tokio::test]
    async fn open_failure_fails_slot() {
        let transport = FakeTransport::new(Behavior::ImmediateError(ExchangeError::Backend {
            status: 500,
            message: "boom".into(),
        }));
        let controller = controller(transport);
        let outcome = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("start")
            .finish()
            .await
            .expect("outcome");
        assert_eq!(outcome.state, SlotState::Failed);
        assert_eq!(controller.slot_state(AgentRole::Planner), SlotState::Failed);
    }

    #[tokio::test]
    async fn backend_error_event_is_folded_and_fails_slot() {
        let transport = FakeTransport::new(Behavior::Chunks(vec![Ok(concat!(
            "data: {\"agent\":\"system\",\"data\":{\"message\":\"开始reviewer工作...\"}}\n\n",
            "data: {\"type\":\"stream\",\"agent\":\"reviewer\",\"content\":\"不错\"}\n\n",
            "data: {\"error\":\"rate limited\"}\n\n",
            "data: [DONE]\n\n",
        ))]));
        let controller = controller(transport);
        controller.seed_artifact(AgentRole::Writer, "draft");

        let outcome = controller
            .start(GenerationRequest::new(AgentRole::Reviewer, "p"))
            .expect("start")
            .finish()
            .await
            .expect("outcome");
        assert_eq!(outcome.state, SlotState::Failed);
        assert_eq!(outcome.failure.as_deref(), Some("rate limited"));

        let messages = controller.snapshot();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].author, Author::System);
        assert_eq!(messages[1].field("critique"), Some("不错"));
        assert!(!messages[1].finalized);
        assert_eq!(messages[2].field("message"), Some("Error: rate limited"));
    }

    #[tokio::test]
    async fn hook_fires_once_on_completion_and_failure_does_not_roll_back() {
        let transport = FakeTransport::new(Behavior::Chunks(vec![Ok(PLANNER_WIRE)]));
        let hook = Arc::new(CountingHook {
            fail: true,
            ..CountingHook::default()
        });
        let controller = GenerationController::builder(transport)
            .completion_hook(hook.clone())
            .build();

        let outcome = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p").persist_to(chapter_target()))
            .expect("start")
            .finish()
            .await
            .expect("outcome");
        assert_eq!(outcome.state, SlotState::Complete);
        assert!(matches!(outcome.persisted, Some(Err(StoreError::Transport(_)))));
        let calls = hook.calls.lock().expect("lock").clone();
        assert_eq!(
            calls,
            vec![(chapter_target(), "第一章：觉醒（终稿）".to_string())]
        );
        let messages = controller.snapshot();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].finalized);
        assert_eq!(controller.slot_state(AgentRole::Planner), SlotState::Complete);
    }

    #[tokio::test]
    async fn hook_is_skipped_without_a_persist_target() {
        let transport = FakeTransport::new(Behavior::Chunks(vec![Ok(PLANNER_WIRE)]));
        let hook = Arc::new(CountingHook::default());
        let controller = GenerationController::builder(transport)
            .completion_hook(hook.clone())
            .build();
        let outcome = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("start")
            .finish()
            .await
            .expect("outcome");
        assert_eq!(outcome.persisted, None);
        assert!(hook.calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn clean_close_without_completion_seals_deltas() {
        let transport = FakeTransport::new(Behavior::Chunks(vec![
            Ok("data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"大\"}\n\n"),
            Ok("data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"纲\"}\n\n"),
        ]));
        let controller = controller(transport);
        let outcome = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("start")
            .finish()
            .await
            .expect("outcome");
        assert_eq!(outcome.state, SlotState::Complete);
        assert_eq!(outcome.artifact.as_deref(), Some("大纲"));
        assert!(controller.snapshot()[0].finalized);
    }

    #[tokio::test]
    async fn regeneration_after_failure_discards_the_stale_open_message() {
        let transport = FakeTransport::new(Behavior::Chunks(vec![
            Ok("data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"旧\"}\n\n"),
            Err(ExchangeError::transport("reset")),
        ]));
        let controller = controller(transport.clone());
        let first = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("start")
            .finish()
            .await
            .expect("outcome");
        assert_eq!(first.state, SlotState::Failed);

        transport.set(Behavior::Chunks(vec![Ok(
            "data: {\"type\":\"stream\",\"agent\":\"planner\",\"content\":\"新\"}\n\ndata: [DONE]\n\n",
        )]));
        let second = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("restart from failed")
            .finish()
            .await
            .expect("outcome");
        assert_eq!(second.state, SlotState::Complete);
        let messages = controller.snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].field("novel_outline"), Some("新"));
        assert!(messages[0].finalized);
    }

    #[tokio::test]
    async fn writer_request_is_filled_from_planner_and_reviewer_artifacts() {
        let transport = FakeTransport::new(Behavior::Chunks(vec![Ok("data: [DONE]\n\n")]));
        let controller = controller(transport.clone());
        controller.seed_artifact(AgentRole::Planner, "小节大纲");
        controller.seed_artifact(AgentRole::Reviewer, "节奏太快");

        controller
            .start(GenerationRequest::new(AgentRole::Writer, "p"))
            .expect("start")
            .finish()
            .await
            .expect("outcome");
        let requests = transport.requests.lock().expect("lock").clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].section_outline, "小节大纲");
        assert_eq!(requests[0].critique, "节奏太快");
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_the_slot() {
        let transport = FakeTransport::new(Behavior::ChunksThenStall(vec![]));
        let controller = controller(transport);
        let handle = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("start");
        drop(handle);
        for _ in 0..100 {
            if controller.slot_state(AgentRole::Planner) == SlotState::Idle {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(controller.slot_state(AgentRole::Planner), SlotState::Idle);
    }

    #[tokio::test]
    async fn seeding_is_refused_while_generating() {
        let transport = FakeTransport::new(Behavior::ChunksThenStall(vec![]));
        let controller = controller(transport);
        let handle = controller
            .start(GenerationRequest::new(AgentRole::Planner, "p"))
            .expect("start");
        assert!(!controller.seed_artifact(AgentRole::Planner, "x"));
        assert!(controller.seed_artifact(AgentRole::Writer, "y"));
        handle.cancel();
        let _ = handle.finish().await;
    }

    #[test]
    fn granularity_field_mismatch_is_detected() {
        let novel = FieldMap::default();
        let mut wire = GenerationRequest::new(AgentRole::Planner, "p").wire;
        assert_eq!(field_mismatch(&novel, &wire), None);

        wire.granularity = Granularity::Chapter;
        assert_eq!(
            field_mismatch(&novel, &wire),
            Some(("novel_outline".to_owned(), "chapter_structure".to_owned()))
        );

        wire.agent = AgentRole::Writer;
        assert_eq!(field_mismatch(&novel, &wire), None);
    }
}
