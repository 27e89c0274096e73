//! Conversation relay: one streamed completion per conversation turn
//!
//! [`ConversationRelay::send_stream`] validates the configuration, claims the
//! conversation's pending-turn slot, and spawns a task that pumps the response
//! body through a [`StreamDecoder`] into the caller's [`TurnSink`]. A sink
//! sees zero or more `on_delta` calls followed by exactly one `on_complete`
//! or `on_error`.
//!
//! Policies:
//! - A second send for a conversation that still has a turn in flight is
//!   rejected with [`Error::TurnInProgress`]; it is never queued.
//! - Aborting a turn that has not produced its terminal signal yields exactly
//!   one `on_error(Error::Cancelled)` and no further deltas. Aborting a
//!   finished turn does nothing.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    config::RelayConfig,
    decoder::{Decoded, StreamDecoder, TerminalSignal},
    error::{Error, Result},
    transport::Transport,
    types::{ChatRequest, Conversation, ConversationId, Message, TurnEvent},
};

/// Receives the output of one streamed turn
pub trait TurnSink: Send {
    /// Newly decoded assistant text, in arrival order. Never empty.
    fn on_delta(&mut self, text: &str);
    /// The turn finished successfully
    fn on_complete(&mut self);
    /// The turn failed or was cancelled
    fn on_error(&mut self, error: Error);
}

/// A [`TurnSink`] built from three closures
pub struct Callbacks<D, C, E> {
    on_delta: D,
    on_complete: C,
    on_error: E,
}

impl<D, C, E> Callbacks<D, C, E>
where
    D: FnMut(&str) + Send,
    C: FnMut() + Send,
    E: FnMut(Error) + Send,
{
    pub fn new(on_delta: D, on_complete: C, on_error: E) -> Self {
        Self {
            on_delta,
            on_complete,
            on_error,
        }
    }
}

impl<D, C, E> TurnSink for Callbacks<D, C, E>
where
    D: FnMut(&str) + Send,
    C: FnMut() + Send,
    E: FnMut(Error) + Send,
{
    fn on_delta(&mut self, text: &str) {
        (self.on_delta)(text)
    }

    fn on_complete(&mut self) {
        (self.on_complete)()
    }

    fn on_error(&mut self, error: Error) {
        (self.on_error)(error)
    }
}

/// Forwards a turn as [`TurnEvent`]s over a channel, e.g. to another process
/// or UI thread. Events sent after the receiver is gone are dropped.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TurnEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<TurnEvent>) -> Self {
        Self { tx }
    }
}

impl TurnSink for ChannelSink {
    fn on_delta(&mut self, text: &str) {
        let _ = self.tx.send(TurnEvent::Delta {
            text: text.to_string(),
        });
    }

    fn on_complete(&mut self) {
        let _ = self.tx.send(TurnEvent::Completed);
    }

    fn on_error(&mut self, error: Error) {
        let _ = self.tx.send(TurnEvent::Failed {
            message: error.to_string(),
        });
    }
}

/// Events of one turn; ends after the terminal event
pub type TurnEventStream = UnboundedReceiverStream<TurnEvent>;

/// Shared state of one in-flight turn
struct TurnControl {
    turn: u64,
    cancel: CancellationToken,
    /// Held while a callback runs. Re-entrant so a callback may abort its own turn.
    gate: ReentrantMutex<()>,
    done: CancellationToken,
}

type PendingTurns = Arc<Mutex<HashMap<ConversationId, Arc<TurnControl>>>>;

thread_local! {
    /// Number of turn gates held by the current thread
    static GATES_HELD: Cell<usize> = const { Cell::new(0) };
}

/// A held delivery gate. Sink callbacks only run while one is alive.
struct Gate<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl<'a> Gate<'a> {
    fn enter(control: &'a TurnControl) -> Self {
        let guard = control.gate.lock();
        GATES_HELD.with(|held| held.set(held.get() + 1));
        Self { _guard: guard }
    }
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        GATES_HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

fn inside_callback() -> bool {
    GATES_HELD.with(|held| held.get() > 0)
}

/// Remove the conversation's slot if it still belongs to `turn`
fn release(pending: &PendingTurns, id: &ConversationId, turn: u64) -> bool {
    let mut map = pending.lock();
    match map.get(id) {
        Some(control) if control.turn == turn => {
            map.remove(id);
            true
        }
        _ => false,
    }
}

fn abort_turn(pending: &PendingTurns, id: &ConversationId, control: &TurnControl) -> bool {
    // From inside a callback, waiting on another turn's gate can deadlock
    // against that turn's callback aborting this one. There the target gate
    // is only taken if it is free or already held by this thread.
    let _gate = if inside_callback() {
        control.gate.try_lock()
    } else {
        Some(control.gate.lock())
    };
    let owned = release(pending, id, control.turn);
    if owned {
        tracing::debug!("Aborting turn {} for conversation {}", control.turn, id);
        control.cancel.cancel();
    }
    owned
}

/// Owned by a turn's task. Frees the slot and marks the turn done even when
/// the task unwinds out of a panicking sink.
struct TurnGuard {
    pending: PendingTurns,
    id: ConversationId,
    control: Arc<TurnControl>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if release(&self.pending, &self.id, self.control.turn) {
            tracing::warn!(
                "Turn {} for conversation {} ended without a terminal callback",
                self.control.turn,
                self.id
            );
        }
        self.control.done.cancel();
    }
}

/// Handle to an in-flight streamed turn
#[derive(Clone)]
pub struct TurnHandle {
    conversation_id: ConversationId,
    control: Arc<TurnControl>,
    pending: PendingTurns,
}

impl TurnHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Abort the turn and close its connection.
    ///
    /// Returns `false` if the turn had already produced its terminal signal.
    /// Once this returns, the sink receives no further deltas. Called from
    /// inside another turn's callback, it does not wait for a callback of
    /// this turn that is already running.
    pub fn abort(&self) -> bool {
        abort_turn(&self.pending, &self.conversation_id, &self.control)
    }

    /// Whether the sink has received its terminal callback
    pub fn is_finished(&self) -> bool {
        self.control.done.is_cancelled()
    }

    /// Wait until the sink has received its terminal callback
    pub async fn finished(&self) {
        self.control.done.cancelled().await
    }
}

/// Relays conversations to a chat completions endpoint.
///
/// Holds at most one pending turn per conversation id. Share it behind an
/// `Arc`; streamed turns run on the current Tokio runtime.
pub struct ConversationRelay {
    config: RwLock<RelayConfig>,
    transport: Arc<dyn Transport>,
    pending: PendingTurns,
    next_turn: AtomicU64,
}

impl ConversationRelay {
    /// Create a relay
    pub fn new(config: RelayConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: RwLock::new(config),
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_turn: AtomicU64::new(1),
        }
    }

    /// Current configuration
    pub fn config(&self) -> RelayConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. Turns already in flight keep the old one.
    pub fn update_config(&self, config: RelayConfig) {
        tracing::debug!("Relay configuration updated: {:?}", config);
        *self.config.write() = config;
    }

    /// Whether a turn is in flight for this conversation
    pub fn is_pending(&self, id: &ConversationId) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Number of conversations with a turn in flight
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send the history and wait for the full reply
    pub async fn send_once(&self, history: &[Message]) -> Result<String> {
        let config = self.config();
        config.validate()?;

        let request = ChatRequest::new(config.model_id.as_str(), history, false)
            .with_temperature(config.temperature);
        self.transport
            .complete(&config, &request)
            .await
            .inspect_err(|e| tracing::warn!("Completion request failed: {}", e))
    }

    /// Stream the reply to `conversation`'s history into `sink`.
    ///
    /// Configuration errors and a turn already in flight for the same
    /// conversation are reported through `sink.on_error` before this returns,
    /// and `None` is returned. Otherwise the turn runs on a task spawned on
    /// the current Tokio runtime; without one the sink gets
    /// [`Error::Runtime`].
    pub fn send_stream<S>(&self, conversation: &Conversation, mut sink: S) -> Option<TurnHandle>
    where
        S: TurnSink + 'static,
    {
        let config = self.config();
        if let Err(e) = config.validate() {
            tracing::warn!("Not sending turn for {}: {}", conversation.id(), e);
            sink.on_error(e);
            return None;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!("Not sending turn for {}: {}", conversation.id(), e);
                sink.on_error(Error::Runtime(e.to_string()));
                return None;
            }
        };

        let id = conversation.id().clone();
        let control = {
            let mut map = self.pending.lock();
            if map.contains_key(&id) {
                None
            } else {
                let control = Arc::new(TurnControl {
                    turn: self.next_turn.fetch_add(1, Ordering::Relaxed),
                    cancel: CancellationToken::new(),
                    gate: ReentrantMutex::new(()),
                    done: CancellationToken::new(),
                });
                map.insert(id.clone(), Arc::clone(&control));
                Some(control)
            }
        };
        let Some(control) = control else {
            tracing::warn!("Rejecting send for {}: a reply is already streaming", id);
            sink.on_error(Error::TurnInProgress(id));
            return None;
        };

        let request = ChatRequest::new(config.model_id.as_str(), conversation.history(), true)
            .with_temperature(config.temperature);
        tracing::debug!(
            "Starting turn {} for conversation {} ({} messages)",
            control.turn,
            id,
            request.messages.len()
        );

        let handle = TurnHandle {
            conversation_id: id.clone(),
            control: Arc::clone(&control),
            pending: Arc::clone(&self.pending),
        };
        let transport = Arc::clone(&self.transport);
        let pending = Arc::clone(&self.pending);

        runtime.spawn(async move {
            let guard = TurnGuard {
                pending,
                id,
                control,
            };
            let control = &guard.control;
            let outcome = pump(transport.as_ref(), &config, &request, control, &mut sink).await;
            finish(&guard.pending, &guard.id, &guard.control, outcome, &mut sink);
        });

        Some(handle)
    }

    /// Stream the reply as a [`TurnEventStream`] instead of callbacks.
    ///
    /// The stream always carries a terminal event, including when the send
    /// is rejected (in which case the handle is `None`).
    pub fn send_stream_events(
        &self,
        conversation: &Conversation,
    ) -> (Option<TurnHandle>, TurnEventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.send_stream(conversation, ChannelSink::new(tx));
        (handle, UnboundedReceiverStream::new(rx))
    }

    /// Abort the turn in flight for a conversation, if any
    pub fn abort(&self, id: &ConversationId) -> bool {
        let control = self.pending.lock().get(id).cloned();
        match control {
            Some(control) => abort_turn(&self.pending, id, &control),
            None => false,
        }
    }

    /// Abort every turn in flight
    pub fn abort_all(&self) -> usize {
        let turns: Vec<_> = self
            .pending
            .lock()
            .iter()
            .map(|(id, control)| (id.clone(), Arc::clone(control)))
            .collect();
        turns
            .iter()
            .filter(|(id, control)| abort_turn(&self.pending, id, control))
            .count()
    }
}

enum Outcome {
    Completed,
    Failed(Error),
    Cancelled,
}

/// Drive the transport and decoder until a terminal signal or cancellation.
/// The response body is dropped, closing the connection, when this returns.
async fn pump<S: TurnSink>(
    transport: &dyn Transport,
    config: &RelayConfig,
    request: &ChatRequest,
    control: &TurnControl,
    sink: &mut S,
) -> Outcome {
    let mut body = tokio::select! {
        biased;
        _ = control.cancel.cancelled() => return Outcome::Cancelled,
        opened = transport.open_stream(config, request) => match opened {
            Ok(body) => body,
            Err(e) => return Outcome::Failed(e),
        },
    };

    let mut decoder = StreamDecoder::new();
    let mut deltas = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => return Outcome::Cancelled,
            next = body.next() => next,
        };

        let items = match next {
            Some(Ok(chunk)) => decoder.feed(&chunk),
            Some(Err(e)) => decoder.error(e).map(Decoded::Terminal).into_iter().collect(),
            None => decoder.end().map(Decoded::Terminal).into_iter().collect(),
        };

        for item in items {
            match item {
                Decoded::Delta(text) => {
                    let _gate = Gate::enter(control);
                    if control.cancel.is_cancelled() {
                        return Outcome::Cancelled;
                    }
                    deltas += 1;
                    sink.on_delta(&text);
                }
                Decoded::Terminal(TerminalSignal::Completed) => {
                    tracing::debug!(
                        "Turn {} completed ({} deltas, {} decode warnings)",
                        control.turn,
                        deltas,
                        decoder.decode_warnings()
                    );
                    return Outcome::Completed;
                }
                Decoded::Terminal(TerminalSignal::Failed(e)) => return Outcome::Failed(e),
            }
        }

        if decoder.is_finished() {
            return Outcome::Completed;
        }
    }
}

/// Release the slot and deliver the single terminal callback
fn finish<S: TurnSink>(
    pending: &PendingTurns,
    id: &ConversationId,
    control: &TurnControl,
    outcome: Outcome,
    sink: &mut S,
) {
    let _gate = Gate::enter(control);
    // Losing the slot means an abort got there first.
    let owned = release(pending, id, control.turn);
    match outcome {
        _ if !owned => sink.on_error(Error::Cancelled),
        Outcome::Cancelled => sink.on_error(Error::Cancelled),
        Outcome::Completed => sink.on_complete(),
        Outcome::Failed(e) => {
            tracing::warn!("Turn {} for conversation {} failed: {}", control.turn, id, e);
            sink.on_error(e);
        }
    }
}
