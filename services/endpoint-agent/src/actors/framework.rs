//! Core actor framework types and traits.
//!
//! Provides the building blocks for batched actors:
//! - `Actor` trait for defining actor behavior
//! - `spawn` to run an actor on its own task
//! - `ActorHandle` for sending messages to actors
//! - `Completion` for awaiting the batch that processed a message
//!
//! Messages are drained from the mailbox in batches. Each message is handed to
//! `Actor::handle`, which only records intent; `Actor::finish_batch` then runs
//! once per batch and does the real work. Batches run on the blocking pool,
//! so actors may call into the kernel synchronously.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// What the actor loop should do after a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Continue,
    Stop,
}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages in batches, one batch at a time
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Record a single message. Side effects belong in `finish_batch`.
    fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext);

    /// Apply the net effect of the batch just handled.
    fn finish_batch(&mut self, batch_len: usize, ctx: &mut ActorContext) -> BatchOutcome;

    /// Called when the actor starts.
    fn on_start(&mut self, _ctx: &mut ActorContext) {}

    /// Called when the actor is about to stop.
    fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Shutdown signal receiver.
    pub shutdown: watch::Receiver<bool>,

    /// Messages handled so far.
    pub messages_processed: u64,

    /// Batches finished so far.
    pub batches_processed: u64,

    /// When the last batch finished.
    pub last_batch_at: Option<Instant>,

    /// Current actor state (for introspection).
    pub state: ActorState,
}

impl ActorContext {
    /// Create a new actor context.
    pub fn new(actor_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            shutdown,
            messages_processed: 0,
            batches_processed: 0,
            last_batch_at: None,
            state: ActorState::Starting,
        }
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// Actor task panicked or was aborted.
    #[error("actor task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

// =============================================================================
// Mailbox
// =============================================================================

/// Mailbox configuration.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Maximum messages drained into one batch.
    pub max_batch_size: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 128,
        }
    }
}

struct Envelope<M> {
    msg: M,
    done: oneshot::Sender<()>,
}

/// Resolves once the batch containing a message has finished.
///
/// Dropping it makes the send fire-and-forget.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<()>,
}

impl Completion {
    /// Wait for the batch to finish.
    ///
    /// Fails if the actor stopped before finishing it.
    pub async fn wait(self) -> Result<(), ActorError> {
        self.rx.await.map_err(|_| ActorError::ActorStopped)
    }
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    /// Sender for the actor's mailbox.
    tx: mpsc::UnboundedSender<Envelope<M>>,

    /// Actor ID for logging.
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> Debug for ActorHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("actor_id", &self.actor_id)
            .finish()
    }
}

impl<M: Message> ActorHandle<M> {
    /// Queue a message. Never blocks.
    pub fn send(&self, msg: M) -> Result<Completion, ActorError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Envelope { msg, done })
            .map_err(|_| ActorError::ActorStopped)?;
        Ok(Completion { rx })
    }

    /// Whether the actor's mailbox has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Type-erased actor reference for lifecycle control.
#[derive(Debug)]
pub struct ActorRef {
    /// Actor ID.
    pub actor_id: String,

    /// Actor type name.
    pub actor_type: String,

    /// Task handle.
    task_handle: tokio::task::JoinHandle<()>,

    /// Shutdown sender.
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if the actor task is still running.
    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the actor task immediately.
    pub fn abort(&self) {
        self.task_handle.abort();
    }

    /// Wait for the actor task to exit.
    pub async fn join(self) -> Result<(), ActorError> {
        self.task_handle.await?;
        Ok(())
    }
}

/// Spawn an actor on its own task.
pub fn spawn<A>(actor: A, config: MailboxConfig) -> (ActorHandle<A::Message>, ActorRef)
where
    A: Actor,
{
    let actor_id = format!("{}_{}", actor.name(), generate_actor_id());
    let actor_type = actor.name().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let max_batch_size = config.max_batch_size.max(1);
    let loop_id = actor_id.clone();
    let task_handle = tokio::spawn(async move {
        run_actor_loop(actor, rx, shutdown_rx, loop_id, max_batch_size).await;
    });

    debug!(actor_id = %actor_id, actor_type = %actor_type, "Spawned actor");

    let handle = ActorHandle {
        tx,
        actor_id: actor_id.clone(),
    };
    let actor_ref = ActorRef {
        actor_id,
        actor_type,
        task_handle,
        shutdown_tx,
    };
    (handle, actor_ref)
}

// =============================================================================
// Actor Loop
// =============================================================================

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::UnboundedReceiver<Envelope<A::Message>>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
    max_batch_size: usize,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone());
    actor.on_start(&mut ctx);
    ctx.state = ActorState::Running;

    // The sender lives in the ActorRef; once it is dropped there is nothing
    // left to watch.
    let mut shutdown_live = true;

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed(), if shutdown_live => {
                match changed {
                    Ok(()) if *shutdown.borrow() => {
                        debug!(actor_id = %actor_id, "Actor received shutdown signal");
                        break;
                    }
                    Ok(()) => {}
                    Err(_) => shutdown_live = false,
                }
            }

            first = rx.recv() => {
                let Some(first) = first else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };

                let mut batch = vec![first];
                while batch.len() < max_batch_size {
                    match rx.try_recv() {
                        Ok(envelope) => batch.push(envelope),
                        Err(_) => break,
                    }
                }

                let batch_len = batch.len();
                let (msgs, waiters): (Vec<_>, Vec<_>) = batch
                    .into_iter()
                    .map(|Envelope { msg, done }| (msg, done))
                    .unzip();

                // Batches shell out and take locks; keep them off the runtime workers.
                let ran = tokio::task::spawn_blocking(move || {
                    for msg in msgs {
                        actor.handle(msg, &mut ctx);
                    }
                    let outcome = actor.finish_batch(batch_len, &mut ctx);
                    (actor, ctx, outcome)
                })
                .await;
                let outcome = match ran {
                    Ok((returned, returned_ctx, outcome)) => {
                        actor = returned;
                        ctx = returned_ctx;
                        outcome
                    }
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(e) => {
                        warn!(actor_id = %actor_id, error = %e, "Actor batch cancelled");
                        return;
                    }
                };
                ctx.messages_processed += batch_len as u64;
                ctx.batches_processed += 1;
                ctx.last_batch_at = Some(Instant::now());

                for done in waiters {
                    let _ = done.send(());
                }

                if outcome == BatchOutcome::Stop {
                    debug!(actor_id = %actor_id, "Actor requested stop");
                    break;
                }
            }
        }
    }

    ctx.state = ActorState::Stopping;
    rx.close();
    actor.on_stop(&mut ctx);
    ctx.state = ActorState::Stopped;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        batches_processed = ctx.batches_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
