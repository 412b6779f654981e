//! Dedicated worker thread per inference session.
//!
//! The actor owns one [`InferenceSession`] on its own OS thread, which makes it
//! the serialization unit for concurrent callers: commands are handled one at a
//! time, so prefill and step never overlap on the same KV cache.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   crossbeam channel   ┌──────────────────┐
//! │   Caller    │ ──── Command ────────>│ Session Actor     │
//! │             │ <──── Event ──────────│ (Dedicated Thread)│
//! │             │   crossbeam channel   │  Owns: Session,   │
//! │             │                       │  Weights, Cache   │
//! └─────────────┘                       └──────────────────┘
//! ```
//!
//! # Token Batching
//!
//! Produced tokens are buffered and emitted every ~50ms or every 10 tokens.
//!
//! # Cancellation
//!
//! Every `Generate` carries the cancel epoch current when it was queued.
//! [`ActorHandle::cancel`] bumps the epoch, which stops the running request and
//! every request still queued behind it. It is observed between steps only; a
//! step in flight completes.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::backend::ComputeEngine;
use crate::engine::{Generation, GenerationConfig, GenerationStats, InferenceSession, StopReason};
use crate::error::{Qwen2Error, Result};
use crate::TokenId;

/// Maximum tokens to buffer before emitting.
const TOKEN_BATCH_SIZE: usize = 10;

/// Maximum time to buffer tokens before emitting (milliseconds).
const TOKEN_BATCH_INTERVAL_MS: u64 = 50;

/// Commands sent to the session actor.
#[derive(Debug, Clone)]
pub enum ActorCommand {
    /// Run a generation over `prompt`.
    Generate {
        prompt: Vec<TokenId>,
        config: GenerationConfig,
        /// Cancel epoch at the time the request was queued.
        epoch: u64,
    },

    /// Stop the current generation before its next step.
    Cancel,

    /// Clear the KV cache and history.
    ResetKvCache,

    /// Enable or disable the KV cache.
    SetKvCacheEnabled(bool),

    /// Shut down the actor thread.
    Shutdown,
}

/// Events sent from the session actor.
#[derive(Debug, Clone)]
pub enum ActorEvent {
    /// A batch of produced tokens.
    TokenBatch(Vec<TokenId>),

    /// Generation finished (for any stop reason).
    Done(Generation),

    /// The request was rejected.
    Error(String),

    /// The actor has shut down.
    Stopped,
}

/// Handle to a session actor.
pub struct ActorHandle {
    cmd_tx: Sender<ActorCommand>,

    /// Dropped on shutdown so a send blocked on a full channel fails.
    event_rx: Option<Receiver<ActorEvent>>,

    /// Set by the session while a generation is in progress.
    is_running: Arc<AtomicBool>,

    /// Bumped by every cancel.
    cancel_epoch: Arc<AtomicU64>,

    thread: Option<thread::JoinHandle<()>>,
}

impl ActorHandle {
    /// Move `session` onto a new OS thread.
    pub fn spawn<E>(session: InferenceSession<E>) -> Result<Self>
    where
        E: ComputeEngine + 'static,
    {
        let (cmd_tx, cmd_rx) = bounded::<ActorCommand>(16);
        let (event_tx, event_rx) = bounded::<ActorEvent>(256);
        let is_running = session.running_flag();
        let cancel_epoch = Arc::new(AtomicU64::new(0));
        let name = format!("session-{}", session.id());

        let epoch = Arc::clone(&cancel_epoch);
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || actor_loop(session, cmd_rx, event_tx, epoch))?;

        Ok(ActorHandle {
            cmd_tx,
            event_rx: Some(event_rx),
            is_running,
            cancel_epoch,
            thread: Some(thread),
        })
    }

    /// Queue a generation request.
    pub fn generate(&self, prompt: Vec<TokenId>, config: GenerationConfig) -> Result<()> {
        let epoch = self.cancel_epoch.load(Ordering::Acquire);
        self.send(ActorCommand::Generate { prompt, config, epoch })
    }

    /// Stop the running generation and any generation queued before this call.
    pub fn cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::AcqRel);
        let _ = self.cmd_tx.try_send(ActorCommand::Cancel);
    }

    pub fn reset_kv_cache(&self) -> Result<()> {
        self.send(ActorCommand::ResetKvCache)
    }

    pub fn set_kv_cache_enabled(&self, enabled: bool) -> Result<()> {
        self.send(ActorCommand::SetKvCacheEnabled(enabled))
    }

    /// Shut down the actor thread and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Try to receive the next event (non-blocking).
    pub fn try_recv(&self) -> Option<ActorEvent> {
        self.event_rx.as_ref()?.try_recv().ok()
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Option<ActorEvent> {
        self.event_rx.as_ref()?.recv().ok()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ActorEvent> {
        self.event_rx.as_ref()?.recv_timeout(timeout).ok()
    }

    /// Block until the next generation finishes, discarding token batches.
    pub fn wait_done(&self) -> Result<Generation> {
        loop {
            match self.recv() {
                Some(ActorEvent::Done(generation)) => return Ok(generation),
                Some(ActorEvent::Error(msg)) => return Err(Qwen2Error::Inference(msg)),
                Some(ActorEvent::TokenBatch(_)) => {}
                Some(ActorEvent::Stopped) | None => {
                    return Err(Qwen2Error::Inference("session actor stopped".into()))
                }
            }
        }
    }

    /// Whether a generation is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    fn send(&self, cmd: ActorCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Qwen2Error::Inference("actor channel closed".into()))
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.cancel_epoch.fetch_add(1, Ordering::AcqRel);
        self.event_rx = None;
        let _ = self.cmd_tx.send(ActorCommand::Shutdown);
        let _ = thread.join();
    }
}

impl Drop for ActorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn actor_loop<E: ComputeEngine>(
    mut session: InferenceSession<E>,
    cmd_rx: Receiver<ActorCommand>,
    event_tx: Sender<ActorEvent>,
    cancel_epoch: Arc<AtomicU64>,
) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            ActorCommand::Generate {
                prompt,
                config,
                epoch,
            } => {
                let cancelled = || cancel_epoch.load(Ordering::Acquire) != epoch;
                if !run_generation(&mut session, &prompt, &config, &event_tx, cancelled) {
                    break;
                }
            }
            // The epoch already stops the request; the command only wakes an idle actor.
            ActorCommand::Cancel => {}
            ActorCommand::ResetKvCache => session.reset_kv_cache(),
            ActorCommand::SetKvCacheEnabled(enabled) => session.set_kv_cache_enabled(enabled),
            ActorCommand::Shutdown => {
                let _ = event_tx.send(ActorEvent::Stopped);
                break;
            }
        }
    }
    debug!(session = %session.id(), "session actor exited");
}

/// Execute a generation request with token batching.
///
/// Returns `false` once the event receiver is gone.
fn run_generation<E, C>(
    session: &mut InferenceSession<E>,
    prompt: &[TokenId],
    config: &GenerationConfig,
    event_tx: &Sender<ActorEvent>,
    cancelled: C,
) -> bool
where
    E: ComputeEngine,
    C: Fn() -> bool,
{
    if cancelled() {
        debug!(session = %session.id(), "generation cancelled before start");
        return event_tx.send(ActorEvent::Done(cancelled_before_start(prompt))).is_ok();
    }

    let mut batch_buffer = Vec::with_capacity(TOKEN_BATCH_SIZE);
    let mut last_emit = Instant::now();
    let mut disconnected = false;

    let result = session.generate_with(prompt, config, |token| {
        batch_buffer.push(token);

        let should_emit = batch_buffer.len() >= TOKEN_BATCH_SIZE
            || last_emit.elapsed() >= Duration::from_millis(TOKEN_BATCH_INTERVAL_MS);
        if should_emit {
            let batch = std::mem::take(&mut batch_buffer);
            if event_tx.send(ActorEvent::TokenBatch(batch)).is_err() {
                disconnected = true;
                return ControlFlow::Break(());
            }
            last_emit = Instant::now();
        }
        if cancelled() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });

    if disconnected {
        return false;
    }
    if !batch_buffer.is_empty() && event_tx.send(ActorEvent::TokenBatch(batch_buffer)).is_err() {
        return false;
    }

    let event = match result {
        Ok(generation) => ActorEvent::Done(generation),
        Err(e) => ActorEvent::Error(e.to_string()),
    };
    event_tx.send(event).is_ok()
}

fn cancelled_before_start(prompt: &[TokenId]) -> Generation {
    Generation {
        tokens: prompt.to_vec(),
        prompt_len: prompt.len(),
        stop_reason: StopReason::Cancelled,
        stats: GenerationStats {
            prompt_tokens: prompt.len(),
            ..GenerationStats::default()
        },
    }
}
