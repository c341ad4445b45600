//! Enumeration-layer message dispatch.
//!
//! The enumeration layer first dumps its current state and then marks the
//! end of the dump with a [`Message::Break`]. Everything before that first
//! break is ignored; the break itself announces readiness. Later messages
//! are handed to the scheduler one job each, so they interleave with poll
//! ticks and settings in arrival order.

use crate::event::Event;
use crate::platform::Message;
use crate::scheduler::SchedulerHandle;
use crate::vnet::Vnet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Readiness gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Initial dump in progress.
    Waiting,
    /// First break seen; messages flow.
    Open,
}

/// What to do with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ignore,
    /// First break: announce readiness.
    Ready,
    Apply(Message),
}

/// Drops messages until the end of the initial dump.
#[derive(Debug)]
pub struct MessageGate {
    state: GateState,
    ignored: u64,
}

impl MessageGate {
    pub fn new() -> Self {
        Self {
            state: GateState::Waiting,
            ignored: 0,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Messages dropped before the gate opened.
    pub fn ignored(&self) -> u64 {
        self.ignored
    }

    pub fn admit(&mut self, message: Message) -> Verdict {
        match (self.state, message) {
            (GateState::Waiting, Message::Break) => {
                self.state = GateState::Open;
                info!(ignored = self.ignored, "initial dump complete");
                Verdict::Ready
            }
            (GateState::Waiting, _) => {
                self.ignored += 1;
                Verdict::Ignore
            }
            (GateState::Open, Message::Break) => Verdict::Ignore,
            (GateState::Open, message) => Verdict::Apply(message),
        }
    }
}

impl Default for MessageGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds `messages` through a [`MessageGate`] into the scheduler until the
/// stream ends, the scheduler exits or `shutdown` fires.
pub async fn run_dispatcher(
    mut messages: mpsc::Receiver<Message>,
    scheduler: SchedulerHandle<Vnet>,
    event: Event,
    shutdown: CancellationToken,
) {
    let mut gate = MessageGate::new();
    loop {
        let message = tokio::select! {
            message = messages.recv() => message,
            _ = shutdown.cancelled() => break,
        };
        let Some(message) = message else {
            debug!("message stream closed");
            break;
        };
        match gate.admit(message) {
            Verdict::Ignore => {}
            Verdict::Ready => {
                if event.ready().is_err() {
                    warn!("scheduler gone before ready");
                    break;
                }
            }
            Verdict::Apply(message) => {
                if scheduler
                    .signal(move |cx| cx.state().on_message(message))
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    info!("Message dispatcher stopped");
}
