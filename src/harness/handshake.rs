//! Turn-taking protocol between a round coordinator and one stream worker.
//!
//! The coordinator side ([`Handshake`]) walks a small state machine:
//!
//! ```text
//! Idle --send--> Sending --Sent--> AwaitingEcho --Read--> Idle
//! Idle --close--> Closing --Closed--> Closed
//! ```
//!
//! Commands travel over a queue of capacity one, events come back over
//! another. Every wait is bounded by the step timeout, so a worker that
//! stops answering turns into an error instead of a hung round.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

/// Request from the coordinator to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Write one payload and read its echo.
    Send,
    /// Close the stream and stop.
    Close,
}

/// Signal from the worker to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Payload of `len` bytes written.
    Sent { len: usize },
    /// Echo of `len` bytes received and verified.
    Read { len: usize },
    /// Stream closed, worker exiting.
    Closed,
    /// Worker gave up on the stream.
    Failed { reason: String },
}

/// Position of a stream in its message cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Sending,
    AwaitingEcho,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: HandshakeState,
        actual: HandshakeState,
    },

    #[error("no answer from stream worker after {timeout:?} while {state:?}")]
    Timeout {
        state: HandshakeState,
        timeout: Duration,
    },

    #[error("stream worker went away while {state:?}")]
    WorkerGone { state: HandshakeState },

    #[error("stream worker failed while {state:?}: {reason}")]
    WorkerFailed {
        state: HandshakeState,
        reason: String,
    },

    #[error("unexpected {event:?} while {state:?}")]
    Unexpected { state: HandshakeState, event: Event },
}

/// Result of one completed message cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageReport {
    pub sent: usize,
    pub echoed: usize,
}

/// Coordinator side of the handshake.
#[derive(Debug)]
pub struct Handshake {
    commands: mpsc::Sender<Command>,
    events: mpsc::Receiver<Event>,
    state: HandshakeState,
    step_timeout: Duration,
}

/// Worker side of the handshake.
#[derive(Debug)]
pub struct HandshakeWorker {
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<Event>,
}

/// Create a connected handshake pair.
pub fn pair(step_timeout: Duration) -> (Handshake, HandshakeWorker) {
    let (command_tx, command_rx) = mpsc::channel(1);
    let (event_tx, event_rx) = mpsc::channel(1);
    (
        Handshake {
            commands: command_tx,
            events: event_rx,
            state: HandshakeState::Idle,
            step_timeout,
        },
        HandshakeWorker {
            commands: command_rx,
            events: event_tx,
        },
    )
}

/// Wait for a worker to hand over its handshake.
pub async fn receive(
    handoff: oneshot::Receiver<Handshake>,
    step_timeout: Duration,
) -> Result<Handshake, HandshakeError> {
    match timeout(step_timeout, handoff).await {
        Ok(Ok(handshake)) => Ok(handshake),
        Ok(Err(_)) => Err(HandshakeError::WorkerGone {
            state: HandshakeState::Idle,
        }),
        Err(_) => Err(HandshakeError::Timeout {
            state: HandshakeState::Idle,
            timeout: step_timeout,
        }),
    }
}

impl Handshake {
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run one `send -> sent -> read` cycle.
    pub async fn send_message(&mut self) -> Result<MessageReport, HandshakeError> {
        self.expect(HandshakeState::Idle)?;

        self.transition(HandshakeState::Sending);
        self.command(Command::Send).await?;
        let sent = match self.next_event().await? {
            Event::Sent { len } => len,
            event => return Err(self.unexpected(event)),
        };

        self.transition(HandshakeState::AwaitingEcho);
        let echoed = match self.next_event().await? {
            Event::Read { len } => len,
            event => return Err(self.unexpected(event)),
        };

        self.transition(HandshakeState::Idle);
        Ok(MessageReport { sent, echoed })
    }

    /// Run the `close -> closed` exchange.
    pub async fn close(&mut self) -> Result<(), HandshakeError> {
        self.expect(HandshakeState::Idle)?;

        self.transition(HandshakeState::Closing);
        self.command(Command::Close).await?;
        match self.next_event().await? {
            Event::Closed => {
                self.transition(HandshakeState::Closed);
                Ok(())
            }
            event => Err(self.unexpected(event)),
        }
    }

    fn expect(&self, expected: HandshakeState) -> Result<(), HandshakeError> {
        if self.state != expected {
            return Err(HandshakeError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(from = ?self.state, to = ?next, "Handshake transition");
        self.state = next;
    }

    fn unexpected(&self, event: Event) -> HandshakeError {
        HandshakeError::Unexpected {
            state: self.state,
            event,
        }
    }

    async fn command(&mut self, command: Command) -> Result<(), HandshakeError> {
        match timeout(self.step_timeout, self.commands.send(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HandshakeError::WorkerGone { state: self.state }),
            Err(_) => Err(HandshakeError::Timeout {
                state: self.state,
                timeout: self.step_timeout,
            }),
        }
    }

    async fn next_event(&mut self) -> Result<Event, HandshakeError> {
        match timeout(self.step_timeout, self.events.recv()).await {
            Ok(Some(Event::Failed { reason })) => Err(HandshakeError::WorkerFailed {
                state: self.state,
                reason,
            }),
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(HandshakeError::WorkerGone { state: self.state }),
            Err(_) => Err(HandshakeError::Timeout {
                state: self.state,
                timeout: self.step_timeout,
            }),
        }
    }
}

impl HandshakeWorker {
    /// Next command. `None` once the coordinator is gone.
    pub async fn next_command(&mut self) -> Option<Command> {
        self.commands.recv().await
    }

    /// Deliver an event. Returns `false` if the coordinator is gone.
    pub async fn signal(&self, event: Event) -> bool {
        self.events.send(event).await.is_ok()
    }
}
