//! Per-stream worker.
//!
//! A [`StreamDriver`] owns one outbound stream and a pseudo-random buffer
//! generated once at start. For every `Send` command it writes a random
//! window of that buffer, signals `Sent`, reads the echo back, checks it
//! byte for byte and signals `Read`. On `Close` it shuts the stream down and
//! signals `Closed`.
//!
//! I/O errors end the worker, but never silently: the failure is logged and
//! sent to the coordinator as [`Event::Failed`].

use super::handshake::{self, Command, Event, Handshake, HandshakeWorker};
use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use std::ops::Range;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Settings shared by all drivers of a round.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Size of the random buffer payloads are cut from.
    pub buffer_size: usize,
    /// Base seed; each driver offsets it by its stream index.
    pub seed: Option<u64>,
    pub step_timeout: Duration,
}

/// How a driver ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    /// Closed on request after `messages` cycles.
    Closed { messages: usize },
    /// Stream failed after `messages` cycles.
    Failed { messages: usize, reason: String },
    /// Coordinator disappeared.
    Abandoned { messages: usize },
}

/// Pick a payload window of a buffer of `len` bytes.
///
/// Start and length are drawn independently from `[0, len / 2)`, so the
/// window always ends within the buffer.
pub fn pick_window<R: Rng>(rng: &mut R, len: usize) -> Range<usize> {
    let half = len / 2;
    if half == 0 {
        return 0..0;
    }
    let from = rng.gen_range(0..half);
    let length = rng.gen_range(0..half);
    from..from + length
}

pub struct StreamDriver<S> {
    stream: S,
    index: usize,
    buffer: Bytes,
    scratch: Vec<u8>,
    rng: SmallRng,
    step_timeout: Duration,
    messages: usize,
}

impl<S> StreamDriver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, index: usize, config: &DriverConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(index as u64)),
            None => SmallRng::from_entropy(),
        };
        let mut buffer = vec![0u8; config.buffer_size];
        rng.fill_bytes(&mut buffer);

        Self {
            stream,
            index,
            buffer: Bytes::from(buffer),
            scratch: vec![0u8; config.buffer_size / 2],
            rng,
            step_timeout: config.step_timeout,
            messages: 0,
        }
    }

    /// Spawn the driver. The handshake is handed over through the returned
    /// receiver once the worker is ready.
    pub fn spawn(
        stream: S,
        index: usize,
        config: &DriverConfig,
    ) -> (JoinHandle<DriverOutcome>, oneshot::Receiver<Handshake>) {
        let (handoff_tx, handoff_rx) = oneshot::channel();
        let driver = Self::new(stream, index, config);
        (tokio::spawn(driver.run(handoff_tx)), handoff_rx)
    }

    pub async fn run(mut self, handoff: oneshot::Sender<Handshake>) -> DriverOutcome {
        let (controller, mut worker) = handshake::pair(self.step_timeout);
        if handoff.send(controller).is_err() {
            debug!(stream = self.index, "Coordinator gone before handoff");
            self.shutdown().await;
            return DriverOutcome::Abandoned { messages: 0 };
        }

        let outcome = self.serve(&mut worker).await;
        self.shutdown().await;

        if let DriverOutcome::Closed { .. } = outcome {
            if !worker.signal(Event::Closed).await {
                return DriverOutcome::Abandoned {
                    messages: self.messages,
                };
            }
            debug!(stream = self.index, messages = self.messages, "Stream closed");
        }
        outcome
    }

    async fn serve(&mut self, worker: &mut HandshakeWorker) -> DriverOutcome {
        loop {
            match worker.next_command().await {
                Some(Command::Send) => {}
                Some(Command::Close) => {
                    return DriverOutcome::Closed {
                        messages: self.messages,
                    }
                }
                None => {
                    return DriverOutcome::Abandoned {
                        messages: self.messages,
                    }
                }
            }

            let window = pick_window(&mut self.rng, self.buffer.len());
            let payload = self.buffer.slice(window);

            debug!(stream = self.index, len = payload.len(), "Sending");
            if let Err(e) = self.write(&payload).await {
                return self.fail(worker, format!("write failed: {e}")).await;
            }
            if !worker.signal(Event::Sent { len: payload.len() }).await {
                return DriverOutcome::Abandoned {
                    messages: self.messages,
                };
            }

            let echo = &mut self.scratch[..payload.len()];
            if let Err(e) = self.stream.read_exact(echo).await {
                return self.fail(worker, format!("read failed: {e}")).await;
            }
            let mismatch = echo.iter().zip(payload.iter()).position(|(a, b)| a != b);
            if let Some(pos) = mismatch {
                return self
                    .fail(worker, format!("echo differs at byte {pos} of {}", payload.len()))
                    .await;
            }

            self.messages += 1;
            debug!(stream = self.index, len = payload.len(), "Echo received");
            if !worker.signal(Event::Read { len: payload.len() }).await {
                return DriverOutcome::Abandoned {
                    messages: self.messages,
                };
            }
        }
    }

    async fn write(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(payload).await?;
        self.stream.flush().await
    }

    async fn fail(&mut self, worker: &HandshakeWorker, reason: String) -> DriverOutcome {
        warn!(stream = self.index, messages = self.messages, %reason, "Stream worker failed");
        worker
            .signal(Event::Failed {
                reason: reason.clone(),
            })
            .await;
        DriverOutcome::Failed {
            messages: self.messages,
            reason,
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(stream = self.index, error = %e, "Stream shutdown failed");
        }
    }
}
