//! Echo responder.
//!
//! Every inbound stream on the echo protocol is copied back onto itself
//! until either side finishes. Errors end the copy and close the stream;
//! from the responder's point of view that is the same as a normal close.

use crate::net::{ConnMeta, Host, ProtocolId};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Protocol identifier shared by the responder and the stream drivers.
pub const ECHO_PROTOCOL: &str = "/reconnect/echo/1.0.0";

pub fn protocol() -> ProtocolId {
    ProtocolId::new(ECHO_PROTOCOL)
}

/// Install the echo responder on `host`.
pub fn register<H: Host>(host: &H) {
    host.set_stream_handler(protocol(), Arc::new(handle_stream::<H::Stream>));
}

/// Inbound stream handler; spawns the copy loop and returns immediately.
pub fn handle_stream<S>(stream: S, meta: ConnMeta)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(peer = %meta.local, remote = %meta.remote, conn = %meta.descriptor, "Echoing");
    tokio::spawn(async move {
        let copied = echo(stream).await;
        trace!(peer = %meta.local, remote = %meta.remote, copied, "Echo finished");
    });
}

/// Copy `stream` back onto itself. Returns the number of bytes echoed.
pub async fn echo<S>(stream: S) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let copied = match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(n) => n,
        Err(e) => {
            trace!(error = %e, "Echo copy ended with error");
            0
        }
    };
    let _ = writer.shutdown().await;
    copied
}
