// Decision channel between the control process and the traffic filter
//
// The filter owns the listening socket. The control process connects,
// registers, and from then on answers every DecisionRequest the filter
// sends. Both sides drop their reference to the peer as soon as the
// connection breaks, so nothing is ever written to a dead endpoint.

use futures::{SinkExt, StreamExt};
use netto_common::{ConnectionRequest, Frame};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::error::{NettoError, Result};

pub mod control;
pub mod filter;

pub use control::DecisionChannel;
pub use filter::FilterEndpoint;

/// Default socket path of the filter endpoint
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/netto-filter.sock";

/// Frames queued per connection before senders wait
pub(crate) const OUTBOUND_QUEUE: usize = 64;

/// Longest line accepted from the peer
const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Newline-delimited JSON frames over the channel socket
pub(crate) type FrameTransport = Framed<UnixStream, LinesCodec>;

pub fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Registration state of the control side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unregistered,
    Registering,
    Registered,
    /// The connection was interrupted; must pass through Unregistered
    /// before registering again
    Broken,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Unregistered => "unregistered",
            ChannelState::Registering => "registering",
            ChannelState::Registered => "registered",
            ChannelState::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// Answers decision requests arriving on the channel.
///
/// Called on the channel's serve task; implementations must not block for
/// long, the flow being decided is paused until the reply is sent.
pub trait DecisionHandler: Send + Sync {
    fn decide(&self, request: ConnectionRequest) -> bool;

    /// Diagnostic text relayed by the filter
    fn extension_log(&self, message: &str) {
        log::debug!("Extension: {}", message);
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn transport(stream: UnixStream) -> FrameTransport {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH))
}

fn codec_error(e: LinesCodecError) -> NettoError {
    match e {
        LinesCodecError::Io(e) => NettoError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            NettoError::Protocol(format!("frame longer than {MAX_FRAME_LENGTH} bytes"))
        }
    }
}

pub(crate) async fn send_frame(transport: &mut FrameTransport, frame: &Frame) -> Result<()> {
    let line = frame
        .encode()
        .map_err(|e| NettoError::Protocol(format!("failed to encode frame: {e}")))?;
    transport.send(line).await.map_err(codec_error)
}

/// Next frame from the peer; `Ok(None)` once it closed the connection.
///
/// Cancel safe: a partially received line stays buffered in the transport.
pub(crate) async fn next_frame(transport: &mut FrameTransport) -> Result<Option<Frame>> {
    match transport.next().await {
        None => Ok(None),
        Some(Ok(line)) => Frame::decode(&line)
            .map(Some)
            .map_err(|e| NettoError::Protocol(format!("undecodable frame: {e}"))),
        Some(Err(e)) => Err(codec_error(e)),
    }
}
