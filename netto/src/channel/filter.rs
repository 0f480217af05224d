// Filter side of the decision channel
//
// Owns the listening socket, keeps track of the registered control process
// and turns each intercepted flow into a DecisionRequest with a bounded wait.

use super::{OUTBOUND_QUEUE, lock, next_frame, send_frame, transport};
use crate::error::{NettoError, Result};
use netto_common::{ConnectionRequest, Frame};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<bool>>>>;

/// The registered control process
#[derive(Clone)]
struct Peer {
    generation: u64,
    outbound: mpsc::Sender<Frame>,
    pending: PendingReplies,
    // Cancels this peer's connection task
    closed: CancellationToken,
}

struct EndpointShared {
    current: Mutex<Option<Peer>>,
    next_request_id: AtomicU64,
    next_generation: AtomicU64,
    registrations: AtomicUsize,
    reply_timeout: Duration,
}

/// Listening end of the decision channel.
///
/// Must be created inside a tokio runtime.
pub struct FilterEndpoint {
    path: PathBuf,
    shared: Arc<EndpointShared>,
    cancel: CancellationToken,
}

impl FilterEndpoint {
    /// Listen on `path`; refuses to take over a socket another endpoint is serving
    pub fn bind(path: impl AsRef<Path>, reply_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(io::Error::from(io::ErrorKind::AddrInUse).into());
            }
            log::debug!("Removing stale socket {:?}", path);
            fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        log::info!("Filter endpoint listening on {:?}", path);

        let shared = Arc::new(EndpointShared {
            current: Mutex::new(None),
            next_request_id: AtomicU64::new(0),
            next_generation: AtomicU64::new(0),
            registrations: AtomicUsize::new(0),
            reply_timeout,
        });
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(listener, Arc::clone(&shared), cancel.clone()));

        Ok(Self {
            path,
            shared,
            cancel,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.shared.current).is_some()
    }

    /// Number of successful registrations since bind
    pub fn registrations(&self) -> usize {
        self.shared.registrations.load(Ordering::SeqCst)
    }

    /// Ask the registered control process for a verdict.
    ///
    /// Fails fast with `ChannelUnavailable` when nobody is registered or the
    /// connection drops, and with `DecisionTimeout` when no reply arrives in
    /// time. Never retried.
    pub async fn request_decision(&self, request: ConnectionRequest) -> Result<bool> {
        let peer = lock(&self.shared.current).clone().ok_or_else(|| {
            NettoError::ChannelUnavailable("no control process registered".into())
        })?;

        let id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&peer.pending).insert(id, reply_tx);

        // The connection may have been torn down after `current` was read
        if peer.outbound.is_closed() {
            lock(&peer.pending).remove(&id);
            return Err(NettoError::ChannelUnavailable("connection closed".into()));
        }

        let timeout = self.shared.reply_timeout;
        let exchange = async {
            peer.outbound
                .send(Frame::DecisionRequest { id, request })
                .await
                .map_err(|_| NettoError::ChannelUnavailable("connection closed".into()))?;
            reply_rx.await.map_err(|_| {
                NettoError::ChannelUnavailable("connection closed before reply".into())
            })
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NettoError::DecisionTimeout(timeout)),
        };

        if result.is_err() {
            lock(&peer.pending).remove(&id);
        }
        result
    }

    /// Relay diagnostic text to the control process; dropped when unregistered
    pub fn log_to_app(&self, message: impl Into<String>) {
        if let Some(peer) = lock(&self.shared.current).as_ref() {
            let _ = peer.outbound.try_send(Frame::ExtensionLog {
                message: message.into(),
            });
        }
    }
}

impl Drop for FilterEndpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
        lock(&self.shared.current).take();
        if let Err(e) = fs::remove_file(&self.path) {
            log::debug!("Failed to remove socket {:?}: {}", self.path, e);
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    shared: Arc<EndpointShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        Arc::clone(&shared),
                        cancel.child_token(),
                    ));
                }
                Err(e) => log::warn!("Failed to accept control connection: {}", e),
            },
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    shared: Arc<EndpointShared>,
    cancel: CancellationToken,
) {
    let mut framed = transport(stream);

    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        first = tokio::time::timeout(shared.reply_timeout, next_frame(&mut framed)) => {
            first
        }
    };
    if !matches!(first, Ok(Ok(Some(Frame::Register)))) {
        log::warn!("Dropping control connection that did not register");
        return;
    }

    let (outbound, mut queue) = mpsc::channel(OUTBOUND_QUEUE);
    let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
    let generation = shared.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

    {
        let replaced = lock(&shared.current).replace(Peer {
            generation,
            outbound,
            pending: Arc::clone(&pending),
            closed: cancel.clone(),
        });
        shared.registrations.fetch_add(1, Ordering::SeqCst);

        if let Some(previous) = replaced {
            log::info!("New control process registration replaces the previous one");
            previous.closed.cancel();
        }
    }

    let accepted = Frame::Registered { accepted: true };
    if let Err(e) = send_frame(&mut framed, &accepted).await {
        log::warn!("Failed to acknowledge registration: {}", e);
    } else {
        log::info!("Control process registered");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = queue.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = send_frame(&mut framed, &frame).await {
                            log::warn!("Failed to write to control process: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
                frame = next_frame(&mut framed) => match frame {
                    Ok(Some(Frame::DecisionReply { id, allowed })) => {
                        match lock(&pending).remove(&id) {
                            Some(reply) => {
                                let _ = reply.send(allowed);
                            }
                            None => log::debug!("Late reply for request {}", id),
                        }
                    }
                    Ok(Some(Frame::Register)) => {
                        if send_frame(&mut framed, &accepted).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(other)) => {
                        log::warn!("Ignoring unexpected frame from control process: {:?}", other)
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Control connection failed: {}", e);
                        break;
                    }
                },
            }
        }
    }

    {
        let mut current = lock(&shared.current);
        if current.as_ref().is_some_and(|peer| peer.generation == generation) {
            *current = None;
            log::info!("Control process disconnected");
        }
    }
    // Close the queue before releasing waiters so a request racing this
    // teardown sees a closed peer instead of waiting for its timeout
    drop(queue);
    lock(&pending).clear();
}
