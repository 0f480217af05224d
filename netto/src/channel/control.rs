// Control-process side of the decision channel

use super::{ChannelState, DecisionHandler, FrameTransport, lock, next_frame, send_frame, transport};
use crate::error::{NettoError, Result};
use netto_common::Frame;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long the filter gets to acknowledge a registration
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    generation: u64,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

struct ChannelInner {
    state: ChannelState,
    connection: Option<Connection>,
    generation: u64,
}

/// Registers this process with the filter and answers its decision requests.
///
/// `register` is idempotent: while registered it returns `true` without
/// opening a second connection.
pub struct DecisionChannel {
    socket_path: PathBuf,
    inner: Arc<Mutex<ChannelInner>>,
    // Serializes concurrent register() calls so only one can connect
    register_lock: tokio::sync::Mutex<()>,
}

impl DecisionChannel {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            inner: Arc::new(Mutex::new(ChannelInner {
                state: ChannelState::Unregistered,
                connection: None,
                generation: 0,
            })),
            register_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    pub fn is_registered(&self) -> bool {
        self.state() == ChannelState::Registered
    }

    /// Connect to the filter and start answering requests with `handler`
    pub async fn register(&self, handler: Arc<dyn DecisionHandler>) -> bool {
        let _guard = self.register_lock.lock().await;

        {
            let mut inner = lock(&self.inner);
            match inner.state {
                ChannelState::Registered if inner.connection.is_some() => {
                    log::warn!("Already registered with the filter");
                    return true;
                }
                ChannelState::Broken => {
                    log::info!("Resetting broken decision channel");
                    inner.state = ChannelState::Unregistered;
                }
                _ => {}
            }
            inner.state = ChannelState::Registering;
        }

        log::info!("Registering with filter at {:?}", self.socket_path);

        match self.handshake().await {
            Ok(framed) => {
                let mut inner = lock(&self.inner);
                inner.generation += 1;
                let generation = inner.generation;
                let cancel = CancellationToken::new();

                let task = tokio::spawn(serve(
                    framed,
                    handler,
                    Arc::clone(&self.inner),
                    generation,
                    cancel.clone(),
                ));

                inner.connection = Some(Connection {
                    generation,
                    cancel,
                    _task: task,
                });
                inner.state = ChannelState::Registered;
                log::info!("Registered with filter");
                true
            }
            Err(e) => {
                log::warn!("Failed to register with the filter: {}", e);
                lock(&self.inner).state = ChannelState::Unregistered;
                false
            }
        }
    }

    async fn handshake(&self) -> Result<FrameTransport> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            NettoError::ChannelUnavailable(format!(
                "cannot connect to {:?}: {e}",
                self.socket_path
            ))
        })?;
        let mut framed = transport(stream);

        send_frame(&mut framed, &Frame::Register).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_frame(&mut framed))
            .await
            .map_err(|_| NettoError::Protocol("registration was not acknowledged".into()))??;

        match reply {
            Some(Frame::Registered { accepted: true }) => Ok(framed),
            Some(Frame::Registered { accepted: false }) => {
                Err(NettoError::Protocol("registration rejected by the filter".into()))
            }
            Some(other) => Err(NettoError::Protocol(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
            None => Err(NettoError::ChannelUnavailable(
                "filter closed the connection during registration".into(),
            )),
        }
    }

    /// Drop the connection and return to Unregistered
    pub fn unregister(&self) {
        let mut inner = lock(&self.inner);
        if let Some(connection) = inner.connection.take() {
            connection.cancel.cancel();
            log::info!("Unregistered from filter");
        }
        inner.state = ChannelState::Unregistered;
    }
}

impl Drop for DecisionChannel {
    fn drop(&mut self) {
        if let Some(connection) = lock(&self.inner).connection.take() {
            connection.cancel.cancel();
        }
    }
}

async fn serve(
    mut framed: FrameTransport,
    handler: Arc<dyn DecisionHandler>,
    inner: Arc<Mutex<ChannelInner>>,
    generation: u64,
    cancel: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = next_frame(&mut framed) => frame,
        };

        match frame {
            Ok(Some(Frame::DecisionRequest { id, request })) => {
                log::debug!(
                    "Decision request {} from {} for {}:{}",
                    id,
                    request.app_id,
                    request.remote_host,
                    request.remote_port
                );
                let allowed = handler.decide(request);
                let reply = Frame::DecisionReply { id, allowed };
                if let Err(e) = send_frame(&mut framed, &reply).await {
                    break format!("failed to send reply: {e}");
                }
            }
            Ok(Some(Frame::ExtensionLog { message })) => handler.extension_log(&message),
            Ok(Some(other)) => log::warn!("Ignoring unexpected frame from filter: {:?}", other),
            Ok(None) => break "filter closed the connection".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    mark_broken(&inner, generation, &reason);
}

/// Forget the dead connection before anything else can try to use it
fn mark_broken(inner: &Mutex<ChannelInner>, generation: u64, reason: &str) {
    let mut inner = lock(inner);
    let is_current = inner
        .connection
        .as_ref()
        .is_some_and(|c| c.generation == generation);

    if is_current {
        inner.connection = None;
        inner.state = ChannelState::Broken;
        log::warn!("Decision channel broken: {}", reason);
    }
}
