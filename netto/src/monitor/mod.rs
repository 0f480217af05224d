// Per-process bandwidth monitoring driven by the nettop feed

pub mod aggregator;
pub mod feed;
pub mod lifecycle;
pub mod parser;
pub mod publisher;

use crate::error::Result;
use crate::process::{MonitorSnapshot, SharedSnapshot};
use aggregator::{Aggregator, DEFAULT_SMOOTHING_WINDOW};
use feed::{DEFAULT_DEBOUNCE, FeedCommand, PipelineStop};
use lifecycle::{SubscriberCount, Transition};
use publisher::{BandwidthPublisher, SnapshotSubscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub feed: FeedCommand,
    pub debounce: Duration,
    pub smoothing_window: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            feed: FeedCommand::default(),
            debounce: DEFAULT_DEBOUNCE,
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
        }
    }
}

// Resources that exist only while someone is subscribed
struct Running {
    child: Child,
    stop: PipelineStop,
    reader: JoinHandle<()>,
}

impl Running {
    async fn shutdown(mut self) {
        // Muted first: the feed closing its output must not publish mid-stop
        self.stop.mute.cancel();
        feed::terminate(&mut self.child).await;
        self.stop.cancel.cancel();
        if let Err(e) = self.reader.await {
            log::warn!("Feed pipeline task failed: {}", e);
        }
    }
}

struct MonitorState {
    subscribers: SubscriberCount,
    running: Option<Running>,
}

/// Shared per-process bandwidth source.
///
/// The feed process runs only while at least one caller has started the
/// monitor and not yet stopped it. Snapshots are delivered through
/// [`BandwidthMonitor::subscribe`].
pub struct BandwidthMonitor {
    settings: MonitorSettings,
    publisher: Arc<BandwidthPublisher>,
    state: Mutex<MonitorState>,
}

impl BandwidthMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            settings,
            publisher: Arc::new(BandwidthPublisher::new()),
            state: Mutex::new(MonitorState {
                subscribers: SubscriberCount::new(),
                running: None,
            }),
        }
    }

    /// Register interest. The first caller launches the feed.
    ///
    /// A launch failure is returned to that caller only; the registration
    /// still counts, and the next launch attempt happens when the count
    /// next goes from zero to one.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.subscribers.acquire() != Transition::Start {
            return Ok(());
        }

        match self.launch() {
            Ok(running) => {
                state.running = Some(running);
                log::info!("Bandwidth monitoring started");
                Ok(())
            }
            Err(e) => {
                log::error!("Bandwidth monitoring unavailable: {}", e);
                Err(e)
            }
        }
    }

    /// Drop interest. The last caller tears the feed down.
    ///
    /// Extra calls beyond the matching `start`s are ignored.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.subscribers.release() != Transition::Stop {
            return;
        }

        if let Some(running) = state.running.take() {
            running.shutdown().await;
            log::info!("Bandwidth monitoring stopped");
        }
        self.publisher.publish(MonitorSnapshot::empty());
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running.is_some()
    }

    pub async fn subscribers(&self) -> usize {
        self.state.lock().await.subscribers.get()
    }

    pub fn subscribe(&self) -> SnapshotSubscription {
        self.publisher.subscribe()
    }

    pub fn latest(&self) -> SharedSnapshot {
        self.publisher.latest()
    }

    fn launch(&self) -> Result<Running> {
        let (child, stdout) = self.settings.feed.spawn()?;
        let stop = PipelineStop::new();

        let reader = tokio::spawn(feed::run_pipeline(
            stdout,
            Aggregator::new(self.settings.smoothing_window),
            Arc::clone(&self.publisher),
            self.settings.debounce,
            stop.clone(),
        ));

        Ok(Running {
            child,
            stop,
            reader,
        })
    }
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new(MonitorSettings::default())
    }
}
