// Accounting feed subprocess and the pipeline that consumes it

use super::aggregator::Aggregator;
use super::parser::LineParser;
use super::publisher::BandwidthPublisher;
use crate::error::{NettoError, Result};
use crate::process::RawSample;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Quiet period after the last read before buffered samples are aggregated
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// How long the feed process gets to exit after SIGTERM
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;

/// Samples held before a flush is forced even without a quiet period
pub const MAX_BUFFERED_SAMPLES: usize = 4096;

/// Command producing the accounting feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for FeedCommand {
    /// nettop with per-process rows, delta byte counts, machine-readable
    /// columns and no iteration limit
    fn default() -> Self {
        Self {
            program: "/usr/bin/nettop".to_string(),
            args: ["-P", "-L", "0", "-J", "bytes_in,bytes_out", "-d", "-x"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl FeedCommand {
    /// Start the feed with stdout piped
    pub fn spawn(&self) -> Result<(Child, ChildStdout)> {
        let launch_error = |source: io::Error| NettoError::ProcessLaunch {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_error)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(io::Error::other("stdout was not captured")))?;

        log::info!("Started feed process {} (pid {:?})", self.program, child.id());
        Ok((child, stdout))
    }
}

/// Ask the feed process to exit, then kill it if it does not.
pub async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        match i32::try_from(pid) {
            Ok(pid) => {
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    log::debug!("SIGTERM to feed process {} failed: {}", pid, e);
                }
            }
            Err(_) => log::debug!("Feed pid {} out of range", pid),
        }

        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("Feed process exited: {}", status);
                return;
            }
            Ok(Err(e)) => log::warn!("Failed to wait for feed process: {}", e),
            Err(_) => log::warn!("Feed process ignored SIGTERM, killing it"),
        }
    }

    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill feed process: {}", e);
    }
}

/// Teardown signals of a running pipeline
#[derive(Debug, Clone, Default)]
pub struct PipelineStop {
    /// Nothing is published once this fires
    pub mute: CancellationToken,
    /// Ends the pipeline along with its debounce timer
    pub cancel: CancellationToken,
}

impl PipelineStop {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Read the feed until cancelled or closed.
///
/// Every read re-arms the debounce timer; buffered samples are aggregated
/// and published only once the feed has been quiet for `debounce`, or as
/// soon as `MAX_BUFFERED_SAMPLES` are waiting. Reading and flushing happen
/// on this one task, so a flush never interleaves with a partially parsed
/// chunk.
pub async fn run_pipeline<R>(
    mut reader: R,
    mut aggregator: Aggregator,
    publisher: Arc<BandwidthPublisher>,
    debounce: Duration,
    stop: PipelineStop,
) where
    R: AsyncRead + Unpin,
{
    let mut parser = LineParser::new();
    let mut buffer: Vec<RawSample> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    let timer = tokio::time::sleep(debounce);
    tokio::pin!(timer);
    let mut armed = false;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancel.cancelled() => break,
            _ = &mut timer, if armed => {
                armed = false;
                flush(&mut buffer, &mut aggregator, &publisher, &stop);
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    log::info!("Feed closed its output");
                    flush(&mut buffer, &mut aggregator, &publisher, &stop);
                    break;
                }
                Ok(n) => {
                    buffer.extend(parser.feed(&chunk[..n]));
                    if buffer.len() >= MAX_BUFFERED_SAMPLES {
                        log::debug!("Feed never went quiet, flushing {} samples", buffer.len());
                        armed = false;
                        flush(&mut buffer, &mut aggregator, &publisher, &stop);
                    } else {
                        timer.as_mut().reset(Instant::now() + debounce);
                        armed = true;
                    }
                }
                Err(e) => {
                    log::error!("Failed to read feed output: {}", e);
                    break;
                }
            },
        }
    }

    log::debug!("Feed pipeline stopped");
}

fn flush(
    buffer: &mut Vec<RawSample>,
    aggregator: &mut Aggregator,
    publisher: &BandwidthPublisher,
    stop: &PipelineStop,
) {
    if stop.mute.is_cancelled() || stop.cancel.is_cancelled() {
        buffer.clear();
        return;
    }
    if buffer.is_empty() {
        return;
    }

    let snapshot = aggregator.flush(std::mem::take(buffer));
    publisher.publish(snapshot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::publisher::SnapshotSubscription;
    use crate::process::SharedSnapshot;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    const DEBOUNCE: Duration = Duration::from_millis(20);

    struct Harness {
        writer: DuplexStream,
        subscription: SnapshotSubscription,
        stop: PipelineStop,
        task: JoinHandle<()>,
    }

    fn start_with(debounce: Duration) -> Harness {
        let (writer, reader) = tokio::io::duplex(1024);
        let publisher = Arc::new(BandwidthPublisher::new());
        let subscription = publisher.subscribe();
        let stop = PipelineStop::new();
        let task = tokio::spawn(run_pipeline(
            reader,
            Aggregator::default(),
            publisher,
            debounce,
            stop.clone(),
        ));
        Harness {
            writer,
            subscription,
            stop,
            task,
        }
    }

    fn start() -> Harness {
        start_with(DEBOUNCE)
    }

    async fn next(subscription: &mut SnapshotSubscription) -> SharedSnapshot {
        tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("no snapshot published")
            .expect("publisher dropped")
    }

    #[test]
    fn test_default_command_is_nettop_delta_mode() {
        let command = FeedCommand::default();
        assert_eq!(command.program, "/usr/bin/nettop");
        assert!(command.args.contains(&"-d".to_string()));
        assert!(command.args.contains(&"bytes_in,bytes_out".to_string()));
    }

    #[tokio::test]
    async fn test_single_line_flush() {
        let mut h = start();

        h.writer.write_all(b"Safari.501,1048576,2097152,\n").await.unwrap();

        let snapshot = next(&mut h.subscription).await;
        let safari = snapshot.get("Safari").unwrap();
        assert_eq!(safari.pid, 501);
        assert_eq!(safari.download_speed, 1048576.0);
        assert_eq!(safari.upload_speed, 2097152.0);
        h.stop.cancel.cancel();
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let mut h = start();

        h.writer.write_all(b",bytes_in,bytes_out,\nX.1,100,").await.unwrap();
        h.writer.write_all(b"50,\nX.2,200,10,\n").await.unwrap();

        let snapshot = next(&mut h.subscription).await;
        let x = snapshot.get("X").unwrap();
        assert_eq!(x.download_speed, 300.0);
        assert_eq!(x.upload_speed, 60.0);
        h.stop.cancel.cancel();
    }

    #[tokio::test]
    async fn test_reads_within_window_make_one_flush() {
        let mut h = start_with(Duration::from_millis(100));

        h.writer.write_all(b"X.1,10,0,\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.writer.write_all(b"X.2,20,0,\n").await.unwrap();

        let snapshot = next(&mut h.subscription).await;
        let x = snapshot.get("X").unwrap();
        assert_eq!(x.download_speed, 30.0);
        assert_eq!(x.history, vec![(30, 0)]);

        // Nothing else was buffered, so no second snapshot follows
        let more = tokio::time::timeout(Duration::from_millis(300), h.subscription.next()).await;
        assert!(more.is_err());
        h.stop.cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_buffer_flushes_without_quiet_period() {
        let mut h = start_with(Duration::from_secs(60));

        let lines = "X.1,1,0,\n".repeat(MAX_BUFFERED_SAMPLES);
        h.writer.write_all(lines.as_bytes()).await.unwrap();

        let snapshot = next(&mut h.subscription).await;
        assert_eq!(
            snapshot.get("X").unwrap().download_speed,
            MAX_BUFFERED_SAMPLES as f64
        );
        h.stop.cancel.cancel();
    }

    #[tokio::test]
    async fn test_smoothing_across_flushes() {
        let mut h = start();

        let mut last = None;
        for bytes in [10, 20, 30] {
            h.writer
                .write_all(format!("X.1,{bytes},0,\n").as_bytes())
                .await
                .unwrap();
            last = Some(next(&mut h.subscription).await);
        }

        assert_eq!(last.unwrap().get("X").unwrap().download_speed, 20.0);
        h.stop.cancel.cancel();
    }

    #[tokio::test]
    async fn test_absent_name_disappears_next_flush() {
        let mut h = start();

        h.writer.write_all(b"A.1,5,5,\nB.2,5,5,\n").await.unwrap();
        let snapshot = next(&mut h.subscription).await;
        assert!(snapshot.get("A").is_some());

        h.writer.write_all(b"B.2,5,5,\n").await.unwrap();
        let snapshot = next(&mut h.subscription).await;
        assert!(snapshot.get("A").is_none());
        assert!(snapshot.get("B").is_some());
        h.stop.cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_without_publishing() {
        let mut h = start();

        h.writer.write_all(b"late.9,1,1,\n").await.unwrap();
        h.stop.cancel.cancel();
        h.task.await.unwrap();

        assert!(h.subscription.latest().is_empty());
    }

    #[tokio::test]
    async fn test_feed_eof_flushes_remaining_samples() {
        let mut h = start();

        h.writer.write_all(b"curl.77,9,1,\n").await.unwrap();
        drop(h.writer);
        h.task.await.unwrap();

        let snapshot = next(&mut h.subscription).await;
        assert!(snapshot.get("curl").is_some());
    }

    #[tokio::test]
    async fn test_muted_pipeline_does_not_publish_on_eof() {
        let h = start();
        let mut writer = h.writer;

        writer.write_all(b"curl.77,9,1,\n").await.unwrap();
        h.stop.mute.cancel();
        drop(writer);
        h.task.await.unwrap();

        assert!(h.subscription.latest().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_error() {
        let command = FeedCommand {
            program: "/nonexistent/netto-feed".to_string(),
            args: Vec::new(),
        };
        assert!(matches!(command.spawn(), Err(NettoError::ProcessLaunch { .. })));
    }
}
