//! Capture sink (spec.md §4.H): a lossy, non-blocking consumer of
//! per-URB records written out as pcapng. Writes never back-pressure
//! the engine — a full channel drops the event and bumps a counter
//! (spec.md §9 "Packet capture task").

use crate::pcapng::PcapNgWriter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub endpoint: u8,
    pub direction_in: bool,
    pub seqnum: u32,
    pub status: i32,
    pub payload_len: usize,
    pub elapsed: Duration,
}

#[derive(Default)]
pub struct CaptureStats {
    pub dropped: AtomicU64,
    pub written: AtomicU64,
}

/// Handle returned to callers that want to feed events in; the
/// background writer task owns the file and drains the channel.
pub struct CaptureSink {
    sender: mpsc::Sender<CaptureEvent>,
    stats: Arc<CaptureStats>,
}

impl CaptureSink {
    /// Spawns the writer task against `path`, truncating any existing
    /// file, and returns a handle plus shared stats.
    pub async fn open(path: &std::path::Path, queue_depth: usize) -> anyhow::Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        let (sender, receiver) = mpsc::channel(queue_depth);
        let stats = Arc::new(CaptureStats::default());
        let task_stats = stats.clone();
        tokio::spawn(async move {
            if let Err(e) = run_writer(file, receiver, task_stats).await {
                warn!("capture sink writer stopped: {e:#}");
            }
        });
        Ok(Self { sender, stats })
    }

    /// Non-blocking by design: drops the event rather than waiting
    /// for channel space.
    pub fn try_send(&self, event: CaptureEvent) {
        if self.sender.try_send(event).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sender(&self) -> mpsc::Sender<CaptureEvent> {
        self.sender.clone()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }
}

async fn run_writer(
    file: tokio::fs::File,
    mut receiver: mpsc::Receiver<CaptureEvent>,
    stats: Arc<CaptureStats>,
) -> anyhow::Result<()> {
    let mut writer = PcapNgWriter::new(file).await?;
    while let Some(event) = receiver.recv().await {
        writer.write_event(&event).await?;
        stats.written.fetch_add(1, Ordering::Relaxed);
    }
    writer.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CaptureSink::open(&dir.path().join("cap.pcapng"), 1).await.unwrap();
        for _ in 0..100 {
            sink.try_send(CaptureEvent {
                endpoint: 1,
                direction_in: true,
                seqnum: 1,
                status: 0,
                payload_len: 0,
                elapsed: Duration::from_millis(1),
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = sink.stats();
        assert!(stats.dropped.load(Ordering::Relaxed) > 0 || stats.written.load(Ordering::Relaxed) == 100);
    }
}
