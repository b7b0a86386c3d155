// src/video_source.rs
//
// Video source boundary. Decoding, RTSP handling and reconnection belong to
// the external producer (e.g. ffmpeg piping rawvideo); this side consumes an
// ordered sequence of (frame_index, Frame) pairs and buffers them through a
// bounded queue. Under backpressure the oldest queued frame is dropped —
// lossy under overload, but acquisition never blocks indefinitely.

use crate::pipeline::metrics::PipelineMetrics;
use crate::types::{Frame, SourceConfig, SourceKind};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// The consumed video source capability: an ordered, lazy, finite or
/// infinite sequence of frames. `Ok(None)` means the source is exhausted.
/// Gaps in frame_index are normal frame loss; indices never decrease.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<(u64, Frame)>>;
}

/// Reads raw rgb24 frames of a fixed geometry from a file or stdin, e.g.
/// `ffmpeg -i rtsp://camera/stream -f rawvideo -pix_fmt rgb24 -`.
pub struct RawVideoSource {
    reader: Box<dyn Read + Send>,
    width: usize,
    height: usize,
    fps: f64,
    frame_index: u64,
}

impl RawVideoSource {
    pub fn open(config: &SourceConfig) -> Result<Self> {
        let reader: Box<dyn Read + Send> = match config.kind {
            SourceKind::Stdin => {
                info!("Reading rgb24 frames from stdin");
                Box::new(std::io::stdin())
            }
            SourceKind::File => {
                let path = config
                    .path
                    .as_deref()
                    .context("source.path is required for kind: file")?;
                info!("Reading rgb24 frames from {}", path);
                let file = std::fs::File::open(path)
                    .with_context(|| format!("Failed to open video source {}", path))?;
                Box::new(std::io::BufReader::new(file))
            }
        };

        info!(
            "Video source geometry: {}x{} @ {:.1} FPS",
            config.width, config.height, config.fps
        );

        Ok(Self {
            reader,
            width: config.width,
            height: config.height,
            fps: config.fps,
            frame_index: 0,
        })
    }
}

impl FrameSource for RawVideoSource {
    fn next_frame(&mut self) -> Result<Option<(u64, Frame)>> {
        let mut data = vec![0u8; self.width * self.height * 3];
        let mut filled = 0usize;

        while filled < data.len() {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => {
                    if filled > 0 {
                        warn!(
                            "Truncated trailing frame ({} of {} bytes), stopping",
                            filled,
                            data.len()
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read frame data"),
            }
        }

        self.frame_index += 1;
        let timestamp_ms = (self.frame_index as f64 / self.fps) * 1000.0;

        Ok(Some((
            self.frame_index,
            Frame {
                data,
                width: self.width,
                height: self.height,
                timestamp_ms,
            },
        )))
    }
}

struct QueueInner {
    frames: VecDeque<(u64, Frame)>,
    closed: bool,
}

/// Bounded frame buffer between the acquisition task and the processing
/// loop. Full queue drops the oldest frame rather than blocking acquisition.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    metrics: Arc<PipelineMetrics>,
}

impl FrameQueue {
    pub fn new(capacity: usize, metrics: Arc<PipelineMetrics>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            metrics,
        })
    }

    pub fn push(&self, frame_index: u64, frame: Frame) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            if inner.frames.len() >= self.capacity {
                if let Some((dropped_index, _)) = inner.frames.pop_front() {
                    warn!(
                        "Frame queue full ({}), dropping oldest frame {}",
                        self.capacity, dropped_index
                    );
                    self.metrics.inc(&self.metrics.frames_dropped);
                }
            }
            inner.frames.push_back((frame_index, frame));
        }
        self.notify.notify_one();
    }

    /// Mark the source exhausted. Queued frames still drain; afterwards
    /// `pop` returns None.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        // notify_one stores a permit, so the single consumer wakes even if
        // it has not started polling yet
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Option<(u64, Frame)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.frames.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run the acquisition side on a blocking task: read frames from the source
/// and feed the queue until exhaustion, error, or a stop request.
pub fn spawn_acquisition(
    mut source: Box<dyn FrameSource>,
    queue: Arc<FrameQueue>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        loop {
            if stop.load(Ordering::Relaxed) {
                debug!("Stop requested, ending frame acquisition");
                break;
            }
            match source.next_frame() {
                Ok(Some((frame_index, frame))) => queue.push(frame_index, frame),
                Ok(None) => {
                    info!("Video source exhausted");
                    break;
                }
                Err(e) => {
                    warn!("Frame acquisition failed: {:#}", e);
                    break;
                }
            }
        }
        queue.close();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> Frame {
        Frame {
            data: vec![n; 2 * 2 * 3],
            width: 2,
            height: 2,
            timestamp_ms: n as f64,
        }
    }

    fn metrics() -> Arc<PipelineMetrics> {
        Arc::new(PipelineMetrics::new())
    }

    #[test]
    fn test_raw_source_reads_fixed_size_frames() {
        let path = std::env::temp_dir().join(format!(
            "vehicle_counter_source_{}.rgb",
            std::process::id()
        ));
        // Two complete 2x2 frames plus a truncated third
        let mut bytes = vec![1u8; 12];
        bytes.extend(vec![2u8; 12]);
        bytes.extend(vec![3u8; 5]);
        std::fs::write(&path, &bytes).unwrap();

        let config = SourceConfig {
            kind: SourceKind::File,
            path: Some(path.to_str().unwrap().to_string()),
            width: 2,
            height: 2,
            fps: 10.0,
        };
        let mut source = RawVideoSource::open(&config).unwrap();

        let (index, frame) = source.next_frame().unwrap().unwrap();
        assert_eq!(index, 1);
        assert_eq!(frame.data, vec![1u8; 12]);
        assert!((frame.timestamp_ms - 100.0).abs() < 1e-9);

        let (index, frame) = source.next_frame().unwrap().unwrap();
        assert_eq!(index, 2);
        assert_eq!(frame.data, vec![2u8; 12]);

        // Truncated trailing frame ends the stream
        assert!(source.next_frame().unwrap().is_none());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_queue_drops_oldest_under_backpressure() {
        let m = metrics();
        let queue = FrameQueue::new(2, m.clone());
        queue.push(1, frame(1));
        queue.push(2, frame(2));
        queue.push(3, frame(3));

        assert_eq!(queue.len(), 2);
        assert_eq!(
            m.frames_dropped.load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        // Frame 1 was sacrificed; 2 and 3 remain in order
        let inner = queue.inner.lock().unwrap();
        let indices: Vec<u64> = inner.frames.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_pop_drains_then_returns_none_after_close() {
        let queue = FrameQueue::new(4, metrics());
        queue.push(1, frame(1));
        queue.push(2, frame(2));
        queue.close();

        assert_eq!(queue.pop().await.unwrap().0, 1);
        assert_eq!(queue.pop().await.unwrap().0, 2);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = FrameQueue::new(4, metrics());
        let q = queue.clone();
        let popper = tokio::spawn(async move { q.pop().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(42, frame(7));

        let item = tokio::time::timeout(std::time::Duration::from_secs(2), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.unwrap().0, 42);
    }

    #[tokio::test]
    async fn test_push_after_close_is_ignored() {
        let queue = FrameQueue::new(4, metrics());
        queue.close();
        queue.push(1, frame(1));
        assert!(queue.pop().await.is_none());
    }

    struct CountingSource {
        remaining: u64,
        next: u64,
    }

    impl FrameSource for CountingSource {
        fn next_frame(&mut self) -> Result<Option<(u64, Frame)>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            self.next += 1;
            Ok(Some((
                self.next,
                Frame {
                    data: vec![0u8; 12],
                    width: 2,
                    height: 2,
                    timestamp_ms: self.next as f64,
                },
            )))
        }
    }

    #[tokio::test]
    async fn test_acquisition_feeds_and_closes_queue() {
        let queue = FrameQueue::new(16, metrics());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_acquisition(
            Box::new(CountingSource {
                remaining: 3,
                next: 0,
            }),
            queue.clone(),
            stop,
        );

        let mut seen = Vec::new();
        while let Some((index, _)) = queue.pop().await {
            seen.push(index);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        handle.await.unwrap();
    }
}
