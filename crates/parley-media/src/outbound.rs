//! Outbound audio pacing.
//!
//! [`OutboundScheduler`] chops synthesized PCM into fixed-duration frames and
//! enqueues them on a wall-clock interval. [`OutboundTrack`] is the transport's
//! side: every poll yields a frame, falling back to silence when nothing is
//! pending. Playback completes only once the track has taken every frame.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audio;

/// Bound on queued outbound frames (one second at 20ms).
pub const OUTBOUND_QUEUE_FRAMES: usize = 50;

/// One fixed-size outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Presentation timestamp in samples.
    pub pts: u64,
}

impl OutboundFrame {
    pub fn is_silence(&self) -> bool {
        self.samples.iter().all(|&s| s == 0)
    }
}

/// Split PCM into frames of `samples_per_frame`, zero-padding the last one.
pub fn split_frames(pcm: &[i16], samples_per_frame: usize) -> Vec<Vec<i16>> {
    if samples_per_frame == 0 {
        return Vec::new();
    }
    pcm.chunks(samples_per_frame)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(samples_per_frame, 0);
            frame
        })
        .collect()
}

/// Create a connected scheduler/track pair.
///
/// `frame_ms` is clamped to at least 1ms.
pub fn outbound_channel(sample_rate: u32, frame_ms: u32) -> (OutboundScheduler, OutboundTrack) {
    let frame_ms = frame_ms.max(1);
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);
    let dequeued = Arc::new(Notify::new());
    let samples_per_frame = (sample_rate as usize * frame_ms as usize) / 1000;
    let frame_duration = Duration::from_millis(frame_ms as u64);
    (
        OutboundScheduler {
            tx,
            dequeued: dequeued.clone(),
            sample_rate,
            samples_per_frame,
            frame_duration,
        },
        OutboundTrack {
            rx,
            dequeued,
            sample_rate,
            samples_per_frame,
            frame_duration,
            pts: 0,
        },
    )
}

/// Producer side: paces PCM into the outbound queue.
#[derive(Clone)]
pub struct OutboundScheduler {
    tx: mpsc::Sender<Vec<i16>>,
    dequeued: Arc<Notify>,
    sample_rate: u32,
    samples_per_frame: usize,
    frame_duration: Duration,
}

impl OutboundScheduler {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Enqueue `pcm` (at `source_rate`) one frame per frame interval, then
    /// wait until the track has dequeued all of them.
    ///
    /// Returns the number of frames enqueued. Stops early when `cancel` fires
    /// or the track side has been dropped.
    pub async fn play(&self, pcm: &[i16], source_rate: u32, cancel: &CancellationToken) -> usize {
        let pcm = audio::resample_pcm(pcm, source_rate, self.sample_rate);
        let frames = split_frames(&pcm, self.samples_per_frame);
        let total = frames.len();

        let mut ticker = tokio::time::interval(self.frame_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sent = 0;
        for frame in frames {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(sent, total, "Playback cancelled");
                    return sent;
                }
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(sent, total, "Playback cancelled");
                    return sent;
                }
                res = self.tx.send(frame) => {
                    if res.is_err() {
                        debug!(sent, total, "Outbound track dropped, stopping playback");
                        return sent;
                    }
                }
            }
            sent += 1;
        }

        self.drained(cancel).await;
        sent
    }

    /// Resolve once no frame is left in the queue.
    async fn drained(&self, cancel: &CancellationToken) {
        // Stale permits from earlier dequeues only cost an extra check.
        while self.tx.capacity() < self.tx.max_capacity() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.tx.closed() => return,
                _ = self.dequeued.notified() => {}
            }
        }
    }
}

/// Consumer side, polled by the transport at its frame clock.
pub struct OutboundTrack {
    rx: mpsc::Receiver<Vec<i16>>,
    dequeued: Arc<Notify>,
    sample_rate: u32,
    samples_per_frame: usize,
    frame_duration: Duration,
    pts: u64,
}

impl OutboundTrack {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Next pending frame, or silence if none is ready. Never blocks.
    pub fn next_frame(&mut self) -> OutboundFrame {
        let samples = match self.rx.try_recv() {
            Ok(samples) => {
                self.dequeued.notify_one();
                samples
            }
            Err(_) => vec![0; self.samples_per_frame],
        };
        self.stamp(samples)
    }

    /// Wait up to one frame interval for a pending frame, else silence.
    pub async fn recv_frame(&mut self) -> OutboundFrame {
        let samples = match tokio::time::timeout(self.frame_duration, self.rx.recv()).await {
            Ok(Some(samples)) => {
                self.dequeued.notify_one();
                samples
            }
            _ => vec![0; self.samples_per_frame],
        };
        self.stamp(samples)
    }

    fn stamp(&mut self, samples: Vec<i16>) -> OutboundFrame {
        let frame = OutboundFrame {
            samples,
            sample_rate: self.sample_rate,
            pts: self.pts,
        };
        self.pts += self.samples_per_frame as u64;
        frame
    }
}
