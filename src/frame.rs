//! Frame hand-off layer.
//!
//! - `Frame`: Immutable RGB sample moved from the capture thread to the motion thread.
//! - `FrameRelay`: Bounded drop-oldest buffer between the two threads.
//! - `PreviewSlot`: Lock-guarded copy of the latest full-resolution frame.
//!
//! The relay never blocks the producer. When full, the oldest pending frame is
//! evicted to admit the newest; the consumer always drains to the most recent
//! frame so analysis never runs behind newer data.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::Timestamp;

/// Frames with either dimension below this are treated as corrupt decodes.
pub const MIN_FRAME_DIMENSION: u32 = 100;

/// Default number of pending frames held by the relay.
pub const DEFAULT_RELAY_CAPACITY: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Immutable RGB image sample with its capture timestamp.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    captured_at: Timestamp,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: Timestamp) -> Self {
        Self { image, captured_at }
    }

    /// Build a frame from tightly packed RGB8 bytes.
    pub fn from_rgb(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: Timestamp,
    ) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", width, height))?;
        Ok(Self::new(image, captured_at))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> Timestamp {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// True when either dimension is below `min_dimension`.
    pub fn is_undersized(&self, min_dimension: u32) -> bool {
        self.width() < min_dimension || self.height() < min_dimension
    }
}

// ----------------------------------------------------------------------------
// FrameRelay: bounded drop-oldest hand-off
// ----------------------------------------------------------------------------

/// Result of offering a frame to the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    Queued,
    /// The relay was full and its oldest pending frame was dropped.
    EvictedOldest,
}

/// Relay counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub offered: u64,
    pub evicted: u64,
    /// Frames skipped by the consumer because a newer one was pending.
    pub stale_discarded: u64,
}

struct RelayState {
    frames: VecDeque<Frame>,
    stats: RelayStats,
}

/// Bounded single-producer/single-consumer hand-off buffer.
pub struct FrameRelay {
    state: Mutex<RelayState>,
    ready: Condvar,
    capacity: usize,
}

impl FrameRelay {
    /// Create a relay holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RelayState {
                frames: VecDeque::with_capacity(capacity),
                stats: RelayStats::default(),
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a frame. Never blocks beyond the internal lock.
    pub fn offer(&self, frame: Frame) -> OfferOutcome {
        let mut state = self.lock();
        state.stats.offered += 1;
        let mut outcome = OfferOutcome::Queued;
        while state.frames.len() >= self.capacity {
            state.frames.pop_front();
            state.stats.evicted += 1;
            outcome = OfferOutcome::EvictedOldest;
        }
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
        outcome
    }

    /// Wait up to `timeout` for a frame, then drain to the most recent one.
    ///
    /// Older pending frames are discarded under the same lock acquisition, so the
    /// caller never observes a frame that was superseded at drain time.
    pub fn take_latest(&self, timeout: Duration) -> Option<Frame> {
        let state = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.frames.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let latest = state.frames.pop_back()?;
        let stale = state.frames.len() as u64;
        state.frames.clear();
        state.stats.stale_discarded += stale;
        Some(latest)
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RelayStats {
        self.lock().stats
    }
}

impl Default for FrameRelay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_CAPACITY)
    }
}

// ----------------------------------------------------------------------------
// PreviewSlot
// ----------------------------------------------------------------------------

/// Latest full-resolution preview frame, readable from any thread.
///
/// Writers hold the lock only for the copy.
#[derive(Clone, Default)]
pub struct PreviewSlot {
    inner: Arc<Mutex<Option<Frame>>>,
}

impl PreviewSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: &Frame) {
        let copy = frame.clone();
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(copy);
    }

    /// Copy of the most recent preview frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use image::Rgb;

    fn make_test_frame(shade: u8) -> Frame {
        Frame::new(
            RgbImage::from_pixel(120, 100, Rgb([shade, shade, shade])),
            Local::now(),
        )
    }

    fn shade_of(frame: &Frame) -> u8 {
        frame.image().get_pixel(0, 0)[0]
    }

    #[test]
    fn from_rgb_rejects_short_buffers() {
        assert!(Frame::from_rgb(vec![0; 10], 4, 4, Local::now()).is_err());
        let frame = Frame::from_rgb(vec![0; 48], 4, 4, Local::now()).unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 4));
    }

    #[test]
    fn undersized_frames_are_flagged() {
        let small = Frame::new(RgbImage::new(99, 200), Local::now());
        assert!(small.is_undersized(MIN_FRAME_DIMENSION));
        assert!(!make_test_frame(0).is_undersized(MIN_FRAME_DIMENSION));
    }

    #[test]
    fn relay_enforces_capacity_by_dropping_oldest() {
        let relay = FrameRelay::new(3);

        for shade in 0..3 {
            assert_eq!(relay.offer(make_test_frame(shade)), OfferOutcome::Queued);
        }
        assert_eq!(relay.offer(make_test_frame(3)), OfferOutcome::EvictedOldest);

        assert_eq!(relay.len(), 3);
        assert_eq!(relay.stats().evicted, 1);
    }

    #[test]
    fn relay_drain_yields_most_recent_offer() {
        let relay = FrameRelay::new(3);
        for shade in 0..50u8 {
            relay.offer(make_test_frame(shade));
        }

        let latest = relay.take_latest(Duration::from_millis(10)).unwrap();
        assert_eq!(shade_of(&latest), 49);
        assert!(relay.is_empty());
        assert_eq!(relay.stats().stale_discarded, 2);
        assert_eq!(relay.stats().evicted, 47);
    }

    #[test]
    fn relay_times_out_when_empty() {
        let relay = FrameRelay::new(3);
        assert!(relay.take_latest(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn relay_capacity_has_floor_of_one() {
        let relay = FrameRelay::new(0);
        assert_eq!(relay.capacity(), 1);
        relay.offer(make_test_frame(1));
        relay.offer(make_test_frame(2));
        assert_eq!(shade_of(&relay.take_latest(Duration::ZERO).unwrap()), 2);
    }

    #[test]
    fn relay_wakes_blocked_consumer() {
        let relay = Arc::new(FrameRelay::new(3));
        let producer = relay.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            producer.offer(make_test_frame(7));
        });
        let frame = relay.take_latest(Duration::from_secs(5)).unwrap();
        assert_eq!(shade_of(&frame), 7);
        handle.join().unwrap();
    }

    #[test]
    fn preview_slot_returns_copy() {
        let slot = PreviewSlot::new();
        assert!(slot.latest().is_none());
        slot.publish(&make_test_frame(9));
        let reader = slot.clone();
        assert_eq!(shade_of(&reader.latest().unwrap()), 9);
    }
}
