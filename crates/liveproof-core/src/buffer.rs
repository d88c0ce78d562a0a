//! Bounded per-challenge frame storage.
//!
//! Every [`FrameBuffer`] is capped by a frame count and draws from a
//! process-wide [`ByteBudget`] shared by all live buffers. When either limit is
//! hit the oldest frame in the buffer is evicted; new data is never rejected
//! unless a single frame cannot fit at all.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::types::FrameRecord;

pub const DEFAULT_MAX_FRAMES: usize = 50;
pub const DEFAULT_MAX_TOTAL_BYTES: usize = 50 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("frame of {size} bytes does not fit the buffer budget ({available} bytes available)")]
pub struct BufferFull {
    pub size: usize,
    pub available: usize,
}

/// Aggregate byte ceiling shared by every live buffer and snapshot.
#[derive(Clone, Debug)]
pub struct ByteBudget {
    inner: Arc<BudgetInner>,
}

#[derive(Debug)]
struct BudgetInner {
    used: AtomicUsize,
    limit: usize,
}

impl ByteBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                used: AtomicUsize::new(0),
                limit,
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.used())
    }

    fn try_reserve(&self, bytes: usize) -> bool {
        let limit = self.inner.limit;
        self.inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= limit)
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        self.inner.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl Default for ByteBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOTAL_BYTES)
    }
}

/// Bytes held against a [`ByteBudget`]; returned when dropped.
#[derive(Debug)]
struct Reservation {
    budget: ByteBudget,
    bytes: usize,
}

impl Reservation {
    fn empty(budget: ByteBudget) -> Self {
        Self { budget, bytes: 0 }
    }

    fn shrink(&mut self, bytes: usize) {
        let bytes = bytes.min(self.bytes);
        self.bytes -= bytes;
        self.budget.release(bytes);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.budget.release(self.bytes);
        }
    }
}

/// FIFO frame store for one active challenge.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<FrameRecord>,
    max_frames: usize,
    reservation: Reservation,
    evicted: u64,
}

impl FrameBuffer {
    pub fn new(max_frames: usize, budget: ByteBudget) -> Self {
        let max_frames = max_frames.max(1);
        Self {
            frames: VecDeque::with_capacity(max_frames),
            max_frames,
            reservation: Reservation::empty(budget),
            evicted: 0,
        }
    }

    /// Append a frame, evicting the oldest frames as needed.
    pub fn append(&mut self, record: FrameRecord) -> Result<(), BufferFull> {
        let size = record.byte_size();
        let budget = self.reservation.budget.clone();
        if size > budget.limit() {
            tracing::warn!(
                frame = record.frame_id,
                size,
                limit = budget.limit(),
                "frame larger than the whole byte budget"
            );
            return Err(BufferFull {
                size,
                available: budget.available(),
            });
        }

        let before = self.evicted;
        if self.frames.len() >= self.max_frames {
            self.evict_oldest();
        }
        while !budget.try_reserve(size) {
            if !self.evict_oldest() {
                tracing::warn!(
                    frame = record.frame_id,
                    size,
                    available = budget.available(),
                    "byte budget exhausted by other buffers"
                );
                return Err(BufferFull {
                    size,
                    available: budget.available(),
                });
            }
        }
        if self.evicted > before {
            tracing::debug!(
                frame = record.frame_id,
                evicted = self.evicted - before,
                budget_used = budget.used(),
                "evicted oldest frames"
            );
        }

        self.reservation.bytes += size;
        self.frames.push_back(record);
        Ok(())
    }

    fn evict_oldest(&mut self) -> bool {
        match self.frames.pop_front() {
            Some(old) => {
                self.reservation.shrink(old.byte_size());
                self.evicted += 1;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Number of frames dropped to stay within limits.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn bytes(&self) -> usize {
        self.reservation.bytes
    }

    /// The most recently appended frame.
    pub fn last(&self) -> Option<&FrameRecord> {
        self.frames.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameRecord> {
        self.frames.iter()
    }

    /// Close the buffer and hand its frames over as an immutable snapshot.
    ///
    /// The byte reservation moves with the frames and is released once the
    /// last snapshot handle is dropped.
    pub fn snapshot(self) -> FrameSnapshot {
        let FrameBuffer {
            frames,
            reservation,
            evicted,
            ..
        } = self;
        FrameSnapshot {
            inner: Arc::new(SnapshotInner {
                frames: Vec::from(frames),
                evicted,
                _reservation: reservation,
            }),
        }
    }
}

#[derive(Debug)]
struct SnapshotInner {
    frames: Vec<FrameRecord>,
    evicted: u64,
    _reservation: Reservation,
}

/// Ordered, read-only view of a closed challenge buffer.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    inner: Arc<SnapshotInner>,
}

impl FrameSnapshot {
    pub fn frames(&self) -> &[FrameRecord] {
        &self.inner.frames
    }

    pub fn len(&self) -> usize {
        self.inner.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.frames.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.inner.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u64) -> FrameRecord {
        FrameRecord::new(id, 1_000 + id, 2_000 + id)
    }

    fn frame_with_image(id: u64, bytes: usize) -> FrameRecord {
        let mut f = frame(id);
        f.image = Some(vec![0u8; bytes]);
        f
    }

    #[test]
    fn test_append_below_cap_grows_by_one() {
        let mut buf = FrameBuffer::new(5, ByteBudget::default());
        for i in 0..5 {
            let before = buf.len();
            buf.append(frame(i)).unwrap();
            assert_eq!(buf.len(), before + 1);
        }
        assert_eq!(buf.evicted(), 0);
    }

    #[test]
    fn test_append_at_cap_evicts_oldest() {
        let mut buf = FrameBuffer::new(3, ByteBudget::default());
        for i in 0..3 {
            buf.append(frame(i)).unwrap();
        }
        buf.append(frame(3)).unwrap();
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.evicted(), 1);
        let ids: Vec<u64> = buf.iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(buf.last().map(|f| f.frame_id), Some(3));
    }

    #[test]
    fn test_byte_budget_evicts_fifo() {
        let per_frame = frame_with_image(0, 1_000).byte_size();
        let budget = ByteBudget::new(per_frame * 2);
        let mut buf = FrameBuffer::new(50, budget.clone());
        buf.append(frame_with_image(0, 1_000)).unwrap();
        buf.append(frame_with_image(1, 1_000)).unwrap();
        buf.append(frame_with_image(2, 1_000)).unwrap();
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.iter().next().unwrap().frame_id, 1);
        assert_eq!(budget.used(), per_frame * 2);
    }

    #[test]
    fn test_budget_is_shared_between_buffers() {
        let per_frame = frame_with_image(0, 1_000).byte_size();
        let budget = ByteBudget::new(per_frame * 2);
        let mut a = FrameBuffer::new(50, budget.clone());
        let mut b = FrameBuffer::new(50, budget.clone());
        a.append(frame_with_image(0, 1_000)).unwrap();
        a.append(frame_with_image(1, 1_000)).unwrap();

        // `b` owns nothing it could evict, so the frame cannot fit.
        let err = b.append(frame_with_image(2, 1_000)).unwrap_err();
        assert_eq!(err.available, 0);

        drop(a);
        assert_eq!(budget.used(), 0);
        b.append(frame_with_image(2, 1_000)).unwrap();
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let limit = frame(0).byte_size() * 2;
        let mut buf = FrameBuffer::new(50, ByteBudget::new(limit));
        buf.append(frame(1)).unwrap();
        assert!(buf.append(frame_with_image(2, limit)).is_err());
        // The rejected frame never becomes the newest.
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.last().map(|f| f.frame_id), Some(1));
    }

    #[test]
    fn test_snapshot_preserves_order_and_releases_on_drop() {
        let budget = ByteBudget::new(1 << 20);
        let mut buf = FrameBuffer::new(10, budget.clone());
        for i in 0..4 {
            buf.append(frame_with_image(i, 100)).unwrap();
        }
        let held = budget.used();
        assert!(held > 0);

        let snap = buf.snapshot();
        assert_eq!(budget.used(), held);
        let ids: Vec<u64> = snap.frames().iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        let clone = snap.clone();
        drop(snap);
        assert_eq!(budget.used(), held);
        drop(clone);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_zero_cap_treated_as_one() {
        let mut buf = FrameBuffer::new(0, ByteBudget::default());
        buf.append(frame(0)).unwrap();
        buf.append(frame(1)).unwrap();
        assert_eq!(buf.len(), 1);
    }
}
