//! Single-slot, latest-frame-wins mailbox between the capture callback and
//! the consumer.
//!
//! The slot holds an `Arc<Frame>` that is only ever replaced or taken as a
//! whole, so a reader sees either nothing or a complete frame. Publishing
//! over an unread frame discards it; there is no backlog.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::capture::Frame;

pub struct FrameBuffer {
    /// Latest unread frame; `None` once consumed
    slot: ArcSwapOption<Frame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_published: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Counters since the buffer was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub published: usize,
    pub read: usize,
    /// Frames overwritten or cleared before anyone read them
    pub dropped: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the latest frame. Never blocks.
    pub fn publish(&self, frame: Frame) {
        let previous = self.slot.swap(Some(Arc::new(frame)));
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        if previous.is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("camtap_frames_dropped_total").increment(1);
        }
    }

    /// Consumer: take the latest frame if one arrived since the last read.
    pub fn try_read(&self) -> Option<Frame> {
        let frame = self.slot.swap(None)?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        // The producer never keeps a reference after publishing, so this
        // unwraps without copying except while a concurrent `peek` holds it.
        Some(Arc::try_unwrap(frame).unwrap_or_else(|shared| (*shared).clone()))
    }

    /// Look at the latest unread frame without consuming it.
    pub fn peek(&self) -> Option<Arc<Frame>> {
        self.slot.load_full()
    }

    pub fn has_unread(&self) -> bool {
        self.slot.load().is_some()
    }

    /// Discard any unread frame.
    pub fn clear(&self) {
        if self.slot.swap(None).is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            published: self.stats.frames_published.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use bytes::Bytes;

    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};

    fn frame(sequence: u64, len: usize) -> Frame {
        Frame {
            data: Bytes::from(vec![sequence as u8; len]),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: 4,
                height: 2,
                format: PixelFormat::Yuyv,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn empty_buffer_reads_none() {
        let buffer = FrameBuffer::new();
        assert!(buffer.try_read().is_none());
        assert!(!buffer.has_unread());
    }

    #[test]
    fn latest_publish_wins() {
        let buffer = FrameBuffer::new();
        for seq in 1..=5 {
            buffer.publish(frame(seq, 16));
        }
        assert_eq!(buffer.try_read().map(|f| f.sequence()), Some(5));
        assert_eq!(
            buffer.stats(),
            BufferStats {
                published: 5,
                read: 1,
                dropped: 4
            }
        );
    }

    #[test]
    fn frames_are_consumed_once() {
        let buffer = FrameBuffer::new();
        buffer.publish(frame(1, 16));
        assert!(buffer.try_read().is_some());
        assert!(buffer.try_read().is_none());
        assert!(buffer.try_read().is_none());

        buffer.publish(frame(2, 16));
        assert_eq!(buffer.try_read().map(|f| f.sequence()), Some(2));
    }

    #[test]
    fn peek_does_not_consume() {
        let buffer = FrameBuffer::new();
        buffer.publish(frame(7, 16));
        assert_eq!(buffer.peek().map(|f| f.sequence()), Some(7));
        assert_eq!(buffer.try_read().map(|f| f.sequence()), Some(7));
        assert!(buffer.peek().is_none());
    }

    #[test]
    fn clear_discards_unread_frame() {
        let buffer = FrameBuffer::new();
        buffer.publish(frame(1, 16));
        buffer.clear();
        assert!(buffer.try_read().is_none());
        assert_eq!(buffer.stats().dropped, 1);
    }

    #[test]
    fn concurrent_reader_sees_whole_frames_in_order() {
        const FRAMES: u64 = 20_000;
        let buffer = Arc::new(FrameBuffer::new());

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for seq in 1..=FRAMES {
                    buffer.publish(frame(seq, 256));
                }
            })
        };

        let mut last = 0;
        let mut seen = 0;
        while last < FRAMES {
            if let Some(f) = buffer.try_read() {
                assert!(f.sequence() > last, "frames went backwards");
                assert_eq!(f.len(), 256);
                assert!(f.data.iter().all(|&b| b == f.sequence() as u8), "torn frame");
                last = f.sequence();
                seen += 1;
            }
            if producer.is_finished() && !buffer.has_unread() {
                break;
            }
        }
        producer.join().unwrap();

        let stats = buffer.stats();
        assert_eq!(stats.published, FRAMES as usize);
        assert_eq!(stats.read, seen);
        assert_eq!(stats.read + stats.dropped, FRAMES as usize);
    }
}
