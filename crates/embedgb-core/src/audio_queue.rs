use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Lock-free ring of stereo `i16` frames between the emulation thread and a
/// host audio thread.
///
/// Indices grow monotonically and are masked into a power-of-two slot array.
/// Each frame is packed into one `AtomicU32`, so a reader never observes a torn
/// frame. When the ring is full new frames are dropped and counted.
struct Ring {
    slots: Box<[AtomicU32]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicU64,
}

impl Ring {
    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

/// Writing end, owned by the session.
pub struct AudioProducer {
    ring: Arc<Ring>,
}

/// Reading end. Clones share the same read position.
#[derive(Clone)]
pub struct AudioConsumer {
    ring: Arc<Ring>,
}

/// Create a ring holding at least `capacity_frames` stereo frames.
pub fn audio_queue(capacity_frames: usize) -> (AudioProducer, AudioConsumer) {
    let cap = capacity_frames.max(2).next_power_of_two();
    let slots: Box<[AtomicU32]> = (0..cap).map(|_| AtomicU32::new(0)).collect();
    let ring = Arc::new(Ring {
        slots,
        mask: cap - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        AudioProducer {
            ring: Arc::clone(&ring),
        },
        AudioConsumer { ring },
    )
}

#[inline]
fn pack(left: i16, right: i16) -> u32 {
    (left as u16 as u32) | ((right as u16 as u32) << 16)
}

#[inline]
fn unpack(frame: u32) -> (i16, i16) {
    (frame as u16 as i16, (frame >> 16) as u16 as i16)
}

impl AudioProducer {
    /// Append one frame. Returns `false` (and counts a drop) when full.
    #[inline]
    pub fn push_stereo(&mut self, left: i16, right: i16) -> bool {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) > ring.mask {
            ring.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        ring.slots[head & ring.mask].store(pack(left, right), Ordering::Relaxed);
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Frames dropped because the reader fell behind.
    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity_frames(&self) -> usize {
        self.ring.mask + 1
    }
}

impl AudioConsumer {
    #[inline]
    pub fn pop_stereo(&self) -> Option<(i16, i16)> {
        let ring = &*self.ring;
        let mut tail = ring.tail.load(Ordering::Acquire);
        loop {
            let head = ring.head.load(Ordering::Acquire);
            if tail == head {
                return None;
            }
            let frame = ring.slots[tail & ring.mask].load(Ordering::Relaxed);
            match ring.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(unpack(frame)),
                Err(current) => tail = current,
            }
        }
    }

    /// Fill `out` with interleaved L/R samples; returns how many were written
    /// (always even). Stops early when the ring runs dry.
    pub fn pop_interleaved(&self, out: &mut [i16]) -> usize {
        let mut written = 0;
        for pair in out.chunks_exact_mut(2) {
            let Some((l, r)) = self.pop_stereo() else {
                break;
            };
            pair[0] = l;
            pair[1] = r;
            written += 2;
        }
        written
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity_frames(&self) -> usize {
        self.ring.mask + 1
    }
}
