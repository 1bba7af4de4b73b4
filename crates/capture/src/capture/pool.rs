//! Frame pool and output queue
//!
//! The pool is a fixed array of preallocated frame buffers, each guarded by
//! an atomic lock bit. Claiming a slot yields a [`FrameLease`]; the lease is
//! the only way to reach the buffer, and dropping it clears the bit. The
//! assembler fills a lease, wraps it in a [`CapturedFrame`] and pushes it on
//! the [`OutputQueue`]; the consumer drops it when done.
//!
//! Lock bits are taken with `Acquire` and cleared with `Release`, so writes
//! made by one owner are visible to the next.

use common::{BoundedQueue, CaptureStats};
use protocol::{FieldGeometry, FrameState};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

/// Smallest usable pool: one slot being filled, one queued or consumed
pub const MIN_POOL_SIZE: usize = 2;

/// Completed frames on their way to the consumer; `None` is the stop sentinel
pub type OutputQueue = BoundedQueue<Option<CapturedFrame>>;

/// Queue sized so the producer always has a slot left
pub fn output_queue(pool_size: usize) -> OutputQueue {
    BoundedQueue::new(pool_size.max(MIN_POOL_SIZE) - 1)
}

struct FrameBuffer {
    data: Box<[u8]>,
    frame_id: u8,
    state: FrameState,
}

struct Slot {
    locked: AtomicBool,
    buffer: UnsafeCell<FrameBuffer>,
}

/// Fixed set of reusable frame buffers
pub struct FramePool {
    slots: Box<[Slot]>,
    next: AtomicUsize,
    stopping: AtomicBool,
    geometry: FieldGeometry,
    stats: Arc<CaptureStats>,
}

// SAFETY: a slot's buffer is only reached through the FrameLease that holds
// its lock bit, so at most one thread touches it at a time
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Allocate `size` slots (at least [`MIN_POOL_SIZE`]) for `geometry`
    pub fn new(size: usize, geometry: FieldGeometry, stats: Arc<CaptureStats>) -> Self {
        let slots = (0..size.max(MIN_POOL_SIZE))
            .map(|_| Slot {
                locked: AtomicBool::new(false),
                buffer: UnsafeCell::new(FrameBuffer {
                    data: vec![0u8; geometry.slot_bytes].into_boxed_slice(),
                    frame_id: 0,
                    state: FrameState::Start,
                }),
            })
            .collect();

        Self {
            slots,
            next: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            geometry,
            stats,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn geometry(&self) -> &FieldGeometry {
        &self.geometry
    }

    /// Claim the first free slot after the last one claimed, without waiting
    pub fn try_acquire(self: &Arc<Self>) -> Option<FrameLease> {
        let n = self.slots.len();
        let start = self.next.load(Ordering::Relaxed);
        for i in 0..n {
            let index = (start + i) % n;
            if self.slots[index]
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.next.store((index + 1) % n, Ordering::Relaxed);
                let mut lease = FrameLease {
                    pool: Arc::clone(self),
                    index,
                };
                lease.set_state(FrameState::Start);
                return Some(lease);
            }
        }
        None
    }

    /// Claim a slot, spinning until one is free
    ///
    /// Returns `None` once [`FramePool::begin_stop`] has been called, so a
    /// thread waiting here during teardown always gets out.
    pub fn acquire(self: &Arc<Self>) -> Option<FrameLease> {
        loop {
            if self.is_stopping() {
                return None;
            }
            if let Some(lease) = self.try_acquire() {
                return Some(lease);
            }
            self.stats.record_pool_spin();
            std::hint::spin_loop();
            thread::yield_now();
        }
    }

    /// Make every current and future [`FramePool::acquire`] return `None`
    pub fn begin_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Slots currently claimed
    pub fn locked_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.locked.load(Ordering::Acquire))
            .count()
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("size", &self.slots.len())
            .field("locked", &self.locked_count())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// Exclusive claim on one pool slot
///
/// Move-only; dropping it hands the slot back.
pub struct FrameLease {
    pool: Arc<FramePool>,
    index: usize,
}

impl FrameLease {
    fn buffer(&self) -> &FrameBuffer {
        // SAFETY: we hold the slot's lock bit
        unsafe { &*self.pool.slots[self.index].buffer.get() }
    }

    fn buffer_mut(&mut self) -> &mut FrameBuffer {
        // SAFETY: we hold the slot's lock bit, and &mut self rules out other borrows
        unsafe { &mut *self.pool.slots[self.index].buffer.get() }
    }

    /// Slot index in the pool
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn geometry(&self) -> &FieldGeometry {
        &self.pool.geometry
    }

    pub fn frame_id(&self) -> u8 {
        self.buffer().frame_id
    }

    pub fn set_frame_id(&mut self, frame_id: u8) {
        self.buffer_mut().frame_id = frame_id;
    }

    pub fn state(&self) -> FrameState {
        self.buffer().state
    }

    pub fn set_state(&mut self, state: FrameState) {
        self.buffer_mut().state = state;
    }

    /// The whole slot buffer
    pub fn data(&self) -> &[u8] {
        &self.buffer().data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer_mut().data
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.pool.slots[self.index]
            .locked
            .store(false, Ordering::Release);
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("index", &self.index)
            .field("frame_id", &self.frame_id())
            .field("state", &self.state())
            .finish()
    }
}

/// A finished frame handed to the consumer
///
/// Read-only. The slot goes back to the pool when this is dropped or
/// [`CapturedFrame::release`]d.
#[derive(Debug)]
pub struct CapturedFrame(FrameLease);

impl CapturedFrame {
    pub(crate) fn new(lease: FrameLease) -> Self {
        Self(lease)
    }

    pub(crate) fn into_lease(self) -> FrameLease {
        self.0
    }

    /// Pool slot the frame lives in
    pub fn slot(&self) -> usize {
        self.0.index()
    }

    pub fn frame_id(&self) -> u8 {
        self.0.frame_id()
    }

    pub fn state(&self) -> FrameState {
        self.0.state()
    }

    /// Every packet of the picture arrived
    pub fn is_complete(&self) -> bool {
        self.state() == FrameState::Complete
    }

    pub fn width(&self) -> u32 {
        self.0.geometry().width
    }

    /// Lines in the picture (half the norm's height unless interleaved)
    pub fn height(&self) -> u32 {
        self.0.geometry().picture_height
    }

    /// Picture bytes, YUYV
    pub fn data(&self) -> &[u8] {
        let len = self.0.geometry().picture_bytes;
        &self.0.data()[..len]
    }

    /// Bytes allocated for the slot
    pub fn capacity(&self) -> usize {
        self.0.data().len()
    }

    /// Hand the slot back to the pool
    pub fn release(self) {
        drop(self);
    }
}
