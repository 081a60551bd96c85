// Vyukov-style bounded MPMC ring with per-slot sequence tags, laid out in a
// caller-supplied memory region so distinct processes can map and share it.
// Enqueue-on-full may evict the oldest item unless that item is marked
// important; important items only ever leave through pop().
use crate::MpmcQueue;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const CACHE_LINE_SIZE: usize = 64;

// Bootstrap states, stored in the region itself. A fresh region is all
// zeroes, so every first attacher starts from UNINITIALIZED.
const UNINITIALIZED: u32 = 0;
const INITIALIZING: u32 = 1;
const READY: u32 = 2;

// Error types surfaced by attach(). Push/pop signal full/empty through
// their Result directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    // Region cannot hold the control block plus a single slot.
    InsufficientRegion,
    // Region was initialized earlier with a different capacity.
    CapacityMismatch { requested: usize, actual: usize },
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::InsufficientRegion => {
                write!(f, "region too small for control block and one slot")
            }
            AttachError::CapacityMismatch { requested, actual } => write!(
                f,
                "region already initialized with capacity {} (requested {})",
                actual, requested
            ),
        }
    }
}

impl std::error::Error for AttachError {}

// Control block at offset 0 of the region. Field order and widths are the
// cross-process ABI; all attachers must agree on pointer width.
#[repr(C)]
struct ControlBlock {
    init_state: AtomicU32,
    head: AtomicUsize,
    tail: AtomicUsize,
    // Written once by the bootstrap winner before init_state becomes READY,
    // read-only afterwards.
    capacity: usize,
}

// One ring cell. The sequence tag encodes the slot state:
//   sequence == pos       -> writable at position pos
//   sequence == pos + 1   -> readable at position pos
// Cache-line aligned so neighbouring slots never share a line.
#[repr(C, align(64))]
struct Slot<T> {
    sequence: AtomicUsize,
    data: UnsafeCell<MaybeUninit<T>>,
    important: AtomicBool,
}

// Handle bound to a shared region. The handle is a view: it owns nothing,
// frees nothing, and stays valid for as long as the caller keeps the region
// mapped. Clones bind the same region.
pub struct SharedRingQueue<T: Send + Copy + 'static> {
    control: *mut ControlBlock,
    slots: *mut Slot<T>,
    capacity: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Copy + 'static> Send for SharedRingQueue<T> {}
unsafe impl<T: Send + Copy + 'static> Sync for SharedRingQueue<T> {}

impl<T: Send + Copy + 'static> Clone for SharedRingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            control: self.control,
            slots: self.slots,
            capacity: self.capacity,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Copy + 'static> SharedRingQueue<T> {
    // Control block size padded out so the slot array starts cache-line
    // aligned (64 is a multiple of every fundamental alignment).
    const fn aligned_control_size() -> usize {
        (mem::size_of::<ControlBlock>() + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
    }

    /// Bytes a region needs to hold a ring of `capacity` slots.
    pub const fn required_size(capacity: usize) -> usize {
        Self::aligned_control_size() + capacity * mem::size_of::<Slot<T>>()
    }

    // Largest capacity a region of `size` bytes can hold.
    fn derived_capacity(size: usize) -> usize {
        match size.checked_sub(Self::aligned_control_size()) {
            Some(space) => space / mem::size_of::<Slot<T>>(),
            None => 0,
        }
    }

    /// Binds a handle to `region`, initializing the ring on first attach.
    /// The capacity is derived from `size`; attachers that arrive after
    /// initialization bind to the stored capacity instead.
    ///
    /// # Safety
    /// `region` must point to at least `size` bytes, mapped at the same
    /// relative layout in every participating process, aligned to 64 bytes,
    /// zero-filled when freshly created, and must outlive the handle and all
    /// of its clones.
    pub unsafe fn attach(region: *mut u8, size: usize) -> Result<Self, AttachError> {
        let capacity = Self::derived_capacity(size);
        if capacity == 0 {
            return Err(AttachError::InsufficientRegion);
        }
        Self::attach_inner(region, size, capacity, false)
    }

    /// Like [`attach`](Self::attach), but with an explicit capacity. Fails
    /// with `CapacityMismatch` when the region was already initialized with
    /// a different one.
    ///
    /// # Safety
    /// Same contract as [`attach`](Self::attach).
    pub unsafe fn attach_with_capacity(
        region: *mut u8,
        size: usize,
        capacity: usize,
    ) -> Result<Self, AttachError> {
        if capacity == 0 || size < Self::required_size(capacity) {
            return Err(AttachError::InsufficientRegion);
        }
        Self::attach_inner(region, size, capacity, true)
    }

    unsafe fn attach_inner(
        region: *mut u8,
        size: usize,
        requested: usize,
        explicit: bool,
    ) -> Result<Self, AttachError> {
        let control = region as *mut ControlBlock;
        let slots = region.add(Self::aligned_control_size()) as *mut Slot<T>;

        let won = (*control)
            .init_state
            .compare_exchange(UNINITIALIZED, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        let capacity = if won {
            // We claimed the fresh region: lay out the control block and tag
            // every slot as writable at its own index.
            ptr::addr_of_mut!((*control).capacity).write(requested);
            (*control).head.store(0, Ordering::Relaxed);
            (*control).tail.store(0, Ordering::Relaxed);
            for i in 0..requested {
                let slot = &*slots.add(i);
                slot.sequence.store(i, Ordering::Relaxed);
                slot.important.store(false, Ordering::Relaxed);
            }
            (*control).init_state.store(READY, Ordering::Release);
            requested
        } else {
            // Another attacher is (or was) initializing. capacity is only
            // valid once the winner's release store is visible, hence the
            // tri-state flag rather than a plain "initialized" bit.
            while (*control).init_state.load(Ordering::Acquire) != READY {
                thread::sleep(Duration::from_millis(1));
            }
            let actual = ptr::addr_of!((*control).capacity).read();
            if explicit && actual != requested {
                return Err(AttachError::CapacityMismatch {
                    requested,
                    actual,
                });
            }
            if size < Self::required_size(actual) {
                return Err(AttachError::InsufficientRegion);
            }
            actual
        };

        Ok(Self {
            control,
            slots,
            capacity,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn control(&self) -> &ControlBlock {
        unsafe { &*self.control }
    }

    #[inline]
    fn slot(&self, pos: usize) -> &Slot<T> {
        unsafe { &*self.slots.add(pos % self.capacity) }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes an item, failing when the ring is full. The rejected item is
    /// handed back to the caller.
    pub fn push(&self, item: T, important: bool) -> Result<(), T> {
        self.push_inner(item, important, false)
    }

    /// Pushes an item, evicting the oldest non-important item when the ring
    /// is full. Fails only when the oldest item is important (it may leave
    /// the ring only through [`pop`](Self::pop)).
    pub fn push_overwrite(&self, item: T, important: bool) -> Result<(), T> {
        self.push_inner(item, important, true)
    }

    fn push_inner(&self, item: T, important: bool, overwrite: bool) -> Result<(), T> {
        let control = self.control();
        let mut pos = control.tail.load(Ordering::Relaxed);

        loop {
            let slot = self.slot(pos);
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                // Slot is writable at this position; the tail CAS is the
                // linearization point of the push.
                match control.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.data.get()).write(item) };
                        slot.important.store(important, Ordering::Relaxed);
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Ring is full at this position.
                if !overwrite {
                    return Err(item);
                }
                // A full slot still carries sequence == pos + 1, so the
                // producer cannot claim it directly: eviction has to release
                // the head slot through the consumer protocol first.
                let head = control.head.load(Ordering::Relaxed);
                let victim = self.slot(head);
                let victim_seq = victim.sequence.load(Ordering::Acquire);
                if victim_seq as isize - (head as isize + 1) == 0 {
                    if victim.important.load(Ordering::Acquire) {
                        // Oldest item must not be dropped.
                        return Err(item);
                    }
                    if control
                        .head
                        .compare_exchange_weak(
                            head,
                            head + 1,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        // Discard the payload (T: Copy, nothing to drop) and
                        // hand the slot to the producers of the next lap.
                        victim.important.store(false, Ordering::Relaxed);
                        victim
                            .sequence
                            .store(head + self.capacity, Ordering::Release);
                    }
                }
                std::hint::spin_loop();
                pos = control.tail.load(Ordering::Relaxed);
            } else {
                // Another producer already claimed this position.
                pos = control.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pops the oldest item together with its importance mark.
    pub fn pop(&self) -> Result<(T, bool), ()> {
        let control = self.control();
        let mut pos = control.head.load(Ordering::Relaxed);

        loop {
            let slot = self.slot(pos);
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos as isize + 1);

            if diff == 0 {
                // Slot is readable; the head CAS is the linearization point.
                match control.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.data.get()).assume_init_read() };
                        let important = slot.important.load(Ordering::Relaxed);
                        slot.important.store(false, Ordering::Relaxed);
                        slot.sequence
                            .store(pos + self.capacity, Ordering::Release);
                        return Ok((value, important));
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Ring is empty.
                return Err(());
            } else {
                // Another consumer already claimed this position.
                pos = control.head.load(Ordering::Relaxed);
            }
        }
    }

    /// True when head == tail. Approximate under concurrency.
    pub fn is_empty(&self) -> bool {
        let control = self.control();
        let head = control.head.load(Ordering::Acquire);
        let tail = control.tail.load(Ordering::Acquire);
        head == tail
    }

    /// True when the ring appears full. Approximate under concurrency.
    pub fn is_full(&self) -> bool {
        self.size_approx() >= self.capacity
    }

    /// Number of items currently in flight. A monitoring hint only: it can
    /// momentarily exceed the capacity or lag behind concurrent operations.
    pub fn size_approx(&self) -> usize {
        let control = self.control();
        let head = control.head.load(Ordering::Acquire);
        let tail = control.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

impl<T: Send + Copy + 'static> MpmcQueue<T> for SharedRingQueue<T> {
    type PushError = T;
    type PopError = ();

    fn push(&self, item: T, important: bool) -> Result<(), T> {
        SharedRingQueue::push(self, item, important)
    }

    fn pop(&self) -> Result<(T, bool), ()> {
        SharedRingQueue::pop(self)
    }

    fn is_empty(&self) -> bool {
        SharedRingQueue::is_empty(self)
    }

    fn is_full(&self) -> bool {
        SharedRingQueue::is_full(self)
    }
}
