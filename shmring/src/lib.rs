pub mod mpmc;

pub use mpmc::AttachError;
pub use mpmc::SharedRingQueue;

// Common interface for MPMC queues that live in a shared memory region.
pub trait MpmcQueue<T: Send>: Send + Sync + 'static {
    // Error on push when the queue rejects the item.
    // Carrying the item lets the producer retry or drop it.
    type PushError;
    // Error on pop when the queue is empty.
    type PopError;

    // Attempts to push an item into the queue.
    // `important` marks the item as undroppable for overwriting producers.
    fn push(&self, item: T, important: bool) -> Result<(), Self::PushError>;

    // Attempts to pop an item from the queue.
    // Returns the item together with its importance mark.
    fn pop(&self) -> Result<(T, bool), Self::PopError>;

    /// True when no item is visible. Approximate under concurrency.
    fn is_empty(&self) -> bool;

    /// True when the ring appears to hold `capacity` items. Approximate.
    fn is_full(&self) -> bool;
}
