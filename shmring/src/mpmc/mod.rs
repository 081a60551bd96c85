pub mod shared_ring;

pub use shared_ring::AttachError;
pub use shared_ring::SharedRingQueue;
