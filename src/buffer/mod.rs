// # Buffer Pool
//
// A bounded, preallocated set of page frames with a sharded page table,
// clock eviction, and scoped pins. One pool serves one page size. The pool
// enforces the write-ahead constraint: a dirty frame reaches its volume
// only after the journal is durable past the frame's last modification.

pub mod frame;
pub mod pool;

pub use frame::{Frame, FrameId, PageMut, PageRef};
pub use pool::{BufferPool, BufferPoolStats};
