//! Mostly-atomic growable MPMC queue.
//!
//! A chain of fixed-capacity lock-free rings: producers write into the
//! newest ring through a 128-bit (generation, value) pair compare-exchange,
//! consumers drain the oldest. When a ring fills, a double-capacity
//! successor is linked behind a priority-inheriting lock; drained rings are
//! retired and recycled once a process-wide epoch registry proves no thread
//! can still touch them. Only the structural slow path ever blocks.
//!
//! ```
//! use maq::Queue;
//!
//! let queue = Queue::new(4, 64);
//! queue.enqueue(7);
//! queue.enqueue(11);
//! assert_eq!(queue.dequeue(), Some(7));
//! assert_eq!(queue.dequeue(), Some(11));
//! assert_eq!(queue.dequeue(), None);
//! ```

mod epoch;
mod lock;
mod queue;
mod subqueue;

pub use queue::{Queue, QueueStats};
