//! Wait queues.
//!
//! Every blocking primitive in the kernel parks threads on one of three
//! queue shapes: plain FIFO ([`BasicWaitQueue`]), event-bitset keyed
//! ([`VectorWaitQueue`]), or deadline keyed ([`TimedWaitQueue`]). All three
//! split their population into a *waiting* half and a *ready* half: `notify`
//! moves items from waiting to ready, `pop` drains ready in order. An item
//! is on at most one queue, in exactly one half.
//!
//! The one operation shared by every queue is forced removal: when a thread
//! is torn down while blocked, the owning queue must drop every reference
//! to it, ready or not. That is the [`WaitQueue`] trait.

mod basic;
mod timed;
mod vector;

pub use basic::{BasicWaitQueue, NotifyMode};
pub use timed::TimedWaitQueue;
pub use vector::{VectorNotifyMode, VectorWaitQueue};

/// Forced-removal hook shared by all queue shapes.
pub trait WaitQueue<T: Copy + PartialEq> {
    /// Remove all references to `item`, whether waiting or ready.
    /// Idempotent: removing an absent item is a no-op.
    fn remove(&mut self, item: T);

    /// True when neither half holds any item.
    fn is_empty(&self) -> bool;
}
