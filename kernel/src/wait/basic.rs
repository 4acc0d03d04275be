//! FIFO wait queue.

extern crate alloc;

use alloc::collections::VecDeque;

use super::WaitQueue;
use crate::error::{ErrorCode, KernelResult};

/// How many waiters a `notify` releases, and from which end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    /// The longest-waiting item (FIFO).
    Next,
    /// The most recently enqueued item (LIFO).
    Last,
    /// Everyone, in FIFO order.
    All,
}

/// The plain condition-style wait queue.
#[derive(Debug, Default)]
pub struct BasicWaitQueue<T> {
    waiting: VecDeque<T>,
    ready: VecDeque<T>,
}

impl<T: Copy + PartialEq> BasicWaitQueue<T> {
    pub const fn new() -> Self {
        Self {
            waiting: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, item: T) {
        self.waiting.push_back(item);
    }

    pub fn notify(&mut self, mode: NotifyMode) {
        match mode {
            NotifyMode::Next => {
                if let Some(item) = self.waiting.pop_front() {
                    self.ready.push_back(item);
                }
            }
            NotifyMode::Last => {
                if let Some(item) = self.waiting.pop_back() {
                    self.ready.push_back(item);
                }
            }
            NotifyMode::All => {
                while let Some(item) = self.waiting.pop_front() {
                    self.ready.push_back(item);
                }
            }
        }
    }

    /// Earliest-ready item, or `Empty`.
    pub fn pop(&mut self) -> KernelResult<T> {
        self.ready.pop_front().ok_or(ErrorCode::Empty)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }
}

impl<T: Copy + PartialEq> WaitQueue<T> for BasicWaitQueue<T> {
    fn remove(&mut self, item: T) {
        self.waiting.retain(|x| *x != item);
        self.ready.retain(|x| *x != item);
    }

    fn is_empty(&self) -> bool {
        self.waiting.is_empty() && self.ready.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_next() {
        let mut q = BasicWaitQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        q.notify(NotifyMode::Next);
        q.notify(NotifyMode::Next);
        assert_eq!(q.pop(), Ok(1));
        assert_eq!(q.pop(), Ok(2));
        assert_eq!(q.pop(), Err(ErrorCode::Empty));
    }

    #[test]
    fn lifo_order_last() {
        let mut q = BasicWaitQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.notify(NotifyMode::Last);
        assert_eq!(q.pop(), Ok(2));
    }

    #[test]
    fn notify_all_preserves_fifo() {
        let mut q = BasicWaitQueue::new();
        for i in 0..4 {
            q.enqueue(i);
        }
        q.notify(NotifyMode::All);
        for i in 0..4 {
            assert_eq!(q.pop(), Ok(i));
        }
    }

    #[test]
    fn conservation_under_remove() {
        let mut q = BasicWaitQueue::new();
        for i in 0..6 {
            q.enqueue(i);
        }
        q.notify(NotifyMode::Next);
        q.notify(NotifyMode::Next);
        // 2 ready, 4 waiting. Remove one from each half.
        q.remove(0); // ready
        q.remove(4); // waiting
        q.notify(NotifyMode::All);
        let mut popped = 0;
        while q.pop().is_ok() {
            popped += 1;
        }
        // 6 entered = 4 popped + 2 removed.
        assert_eq!(popped, 4);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut q = BasicWaitQueue::new();
        q.enqueue(9);
        q.remove(9);
        q.remove(9);
        assert!(q.is_empty());
    }
}
