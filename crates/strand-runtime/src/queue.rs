//! Deadline wait-heap
//!
//! Binary min-heap over task pointers ordered by wake deadline. Every task
//! stores its own heap index (`queuepos`), so a readiness event can remove
//! a mid-heap entry in O(log n) without searching; whichever of the timeout
//! and the fd event fires first wins, the loser is simply no longer queued.

use crate::task::{Task, QUEUE_REMOVED};
use std::ptr::NonNull;

pub struct WaitQueue {
    heap: Vec<NonNull<Task>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(8),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[inline]
    fn deadline(&self, node: usize) -> u64 {
        unsafe { self.heap[node].as_ref().deadline }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        unsafe {
            self.heap[a].as_mut().queuepos = a;
            self.heap[b].as_mut().queuepos = b;
        }
    }

    fn sift_up(&mut self, mut node: usize) {
        while node > 0 {
            let parent = (node - 1) / 2;
            if self.deadline(parent) <= self.deadline(node) {
                return;
            }
            self.swap(parent, node);
            node = parent;
        }
    }

    fn sift_down(&mut self, mut node: usize) {
        let size = self.heap.len();
        loop {
            let left = 2 * node + 1;
            let right = 2 * node + 2;
            if left >= size {
                return;
            }
            let mut selected = left;
            if right < size && self.deadline(right) < self.deadline(left) {
                selected = right;
            }
            if self.deadline(selected) >= self.deadline(node) {
                return;
            }
            self.swap(selected, node);
            node = selected;
        }
    }

    /// Insert a task keyed by its current deadline. A task already queued
    /// is re-queued at its new deadline.
    pub fn add(&mut self, mut task: NonNull<Task>) {
        let pos = unsafe { task.as_ref().queuepos };
        if pos != QUEUE_REMOVED {
            self.remove(pos);
        }
        let node = self.heap.len();
        self.heap.push(task);
        unsafe { task.as_mut().queuepos = node };
        self.sift_up(node);
    }

    /// The earliest deadline in the heap.
    pub fn peek_deadline(&self) -> Option<u64> {
        if self.heap.is_empty() {
            None
        } else {
            Some(self.deadline(0))
        }
    }

    /// Remove the entry at heap index `node`.
    pub fn remove(&mut self, node: usize) -> Option<NonNull<Task>> {
        if node >= self.heap.len() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(node, last);
        let mut task = self.heap.pop().expect("heap is non-empty");
        unsafe { task.as_mut().queuepos = QUEUE_REMOVED };

        if node < self.heap.len() {
            if node != 0 && self.deadline(node) < self.deadline((node - 1) / 2) {
                self.sift_up(node);
            } else {
                self.sift_down(node);
            }
        }
        Some(task)
    }

    /// Pop the earliest-deadline task.
    pub fn pop(&mut self) -> Option<NonNull<Task>> {
        self.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn timer_task(deadline: u64) -> Box<Task> {
        let mut t = Task::main();
        t.deadline = deadline;
        Box::new(t)
    }

    fn ptr(t: &mut Box<Task>) -> NonNull<Task> {
        NonNull::from(&mut **t)
    }

    #[test]
    fn test_pop_yields_nondecreasing_deadlines() {
        let mut tasks: Vec<Box<Task>> = [35u64, 3, 99, 1, 42, 7, 7, 58, 12]
            .iter()
            .map(|&d| timer_task(d))
            .collect();
        let mut q = WaitQueue::new();
        for t in tasks.iter_mut() {
            q.add(ptr(t));
        }

        let mut last = 0;
        while let Some(t) = q.pop() {
            let d = unsafe { t.as_ref().deadline };
            assert!(d >= last);
            assert_eq!(unsafe { t.as_ref().queuepos }, QUEUE_REMOVED);
            last = d;
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_arbitrary_removal_keeps_order() {
        let mut tasks: Vec<Box<Task>> =
            (0..32).map(|i| timer_task((i * 31 + 17) % 100)).collect();
        let mut q = WaitQueue::new();
        for t in tasks.iter_mut() {
            q.add(ptr(t));
        }

        // Remove a handful of mid-heap entries through their queuepos.
        for t in tasks.iter().step_by(5) {
            let pos = t.queuepos;
            if pos != QUEUE_REMOVED {
                q.remove(pos);
            }
        }

        let mut last = 0;
        while let Some(t) = q.pop() {
            let d = unsafe { t.as_ref().deadline };
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn test_readd_moves_entry() {
        let mut a = timer_task(10);
        let mut b = timer_task(20);
        let mut q = WaitQueue::new();
        q.add(ptr(&mut a));
        q.add(ptr(&mut b));

        // Re-queue `a` behind `b`.
        a.deadline = 30;
        q.add(ptr(&mut a));
        assert_eq!(q.len(), 2);

        let first = q.pop().expect("two entries queued");
        assert_eq!(unsafe { first.as_ref().deadline }, 20);
    }

    #[test]
    fn test_peek_deadline() {
        let mut q = WaitQueue::new();
        assert_eq!(q.peek_deadline(), None);
        let mut t = timer_task(77);
        q.add(ptr(&mut t));
        assert_eq!(q.peek_deadline(), Some(77));
        assert_eq!(q.len(), 1);
    }
}
