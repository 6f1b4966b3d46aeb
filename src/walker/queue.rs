//! Multi-stage traversal queues
//!
//! A `TravQueue` tracks files through three stages:
//!
//! - `buffer`: files pushed but not yet eligible for service. Buffering
//!   gives LIFO (depth-first) flushes a natural ordering and lets a whole
//!   directory's children be sorted before they become visible.
//! - `waiting`: files waiting to be serviced, either asynchronously by the
//!   I/O queue or synchronously by the engine.
//! - `ready`: files whose service is complete and that can be popped.
//!
//! While the I/O queue services a file it is detached from all stages and
//! tracked only by the `in_service` count. Ordered mode is the exception,
//! because pop order must equal push order exactly: there a file sits in
//! `waiting` and `ready` simultaneously at the position fixed at flush
//! time, and its `ioqueued` flag tells the engine to wait for the
//! completion rather than reorder around it.
//!
//! The balance counter tracks synchronous service (+1) against asynchronous
//! service (−1). A queue with the `BALANCE` flavor permits async service
//! only while the counter is non-negative, splitting work evenly between
//! the main thread and a single-threaded I/O queue.

use crate::walker::record::{Arena, FileId};
use bitflags::bitflags;
use std::collections::VecDeque;

bitflags! {
    /// Queue flavors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueFlags: u32 {
        /// Track the sync/async service balance
        const BALANCE = 1 << 0;
        /// Push to the buffer stage; flush() moves it to waiting
        const BUFFER = 1 << 1;
        /// Flush prepends instead of appending (stack order, for DFS)
        const LIFO = 1 << 2;
        /// Strict pop order equals push order across async completion
        const ORDER = 1 << 3;
    }
}

/// A three-stage queue of file records.
#[derive(Debug)]
pub struct TravQueue {
    flags: QueueFlags,
    buffer: Vec<FileId>,
    waiting: VecDeque<FileId>,
    ready: VecDeque<FileId>,
    /// Files in any stage or in service
    size: usize,
    /// Files currently detached for async service
    in_service: usize,
    /// Sync-service surplus; async service allowed while non-negative
    imbalance: i64,
}

impl TravQueue {
    pub fn new(flags: QueueFlags) -> Self {
        Self {
            flags,
            buffer: Vec::new(),
            waiting: VecDeque::new(),
            ready: VecDeque::new(),
            size: 0,
            in_service: 0,
            imbalance: 0,
        }
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    /// Total files tracked, including any in async service.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Files currently detached for async service.
    pub fn in_service(&self) -> usize {
        self.in_service
    }

    /// Whether the buffer stage has unflushed files.
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Add a file to the queue.
    pub fn push(&mut self, id: FileId) {
        if self.flags.contains(QueueFlags::BUFFER) {
            self.buffer.push(id);
        } else if self.flags.contains(QueueFlags::LIFO) {
            self.waiting.push_front(id);
            if self.flags.contains(QueueFlags::ORDER) {
                self.ready.push_front(id);
            }
        } else {
            self.waiting.push_back(id);
            if self.flags.contains(QueueFlags::ORDER) {
                self.ready.push_back(id);
            }
        }
        self.size += 1;
    }

    /// Move buffered files to the waiting stage.
    ///
    /// In ordered mode the same files enter `ready` at the same relative
    /// position, fixing their pop order before any async service begins.
    pub fn flush(&mut self) {
        if !self.flags.contains(QueueFlags::BUFFER) {
            return;
        }

        if self.flags.contains(QueueFlags::ORDER) {
            if self.flags.contains(QueueFlags::LIFO) {
                for &id in self.buffer.iter().rev() {
                    self.ready.push_front(id);
                }
            } else {
                self.ready.extend(self.buffer.iter().copied());
            }
        }

        if self.flags.contains(QueueFlags::LIFO) {
            for id in self.buffer.drain(..).rev() {
                self.waiting.push_front(id);
            }
        } else {
            self.waiting.extend(self.buffer.drain(..));
        }
    }

    /// Sort the buffer stage by name, for sorted traversals.
    pub fn sort_buffer(&mut self, arena: &Arena) {
        self.buffer.sort_by(|&a, &b| arena[a].name.cmp(&arena[b].name));
    }

    /// Whether async service is currently permitted.
    pub fn balanced(&self) -> bool {
        !self.flags.contains(QueueFlags::BALANCE) || self.imbalance >= 0
    }

    /// Record one unit of service: async shifts the balance down, sync up.
    pub fn rebalance(&mut self, async_service: bool) {
        if async_service {
            self.imbalance -= 1;
        } else {
            self.imbalance += 1;
        }
    }

    /// The next file needing service, without removing it.
    pub fn peek_waiting(&self) -> Option<FileId> {
        if !self.flags.contains(QueueFlags::BUFFER) {
            return self.waiting.front().copied();
        }

        if self.flags.contains(QueueFlags::ORDER) {
            // Files must reach the waiting/ready lists before detaching,
            // or their pop position would be lost
            return self.waiting.front().copied();
        }

        let (prefix, suffix) = if self.flags.contains(QueueFlags::LIFO) {
            (self.buffer.first().copied(), self.waiting.front().copied())
        } else {
            (self.waiting.front().copied(), self.buffer.first().copied())
        };
        prefix.or(suffix)
    }

    /// The next poppable file, without removing it.
    pub fn peek_ready(&self) -> Option<FileId> {
        self.ready.front().copied()
    }

    /// Remove a file for service. It must be the file `peek_waiting`
    /// returned. Async detach marks the record in-flight and counts one
    /// unit of async service.
    pub fn detach(&mut self, arena: &mut Arena, id: FileId, async_service: bool) {
        debug_assert!(!arena[id].ioqueued);

        if self.buffer.first() == Some(&id) {
            debug_assert!(!self.flags.contains(QueueFlags::ORDER));
            self.buffer.remove(0);
        } else if self.waiting.front() == Some(&id) {
            self.waiting.pop_front();
        } else {
            unreachable!("detached file was not buffered or waiting");
        }

        if async_service {
            arena[id].ioqueued = true;
            self.in_service += 1;
            self.rebalance(true);
        }
    }

    /// Return a serviced file to the queue on the ready stage.
    ///
    /// In ordered mode the file already occupies its ready position;
    /// clearing the in-flight flag is all that is needed.
    pub fn attach(&mut self, arena: &mut Arena, id: FileId, async_service: bool) {
        if async_service {
            debug_assert!(arena[id].ioqueued);
            arena[id].ioqueued = false;
            self.in_service -= 1;
        } else {
            debug_assert!(!arena[id].ioqueued);
        }

        if !self.flags.contains(QueueFlags::ORDER) {
            self.ready.push_back(id);
        }
    }

    /// Make a file ready immediately, bypassing async service.
    pub fn skip(&mut self, arena: &mut Arena, id: FileId) {
        self.detach(arena, id, false);
        self.attach(arena, id, false);
    }

    /// Pop the next file.
    ///
    /// Prefers the ready stage; a file popped from `waiting` instead must
    /// be serviced synchronously by the caller. In ordered mode the same
    /// file is popped from both stages.
    pub fn pop(&mut self) -> Option<FileId> {
        // The buffer must be flushed (and possibly sorted) first
        debug_assert!(self.buffer.is_empty());

        let mut file = self.ready.pop_front();

        let also_waiting = match file {
            None => true,
            Some(f) => self.waiting.front() == Some(&f),
        };
        if also_waiting {
            if let Some(w) = self.waiting.pop_front() {
                file = Some(w);
            }
        }

        if file.is_some() {
            self.size -= 1;
        }
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(n: usize) -> (Arena, Vec<FileId>) {
        let mut arena = Arena::new();
        let ids = (0..n)
            .map(|i| arena.alloc(None, format!("f{}", i).as_bytes()))
            .collect();
        (arena, ids)
    }

    #[test]
    fn test_fifo_order() {
        let (_arena, ids) = arena_with(3);
        let mut queue = TravQueue::new(QueueFlags::empty());

        for &id in &ids {
            queue.push(id);
        }
        for &id in &ids {
            assert_eq!(queue.pop(), Some(id));
        }
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_lifo_buffer_flush() {
        let (_arena, ids) = arena_with(3);
        let mut queue = TravQueue::new(QueueFlags::BUFFER | QueueFlags::LIFO);

        for &id in &ids {
            queue.push(id);
        }
        assert!(queue.has_buffered());
        queue.flush();

        // A flushed LIFO batch keeps its own order at the head
        assert_eq!(queue.pop(), Some(ids[0]));
        assert_eq!(queue.pop(), Some(ids[1]));
        assert_eq!(queue.pop(), Some(ids[2]));
    }

    #[test]
    fn test_lifo_nested_flushes_stack() {
        let (_arena, ids) = arena_with(4);
        let mut queue = TravQueue::new(QueueFlags::BUFFER | QueueFlags::LIFO);

        queue.push(ids[0]);
        queue.push(ids[1]);
        queue.flush();

        // A later batch lands in front of the earlier one
        queue.push(ids[2]);
        queue.push(ids[3]);
        queue.flush();

        assert_eq!(queue.pop(), Some(ids[2]));
        assert_eq!(queue.pop(), Some(ids[3]));
        assert_eq!(queue.pop(), Some(ids[0]));
        assert_eq!(queue.pop(), Some(ids[1]));
    }

    #[test]
    fn test_async_completion_order_not_preserved_unordered() {
        let (mut arena, ids) = arena_with(3);
        let mut queue = TravQueue::new(QueueFlags::empty());

        for &id in &ids {
            queue.push(id);
        }

        // Detach the first two for async service; the second finishes first
        queue.detach(&mut arena, ids[0], true);
        queue.detach(&mut arena, ids[1], true);
        queue.attach(&mut arena, ids[1], true);
        queue.attach(&mut arena, ids[0], true);

        assert_eq!(queue.pop(), Some(ids[1]));
        assert_eq!(queue.pop(), Some(ids[0]));
        assert_eq!(queue.pop(), Some(ids[2]));
    }

    #[test]
    fn test_ordered_pop_matches_push_despite_async() {
        let (mut arena, ids) = arena_with(3);
        let mut queue = TravQueue::new(QueueFlags::ORDER);

        for &id in &ids {
            queue.push(id);
        }

        // Async completion out of order must not reorder pops
        queue.detach(&mut arena, ids[0], true);
        queue.detach(&mut arena, ids[1], true);
        queue.attach(&mut arena, ids[1], true);
        queue.attach(&mut arena, ids[0], true);

        assert_eq!(queue.pop(), Some(ids[0]));
        assert_eq!(queue.pop(), Some(ids[1]));
        assert_eq!(queue.pop(), Some(ids[2]));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_ordered_pop_flags_inflight_file() {
        let (mut arena, ids) = arena_with(2);
        let mut queue = TravQueue::new(QueueFlags::ORDER);

        queue.push(ids[0]);
        queue.push(ids[1]);
        queue.detach(&mut arena, ids[0], true);

        // Still in flight: the popped record carries the ioqueued flag so
        // the engine knows to wait for its completion
        let popped = queue.pop().unwrap();
        assert_eq!(popped, ids[0]);
        assert!(arena[popped].ioqueued);
    }

    #[test]
    fn test_sorted_flush() {
        let mut arena = Arena::new();
        let z = arena.alloc(None, b"z");
        let m = arena.alloc(None, b"m");
        let a = arena.alloc(None, b"a");

        let mut queue = TravQueue::new(QueueFlags::BUFFER | QueueFlags::ORDER);
        queue.push(z);
        queue.push(m);
        queue.push(a);
        queue.sort_buffer(&arena);
        queue.flush();

        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), Some(m));
        assert_eq!(queue.pop(), Some(z));
    }

    #[test]
    fn test_balance_gate() {
        let (mut arena, ids) = arena_with(2);
        let mut queue = TravQueue::new(QueueFlags::BALANCE);

        assert!(queue.balanced());
        queue.push(ids[0]);
        queue.push(ids[1]);

        queue.detach(&mut arena, ids[0], true);
        assert!(!queue.balanced(), "async service should tip the balance");

        queue.rebalance(false);
        assert!(queue.balanced(), "sync service should restore it");
    }

    #[test]
    fn test_skip_makes_ready() {
        let (mut arena, ids) = arena_with(1);
        let mut queue = TravQueue::new(QueueFlags::empty());

        queue.push(ids[0]);
        queue.skip(&mut arena, ids[0]);
        assert_eq!(queue.peek_ready(), Some(ids[0]));
        assert_eq!(queue.pop(), Some(ids[0]));
    }
}
