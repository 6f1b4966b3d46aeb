//! Asynchronous I/O queue
//!
//! Offloads the blocking filesystem calls (`opendir`, `stat`, `close`,
//! `closedir`) to a pool of worker threads so the engine can overlap them
//! with callback execution. Requests flow through a bounded
//! crossbeam-channel; completions return on a second channel in whatever
//! order the workers finish them. Order restoration is the traversal
//! queue's job, not ours.
//!
//! Each request carries an opaque tag (the submitting record's handle) that
//! comes back with the completion. Close requests carry no tag.

use crate::dir::{close_fd, DirFlags, DirStream};
use crate::error::{Errno, IoqError};
use crate::stat::{fstatat, StatBuf, StatFlags};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Opaque request tag, returned with the completion.
pub type Tag = usize;

/// A request to the I/O queue.
#[derive(Debug)]
pub enum IoqOp {
    /// Open the directory `name` relative to `dfd`
    Opendir {
        dfd: RawFd,
        name: CString,
        flags: DirFlags,
        tag: Tag,
    },
    /// Stat `name` relative to `dfd`
    Stat {
        dfd: RawFd,
        name: CString,
        flags: StatFlags,
        tag: Tag,
    },
    /// Close a bare descriptor
    Close { fd: RawFd },
    /// Close a directory stream
    Closedir { dir: DirStream },
}

/// The payload of a finished request.
#[derive(Debug)]
pub enum IoqOutcome {
    Opendir(Result<DirStream, Errno>),
    /// Carries the submitted follow policy so the result lands in the
    /// right stat-cache slot
    Stat {
        flags: StatFlags,
        result: Result<StatBuf, Errno>,
    },
    Close(Result<(), Errno>),
    Closedir,
}

/// A finished request.
#[derive(Debug)]
pub struct Completion {
    /// The tag from the original request, if it carried one
    pub tag: Option<Tag>,
    /// What happened
    pub outcome: IoqOutcome,
}

/// An asynchronous I/O queue with a fixed depth and worker pool.
pub struct Ioq {
    submit: Option<Sender<IoqOp>>,
    complete: Receiver<Completion>,
    depth: usize,
    in_flight: usize,
    cancelled: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    nthreads: usize,
}

impl Ioq {
    /// Create a queue of the given depth serviced by `nthreads` workers.
    pub fn new(depth: usize, nthreads: usize) -> Result<Self, IoqError> {
        assert!(nthreads > 0, "an ioq needs at least one worker");

        let (submit_tx, submit_rx) = bounded::<IoqOp>(depth);
        let (complete_tx, complete_rx) = bounded::<Completion>(depth);
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(nthreads);
        for id in 0..nthreads {
            let rx = submit_rx.clone();
            let tx = complete_tx.clone();
            let cancelled = Arc::clone(&cancelled);

            let handle = thread::Builder::new()
                .name(format!("ioq-{}", id))
                .spawn(move || worker_loop(id, rx, tx, cancelled))
                .map_err(|_| IoqError::Disconnected)?;
            workers.push(handle);
        }

        Ok(Self {
            submit: Some(submit_tx),
            complete: complete_rx,
            depth,
            in_flight: 0,
            cancelled,
            workers,
            nthreads,
        })
    }

    /// Remaining request slots.
    pub fn capacity(&self) -> usize {
        self.depth - self.in_flight
    }

    /// Number of worker threads.
    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    /// Submit a request. The caller must have checked [`Ioq::capacity`].
    pub fn submit(&mut self, op: IoqOp) -> Result<(), IoqError> {
        debug_assert!(self.in_flight < self.depth);

        let sender = self.submit.as_ref().ok_or(IoqError::Disconnected)?;
        sender.send(op).map_err(|_| IoqError::Disconnected)?;
        self.in_flight += 1;
        Ok(())
    }

    /// Pop a completion, blocking only if `block` is set.
    ///
    /// Returns `None` when nothing is in flight, or nothing has finished
    /// yet and `block` is false.
    pub fn pop(&mut self, block: bool) -> Option<Completion> {
        if self.in_flight == 0 {
            return None;
        }

        let completion = if block {
            self.complete.recv().ok()
        } else {
            self.complete.try_recv().ok()
        };

        if completion.is_some() {
            self.in_flight -= 1;
        }
        completion
    }

    /// Cancel outstanding work.
    ///
    /// Pending opendir/stat requests complete with `ECANCELED`; close
    /// requests still run so no descriptor leaks. The caller must keep
    /// popping until [`Ioq::capacity`] is full again.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl Drop for Ioq {
    fn drop(&mut self) {
        self.cancel();

        // Closing the submit channel stops the workers after the backlog
        self.submit = None;
        while self.pop(true).is_some() {}

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    id: usize,
    rx: Receiver<IoqOp>,
    tx: Sender<Completion>,
    cancelled: Arc<AtomicBool>,
) {
    debug!(worker = id, "ioq worker started");

    while let Ok(op) = rx.recv() {
        let completion = service(op, &cancelled);
        // If the engine is gone, keep draining so close requests still run
        let _ = tx.send(completion);
    }

    debug!(worker = id, "ioq worker stopped");
}

fn service(op: IoqOp, cancelled: &AtomicBool) -> Completion {
    let cancelled = cancelled.load(Ordering::Acquire);

    match op {
        IoqOp::Opendir { dfd, name, flags, tag } => {
            let result = if cancelled {
                Err(Errno(libc::ECANCELED))
            } else {
                DirStream::open_at(dfd, &name, flags)
            };
            Completion { tag: Some(tag), outcome: IoqOutcome::Opendir(result) }
        }

        IoqOp::Stat { dfd, name, flags, tag } => {
            let result = if cancelled {
                Err(Errno(libc::ECANCELED))
            } else {
                service_stat(dfd, &name, flags)
            };
            Completion { tag: Some(tag), outcome: IoqOutcome::Stat { flags, result } }
        }

        // Close requests run even after cancellation: descriptors must not leak
        IoqOp::Close { fd } => Completion {
            tag: None,
            outcome: IoqOutcome::Close(close_fd(fd)),
        },

        IoqOp::Closedir { dir } => {
            drop(dir);
            Completion { tag: None, outcome: IoqOutcome::Closedir }
        }
    }
}

fn service_stat(dfd: RawFd, name: &std::ffi::CStr, flags: StatFlags) -> Result<StatBuf, Errno> {
    match flags {
        StatFlags::Follow => fstatat(dfd, name, true),
        StatFlags::NoFollow => fstatat(dfd, name, false),
        StatFlags::TryFollow => match fstatat(dfd, name, true) {
            Err(errno) if errno.is_not_found() => fstatat(dfd, name, false),
            other => other,
        },
    }
}
