//! The traversal engine
//!
//! One engine drives every search strategy. The main loop alternates
//! between two queues: directories are popped, opened, and read, with each
//! child either visited immediately or buffered onto the file queue;
//! buffered files are popped and visited once their async stat completes.
//! Garbage collection runs when a directory is exhausted or a current file
//! has been visited, firing post-order visits as refcounts reach zero and
//! propagating the decrement up the parent chain.
//!
//! The engine never blocks on the I/O queue while it has synchronous work
//! of its own, and with a single I/O thread it splits service evenly
//! between itself and the worker using the queues' balance counters.

use crate::dir::{dup_cloexec, DirEntry, DirFlags, DirStream, FileType};
use crate::error::{ConfigError, Errno, Result, WalkError};
use crate::ioq::{Ioq, IoqOp, IoqOutcome};
use crate::stat::{StatCache, StatFlags};
use crate::walk::{Action, Entry, MountTable, Strategy, Visit, WalkFlags, WalkOptions};
use crate::walker::cache::FdCache;
use crate::walker::queue::{QueueFlags, TravQueue};
use crate::walker::record::{Arena, FileId};
use bitflags::bitflags;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use tracing::debug;

/// The visitor callback as the engine sees it.
pub(crate) type WalkCallback<'cb> = dyn for<'e> FnMut(&mut Entry<'e>) -> Action + 'cb;

bitflags! {
    /// Which visits fire while garbage collecting a record chain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct GcFlags: u32 {
        /// Report a directory read error through the visitor
        const ERROR = 1 << 0;
        /// Fire the post-order visit for the record itself
        const FILE = 1 << 1;
        /// Fire post-order visits for freed ancestors
        const PARENTS = 1 << 2;
        const ALL = Self::ERROR.bits() | Self::FILE.bits() | Self::PARENTS.bits();
    }
}

/// Queue selector, so helpers can operate on either queue by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qid {
    Files,
    Dirs,
}

/// What the last callback invocation learned about its entry.
#[derive(Debug, Clone, Copy)]
struct Saved {
    ftype: FileType,
    ident: Option<(u64, u64)>,
}

/// Scalar fields of an [`Entry`], computed before the descriptor borrows
/// the path buffer.
struct EntryParts {
    name_off: usize,
    depth: usize,
    ftype: FileType,
    error: Option<Errno>,
    at_fd: RawFd,
    at_off: usize,
    stat_flags: StatFlags,
    stats: StatCache,
    root: Option<FileId>,
    mount_parent_dev: Option<u64>,
}

/// The state of one traversal.
pub(crate) struct WalkState<'cb> {
    callback: &'cb mut WalkCallback<'cb>,
    flags: WalkFlags,
    strategy: Strategy,
    mtab: Option<MountTable>,
    dir_flags: DirFlags,

    /// Accumulated errno; the walk's final result
    error: i32,

    arena: Arena,
    cache: FdCache,
    ioq: Option<Ioq>,
    nthreads: usize,

    /// Unpinned directories whose streams should be unwrapped
    to_close: Vec<FileId>,
    fileq: TravQueue,
    dirq: TravQueue,

    /// The path being built for the current visit
    path: Vec<u8>,
    /// The current record
    file: Option<FileId>,
    /// The record the path buffer was last built for
    previous: Option<FileId>,

    /// Whether the current record's stream is open and pinned for reading
    reading: bool,
    /// The dirent most recently read from the current directory
    de: Option<DirEntry>,
    /// Error from opening or reading the current directory
    direrror: i32,

    saved: Saved,
}

impl<'cb> WalkState<'cb> {
    pub(crate) fn new(callback: &'cb mut WalkCallback<'cb>, options: &WalkOptions) -> Result<Self> {
        if options.max_open < 2 {
            return Err(ConfigError::OpenFdLimit { given: options.max_open, min: 2 }.into());
        }

        let mut flags = options.flags;
        let strategy = options.strategy;
        let nthreads = options.threads;
        let qdepth = 4096;

        let ioq = if nthreads > 0 {
            Some(Ioq::new(qdepth, nthreads)?)
        } else {
            None
        };

        if must_buffer(flags, strategy, nthreads) {
            flags |= WalkFlags::BUFFER;
        }

        let mut dir_flags = DirFlags::empty();
        if flags.contains(WalkFlags::WHITEOUTS) {
            dir_flags |= DirFlags::WHITEOUTS;
        }

        let mut qflags = QueueFlags::empty();
        if strategy != Strategy::Bfs {
            qflags |= QueueFlags::BUFFER | QueueFlags::LIFO;
        }
        if flags.contains(WalkFlags::BUFFER) {
            qflags |= QueueFlags::BUFFER;
        }
        if flags.contains(WalkFlags::SORT) {
            qflags |= QueueFlags::ORDER;
        } else if nthreads == 1 {
            qflags |= QueueFlags::BALANCE;
        }
        let fileq = TravQueue::new(qflags);

        // In breadth-first mode, or whenever files are already buffered,
        // directories can queue in plain FIFO order
        let mut dqflags = qflags;
        if strategy == Strategy::Bfs || flags.contains(WalkFlags::BUFFER) {
            dqflags.remove(QueueFlags::BUFFER | QueueFlags::LIFO);
        }
        let dirq = TravQueue::new(dqflags);

        Ok(Self {
            callback,
            flags,
            strategy,
            mtab: options.mtab.clone(),
            dir_flags,
            error: 0,
            arena: Arena::new(),
            cache: FdCache::new(options.max_open),
            ioq,
            nthreads,
            to_close: Vec::new(),
            fileq,
            dirq,
            path: Vec::new(),
            file: None,
            previous: None,
            reading: false,
            de: None,
            direrror: 0,
            saved: Saved { ftype: FileType::Unknown, ident: None },
        })
    }

    /// Turn on post-order visits mid-flight, for the final pass of
    /// exponential deepening.
    pub(crate) fn set_post_order(&mut self) {
        self.flags |= WalkFlags::POST_ORDER;
    }

    /// Run one full traversal of `paths`.
    ///
    /// Returns false if the walk was stopped early (by the callback or a
    /// fatal error). The state is reusable afterwards, which is how the
    /// deepening strategies run many iterations over one warm fd cache.
    pub(crate) fn run(&mut self, paths: &[Vec<u8>]) -> bool {
        for path in paths {
            if self.visit(Some(path)).is_err() {
                return false;
            }
        }
        self.flush();

        loop {
            while self.pop_dir() {
                self.opendir_current();
                while self.readdir_current() {
                    let name = self.de.as_ref().map(|d| d.name.as_bytes().to_vec());
                    if self.visit(name.as_deref()).is_err() {
                        return false;
                    }
                }
                if self.closedir_current().is_err() {
                    return false;
                }
            }

            if !self.pop_file() {
                break;
            }
            if self.visit(None).is_err() {
                return false;
            }
            self.flush();
        }

        true
    }

    /// Tear down the traversal, draining every outstanding async request,
    /// and report the accumulated error.
    pub(crate) fn finish(mut self) -> Result<()> {
        if let Some(ioq) = self.ioq.as_mut() {
            ioq.cancel();
        }
        while self.ioq_pop(true) {}

        // Remaining teardown closes synchronously
        let ioq = self.ioq.take();

        let _ = self.gc(GcFlags::empty());
        self.drain(Qid::Dirs);
        self.drain(Qid::Files);

        drop(ioq);

        if self.error != 0 {
            Err(WalkError::Traversal(Errno(self.error)))
        } else {
            Ok(())
        }
    }

    fn queue(&self, qid: Qid) -> &TravQueue {
        match qid {
            Qid::Files => &self.fileq,
            Qid::Dirs => &self.dirq,
        }
    }

    fn queue_mut(&mut self, qid: Qid) -> &mut TravQueue {
        match qid {
            Qid::Files => &mut self.fileq,
            Qid::Dirs => &mut self.dirq,
        }
    }

    /// Process one I/O queue completion. Returns false when there is no
    /// queue or nothing completed.
    fn ioq_pop(&mut self, block: bool) -> bool {
        let Some(ioq) = self.ioq.as_mut() else { return false };
        let Some(completion) = ioq.pop(block) else { return false };

        let file = completion.tag.map(FileId::from_index);
        if let Some(f) = file {
            self.unpin_parent(f, true);
        }

        match completion.outcome {
            IoqOutcome::Close(_) | IoqOutcome::Closedir => {
                self.cache.grant();
            }

            IoqOutcome::Opendir(result) => {
                self.cache.grant();
                let f = file.expect("opendir completion without a tag");
                if let Ok(dir) = result {
                    self.set_dir(f, dir);
                }
                // On failure the record reattaches without a stream and
                // the error surfaces when the synchronous open retries
                self.dirq.attach(&mut self.arena, f, true);
            }

            IoqOutcome::Stat { flags, result } => {
                let f = file.expect("stat completion without a tag");
                self.arena[f].stats.store(flags, result);
                self.fileq.attach(&mut self.arena, f, true);
            }
        }

        true
    }

    /// Make sure the I/O queue can take one more request.
    fn ioq_reserve(&mut self) -> std::result::Result<(), ()> {
        let Some(ioq) = self.ioq.as_ref() else { return Err(()) };
        if ioq.capacity() > 0 {
            return Ok(());
        }

        // With several workers it's faster to wait for one than to do the
        // work on the main thread
        let block = self.nthreads > 1;
        if self.ioq_pop(block) {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Make sure at least one descriptor slot is free.
    fn cache_reserve(&mut self) -> std::result::Result<(), Errno> {
        if self.cache.capacity() > 0 {
            return Ok(());
        }

        // Async closes may be in flight; harvesting them is cheaper than
        // evicting a descriptor we may want again
        while self.ioq_pop(true) {
            if self.cache.capacity() > 0 {
                return Ok(());
            }
        }

        if !self.cache.pop_lru(&mut self.arena) {
            return Err(Errno(libc::EMFILE));
        }
        Ok(())
    }

    /// Open a record's descriptor relative to `base`.
    fn file_openat(
        &mut self,
        file: FileId,
        base: Option<FileId>,
        at_path: &[u8],
    ) -> std::result::Result<RawFd, Errno> {
        debug_assert!(self.arena[file].fd.is_none());

        let at_fd = match base {
            Some(b) => {
                self.cache.pin(&mut self.arena, b);
                self.arena[b].fd.expect("pinned base without fd")
            }
            None => libc::AT_FDCWD,
        };

        let result = self.openat_with_retry(at_fd, at_path);

        if let Some(b) = base {
            self.cache.unpin(&mut self.arena, b);
        }

        let fd = result?;
        self.arena[file].fd = Some(fd);
        self.cache.add(&mut self.arena, file)?;
        Ok(fd)
    }

    fn openat_with_retry(&mut self, at_fd: RawFd, at_path: &[u8]) -> std::result::Result<RawFd, Errno> {
        self.cache_reserve()?;

        let name = CString::new(at_path).map_err(|_| Errno(libc::EINVAL))?;
        match crate::dir::open_dir_at(at_fd, &name) {
            Ok(fd) => Ok(fd),
            Err(errno) if errno.0 == libc::EMFILE => {
                // The process fd table is fuller than our accounting
                // believed; evict and retry once
                let retried = if self.cache.pop_lru(&mut self.arena) {
                    crate::dir::open_dir_at(at_fd, &name)
                } else {
                    Err(errno)
                };
                self.cache.reset_after_emfile();
                retried
            }
            Err(errno) => Err(errno),
        }
    }

    /// Open a record's descriptor, recovering from `ENAMETOOLONG` by
    /// walking the ancestor chain one component at a time.
    fn file_open(&mut self, file: FileId, path: &[u8]) -> std::result::Result<RawFd, Errno> {
        // Find the nearest ancestor with an open descriptor
        let mut base = self.arena[file].parent;
        while let Some(b) = base {
            if self.arena[b].fd.is_some() {
                break;
            }
            base = self.arena[b].parent;
        }

        let at_path: Vec<u8> = match base {
            Some(b) => path[self.arena[b].child_name_off()..].to_vec(),
            None => path.to_vec(),
        };

        let mut last_err = match self.file_openat(file, base, &at_path) {
            Ok(fd) => return Ok(fd),
            Err(errno) if !errno.is_name_too_long() => return Err(errno),
            Err(errno) => errno,
        };

        // Open each intermediary relative to its parent's descriptor
        let mut chain = Vec::new();
        let mut cur = Some(file);
        while cur != base {
            let c = cur.expect("base is an ancestor of file");
            chain.push(c);
            cur = self.arena[c].parent;
        }
        chain.reverse();

        for cur in chain {
            let parent = self.arena[cur].parent;
            let openable = match parent {
                None => true,
                Some(p) => self.arena[p].fd.is_some(),
            };
            if openable {
                let name = self.arena[cur].name.clone();
                if let Err(errno) = self.file_openat(cur, parent, &name) {
                    last_err = errno;
                }
            }
        }

        self.arena[file].fd.ok_or(last_err)
    }

    /// Associate an open stream with a record, registering the descriptor
    /// in the cache if the record didn't already own it.
    fn set_dir(&mut self, file: FileId, dir: DirStream) {
        debug_assert!(self.arena[file].dir.is_none());

        if self.arena[file].fd.is_none() {
            self.arena[file].fd = Some(dir.fd());
            self.arena[file].dir = Some(dir);
            // On failure the cache already closed the stream; the record
            // simply retries synchronously later
            let _ = self.cache.add(&mut self.arena, file);
        } else {
            debug_assert_eq!(self.arena[file].fd, Some(dir.fd()));
            self.arena[file].dir = Some(dir);
        }
    }

    /// Close a descriptor, asynchronously if possible.
    fn ioq_close_fd(&mut self, fd: RawFd) {
        if self.ioq_reserve().is_ok() {
            let ioq = self.ioq.as_mut().expect("reserved ioq");
            if ioq.submit(IoqOp::Close { fd }).is_ok() {
                return;
            }
            // The channel dropped the request; nothing closed it
        }
        let _ = crate::dir::close_fd(fd);
        self.cache.grant();
    }

    /// Close a stream, asynchronously if possible.
    fn ioq_closedir(&mut self, dir: DirStream) {
        if self.ioq_reserve().is_ok() {
            let ioq = self.ioq.as_mut().expect("reserved ioq");
            if ioq.submit(IoqOp::Closedir { dir }).is_ok() {
                return;
            }
            // Submission failure dropped (and therefore closed) the stream
        } else {
            drop(dir);
        }
        self.cache.grant();
    }

    /// Release a record's descriptor, offloading the close.
    fn close_file(&mut self, file: FileId) {
        debug_assert!(self.arena[file].fd.is_some());
        debug_assert_eq!(self.arena[file].pincount, 0);

        self.cache.detach(&mut self.arena, file);
        let dir = self.arena[file].dir.take();
        let fd = self.arena[file].fd.take().expect("closing a closed file");

        match dir {
            Some(dir) => self.ioq_closedir(dir),
            None => self.ioq_close_fd(fd),
        }
    }

    /// Free a finished directory stream while children may still need the
    /// descriptor: keep a plain dup'd fd and close the stream itself.
    fn unwrapdir(&mut self, file: FileId) {
        if self.arena[file].dir.is_none() {
            return;
        }

        let reffed = self.arena[file].refcount > 1;
        if self.arena[file].pincount > 0 {
            return;
        }
        if !reffed {
            self.close_file(file);
            return;
        }

        // Make room for the dup
        self.cache.pin(&mut self.arena, file);
        let reserved = self.cache_reserve();
        self.cache.unpin(&mut self.arena, file);
        if reserved.is_err() {
            return;
        }

        let old_fd = self.arena[file].fd.expect("stream without fd");
        let Ok(new_fd) = dup_cloexec(old_fd) else { return };
        self.cache.charge();

        let dir = self.arena[file].dir.take().expect("checked above");
        self.arena[file].fd = Some(new_fd);
        self.ioq_closedir(dir);
    }

    /// Queue a directory for unwrapping once it is safe.
    fn delayed_unwrap(&mut self, file: FileId) {
        debug_assert!(self.arena[file].dir.is_some());
        if !self.to_close.contains(&file) {
            self.to_close.push(file);
        }
    }

    /// Pin a record's parent for use as an openat/fstatat base.
    ///
    /// Returns the descriptor to use, `AT_FDCWD` for parentless records,
    /// or `None` when the parent's descriptor has been evicted.
    fn pin_parent(&mut self, file: FileId) -> Option<RawFd> {
        let Some(parent) = self.arena[file].parent else {
            return Some(libc::AT_FDCWD);
        };
        let fd = self.arena[parent].fd?;
        self.cache.pin(&mut self.arena, parent);
        Some(fd)
    }

    /// Undo [`WalkState::pin_parent`]; optionally schedule the parent's
    /// stream for unwrapping once fully unpinned.
    fn unpin_parent(&mut self, file: FileId, unwrap: bool) {
        let Some(parent) = self.arena[file].parent else { return };

        self.cache.unpin(&mut self.arena, parent);

        if unwrap && self.arena[parent].dir.is_some() && self.arena[parent].pincount == 0 {
            self.delayed_unwrap(parent);
        }
    }

    /// Submit an async opendir for a record.
    fn ioq_opendir(&mut self, file: FileId) -> bool {
        if self.ioq_reserve().is_err() {
            return false;
        }
        let Some(dfd) = self.pin_parent(file) else { return false };

        if self.cache_reserve().is_err() {
            self.unpin_parent(file, false);
            return false;
        }

        let Ok(name) = CString::new(self.arena[file].name.clone()) else {
            self.unpin_parent(file, false);
            return false;
        };

        let op = IoqOp::Opendir { dfd, name, flags: self.dir_flags, tag: file.index() };
        let ioq = self.ioq.as_mut().expect("reserved ioq");
        match ioq.submit(op) {
            Ok(()) => {
                self.cache.charge();
                true
            }
            Err(_) => {
                self.unpin_parent(file, false);
                false
            }
        }
    }

    /// Submit async opendirs while the directory queue stays balanced.
    fn ioq_opendirs(&mut self) {
        while self.dirq.balanced() {
            let Some(dir) = self.dirq.peek_waiting() else { break };
            if self.ioq_opendir(dir) {
                self.dirq.detach(&mut self.arena, dir, true);
            } else {
                break;
            }
        }
    }

    /// Queue a directory record for reading.
    fn push_dir(&mut self, file: FileId) {
        debug_assert_eq!(self.arena[file].ftype, FileType::Directory);
        self.dirq.push(file);
        self.ioq_opendirs();
    }

    /// Submit an async stat for a record.
    fn ioq_stat(&mut self, file: FileId) -> bool {
        if self.ioq_reserve().is_err() {
            return false;
        }
        let Some(dfd) = self.pin_parent(file) else { return false };

        let Ok(name) = CString::new(self.arena[file].name.clone()) else {
            self.unpin_parent(file, false);
            return false;
        };

        let flags = self.stat_flags_for(self.arena[file].depth);
        let op = IoqOp::Stat { dfd, name, flags, tag: file.index() };
        let ioq = self.ioq.as_mut().expect("reserved ioq");
        match ioq.submit(op) {
            Ok(()) => true,
            Err(_) => {
                self.unpin_parent(file, false);
                false
            }
        }
    }

    /// Whether a record's stat should be offloaded.
    fn should_ioq_stat(&self, file: FileId) -> bool {
        let record = &self.arena[file];

        // Roots are processed strictly in input order
        if record.depth == 0 {
            return false;
        }

        // Whiteout emulation is synchronous-only
        if record.ftype == FileType::Whiteout {
            return false;
        }

        self.must_stat(record.depth, record.ftype, OsStr::from_bytes(&record.name))
    }

    /// Offload stats for waiting files while the balance allows.
    fn stat_files(&mut self) {
        loop {
            let Some(file) = self.fileq.peek_waiting() else { break };

            if !self.should_ioq_stat(file) {
                self.fileq.skip(&mut self.arena, file);
                continue;
            }

            if !self.fileq.balanced() {
                break;
            }

            if self.ioq_stat(file) {
                self.fileq.detach(&mut self.arena, file, true);
            } else {
                break;
            }
        }
    }

    /// Queue a file record for a later visit.
    fn push_file(&mut self, file: FileId) {
        self.fileq.push(file);
        self.stat_files();
    }

    /// Pop from a queue, servicing or waiting out async requests.
    fn pop_from(&mut self, qid: Qid) -> bool {
        if self.queue(qid).size() == 0 {
            return false;
        }

        loop {
            let q = self.queue(qid);
            if q.peek_ready().is_some() || q.in_service() == 0 {
                break;
            }

            // With a single I/O thread, prefer servicing a waiting file
            // ourselves over blocking on the worker
            let block = !(self.queue(qid).peek_waiting().is_some() && self.nthreads == 1);
            if !self.ioq_pop(block) {
                break;
            }
        }

        let Some(file) = self.queue_mut(qid).pop() else { return false };

        // In ordered mode the popped record may still be in flight
        while self.arena[file].ioqueued {
            if !self.ioq_pop(true) {
                self.arena[file].ioqueued = false;
                break;
            }
        }

        self.file = Some(file);
        true
    }

    /// Pop the next directory to read, unless visiting ready files first
    /// would preserve a stricter order.
    fn pop_dir(&mut self) -> bool {
        debug_assert!(self.file.is_none());

        if self.flags.contains(WalkFlags::SORT) {
            // Keep strict breadth-first order when sorting
            if self.strategy == Strategy::Bfs && self.fileq.peek_ready().is_some() {
                return false;
            }
        } else if self.dirq.peek_ready().is_none() && self.fileq.peek_ready().is_some() {
            // Don't block on directories while files are ready to visit
            return false;
        }

        self.pop_from(Qid::Dirs)
    }

    /// Pop the next file to visit.
    fn pop_file(&mut self) -> bool {
        debug_assert!(self.file.is_none());
        self.pop_from(Qid::Files)
    }

    /// The follow policy in effect at a given depth.
    fn stat_flags_for(&self, depth: usize) -> StatFlags {
        let mut mask = WalkFlags::FOLLOW_ALL;
        if depth == 0 {
            mask |= WalkFlags::FOLLOW_ROOTS;
        }

        if self.flags.intersects(mask) {
            StatFlags::TryFollow
        } else {
            StatFlags::NoFollow
        }
    }

    /// Whether an entry needs stat info before its visit.
    fn must_stat(&self, depth: usize, ftype: FileType, name: &OsStr) -> bool {
        if self.flags.contains(WalkFlags::STAT) {
            return true;
        }

        match ftype {
            FileType::Unknown => true,
            FileType::Directory => self.flags.intersects(
                WalkFlags::DETECT_CYCLES | WalkFlags::SKIP_MOUNTS | WalkFlags::PRUNE_MOUNTS,
            ),
            FileType::Symlink if self.stat_flags_for(depth).follows() => true,
            _ => self
                .mtab
                .as_ref()
                .is_some_and(|mtab| mtab.might_be_mount(name)),
        }
    }

    /// Rebuild the path buffer for the current record, overwriting only
    /// the suffix that differs from the previously built path.
    fn build_path(&mut self, name: Option<&[u8]>) {
        let file = self.file;
        let pathlen = file
            .map(|f| self.arena[f].name_off + self.arena[f].name.len())
            .unwrap_or(0);
        self.path.resize(pathlen, 0);

        if let Some(f) = file {
            // Find the deepest ancestor shared with the previous path
            let mut ancestor = self.previous;
            while let Some(a) = ancestor {
                if self.arena[a].depth > self.arena[f].depth {
                    ancestor = self.arena[a].parent;
                } else {
                    break;
                }
            }

            // Copy the differing components back-to-front
            let mut cur = Some(f);
            while cur.is_some() && cur != ancestor {
                let c = cur.expect("checked above");
                let off = self.arena[c].name_off;
                if off > 0 {
                    self.path[off - 1] = b'/';
                }
                let len = self.arena[c].name.len();
                let (arena, path) = (&self.arena, &mut self.path);
                path[off..off + len].copy_from_slice(&arena[c].name);

                if let Some(a) = ancestor {
                    if self.arena[a].depth == self.arena[c].depth {
                        ancestor = self.arena[a].parent;
                    }
                }
                cur = self.arena[c].parent;
            }
        }

        self.previous = self.file;

        if let Some(name) = name {
            if pathlen > 0 && self.path[pathlen - 1] != b'/' {
                self.path.push(b'/');
            }
            self.path.extend_from_slice(name);
        }
    }

    /// Make sure a record's descriptor is open, reopening from its path
    /// prefix if it was evicted.
    fn ensure_open(&mut self, file: FileId, upto: usize) -> std::result::Result<RawFd, Errno> {
        if let Some(fd) = self.arena[file].fd {
            return Ok(fd);
        }
        let prefix = self.path[..upto].to_vec();
        self.file_open(file, &prefix)
    }

    /// Compute the scalar fields of the visit descriptor, faulting in any
    /// required stat info and running cycle detection.
    fn prepare_entry(&mut self) -> EntryParts {
        let file = self.file;

        let mut parts = EntryParts {
            name_off: 0,
            depth: 0,
            ftype: FileType::Unknown,
            error: (self.direrror != 0).then(|| Errno(self.direrror)),
            at_fd: libc::AT_FDCWD,
            at_off: 0,
            stat_flags: StatFlags::NoFollow,
            stats: StatCache::default(),
            root: file.map(|f| self.arena[f].root),
            mount_parent_dev: None,
        };

        let de_ftype = self.de.as_ref().map(|de| de.ftype);
        let parent = if let Some(ftype) = de_ftype {
            let f = file.expect("dirent without a directory");
            parts.depth = self.arena[f].depth + 1;
            parts.ftype = ftype;
            parts.name_off = self.arena[f].child_name_off();
            Some(f)
        } else if let Some(f) = file {
            parts.depth = self.arena[f].depth;
            parts.ftype = self.arena[f].ftype;
            parts.name_off = self.arena[f].name_off;
            parts.stats.fill_from(&self.arena[f].stats);
            self.arena[f].parent
        } else {
            None
        };

        if let Some(p) = parent {
            // Keep the immediate parent open so at_path stays one
            // component long, avoiding ENAMETOOLONG in the callback
            let plen = self.arena[p].name_off + self.arena[p].name.len();
            match self.ensure_open(p, plen) {
                Ok(fd) => {
                    parts.at_fd = fd;
                    parts.at_off = parts.name_off;
                }
                Err(errno) => parts.error = Some(errno),
            }
        }

        if parts.depth == 0 {
            parts.name_off = base_offset(&self.path);
        }
        parts.stat_flags = self.stat_flags_for(parts.depth);

        let mount_parent = if self.de.is_some() {
            file
        } else {
            file.and_then(|f| self.arena[f].parent)
        };
        parts.mount_parent_dev = mount_parent
            .and_then(|p| self.arena[p].ident)
            .map(|(dev, _)| dev);

        if parts.error.is_some() {
            parts.ftype = FileType::Error;
            return parts;
        }

        let name = OsStr::from_bytes(&self.path[parts.name_off..]);
        if self.must_stat(parts.depth, parts.ftype, name) {
            let whiteout = parts.ftype == FileType::Whiteout;
            let at_path = match CString::new(&self.path[parts.at_off..]) {
                Ok(p) => p,
                Err(_) => {
                    parts.ftype = FileType::Error;
                    parts.error = Some(Errno(libc::EINVAL));
                    return parts;
                }
            };

            match parts.stats.fetch(parts.at_fd, &at_path, parts.stat_flags, whiteout) {
                Ok(buf) => {
                    let ftype = buf.file_type();
                    // A synthesized whiteout buffer has no type bits
                    parts.ftype = if ftype == FileType::Unknown && whiteout {
                        FileType::Whiteout
                    } else {
                        ftype
                    };
                }
                Err(errno) => {
                    parts.ftype = FileType::Error;
                    parts.error = Some(errno);
                    return parts;
                }
            }
        }

        if parts.ftype == FileType::Directory && self.flags.contains(WalkFlags::DETECT_CYCLES) {
            if let Some(buf) = parts.stats.cached(parts.stat_flags) {
                let key = (buf.dev(), buf.ino());
                let mut ancestor = parent;
                while let Some(a) = ancestor {
                    if self.arena[a].ident == Some(key) {
                        parts.ftype = FileType::Error;
                        parts.error = Some(Errno(libc::ELOOP));
                        return parts;
                    }
                    ancestor = self.arena[a].parent;
                }
            }
        }

        parts
    }

    /// Build the descriptor and invoke the visitor.
    fn call_back(&mut self, name: Option<&[u8]>, visit: Visit) -> Action {
        if visit == Visit::Post && !self.flags.contains(WalkFlags::POST_ORDER) {
            return Action::Prune;
        }

        self.build_path(name);
        let parts = self.prepare_entry();
        let mount_parent_dev = parts.mount_parent_dev;

        let root_bytes: &[u8] = match parts.root {
            Some(r) => &self.arena[r].name,
            None => &self.path,
        };
        let mut entry = Entry {
            path: &self.path,
            name_off: parts.name_off,
            root: root_bytes,
            depth: parts.depth,
            visit,
            ftype: parts.ftype,
            error: parts.error,
            at_fd: parts.at_fd,
            at_off: parts.at_off,
            stat_flags: parts.stat_flags,
            stats: parts.stats,
        };

        // The visitor never sees an error entry unless recovery is on
        if entry.ftype == FileType::Error && !self.flags.contains(WalkFlags::RECOVER) {
            self.error = entry.error.map(|e| e.0).unwrap_or(libc::EIO);
            return Action::Stop;
        }

        let mut ret;
        if self.flags.contains(WalkFlags::SKIP_MOUNTS) && is_mount(&mut entry, mount_parent_dev) {
            ret = Action::Prune;
        } else {
            ret = (self.callback)(&mut entry);
            if ret == Action::Continue {
                if visit != Visit::Pre || entry.ftype != FileType::Directory {
                    ret = Action::Prune;
                } else if self.flags.contains(WalkFlags::PRUNE_MOUNTS)
                    && is_mount(&mut entry, mount_parent_dev)
                {
                    ret = Action::Prune;
                }
            }
        }

        // A stat performed on this thread counts as synchronous service
        if self.fileq.flags().contains(QueueFlags::BALANCE)
            && entry.stats.take_sync_calls() > 0
        {
            self.fileq.rebalance(false);
        }

        self.saved = Saved {
            ftype: entry.ftype,
            ident: entry
                .cached_stat(entry.stat_flags)
                .map(|buf| (buf.dev(), buf.ino())),
        };

        ret
    }

    /// Visit and/or enqueue one entry.
    ///
    /// `name` is a dirent or root path; `None` means the current record,
    /// whose visit was deferred when it was buffered.
    fn visit(&mut self, name: Option<&[u8]>) -> std::result::Result<(), ()> {
        if self.should_buffer(name) {
            let file = self.arena.alloc(self.file, name.expect("buffering needs a name"));
            if let Some(de) = &self.de {
                self.arena[file].ftype = de.ftype;
            }
            self.push_file(file);
            return Ok(());
        }

        match self.call_back(name, Visit::Pre) {
            Action::Continue => {
                let file = match name {
                    Some(n) => self.arena.alloc(self.file, n),
                    None => self.file.take().expect("continuing without a record"),
                };
                self.arena[file].ftype = self.saved.ftype;
                if self.saved.ident.is_some() {
                    self.arena[file].ident = self.saved.ident;
                }
                self.arena[file].stats.clear();
                self.push_dir(file);
                Ok(())
            }

            Action::Prune => {
                if self.file.is_some() && name.is_none() {
                    // The record was visited; its post-order fires now
                    self.gc(GcFlags::FILE | GcFlags::PARENTS)
                } else {
                    Ok(())
                }
            }

            Action::Stop => {
                if self.file.is_some() && name.is_none() {
                    let _ = self.gc(GcFlags::empty());
                }
                Err(())
            }
        }
    }

    /// Whether to defer this entry's visit by buffering it as a record.
    fn should_buffer(&self, name: Option<&[u8]>) -> bool {
        // A current record is already buffered
        let Some(name) = name else { return false };

        if self.flags.contains(WalkFlags::BUFFER) {
            return true;
        }

        // Buffer only when the stat it needs can actually run async
        if self.ioq.is_none() {
            return false;
        }
        if !self.fileq.balanced() {
            return false;
        }

        let depth = self.file.map(|f| self.arena[f].depth + 1).unwrap_or(1);
        let ftype = self.de.as_ref().map(|d| d.ftype).unwrap_or(FileType::Unknown);
        self.must_stat(depth, ftype, OsStr::from_bytes(name))
    }

    /// Open the current record's directory, synchronously if the async
    /// open didn't get to it.
    fn opendir_current(&mut self) {
        debug_assert!(!self.reading);
        debug_assert!(self.de.is_none());

        self.direrror = 0;
        let file = self.file.expect("no current directory");

        if self.arena[file].dir.is_none() {
            self.build_path(None);
            self.dirq.rebalance(false);

            let path = self.path.clone();
            match self.file_open(file, &path) {
                Ok(fd) => match DirStream::from_fd(fd, self.dir_flags) {
                    Ok(dir) => self.set_dir(file, dir),
                    Err(errno) => {
                        // The record keeps its fd; only the stream failed
                        debug!(errno = errno.0, "fdopendir failed");
                        self.direrror = errno.0;
                        return;
                    }
                },
                Err(errno) => {
                    self.direrror = errno.0;
                    return;
                }
            }
        }

        self.cache.pin(&mut self.arena, file);
        self.reading = true;
    }

    /// Read the next entry of the current directory into `self.de`.
    fn readdir_current(&mut self) -> bool {
        if !self.reading {
            return false;
        }

        let file = self.file.expect("reading without a current directory");
        let result = self.arena[file]
            .dir
            .as_mut()
            .expect("reading without a stream")
            .read();

        match result {
            Ok(Some(entry)) => {
                self.de = Some(entry);
                true
            }
            Ok(None) => {
                self.de = None;
                false
            }
            Err(errno) => {
                self.de = None;
                self.direrror = errno.0;
                false
            }
        }
    }

    /// Garbage collect the current record and its newly unreferenced
    /// ancestors, firing the visits `flags` allows.
    fn gc(&mut self, flags: GcFlags) -> std::result::Result<(), ()> {
        let mut flags = flags;
        let mut ret = Ok(());

        if let Some(file) = self.file {
            if self.reading {
                self.cache.unpin(&mut self.arena, file);
                self.reading = false;
            }
            if self.arena[file].dir.is_some() {
                self.delayed_unwrap(file);
            }
        }
        self.de = None;

        if self.direrror != 0 {
            if flags.contains(GcFlags::ERROR) {
                if self.call_back(None, Visit::Pre) == Action::Stop {
                    ret = Err(());
                    flags = GcFlags::empty();
                }
            } else {
                self.error = self.direrror;
            }
        }
        self.direrror = 0;

        while !self.to_close.is_empty() {
            let file = self.to_close.remove(0);
            self.unwrapdir(file);
        }

        let mut visit = GcFlags::FILE;
        while let Some(file) = self.file {
            self.arena[file].refcount -= 1;
            if self.arena[file].refcount > 0 {
                self.file = None;
                break;
            }

            if flags.contains(visit) {
                if self.call_back(None, Visit::Post) == Action::Stop {
                    ret = Err(());
                    flags = GcFlags::empty();
                }
            }
            visit = GcFlags::PARENTS;

            let parent = self.arena[file].parent;
            if self.previous == Some(file) {
                self.previous = parent;
            }
            self.file = parent;

            if self.arena[file].fd.is_some() {
                self.close_file(file);
            }
            self.arena.free(file);
        }

        ret
    }

    /// Flush both queue buffers and kick off any eligible async work.
    fn flush(&mut self) {
        if self.flags.contains(WalkFlags::SORT) {
            self.fileq.sort_buffer(&self.arena);
        }
        self.fileq.flush();
        self.stat_files();

        self.dirq.flush();
        self.ioq_opendirs();
    }

    /// Finish the current directory: GC with all visits enabled, then
    /// release the batch of children into the queues.
    fn closedir_current(&mut self) -> std::result::Result<(), ()> {
        self.gc(GcFlags::ALL)?;
        self.flush();
        Ok(())
    }

    /// Pop and discard everything left on a queue.
    fn drain(&mut self, qid: Qid) {
        self.queue_mut(qid).flush();
        while self.pop_from(qid) {
            let _ = self.gc(GcFlags::empty());
        }
    }
}

/// Whether this configuration requires reading whole directories before
/// visiting any of their children.
fn must_buffer(flags: WalkFlags, strategy: Strategy, nthreads: usize) -> bool {
    if flags.contains(WalkFlags::SORT) {
        // Can't sort what we haven't collected
        return true;
    }

    if strategy == Strategy::Dfs && nthreads == 0 {
        // Without buffering, a synchronous DFS would visit a directory's
        // first child's subtree before its later siblings' parents
        return true;
    }

    if flags.contains(WalkFlags::STAT) && nthreads > 1 {
        // Every file is stat'd anyway; let the ioq have them all
        return true;
    }

    false
}

/// Whether the entry's device differs from its parent's.
fn is_mount(entry: &mut Entry, parent_dev: Option<u64>) -> bool {
    let Some(parent_dev) = parent_dev else { return false };
    let flags = entry.stat_flags();
    match entry.stat(flags) {
        Ok(buf) => buf.dev() != parent_dev,
        Err(_) => false,
    }
}

/// The offset of the final path component, for root paths like "foo/bar".
fn base_offset(path: &[u8]) -> usize {
    let mut end = path.len();
    while end > 1 && path[end - 1] == b'/' {
        end -= 1;
    }
    match path[..end].iter().rposition(|&c| c == b'/') {
        Some(i) if i + 1 < end => i + 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_offset() {
        assert_eq!(base_offset(b"foo/bar"), 4);
        assert_eq!(base_offset(b"foo"), 0);
        assert_eq!(base_offset(b"/"), 0);
        assert_eq!(base_offset(b"/usr/lib/"), 5);
        assert_eq!(base_offset(b"a/b/c"), 4);
    }

    #[test]
    fn test_must_buffer_rules() {
        assert!(must_buffer(WalkFlags::SORT, Strategy::Bfs, 0));
        assert!(must_buffer(WalkFlags::empty(), Strategy::Dfs, 0));
        assert!(!must_buffer(WalkFlags::empty(), Strategy::Dfs, 1));
        assert!(must_buffer(WalkFlags::STAT, Strategy::Bfs, 2));
        assert!(!must_buffer(WalkFlags::STAT, Strategy::Bfs, 1));
        assert!(!must_buffer(WalkFlags::empty(), Strategy::Bfs, 0));
    }
}
