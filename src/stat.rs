//! stat(2) plumbing
//!
//! Wraps `fstatat(2)` and provides the two-slot stat cache every traversal
//! entry carries: one slot for follow-symlink results, one for no-follow.
//! Each slot is either unfetched, fetched with a buffer, or fetched with an
//! errno, so repeated queries never hit the filesystem twice.

use crate::dir::FileType;
use crate::error::Errno;
use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

/// Symlink-follow policy for a single stat query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatFlags {
    /// Follow symlinks
    Follow,
    /// Do not follow symlinks
    NoFollow,
    /// Follow symlinks, but fall back to the link itself if it is broken
    TryFollow,
}

impl StatFlags {
    /// Whether this policy can return information about a link target.
    pub fn follows(self) -> bool {
        !matches!(self, StatFlags::NoFollow)
    }
}

/// A stat(2) result buffer.
#[derive(Clone, Copy)]
pub struct StatBuf(libc::stat);

impl StatBuf {
    /// Device number.
    pub fn dev(&self) -> u64 {
        self.0.st_dev as u64
    }

    /// Inode number.
    pub fn ino(&self) -> u64 {
        self.0.st_ino as u64
    }

    /// Raw mode bits.
    pub fn mode(&self) -> libc::mode_t {
        self.0.st_mode
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.0.st_size as u64
    }

    /// Link count.
    pub fn nlink(&self) -> u64 {
        self.0.st_nlink as u64
    }

    /// The file type encoded in the mode bits.
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.0.st_mode)
    }

    /// Whether this buffer describes a symlink.
    pub fn is_symlink(&self) -> bool {
        self.0.st_mode & libc::S_IFMT == libc::S_IFLNK
    }

    /// A synthesized all-zero buffer standing in for a whiteout entry.
    ///
    /// Matches the FTS_WHITEOUT behavior on BSD: the entry has no backing
    /// inode, so every field reads as zero.
    pub fn whiteout() -> Self {
        // SAFETY: libc::stat is a plain-old-data struct; all-zeroes is valid
        StatBuf(unsafe { std::mem::zeroed() })
    }
}

impl std::fmt::Debug for StatBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatBuf")
            .field("dev", &self.dev())
            .field("ino", &self.ino())
            .field("mode", &format_args!("{:o}", self.mode()))
            .field("size", &self.size())
            .finish()
    }
}

/// Call `fstatat(2)` relative to `dfd`.
///
/// This is the single-policy primitive: `TryFollow` is composed on top by
/// [`StatCache::fetch`].
pub fn fstatat(dfd: RawFd, path: &CStr, follow: bool) -> Result<StatBuf, Errno> {
    let mut buf = MaybeUninit::<libc::stat>::uninit();
    let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    let ret = unsafe { libc::fstatat(dfd, path.as_ptr(), buf.as_mut_ptr(), flags) };
    if ret == 0 {
        Ok(StatBuf(unsafe { buf.assume_init() }))
    } else {
        Err(Errno::last())
    }
}

/// One slot of the stat cache.
#[derive(Debug, Clone, Copy, Default)]
pub enum StatSlot {
    /// No query has been made with this follow policy
    #[default]
    Unfetched,
    /// A query succeeded
    Fetched(StatBuf),
    /// A query failed
    Failed(Errno),
}

impl StatSlot {
    fn is_unfetched(&self) -> bool {
        matches!(self, StatSlot::Unfetched)
    }

    fn ok(&self) -> Option<&StatBuf> {
        match self {
            StatSlot::Fetched(buf) => Some(buf),
            _ => None,
        }
    }
}

/// Cached stat info for one traversal entry.
///
/// Results arriving from the I/O queue and results faulted in by the
/// visitor land in the same cache, so a stat is never repeated for the
/// same entry and follow policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatCache {
    /// Follow-symlink slot
    stat: StatSlot,
    /// No-follow slot
    lstat: StatSlot,
    /// Number of fstatat calls made by this cache on the calling thread
    sync_calls: u32,
}

impl StatCache {
    /// Reset both slots.
    pub fn clear(&mut self) {
        *self = StatCache::default();
    }

    /// Copy fetched slots from `other` into any unfetched slots here.
    pub fn fill_from(&mut self, other: &StatCache) {
        if self.stat.is_unfetched() && !other.stat.is_unfetched() {
            self.stat = other.stat;
        }
        if self.lstat.is_unfetched() && !other.lstat.is_unfetched() {
            self.lstat = other.lstat;
        }
    }

    /// Record the result of a stat performed with `flags`.
    ///
    /// A no-follow result for a non-link also fills the follow slot, since
    /// both policies agree for it. A try-follow result that turns out to be
    /// a link means the follow attempt failed: the link's own info fills
    /// the no-follow slot and the follow slot records `ENOENT`.
    pub fn store(&mut self, flags: StatFlags, result: Result<StatBuf, Errno>) {
        match flags {
            StatFlags::NoFollow => {
                self.lstat = slot_of(result);
                match result {
                    Ok(buf) if buf.is_symlink() => {}
                    _ => self.stat = slot_of(result),
                }
            }
            StatFlags::TryFollow => match result {
                Err(errno) => self.stat = StatSlot::Failed(errno),
                Ok(buf) if buf.is_symlink() => {
                    self.lstat = StatSlot::Fetched(buf);
                    self.stat = StatSlot::Failed(Errno(libc::ENOENT));
                }
                Ok(buf) => self.stat = StatSlot::Fetched(buf),
            },
            StatFlags::Follow => self.stat = slot_of(result),
        }
    }

    /// Look up a cached buffer without touching the filesystem.
    pub fn cached(&self, flags: StatFlags) -> Option<&StatBuf> {
        match flags {
            StatFlags::NoFollow => self.lstat.ok(),
            StatFlags::Follow => self.stat.ok(),
            StatFlags::TryFollow => match self.stat {
                StatSlot::Fetched(ref buf) => Some(buf),
                StatSlot::Failed(errno) if errno.is_not_found() => self.lstat.ok(),
                _ => None,
            },
        }
    }

    /// Fetch stat info, hitting the filesystem only for unfetched slots.
    ///
    /// `whiteout` enables the synthesized-buffer fallback for union-mount
    /// whiteouts, whose names appear in the directory but have no inode.
    pub fn fetch(
        &mut self,
        dfd: RawFd,
        path: &CStr,
        flags: StatFlags,
        whiteout: bool,
    ) -> Result<StatBuf, Errno> {
        match flags {
            StatFlags::TryFollow => {
                match self.fetch_one(dfd, path, true, whiteout) {
                    Err(errno) if errno.is_not_found() => {
                        self.fetch_one(dfd, path, false, whiteout)
                    }
                    other => other,
                }
            }
            StatFlags::Follow => self.fetch_one(dfd, path, true, whiteout),
            StatFlags::NoFollow => self.fetch_one(dfd, path, false, whiteout),
        }
    }

    fn fetch_one(
        &mut self,
        dfd: RawFd,
        path: &CStr,
        follow: bool,
        whiteout: bool,
    ) -> Result<StatBuf, Errno> {
        let slot = if follow { &self.stat } else { &self.lstat };
        match *slot {
            StatSlot::Fetched(buf) => return Ok(buf),
            StatSlot::Failed(errno) => return Err(errno),
            StatSlot::Unfetched => {}
        }

        self.sync_calls += 1;
        let result = match fstatat(dfd, path, follow) {
            Err(errno) if whiteout && errno.0 == libc::ENOENT => Ok(StatBuf::whiteout()),
            other => other,
        };

        let flags = if follow { StatFlags::Follow } else { StatFlags::NoFollow };
        self.store(flags, result);
        result
    }

    /// Number of fstatat calls this cache has made on the calling thread,
    /// clearing the counter.
    pub fn take_sync_calls(&mut self) -> u32 {
        std::mem::take(&mut self.sync_calls)
    }
}

fn slot_of(result: Result<StatBuf, Errno>) -> StatSlot {
    match result {
        Ok(buf) => StatSlot::Fetched(buf),
        Err(errno) => StatSlot::Failed(errno),
    }
}
