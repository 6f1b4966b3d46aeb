//! Directory streams
//!
//! Thin ownership layer over `libc::DIR`: directories are opened with
//! `openat(2)` (always `O_RDONLY | O_CLOEXEC | O_DIRECTORY`) and wrapped
//! with `fdopendir(3)`, so the engine can hand descriptors around by fd
//! number while the stream owns the close.
//!
//! A `DirStream` may be created on an I/O queue worker thread and read on
//! the main thread, but never concurrently from both.

use crate::error::Errno;
use bitflags::bitflags;
use std::ffi::{CStr, OsString};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

bitflags! {
    /// Flags for opening a directory stream.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirFlags: u32 {
        /// Report whiteout entries instead of skipping them.
        const WHITEOUTS = 1 << 0;
    }
}

/// The type of a filesystem entry, as far as the walk currently knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Not yet determined (dirent had `DT_UNKNOWN`, no stat yet)
    Unknown,
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Block device
    BlockDev,
    /// Character device
    CharDev,
    /// Named pipe
    Fifo,
    /// Unix socket
    Socket,
    /// Union-mount whiteout entry
    Whiteout,
    /// An error occurred resolving this entry
    Error,
}

impl FileType {
    /// Map a dirent `d_type` value.
    pub fn from_dirent(d_type: u8) -> Self {
        match d_type {
            libc::DT_REG => FileType::Regular,
            libc::DT_DIR => FileType::Directory,
            libc::DT_LNK => FileType::Symlink,
            libc::DT_BLK => FileType::BlockDev,
            libc::DT_CHR => FileType::CharDev,
            libc::DT_FIFO => FileType::Fifo,
            libc::DT_SOCK => FileType::Socket,
            14 => FileType::Whiteout, // DT_WHT; not exposed by libc on Linux
            _ => FileType::Unknown,
        }
    }

    /// Map a stat `st_mode` value.
    pub fn from_mode(mode: libc::mode_t) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FileType::Regular,
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFBLK => FileType::BlockDev,
            libc::S_IFCHR => FileType::CharDev,
            libc::S_IFIFO => FileType::Fifo,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    /// Whether this entry is known to be a directory.
    pub fn is_dir(self) -> bool {
        self == FileType::Directory
    }

    /// Whether this entry is known to be a symlink.
    pub fn is_symlink(self) -> bool {
        self == FileType::Symlink
    }
}

/// One entry read from a directory stream.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// The entry's name (final path component only)
    pub name: OsString,
    /// The entry type, if the filesystem reported one
    pub ftype: FileType,
}

/// Open a directory descriptor relative to `dfd`.
///
/// `dfd` may be `libc::AT_FDCWD`.
pub fn open_dir_at(dfd: RawFd, name: &CStr) -> Result<RawFd, Errno> {
    let flags = libc::O_RDONLY | libc::O_CLOEXEC | libc::O_DIRECTORY;
    let fd = unsafe { libc::openat(dfd, name.as_ptr(), flags) };
    if fd < 0 {
        Err(Errno::last())
    } else {
        Ok(fd)
    }
}

/// Duplicate a descriptor with `FD_CLOEXEC` set.
pub fn dup_cloexec(fd: RawFd) -> Result<RawFd, Errno> {
    let new = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new < 0 {
        Err(Errno::last())
    } else {
        Ok(new)
    }
}

/// Close a raw descriptor, ignoring `EINTR` per POSIX advice.
pub fn close_fd(fd: RawFd) -> Result<(), Errno> {
    let ret = unsafe { libc::close(fd) };
    if ret == 0 || Errno::last().0 == libc::EINTR {
        Ok(())
    } else {
        Err(Errno::last())
    }
}

/// An open directory stream.
///
/// Owns the underlying descriptor: dropping the stream runs `closedir(3)`,
/// which closes the fd obtained from [`DirStream::fd`].
#[derive(Debug)]
pub struct DirStream {
    dir: NonNull<libc::DIR>,
    flags: DirFlags,
}

// A DirStream is only ever used by one thread at a time: it is created on
// an ioq worker, shipped through a channel, and read on the main thread.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Wrap an already-open directory descriptor.
    ///
    /// On success the stream takes ownership of `fd`. On failure the
    /// caller keeps it, matching `fdopendir(3)`.
    pub fn from_fd(fd: RawFd, flags: DirFlags) -> Result<Self, Errno> {
        let dir = unsafe { libc::fdopendir(fd) };
        match NonNull::new(dir) {
            Some(dir) => Ok(DirStream { dir, flags }),
            None => Err(Errno::last()),
        }
    }

    /// Open the directory `name` relative to `dfd`.
    pub fn open_at(dfd: RawFd, name: &CStr, flags: DirFlags) -> Result<Self, Errno> {
        let fd = open_dir_at(dfd, name)?;
        DirStream::from_fd(fd, flags).inspect_err(|_| {
            let _ = close_fd(fd);
        })
    }

    /// The descriptor backing this stream.
    pub fn fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir.as_ptr()) }
    }

    /// Read the next entry, skipping `.` and `..`.
    ///
    /// Returns `Ok(None)` at end of directory. Whiteout entries are skipped
    /// unless the stream was opened with [`DirFlags::WHITEOUTS`].
    pub fn read(&mut self) -> Result<Option<DirEntry>, Errno> {
        loop {
            // readdir() signals errors only through errno
            unsafe { *libc::__errno_location() = 0 };

            let ent = unsafe { libc::readdir(self.dir.as_ptr()) };
            if ent.is_null() {
                let errno = Errno::last();
                return if errno.0 == 0 { Ok(None) } else { Err(errno) };
            }

            let ent = unsafe { &*ent };
            let name = unsafe { CStr::from_ptr(ent.d_name.as_ptr()) };
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }

            let ftype = FileType::from_dirent(ent.d_type);
            if ftype == FileType::Whiteout && !self.flags.contains(DirFlags::WHITEOUTS) {
                continue;
            }

            return Ok(Some(DirEntry {
                name: OsString::from_vec(bytes.to_vec()),
                ftype,
            }));
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}
