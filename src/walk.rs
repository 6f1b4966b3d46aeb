//! Public traversal API
//!
//! A walk takes a set of starting paths, a visitor callback, and a
//! [`WalkOptions`] describing the strategy and behavior flags. The engine
//! calls the visitor once per encountered entry (twice with
//! [`WalkFlags::POST_ORDER`]: once before and once after the entry's
//! children), handing it an [`Entry`] descriptor with the path, depth,
//! type, and lazily cached stat info.
//!
//! ```no_run
//! use widewalk::{walk, Action, WalkOptions};
//!
//! let options = WalkOptions::default();
//! walk(&["."], |entry| {
//!     println!("{}", entry.path().display());
//!     Action::Continue
//! }, &options).unwrap();
//! ```

use crate::dir::FileType;
use crate::error::{ConfigError, Errno, Result};
use crate::stat::{StatBuf, StatCache, StatFlags};
use crate::walker::engine::WalkState;
use crate::walker::strategy;
use bitflags::bitflags;
use std::collections::HashSet;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

bitflags! {
    /// Flags that control walk behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WalkFlags: u32 {
        /// stat() every encountered entry
        const STAT = 1 << 0;
        /// Report per-entry errors through the visitor instead of failing
        const RECOVER = 1 << 1;
        /// Visit directories in post-order as well as pre-order
        const POST_ORDER = 1 << 2;
        /// Follow a starting path that is a symlink
        const FOLLOW_ROOTS = 1 << 3;
        /// Follow all symlinks
        const FOLLOW_ALL = 1 << 4;
        /// Detect directory cycles
        const DETECT_CYCLES = 1 << 5;
        /// Skip mount points entirely
        const SKIP_MOUNTS = 1 << 6;
        /// Visit mount points but not their contents
        const PRUNE_MOUNTS = 1 << 7;
        /// Visit each directory's children in sorted order
        const SORT = 1 << 8;
        /// Read each directory fully before visiting its children
        const BUFFER = 1 << 9;
        /// Include whiteout entries in the results
        const WHITEOUTS = 1 << 10;
    }
}

/// Tree search strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Breadth-first search
    #[default]
    Bfs,
    /// Depth-first search
    Dfs,
    /// Iterative deepening search
    Ids,
    /// Exponential deepening search
    Eds,
}

/// Which visit a callback invocation corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Before the entry's children are processed
    Pre,
    /// After the entry's children are processed
    Post,
}

/// What the visitor wants done next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep walking
    Continue,
    /// Skip this entry's children
    Prune,
    /// Stop the whole walk
    Stop,
}

/// A caller-supplied hint set of names that might be mount points.
///
/// Parsing a real mount table is a collaborator's job; the engine only
/// consults the set to decide whether a non-directory needs a stat.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    names: HashSet<OsString>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the basename of a known mount point.
    pub fn insert(&mut self, name: impl Into<OsString>) {
        self.names.insert(name.into());
    }

    /// Whether `name` matches a known mount point basename.
    pub fn might_be_mount(&self, name: &OsStr) -> bool {
        self.names.contains(name)
    }
}

/// Options controlling a walk.
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Behavior flags
    pub flags: WalkFlags,
    /// Search strategy
    pub strategy: Strategy,
    /// Maximum number of descriptors the engine may keep open (≥ 2)
    pub max_open: usize,
    /// Number of I/O queue threads; 0 runs fully synchronously
    pub threads: usize,
    /// Mount point hints, if the caller has them
    pub mtab: Option<MountTable>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            flags: WalkFlags::empty(),
            strategy: Strategy::Bfs,
            max_open: 4096,
            threads: 1,
            mtab: None,
        }
    }
}

/// The descriptor handed to the visitor for each entry.
///
/// Passed mutably so that [`Entry::stat`] can cache its result in place;
/// the fields themselves are read-only to the visitor.
#[derive(Debug)]
pub struct Entry<'a> {
    pub(crate) path: &'a [u8],
    pub(crate) name_off: usize,
    pub(crate) root: &'a [u8],
    pub(crate) depth: usize,
    pub(crate) visit: Visit,
    pub(crate) ftype: FileType,
    pub(crate) error: Option<Errno>,
    pub(crate) at_fd: RawFd,
    pub(crate) at_off: usize,
    pub(crate) stat_flags: StatFlags,
    pub(crate) stats: StatCache,
}

impl<'a> Entry<'a> {
    /// The full path to the entry.
    pub fn path(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.path))
    }

    /// The entry's name (final path component).
    pub fn name(&self) -> &OsStr {
        OsStr::from_bytes(&self.path[self.name_off..])
    }

    /// The starting path under which this entry was found.
    pub fn root(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.root))
    }

    /// Depth below the starting path; 0 for the starting path itself.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether this is the pre- or post-order visit.
    pub fn visit(&self) -> Visit {
        self.visit
    }

    /// The entry type, as far as the walk knows without extra stat calls.
    pub fn file_type(&self) -> FileType {
        self.ftype
    }

    /// The error behind a [`FileType::Error`] entry.
    pub fn error(&self) -> Option<Errno> {
        self.error
    }

    /// A descriptor usable as the directory argument of `*at()` calls,
    /// paired with [`Entry::at_path`]. `AT_FDCWD` when no parent
    /// descriptor is open.
    pub fn at_fd(&self) -> RawFd {
        self.at_fd
    }

    /// The path to this entry relative to [`Entry::at_fd`].
    pub fn at_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.path[self.at_off..]))
    }

    /// The default symlink-follow policy for this entry.
    pub fn stat_flags(&self) -> StatFlags {
        self.stat_flags
    }

    /// Stat this entry, caching the result.
    ///
    /// Pass [`Entry::stat_flags`] for the walk's default follow policy.
    pub fn stat(&mut self, flags: StatFlags) -> std::result::Result<StatBuf, Errno> {
        let at_path = CString::new(&self.path[self.at_off..]).map_err(|_| Errno(libc::EINVAL))?;
        let whiteout = self.ftype == FileType::Whiteout;
        self.stats.fetch(self.at_fd, &at_path, flags, whiteout)
    }

    /// The cached stat result for `flags`, if one exists.
    pub fn cached_stat(&self, flags: StatFlags) -> Option<&StatBuf> {
        self.stats.cached(flags)
    }

    /// The entry type under the given follow policy, calling stat only
    /// when the cheap answer isn't available.
    pub fn type_with(&mut self, flags: StatFlags) -> FileType {
        match flags {
            StatFlags::NoFollow => {
                if self.ftype == FileType::Symlink || self.stat_flags == StatFlags::NoFollow {
                    return self.ftype;
                }
            }
            StatFlags::TryFollow => {
                if self.ftype != FileType::Symlink || self.stat_flags == StatFlags::TryFollow {
                    return self.ftype;
                }
            }
            StatFlags::Follow => {
                if self.ftype != FileType::Symlink {
                    return self.ftype;
                } else if self.stat_flags == StatFlags::TryFollow {
                    return FileType::Error;
                }
            }
        }

        match self.stat(flags) {
            Ok(buf) => buf.file_type(),
            Err(_) => FileType::Error,
        }
    }
}

/// Walk a filesystem tree, invoking `callback` for every entry.
///
/// Returns `Ok(())` iff the traversal completed without accumulating any
/// error. Per-entry errors are reported through the visitor when
/// [`WalkFlags::RECOVER`] is set; otherwise the first one becomes the
/// walk's result.
pub fn walk<P, F>(paths: &[P], mut callback: F, options: &WalkOptions) -> Result<()>
where
    P: AsRef<Path>,
    F: for<'e> FnMut(&mut Entry<'e>) -> Action,
{
    if options.max_open < 2 {
        return Err(ConfigError::OpenFdLimit { given: options.max_open, min: 2 }.into());
    }

    let paths: Vec<Vec<u8>> = paths
        .iter()
        .map(|p| p.as_ref().as_os_str().as_bytes().to_vec())
        .collect();

    match options.strategy {
        Strategy::Bfs | Strategy::Dfs => {
            let mut state = WalkState::new(&mut callback, options)?;
            state.run(&paths);
            state.finish()
        }
        Strategy::Ids => strategy::deepening(&paths, &mut callback, options, false),
        Strategy::Eds => strategy::deepening(&paths, &mut callback, options, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_open_too_small() {
        let options = WalkOptions { max_open: 1, ..Default::default() };
        let err = walk(&["."], |_| Action::Continue, &options).unwrap_err();
        assert_eq!(err.errno().0, libc::EINVAL);
    }

    #[test]
    fn test_mount_table_lookup() {
        let mut mtab = MountTable::new();
        mtab.insert("proc");
        assert!(mtab.might_be_mount(OsStr::new("proc")));
        assert!(!mtab.might_be_mount(OsStr::new("home")));
    }

    #[test]
    fn test_empty_paths_is_noop() {
        let paths: [&str; 0] = [];
        let mut calls = 0;
        walk(&paths, |_| { calls += 1; Action::Continue }, &WalkOptions::default()).unwrap();
        assert_eq!(calls, 0);
    }
}
