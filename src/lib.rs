//! widewalk - Breadth-First Filesystem Traversal Engine
//!
//! A file-tree walking library in the spirit of `nftw(3)`, built around a
//! breadth-first default with depth-first, iterative-deepening, and
//! exponential-deepening strategies sharing one engine.
//!
//! # Features
//!
//! - **Four search strategies**: BFS, DFS, IDS, and EDS all drive the same
//!   engine with different queue flavors and depth windows.
//!
//! - **Asynchronous I/O**: `opendir`/`stat`/`close` calls overlap with
//!   visitor execution on a configurable worker pool, with a balance
//!   counter splitting work fairly when only one worker is available.
//!
//! - **Bounded descriptors**: an LRU cache with pin/unpin semantics keeps
//!   the number of open descriptors under the caller's budget while
//!   minimizing path re-traversal, preferring to keep roots open longest.
//!
//! - **Strict ordering**: sorted traversals see children in name order
//!   even when async completions arrive out of order, and breadth-first
//!   walks visit every depth-N entry before any depth-(N+1) entry.
//!
//! - **Robust edge handling**: device/inode cycle detection, mount-point
//!   skipping and pruning, `ENAMETOOLONG` recovery by component-wise
//!   descent, and whiteout-aware stat emulation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         walk()                               │
//! │   BFS / DFS ──────────────► engine                           │
//! │   IDS / EDS ── depth-window wrapper ──► engine               │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼───────────────────────────────┐
//! │                         Engine                               │
//! │   dir queue ──► opendir ──► readdir ──► visit children       │
//! │   file queue ──► visit ──► GC (post-order, refcounts)        │
//! │            fd cache (LRU, pinned during *at calls)           │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │ opendir / stat               │ close
//! ┌───────────────▼──────────────────────────────▼───────────────┐
//! │                 I/O queue (worker threads)                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use widewalk::{walk, Action, Strategy, WalkFlags, WalkOptions};
//!
//! let options = WalkOptions {
//!     strategy: Strategy::Bfs,
//!     flags: WalkFlags::SORT,
//!     ..Default::default()
//! };
//!
//! walk(&["/usr/share"], |entry| {
//!     println!("{}", entry.path().display());
//!     Action::Continue
//! }, &options).unwrap();
//! ```

pub mod dir;
pub mod error;
pub mod ioq;
pub mod stat;
pub mod walk;
pub mod walker;

pub use dir::{DirEntry, DirFlags, DirStream, FileType};
pub use error::{ConfigError, Errno, IoqError, Result, WalkError};
pub use stat::{StatBuf, StatFlags};
pub use walk::{walk, Action, Entry, MountTable, Strategy, Visit, WalkFlags, WalkOptions};
