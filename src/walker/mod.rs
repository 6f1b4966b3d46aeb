//! Traversal internals
//!
//! The engine drives two multi-stage queues (directories to read, files to
//! visit) over an arena of reference-counted records, with a bounded LRU
//! cache of open descriptors and an optional async I/O queue:
//!
//! ```text
//!                  ┌────────────────────────────┐
//!                  │          Engine            │
//!                  │  pop dir → open → readdir  │
//!                  │  visit children / enqueue  │
//!                  │  pop file → visit → GC     │
//!                  └─────┬───────────────┬──────┘
//!                        │               │
//!               ┌────────▼─────┐   ┌─────▼────────┐
//!               │  dir queue   │   │  file queue  │
//!               │ buffer→wait→ │   │ buffer→wait→ │
//!               │    ready     │   │    ready     │
//!               └────────┬─────┘   └─────┬────────┘
//!                        │  opendir      │  stat
//!                        └──────┬────────┘
//!                        ┌──────▼───────┐
//!                        │  I/O queue   │
//!                        │  (workers)   │
//!                        └──────────────┘
//! ```

pub mod cache;
pub mod engine;
pub mod queue;
pub mod record;
pub mod strategy;
