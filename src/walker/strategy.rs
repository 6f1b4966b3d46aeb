//! Deepening strategies
//!
//! Iterative deepening runs the engine repeatedly over a sliding depth
//! window `[min_depth, max_depth)`, widening by one each round; the
//! exponential variant doubles the window instead. One engine state is
//! reused for every round, keeping the descriptor cache warm.
//!
//! The user's callback is wrapped: outside the window the wrapper answers
//! for itself (descend, or prune subtrees the user pruned in an earlier
//! round), and inside the window it delegates. A round that prunes at the
//! depth limit clears the `bottom` flag, scheduling another round.
//!
//! Post-order is reconstructed after the bottom is reached: iterative
//! deepening replays the windows in reverse, overriding each visit to
//! read as post-order; exponential deepening runs one final unbounded
//! traversal with post-order enabled on the engine itself.

use crate::dir::FileType;
use crate::error::Result;
use crate::walk::{Action, Entry, Visit, WalkFlags, WalkOptions};
use crate::walker::engine::{WalkCallback, WalkState};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;

/// Depth window state shared between the wrapper callback and the round
/// driver.
struct DepthWindow {
    /// Which visit kind the delegate should currently see
    visit: Cell<Visit>,
    /// Whether to override the engine's visit field
    force_visit: Cell<bool>,
    /// Current minimum depth (inclusive)
    min_depth: Cell<usize>,
    /// Current maximum depth (exclusive)
    max_depth: Cell<usize>,
    /// Whether the deepest level has been reached
    bottom: Cell<bool>,
    /// Paths the delegate pruned, so later rounds don't re-descend
    pruned: RefCell<HashSet<Vec<u8>>>,
}

fn window_callback(
    window: &DepthWindow,
    delegate: &mut WalkCallback<'_>,
    entry: &mut Entry<'_>,
) -> Action {
    if window.force_visit.get() {
        entry.visit = window.visit.get();
    }

    if entry.file_type() == FileType::Error {
        // Report errors at the window edge; deeper rounds already did
        return if entry.depth() + 1 >= window.min_depth.get() {
            delegate(entry)
        } else {
            Action::Prune
        };
    }

    if entry.depth() < window.min_depth.get() {
        // Above the window: descend silently, except into pruned subtrees
        return if window.pruned.borrow().contains(entry.path) {
            Action::Prune
        } else {
            Action::Continue
        };
    } else if window.visit.get() == Visit::Post
        && window.pruned.borrow().contains(entry.path)
    {
        return Action::Prune;
    }

    let mut ret = Action::Continue;
    if entry.visit() == window.visit.get() {
        ret = delegate(entry);
    }

    match ret {
        Action::Continue => {
            if entry.file_type() == FileType::Directory
                && entry.depth() + 1 >= window.max_depth.get()
            {
                // There is more tree below the window
                window.bottom.set(false);
                ret = Action::Prune;
            }
        }
        Action::Prune => {
            if entry.file_type() == FileType::Directory {
                window.pruned.borrow_mut().insert(entry.path.to_vec());
            }
        }
        Action::Stop => {}
    }

    ret
}

/// Run an iterative (or exponential) deepening walk.
pub(crate) fn deepening(
    paths: &[Vec<u8>],
    delegate: &mut WalkCallback<'_>,
    options: &WalkOptions,
    exponential: bool,
) -> Result<()> {
    let window = DepthWindow {
        visit: Cell::new(Visit::Pre),
        force_visit: Cell::new(false),
        min_depth: Cell::new(0),
        max_depth: Cell::new(1),
        bottom: Cell::new(false),
        pruned: RefCell::new(HashSet::new()),
    };

    // The rounds drive pre/post order themselves
    let mut nested_options = options.clone();
    nested_options.flags.remove(WalkFlags::POST_ORDER);

    let mut callback =
        |entry: &mut Entry<'_>| -> Action { window_callback(&window, &mut *delegate, entry) };
    let mut state = WalkState::new(&mut callback, &nested_options)?;

    let mut stopped = false;
    while !window.bottom.get() {
        window.bottom.set(true);

        if !state.run(paths) {
            stopped = true;
            break;
        }

        if exponential {
            window.min_depth.set(window.max_depth.get());
            window.max_depth.set(window.max_depth.get() * 2);
        } else {
            window.min_depth.set(window.min_depth.get() + 1);
            window.max_depth.set(window.max_depth.get() + 1);
        }
    }

    if !stopped && options.flags.contains(WalkFlags::POST_ORDER) {
        window.visit.set(Visit::Post);

        if exponential {
            // One unbounded pass with real post-order visits
            window.min_depth.set(0);
            state.set_post_order();
            state.run(paths);
        } else {
            // Replay the windows deepest-first, relabeling each visit
            window.force_visit.set(true);

            while window.min_depth.get() > 0 {
                window.max_depth.set(window.max_depth.get() - 1);
                window.min_depth.set(window.min_depth.get() - 1);

                if !state.run(paths) {
                    break;
                }
            }
        }
    }

    state.finish()
}
