//! Integration tests for widewalk
//!
//! These build real trees under a tempdir and assert the traversal
//! orders, visit pairings, and error behavior of each strategy.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use widewalk::{
    walk, Action, FileType, Strategy, Visit, WalkFlags, WalkOptions,
};

/// Build a tree from entries like "a/" (directory) and "a/b" (file).
fn build_tree(entries: &[&str]) -> TempDir {
    let tmp = tempfile::tempdir().unwrap();
    for entry in entries {
        let path = tmp.path().join(entry.trim_end_matches('/'));
        if entry.ends_with('/') {
            fs::create_dir_all(&path).unwrap();
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::File::create(&path).unwrap();
        }
    }
    tmp
}

/// Walk `root` and record (relative path, visit, type) triples.
fn collect(root: &Path, options: &WalkOptions) -> Vec<(String, Visit, FileType)> {
    let mut visits = Vec::new();
    walk(
        &[root],
        |entry| {
            let rel = entry
                .path()
                .strip_prefix(root.parent().unwrap())
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            visits.push((rel, entry.visit(), entry.file_type()));
            Action::Continue
        },
        options,
    )
    .unwrap();
    visits
}

fn pre_paths(visits: &[(String, Visit, FileType)]) -> Vec<String> {
    visits
        .iter()
        .filter(|(_, v, _)| *v == Visit::Pre)
        .map(|(p, _, _)| p.clone())
        .collect()
}

#[test]
fn test_bfs_visits_shallower_entries_first() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d"]);
    let root = tmp.path().join("a");

    let options = WalkOptions::default();
    let visits = collect(&root, &options);
    let pre = pre_paths(&visits);

    assert_eq!(pre.len(), 4);
    assert_eq!(pre[0], "a");
    // Siblings may arrive in OS order, but depth 1 precedes depth 2
    assert_eq!(pre[3], "a/c/d");
    let middle: std::collections::HashSet<_> = pre[1..3].iter().cloned().collect();
    assert_eq!(
        middle,
        ["a/b".to_string(), "a/c".to_string()].into_iter().collect()
    );
}

#[test]
fn test_bfs_sorted_exact_order() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d"]);
    let root = tmp.path().join("a");

    let options = WalkOptions {
        flags: WalkFlags::SORT,
        ..Default::default()
    };
    let visits = collect(&root, &options);
    assert_eq!(pre_paths(&visits), vec!["a", "a/b", "a/c", "a/c/d"]);
}

#[test]
fn test_dfs_buffered_preorder() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d"]);
    let root = tmp.path().join("a");

    let options = WalkOptions {
        strategy: Strategy::Dfs,
        flags: WalkFlags::BUFFER | WalkFlags::SORT,
        ..Default::default()
    };
    let visits = collect(&root, &options);
    assert_eq!(pre_paths(&visits), vec!["a", "a/b", "a/c", "a/c/d"]);
}

#[test]
fn test_dfs_post_order_interleaving() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d"]);
    let root = tmp.path().join("a");

    let options = WalkOptions {
        strategy: Strategy::Dfs,
        flags: WalkFlags::BUFFER | WalkFlags::SORT | WalkFlags::POST_ORDER,
        ..Default::default()
    };
    let visits = collect(&root, &options);

    let expected = vec![
        ("a".to_string(), Visit::Pre),
        ("a/b".to_string(), Visit::Pre),
        ("a/b".to_string(), Visit::Post),
        ("a/c".to_string(), Visit::Pre),
        ("a/c/d".to_string(), Visit::Pre),
        ("a/c/d".to_string(), Visit::Post),
        ("a/c".to_string(), Visit::Post),
        ("a".to_string(), Visit::Post),
    ];
    let got: Vec<_> = visits.iter().map(|(p, v, _)| (p.clone(), *v)).collect();
    assert_eq!(got, expected);
}

#[test]
fn test_pre_precedes_post_for_every_entry() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d", "a/c/e/", "a/c/e/f"]);
    let root = tmp.path().join("a");

    let options = WalkOptions {
        flags: WalkFlags::BUFFER | WalkFlags::POST_ORDER,
        ..Default::default()
    };
    let visits = collect(&root, &options);

    for (path, visit, _) in &visits {
        if *visit == Visit::Post {
            let pre_idx = visits
                .iter()
                .position(|(p, v, _)| p == path && *v == Visit::Pre)
                .unwrap_or_else(|| panic!("{} had POST without PRE", path));
            let post_idx = visits
                .iter()
                .position(|(p, v, _)| p == path && *v == Visit::Post)
                .unwrap();
            assert!(pre_idx < post_idx, "{} PRE must precede POST", path);
        }
    }

    // Each entry visited exactly once per order
    let pre = pre_paths(&visits);
    let mut unique: Vec<_> = pre.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(pre.len(), unique.len());
}

#[test]
fn test_sorted_sibling_order() {
    let tmp = build_tree(&["a/", "a/x", "a/m", "a/z"]);
    let root = tmp.path().join("a");

    let options = WalkOptions {
        flags: WalkFlags::SORT,
        ..Default::default()
    };
    let visits = collect(&root, &options);
    assert_eq!(pre_paths(&visits), vec!["a", "a/m", "a/x", "a/z"]);
}

#[test]
fn test_sorted_order_with_multiple_threads() {
    let entries: Vec<String> = (0..50).map(|i| format!("a/f{:02}", i)).collect();
    let mut layout: Vec<&str> = vec!["a/"];
    layout.extend(entries.iter().map(String::as_str));
    let tmp = build_tree(&layout);
    let root = tmp.path().join("a");

    let options = WalkOptions {
        flags: WalkFlags::SORT | WalkFlags::STAT,
        threads: 4,
        ..Default::default()
    };
    let visits = collect(&root, &options);
    let pre = pre_paths(&visits);

    // Async stat completions must not disturb the sorted order
    let mut sorted = pre.clone();
    sorted.sort();
    assert_eq!(pre, sorted);
    assert_eq!(pre.len(), 51);
}

#[test]
fn test_cycle_detection_reports_eloop() {
    let tmp = build_tree(&["a/", "a/b"]);
    symlink(tmp.path().join("a"), tmp.path().join("a/loop")).unwrap();
    let root = tmp.path().join("a");

    let options = WalkOptions {
        flags: WalkFlags::FOLLOW_ALL | WalkFlags::DETECT_CYCLES | WalkFlags::RECOVER,
        ..Default::default()
    };

    let mut loop_errors = 0;
    walk(
        &[&root],
        |entry| {
            if entry.file_type() == FileType::Error {
                assert_eq!(entry.error().map(|e| e.0), Some(libc::ELOOP));
                loop_errors += 1;
            }
            Action::Continue
        },
        &options,
    )
    .unwrap();

    assert_eq!(loop_errors, 1, "the cycle should surface exactly once");
}

#[test]
fn test_ids_visits_each_depth_once() {
    let tmp = build_tree(&["r/", "r/d1/", "r/d1/d2/", "r/d1/d2/d3/", "r/d1/d2/d3/d4/", "r/d1/d2/d3/d4/d5/"]);
    let root = tmp.path().join("r");

    let options = WalkOptions {
        strategy: Strategy::Ids,
        ..Default::default()
    };

    let mut depth_counts = vec![0usize; 7];
    walk(
        &[&root],
        |entry| {
            if entry.visit() == Visit::Pre {
                depth_counts[entry.depth()] += 1;
            }
            Action::Continue
        },
        &options,
    )
    .unwrap();

    assert_eq!(depth_counts, vec![1, 1, 1, 1, 1, 1, 0]);
}

#[test]
fn test_ids_pre_visits_match_bfs() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d", "a/c/e/", "a/c/e/f", "a/g"]);
    let root = tmp.path().join("a");

    let bfs = collect(&root, &WalkOptions::default());
    let ids = collect(
        &root,
        &WalkOptions { strategy: Strategy::Ids, ..Default::default() },
    );

    let bfs_set: std::collections::HashSet<_> = pre_paths(&bfs).into_iter().collect();
    let ids_set: std::collections::HashSet<_> = pre_paths(&ids).into_iter().collect();
    assert_eq!(bfs_set, ids_set);
}

#[test]
fn test_eds_pre_visits_match_bfs() {
    let tmp = build_tree(&["a/", "a/b/", "a/b/c/", "a/b/c/d/", "a/b/c/d/e", "a/f"]);
    let root = tmp.path().join("a");

    let bfs = collect(&root, &WalkOptions::default());
    let eds = collect(
        &root,
        &WalkOptions { strategy: Strategy::Eds, ..Default::default() },
    );

    let bfs_set: std::collections::HashSet<_> = pre_paths(&bfs).into_iter().collect();
    let eds_set: std::collections::HashSet<_> = pre_paths(&eds).into_iter().collect();
    assert_eq!(bfs_set, eds_set);
}

#[test]
fn test_prune_skips_subtree() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d"]);
    let root = tmp.path().join("a");

    let mut seen = Vec::new();
    walk(
        &[&root],
        |entry| {
            let name = entry.name().to_string_lossy().into_owned();
            seen.push(name.clone());
            if name == "c" {
                Action::Prune
            } else {
                Action::Continue
            }
        },
        &WalkOptions::default(),
    )
    .unwrap();

    assert!(seen.contains(&"c".to_string()));
    assert!(!seen.contains(&"d".to_string()), "pruned subtree was visited");
}

#[test]
fn test_stop_halts_early() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d", "a/e", "a/f"]);
    let root = tmp.path().join("a");

    let mut count = 0;
    let result = walk(
        &[&root],
        |_| {
            count += 1;
            if count >= 2 { Action::Stop } else { Action::Continue }
        },
        &WalkOptions::default(),
    );

    // Stop is not an error; the walk just ends
    assert!(result.is_ok());
    assert_eq!(count, 2);
}

#[test]
fn test_missing_root_with_recover() {
    let mut error_seen = None;
    walk(
        &["/nonexistent/widewalk-test-root"],
        |entry| {
            if entry.file_type() == FileType::Error {
                error_seen = entry.error();
            }
            Action::Continue
        },
        &WalkOptions { flags: WalkFlags::RECOVER, ..Default::default() },
    )
    .unwrap();

    assert_eq!(error_seen.map(|e| e.0), Some(libc::ENOENT));
}

#[test]
fn test_missing_root_without_recover() {
    let result = walk(
        &["/nonexistent/widewalk-test-root"],
        |_| Action::Continue,
        &WalkOptions::default(),
    );

    let err = result.unwrap_err();
    assert_eq!(err.errno().0, libc::ENOENT);
}

#[test]
fn test_small_fd_budget_still_completes() {
    let mut layout = vec!["d0/".to_string()];
    let mut prefix = "d0".to_string();
    for i in 1..10 {
        prefix = format!("{}/d{}", prefix, i);
        layout.push(format!("{}/", prefix));
        layout.push(format!("{}/file", prefix));
    }
    let layout_refs: Vec<&str> = layout.iter().map(String::as_str).collect();
    let tmp = build_tree(&layout_refs);
    let root = tmp.path().join("d0");

    let options = WalkOptions { max_open: 4, ..Default::default() };
    let visits = collect(&root, &options);
    // 10 dirs and 9 files, each visited once
    assert_eq!(pre_paths(&visits).len(), 19);
}

#[test]
fn test_synchronous_mode_matches_async() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d", "a/e/", "a/e/f"]);
    let root = tmp.path().join("a");

    let sync = collect(
        &root,
        &WalkOptions { threads: 0, flags: WalkFlags::SORT, ..Default::default() },
    );
    let async2 = collect(
        &root,
        &WalkOptions { threads: 2, flags: WalkFlags::SORT, ..Default::default() },
    );

    assert_eq!(sync, async2);
}

#[test]
fn test_repeat_walk_is_identical() {
    let tmp = build_tree(&["a/", "a/b", "a/c/", "a/c/d", "a/e"]);
    let root = tmp.path().join("a");

    let options = WalkOptions { flags: WalkFlags::SORT, ..Default::default() };
    let first = collect(&root, &options);
    let second = collect(&root, &options);
    assert_eq!(first, second);
}

#[test]
fn test_root_symlink_follow_policy() {
    let tmp = build_tree(&["target/", "target/inside"]);
    let link = tmp.path().join("link");
    symlink(tmp.path().join("target"), &link).unwrap();

    // Without FOLLOW_ROOTS the link itself is the only visit
    let mut types = Vec::new();
    walk(
        &[&link],
        |entry| {
            types.push(entry.file_type());
            Action::Continue
        },
        &WalkOptions::default(),
    )
    .unwrap();
    assert_eq!(types, vec![FileType::Symlink]);

    // With FOLLOW_ROOTS the walk descends through it
    let mut names = Vec::new();
    walk(
        &[&link],
        |entry| {
            names.push(entry.name().to_string_lossy().into_owned());
            Action::Continue
        },
        &WalkOptions { flags: WalkFlags::FOLLOW_ROOTS, ..Default::default() },
    )
    .unwrap();
    assert!(names.contains(&"inside".to_string()));
}

#[test]
fn test_multiple_roots_in_input_order() {
    let tmp = build_tree(&["one/", "one/a", "two/", "two/b", "three"]);

    let roots: Vec<PathBuf> = ["one", "two", "three"]
        .iter()
        .map(|r| tmp.path().join(r))
        .collect();

    let mut root_order = Vec::new();
    walk(
        &roots,
        |entry| {
            if entry.depth() == 0 {
                root_order.push(entry.name().to_string_lossy().into_owned());
            }
            Action::Continue
        },
        &WalkOptions::default(),
    )
    .unwrap();

    assert_eq!(root_order, vec!["one", "two", "three"]);
}

#[test]
fn test_depth_and_root_fields() {
    let tmp = build_tree(&["a/", "a/b/", "a/b/c"]);
    let root = tmp.path().join("a");

    walk(
        &[&root],
        |entry| {
            let components = entry
                .path()
                .strip_prefix(tmp.path())
                .unwrap()
                .components()
                .count();
            assert_eq!(entry.depth(), components - 1);
            assert_eq!(entry.root(), root);
            Action::Continue
        },
        &WalkOptions::default(),
    )
    .unwrap();
}

#[test]
fn test_stat_caching_in_callback() {
    let tmp = build_tree(&["a/", "a/b"]);
    let root = tmp.path().join("a");

    walk(
        &[&root],
        |entry| {
            let flags = entry.stat_flags();
            let first = entry.stat(flags).unwrap();
            // Second query must come from the cache
            let cached = entry.cached_stat(flags).unwrap();
            assert_eq!(first.ino(), cached.ino());
            Action::Continue
        },
        &WalkOptions::default(),
    )
    .unwrap();
}
