use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::cancel::CancellationToken;
use crate::error::{CoreError, CoreResult};
use crate::ignore_rules::{IgnoreMatcher, IgnoreSource};

/// One node of the project tree handed to the UI.
///
/// Ignored entries stay in the tree as childless leaves so the UI can render
/// them greyed out; the walk never descends into them.
#[derive(Debug, Clone, Serialize)]
pub struct FileNode {
    pub name: String,
    pub abs_path: PathBuf,
    /// Forward-slash relative path, empty only for the root itself.
    pub rel_path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Modification time, unix milliseconds (0 when unavailable).
    pub mtime: u64,
    pub is_gitignored: bool,
    pub is_custom_ignored: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

/// Flat view of a scannable file, consumed by the indexer and the builders.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub abs_path: PathBuf,
    /// Forward-slash path relative to the project root.
    pub rel_path: String,
    pub size: u64,
}

fn mtime_ms(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Walk `root` depth-first, honouring the ignore matcher.
///
/// Ordering is stable: directories before files, then case-insensitive name.
/// The walk observes `cancel` at every directory boundary; a cancelled walk
/// returns `OperationCancelled` and the partial tree is discarded.
pub fn scan(
    root: &Path,
    matcher: &IgnoreMatcher,
    cancel: &CancellationToken,
) -> CoreResult<Vec<FileNode>> {
    let meta = std::fs::metadata(root).map_err(|e| CoreError::io("scan", root, e))?;
    if !meta.is_dir() {
        return Err(CoreError::InvalidInput(format!(
            "project root is not a directory: {}",
            root.display()
        )));
    }
    scan_dir(root, root, "", matcher, cancel)
}

fn scan_dir(
    root: &Path,
    dir: &Path,
    rel_prefix: &str,
    matcher: &IgnoreMatcher,
    cancel: &CancellationToken,
) -> CoreResult<Vec<FileNode>> {
    cancel.check()?;

    let read = std::fs::read_dir(dir).map_err(|e| CoreError::io("read_dir", dir, e))?;

    struct RawEntry {
        name: String,
        abs_path: PathBuf,
        is_dir: bool,
        size: u64,
        mtime: u64,
    }

    let mut raw: Vec<RawEntry> = Vec::new();
    for item in read {
        let entry = match item {
            Ok(e) => e,
            Err(err) => {
                log::warn!("skipping unreadable entry in {}: {err}", dir.display());
                continue;
            }
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        // Symlinks are skipped outright: following them could escape the
        // project root, which the tree invariant forbids.
        if file_type.is_symlink() {
            continue;
        }
        let abs_path = entry.path();
        debug_assert!(abs_path.starts_with(root));
        let Ok(meta) = entry.metadata() else { continue };
        let Some(name) = abs_path.file_name().and_then(|n| n.to_str()).map(String::from)
        else {
            continue;
        };
        raw.push(RawEntry {
            name,
            abs_path,
            is_dir: file_type.is_dir(),
            size: if file_type.is_dir() { 0 } else { meta.len() },
            mtime: mtime_ms(&meta),
        });
    }

    raw.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    let mut nodes = Vec::with_capacity(raw.len());
    for entry in raw {
        cancel.check()?;

        let rel_path = if rel_prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{rel_prefix}/{}", entry.name)
        };

        let source = matcher.match_source(&rel_path, entry.is_dir);
        let is_gitignored = source == IgnoreSource::Gitignore;
        let is_custom_ignored =
            source == IgnoreSource::Custom || source == IgnoreSource::Default;

        let children = if entry.is_dir && source == IgnoreSource::None {
            scan_dir(root, &entry.abs_path, &rel_path, matcher, cancel)?
        } else {
            vec![]
        };

        nodes.push(FileNode {
            name: entry.name,
            abs_path: entry.abs_path,
            rel_path,
            is_dir: entry.is_dir,
            size: entry.size,
            mtime: entry.mtime,
            is_gitignored,
            is_custom_ignored,
            children,
        });
    }

    Ok(nodes)
}

/// Flatten a scanned tree into the non-ignored file entries, in tree order.
pub fn collect_files(nodes: &[FileNode]) -> Vec<FileEntry> {
    let mut out = Vec::new();
    push_files(nodes, &mut out);
    out
}

fn push_files(nodes: &[FileNode], out: &mut Vec<FileEntry>) {
    for node in nodes {
        if node.is_gitignored || node.is_custom_ignored {
            continue;
        }
        if node.is_dir {
            push_files(&node.children, out);
        } else {
            out.push(FileEntry {
                abs_path: node.abs_path.clone(),
                rel_path: node.rel_path.clone(),
                size: node.size,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignore_rules::IgnoreOptions;
    use std::fs;

    fn scan_fixture(custom_rules: &str) -> (tempfile::TempDir, Vec<FileNode>) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        fs::write(dir.path().join("src/Zed.rs"), "pub fn z() {}\n").unwrap();
        fs::write(dir.path().join("node_modules/x.js"), "x\n").unwrap();
        fs::write(dir.path().join("README.md"), "# hi\n").unwrap();

        let matcher = IgnoreMatcher::compile(
            dir.path(),
            &IgnoreOptions {
                use_gitignore: false,
                use_custom: true,
                custom_rules: custom_rules.to_string(),
            },
        )
        .unwrap();
        let tree = scan(dir.path(), &matcher, &CancellationToken::new()).unwrap();
        (dir, tree)
    }

    #[test]
    fn directories_sort_before_files_case_insensitively() {
        let (_dir, tree) = scan_fixture("");
        let names: Vec<&str> = tree.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["node_modules", "src", "README.md"]);

        let src = tree.iter().find(|n| n.name == "src").unwrap();
        let child_names: Vec<&str> = src.children.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(child_names, vec!["lib.rs", "Zed.rs"]);
    }

    #[test]
    fn ignored_directories_stay_as_leaves_and_are_not_traversed() {
        let (_dir, tree) = scan_fixture("");
        let nm = tree.iter().find(|n| n.name == "node_modules").unwrap();
        assert!(nm.is_custom_ignored);
        assert!(nm.children.is_empty());
    }

    #[test]
    fn rel_paths_use_forward_slashes() {
        let (_dir, tree) = scan_fixture("");
        let src = tree.iter().find(|n| n.name == "src").unwrap();
        assert!(src.children.iter().all(|c| c.rel_path.starts_with("src/")));
    }

    #[test]
    fn collect_files_excludes_ignored_entries() {
        let (_dir, tree) = scan_fixture("README.md\n");
        let files = collect_files(&tree);
        let rels: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert!(rels.contains(&"src/lib.rs"));
        assert!(!rels.iter().any(|r| r.contains("node_modules")));
        assert!(!rels.contains(&"README.md"));
    }

    #[test]
    fn cancelled_walk_discards_partial_results() {
        let (_dir, _) = scan_fixture("");
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "x").unwrap();
        let matcher =
            IgnoreMatcher::compile(dir.path(), &IgnoreOptions::default()).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            scan(dir.path(), &matcher, &token),
            Err(CoreError::OperationCancelled)
        ));
    }
}
