use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tree_sitter::{Node, Parser, Query, QueryCursor, StreamingIterator};

use crate::cancel::CancellationToken;
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::languages;
use crate::scanner::FileEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Method,
    Type,
    Variable,
    Constant,
    Interface,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Type => "type",
            SymbolKind::Variable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::Interface => "interface",
        };
        f.write_str(text)
    }
}

impl SymbolKind {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "function" => Some(Self::Function),
            "method" => Some(Self::Method),
            "type" => Some(Self::Type),
            "variable" => Some(Self::Variable),
            "constant" => Some(Self::Constant),
            "interface" => Some(Self::Interface),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, SymbolKind::Function | SymbolKind::Method)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    /// Stable hash of `(file_path, name, start_line, kind)`.
    pub id: String,
    pub name: String,
    pub kind: SymbolKind,
    /// Forward-slash path relative to the project root.
    pub file_path: String,
    /// 0-indexed first line of the declaration.
    pub start_line: u32,
    /// 0-indexed last line of the declaration (inclusive).
    pub end_line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// xxh3 hex digest of the containing file's bytes at extraction time.
    pub content_hash: String,
}

/// Compute the xxh3 hex digest of raw bytes.
#[inline]
pub fn xxh3_hex(bytes: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(bytes))
}

fn symbol_id(file_path: &str, name: &str, start_line: u32, kind: SymbolKind) -> String {
    xxh3_hex(format!("{file_path}:{name}:{start_line}:{kind}").as_bytes())
}

fn package_of(rel_path: &str) -> Option<String> {
    rel_path.rsplit_once('/').map(|(dir, _)| dir.to_string())
}

/// Return true when a source text looks minified or machine-generated.
///
/// Heuristic: inspect the first 5 non-empty lines. A single line over 2 000
/// chars is almost certainly minified JS/CSS/JSON; parsing it wastes CPU.
pub fn is_minified_or_generated(source_text: &str) -> bool {
    const MAX_SAFE_LINE_CHARS: usize = 2_000;
    source_text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(5)
        .any(|l| l.len() > MAX_SAFE_LINE_CHARS)
}

/// Bounded worker pool shared by the parsing and extraction sweeps.
pub(crate) fn worker_pool() -> &'static rayon::ThreadPool {
    static POOL: OnceLock<rayon::ThreadPool> = OnceLock::new();
    POOL.get_or_init(|| {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("shotgun-worker-{i}"))
            .build()
            .expect("worker pool")
    })
}

fn node_text<'a>(source: &'a [u8], node: Node) -> &'a str {
    std::str::from_utf8(&source[node.start_byte()..node.end_byte()]).unwrap_or("")
}

/// Collapse a declaration's text into a single readable signature line.
fn first_line_signature(def_text: &str) -> String {
    let mut s = def_text;
    if let Some(i) = s.find('{') {
        s = &s[..i];
    }
    if let Some(i) = s.find('\n') {
        s = &s[..i];
    }

    let mut out = String::with_capacity(s.len().min(200));
    let mut prev_ws = false;
    for ch in s.chars() {
        let is_ws = ch.is_whitespace();
        if is_ws {
            if !prev_ws {
                out.push(' ');
            }
        } else {
            out.push(ch);
        }
        prev_ws = is_ws;
        if out.len() >= 240 {
            break;
        }
    }

    out.trim().trim_end_matches('{').trim().to_string()
}

/// Extract all symbols from one file's source text.
///
/// Unknown extensions and feature-gated grammars yield an empty set, not an
/// error; only a genuine parse failure is reported.
pub fn extract_symbols(
    path: &Path,
    rel_path: &str,
    source_text: &str,
    content_hash: &str,
) -> CoreResult<Vec<Symbol>> {
    if is_minified_or_generated(source_text) {
        return Ok(vec![]);
    }
    let Some(kind) = languages::detect(path) else {
        return Ok(vec![]);
    };
    let Some(language) = languages::grammar(kind) else {
        return Ok(vec![]);
    };

    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(|e| CoreError::ParseError {
            file_path: rel_path.to_string(),
            message: format!("grammar rejected: {e}"),
        })?;
    let tree = parser
        .parse(source_text, None)
        .ok_or_else(|| CoreError::ParseError {
            file_path: rel_path.to_string(),
            message: "tree-sitter parse failed".to_string(),
        })?;
    let root = tree.root_node();
    let source = source_text.as_bytes();
    let package = package_of(rel_path);

    let mut symbols: Vec<Symbol> = Vec::new();
    let mut seen: HashSet<(String, u32)> = HashSet::new();

    for spec in languages::symbol_queries(kind) {
        // A query that does not compile against this grammar version simply
        // contributes nothing; the remaining queries still run.
        let Ok(query) = Query::new(&language, spec.query) else {
            log::debug!("symbol query skipped for {rel_path}: {}", spec.query);
            continue;
        };
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(&query, root, source);
        while let Some(m) = matches.next() {
            let mut name_node: Option<Node> = None;
            let mut def_node: Option<Node> = None;
            for cap in m.captures {
                match query.capture_names()[cap.index as usize] {
                    "name" => name_node = Some(cap.node),
                    "def" => def_node = Some(cap.node),
                    _ => {}
                }
            }
            let Some(name_node) = name_node else { continue };
            let def_node = def_node.unwrap_or(name_node);

            let name = node_text(source, name_node).trim().to_string();
            if name.is_empty() {
                continue;
            }

            let start_line = def_node.start_position().row as u32;
            let end_line = def_node.end_position().row as u32;

            // First query wins: methods shadow the function query, interface
            // declarations shadow the generic type query.
            if !seen.insert((name.clone(), start_line)) {
                continue;
            }

            let signature = if spec.signature {
                Some(first_line_signature(node_text(source, def_node)))
            } else {
                None
            };

            symbols.push(Symbol {
                id: symbol_id(rel_path, &name, start_line, spec.kind),
                name,
                kind: spec.kind,
                file_path: rel_path.to_string(),
                start_line,
                end_line,
                package: package.clone(),
                signature,
                content_hash: content_hash.to_string(),
            });
        }
    }

    symbols.sort_by(|a, b| {
        a.start_line
            .cmp(&b.start_line)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(symbols)
}

// ---------------------------------------------------------------------------
// On-disk cache: one row per file keyed by content hash.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRow {
    /// xxh3 hex digest of the raw file bytes at last parse time.
    hash: String,
    /// Stored byte length — cheap pre-screen before comparing hashes.
    size: u64,
    symbols: Vec<Symbol>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheStore {
    entries: HashMap<String, CacheRow>,
}

impl CacheStore {
    fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str::<Self>(&text) {
            Ok(store) => store,
            Err(err) => {
                log::warn!("symbol cache schema changed or corrupted ({err}), rebuilding");
                Self::default()
            }
        }
    }

    /// Atomic write-back: temp file in the same directory, then rename.
    fn save(&self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexStats {
    pub files: usize,
    pub symbols: usize,
    pub reparsed: usize,
    pub reused: usize,
    pub failed: usize,
    pub warnings: Vec<String>,
}

/// Per-project symbol index with an incremental on-disk cache.
///
/// Reads may race with nothing: the container hands the index out behind a
/// lock, and all mutation happens through `&mut self`.
pub struct SymbolIndex {
    root: PathBuf,
    /// `None` after a cache I/O failure — in-memory-only degraded mode.
    cache_path: Option<PathBuf>,
    store: CacheStore,
    by_name: HashMap<String, Vec<Symbol>>,
    by_kind: HashMap<SymbolKind, Vec<Symbol>>,
    /// Files whose parse errors were already reported this session.
    warned: HashSet<String>,
    degraded_warned: bool,
}

enum FileOutcome {
    Reused(CacheRow),
    Parsed(CacheRow),
    Failed { message: String },
}

impl SymbolIndex {
    /// Open the index for `root`, loading any persisted cache. A missing or
    /// unwritable cache directory degrades to in-memory-only mode.
    pub fn open(root: &Path, cache_dir: Option<&Path>) -> Self {
        let cache_path = cache_dir.and_then(|dir| match std::fs::create_dir_all(dir) {
            Ok(()) => Some(dir.join("symbols.json")),
            Err(err) => {
                log::warn!(
                    "symbol cache unavailable ({err}); continuing in-memory only"
                );
                None
            }
        });
        let store = cache_path
            .as_deref()
            .map(CacheStore::load)
            .unwrap_or_default();

        let mut index = Self {
            root: root.to_path_buf(),
            cache_path,
            store,
            by_name: HashMap::new(),
            by_kind: HashMap::new(),
            warned: HashSet::new(),
            degraded_warned: false,
        };
        index.rebuild_inverted();
        index
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Index the given files, reparsing only those whose content hash
    /// changed. Rows for files that vanished from the project are dropped.
    /// Cancellation discards all partial work.
    pub fn index_project(
        &mut self,
        files: &[FileEntry],
        cancel: &CancellationToken,
        events: &EventBus,
    ) -> CoreResult<IndexStats> {
        cancel.check()?;

        let store = &self.store;
        let outcomes: Vec<Option<(String, FileOutcome)>> = worker_pool().install(|| {
            files
                .par_iter()
                .map(|entry| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some((entry.rel_path.clone(), index_one(&self.root, entry, store)))
                })
                .collect()
        });
        cancel.check()?;

        let mut stats = IndexStats::default();
        let mut next: HashMap<String, CacheRow> = HashMap::new();

        for outcome in outcomes.into_iter().flatten() {
            let (rel, outcome) = outcome;
            stats.files += 1;
            match outcome {
                FileOutcome::Reused(row) => {
                    stats.reused += 1;
                    stats.symbols += row.symbols.len();
                    next.insert(rel, row);
                }
                FileOutcome::Parsed(row) => {
                    stats.reparsed += 1;
                    stats.symbols += row.symbols.len();
                    next.insert(rel, row);
                }
                FileOutcome::Failed { message } => {
                    stats.failed += 1;
                    if self.warned.insert(rel.clone()) {
                        log::warn!("symbol extraction failed for {rel}: {message}");
                        stats.warnings.push(format!("{rel}: {message}"));
                    }
                }
            }
        }

        self.store.entries = next;
        self.rebuild_inverted();
        self.flush_best_effort();

        events.publish(CoreEvent::SymbolIndexBuilt {
            root: self.root.to_string_lossy().to_string(),
            files: stats.files,
            symbols: stats.symbols,
            reparsed: stats.reparsed,
        });

        Ok(stats)
    }

    /// Symbols of one file, refreshed when the persisted row is stale. This
    /// is the invariant that index queries never return symbols whose hash
    /// disagrees with current content.
    pub fn get(&mut self, rel_path: &str) -> CoreResult<Vec<Symbol>> {
        let abs = self.root.join(rel_path);
        let bytes = std::fs::read(&abs).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(rel_path.to_string()),
            _ => CoreError::io("read", abs.clone(), e),
        })?;
        let hash = xxh3_hex(&bytes);

        if let Some(row) = self.store.entries.get(rel_path) {
            if row.hash == hash {
                return Ok(row.symbols.clone());
            }
        }

        let source_text = String::from_utf8_lossy(&bytes).into_owned();
        let symbols = extract_symbols(&abs, rel_path, &source_text, &hash)?;
        self.store.entries.insert(
            rel_path.to_string(),
            CacheRow {
                hash,
                size: bytes.len() as u64,
                symbols: symbols.clone(),
            },
        );
        self.rebuild_inverted();
        self.flush_best_effort();
        Ok(symbols)
    }

    /// Content hash currently recorded for a file, if indexed.
    pub fn file_hash(&self, rel_path: &str) -> Option<&str> {
        self.store.entries.get(rel_path).map(|row| row.hash.as_str())
    }

    pub fn files(&self) -> Vec<String> {
        let mut out: Vec<String> = self.store.entries.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn query(&self, predicate: impl Fn(&Symbol) -> bool) -> Vec<Symbol> {
        let mut out: Vec<Symbol> = self
            .store
            .entries
            .values()
            .flat_map(|row| row.symbols.iter())
            .filter(|s| predicate(s))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.file_path
                .cmp(&b.file_path)
                .then_with(|| a.start_line.cmp(&b.start_line))
        });
        out
    }

    pub fn find_by_name(&self, name: &str, kind: Option<SymbolKind>) -> Vec<Symbol> {
        let Some(candidates) = self.by_name.get(name) else {
            return vec![];
        };
        candidates
            .iter()
            .filter(|s| kind.is_none_or(|k| s.kind == k))
            .cloned()
            .collect()
    }

    pub fn by_kind(&self, kind: SymbolKind) -> Vec<Symbol> {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }

    pub fn symbol_by_id(&self, id: &str) -> Option<Symbol> {
        self.store
            .entries
            .values()
            .flat_map(|row| row.symbols.iter())
            .find(|s| s.id == id)
            .cloned()
    }

    /// Drop the cached rows for changed files; the next index pass or `get`
    /// reparses them. Called by the watcher.
    pub fn invalidate(&mut self, rel_paths: &[String]) {
        let mut touched = false;
        for rel in rel_paths {
            touched |= self.store.entries.remove(rel).is_some();
        }
        if touched {
            self.rebuild_inverted();
        }
    }

    /// Flush the cache to disk.
    pub fn close(&mut self) -> CoreResult<()> {
        if let Some(path) = self.cache_path.clone() {
            self.store
                .save(&path)
                .map_err(|e| CoreError::io("write", path, e))?;
        }
        Ok(())
    }

    fn flush_best_effort(&mut self) {
        let Some(path) = self.cache_path.clone() else {
            return;
        };
        if let Err(err) = self.store.save(&path) {
            if !self.degraded_warned {
                log::warn!(
                    "symbol cache write failed ({err}); continuing in-memory only"
                );
                self.degraded_warned = true;
            }
            self.cache_path = None;
        }
    }

    fn rebuild_inverted(&mut self) {
        self.by_name.clear();
        self.by_kind.clear();
        for row in self.store.entries.values() {
            for symbol in &row.symbols {
                self.by_name
                    .entry(symbol.name.clone())
                    .or_default()
                    .push(symbol.clone());
                self.by_kind
                    .entry(symbol.kind)
                    .or_default()
                    .push(symbol.clone());
            }
        }
    }
}

fn index_one(root: &Path, entry: &FileEntry, store: &CacheStore) -> FileOutcome {
    let abs = if entry.abs_path.is_absolute() {
        entry.abs_path.clone()
    } else {
        root.join(&entry.abs_path)
    };

    // Size pre-screen: an unchanged size is a prerequisite for an unchanged
    // hash, and mismatches skip the read-and-hash of the old row entirely.
    if let Some(row) = store.entries.get(&entry.rel_path) {
        if row.size == entry.size {
            if let Ok(bytes) = std::fs::read(&abs) {
                let hash = xxh3_hex(&bytes);
                if hash == row.hash {
                    return FileOutcome::Reused(row.clone());
                }
                return parse_row(&abs, &entry.rel_path, bytes, hash);
            }
        }
    }

    match std::fs::read(&abs) {
        Ok(bytes) => {
            let hash = xxh3_hex(&bytes);
            parse_row(&abs, &entry.rel_path, bytes, hash)
        }
        Err(err) => FileOutcome::Failed {
            message: err.to_string(),
        },
    }
}

fn parse_row(abs: &Path, rel: &str, bytes: Vec<u8>, hash: String) -> FileOutcome {
    // Binary files contribute no symbols, without error.
    if bytes.contains(&0u8) {
        return FileOutcome::Parsed(CacheRow {
            hash,
            size: bytes.len() as u64,
            symbols: vec![],
        });
    }
    let size = bytes.len() as u64;
    let source_text = String::from_utf8_lossy(&bytes).into_owned();
    match extract_symbols(abs, rel, &source_text, &hash) {
        Ok(symbols) => FileOutcome::Parsed(CacheRow {
            hash,
            size,
            symbols,
        }),
        Err(err) => FileOutcome::Failed {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUST_SOURCE: &str = r#"
pub struct Header {
    pub len: usize,
}

pub trait Decode {
    fn decode(&self) -> usize;
}

pub const MAX_LEN: usize = 1024;

pub fn parse_header(input: &str) -> Header {
    Header { len: input.len() }
}

impl Header {
    pub fn validate(&self) -> bool {
        self.len < MAX_LEN
    }
}
"#;

    fn extract(source: &str) -> Vec<Symbol> {
        let hash = xxh3_hex(source.as_bytes());
        extract_symbols(Path::new("src/parser.rs"), "src/parser.rs", source, &hash).unwrap()
    }

    #[test]
    fn rust_extraction_classifies_kinds() {
        let symbols = extract(RUST_SOURCE);
        let find = |name: &str| symbols.iter().find(|s| s.name == name).unwrap();

        assert_eq!(find("Header").kind, SymbolKind::Type);
        assert_eq!(find("Decode").kind, SymbolKind::Interface);
        assert_eq!(find("MAX_LEN").kind, SymbolKind::Constant);
        assert_eq!(find("parse_header").kind, SymbolKind::Function);
        assert_eq!(find("validate").kind, SymbolKind::Method);
    }

    #[test]
    fn functions_carry_a_collapsed_signature() {
        let symbols = extract(RUST_SOURCE);
        let parse = symbols.iter().find(|s| s.name == "parse_header").unwrap();
        let sig = parse.signature.as_deref().unwrap();
        assert!(sig.contains("fn parse_header"));
        assert!(!sig.contains('\n'));
    }

    #[test]
    fn symbol_ids_are_stable_across_extractions() {
        let first = extract(RUST_SOURCE);
        let second = extract(RUST_SOURCE);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
        }
    }

    #[test]
    fn unknown_extensions_yield_empty_not_error() {
        let symbols = extract_symbols(
            Path::new("data.csv"),
            "data.csv",
            "a,b,c\n1,2,3\n",
            "00",
        )
        .unwrap();
        assert!(symbols.is_empty());
    }

    #[test]
    fn minified_content_is_skipped() {
        let blob = format!("var x={};", "a".repeat(5_000));
        let symbols =
            extract_symbols(Path::new("bundle.js"), "bundle.js", &blob, "00").unwrap();
        assert!(symbols.is_empty());
    }

    #[test]
    fn index_survives_without_a_cache_directory() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("lib.rs"), "pub fn a() {}\n").unwrap();

        let mut index = SymbolIndex::open(project.path(), None);
        let files = vec![FileEntry {
            abs_path: project.path().join("lib.rs"),
            rel_path: "lib.rs".into(),
            size: std::fs::metadata(project.path().join("lib.rs")).unwrap().len(),
        }];
        let stats = index
            .index_project(&files, &CancellationToken::new(), &EventBus::disabled())
            .unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.reparsed, 1);
        assert_eq!(index.find_by_name("a", Some(SymbolKind::Function)).len(), 1);
    }

    #[test]
    fn stale_rows_are_refreshed_on_get() {
        let project = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let file = project.path().join("m.rs");
        std::fs::write(&file, "pub fn before() {}\n").unwrap();

        let mut index = SymbolIndex::open(project.path(), Some(cache.path()));
        let files = vec![FileEntry {
            abs_path: file.clone(),
            rel_path: "m.rs".into(),
            size: std::fs::metadata(&file).unwrap().len(),
        }];
        index
            .index_project(&files, &CancellationToken::new(), &EventBus::disabled())
            .unwrap();
        assert_eq!(index.find_by_name("before", None).len(), 1);

        // Mutate behind the index's back; get() must not serve stale rows.
        std::fs::write(&file, "pub fn after() {}\n").unwrap();
        let symbols = index.get("m.rs").unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "after");
        assert_eq!(
            symbols[0].content_hash,
            xxh3_hex(&std::fs::read(&file).unwrap())
        );
    }

    #[test]
    fn cancelled_indexing_discards_partial_results() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("a.rs"), "pub fn a() {}\n").unwrap();
        let mut index = SymbolIndex::open(project.path(), None);
        let files = vec![FileEntry {
            abs_path: project.path().join("a.rs"),
            rel_path: "a.rs".into(),
            size: 14,
        }];
        let token = CancellationToken::new();
        token.cancel();
        let result = index.index_project(&files, &token, &EventBus::disabled());
        assert!(matches!(result, Err(CoreError::OperationCancelled)));
        assert!(index.find_by_name("a", None).is_empty());
    }
}
