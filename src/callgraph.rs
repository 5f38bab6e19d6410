use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use crate::cancel::CancellationToken;
use crate::error::CoreResult;
use crate::events::{CoreEvent, EventBus};
use crate::languages;
use crate::scanner::FileEntry;
use crate::symbols::{worker_pool, Symbol, SymbolIndex, SymbolKind};
use tree_sitter::{Node, Parser};

/// Language-agnostic deny-list of common stdlib / runtime method names that
/// produce noise edges without conveying domain intent.
static CALL_NOISE: &[&str] = &[
    // Rust — core/std
    "clone", "to_string", "to_owned", "into", "from", "default", "unwrap", "expect", "iter",
    "into_iter", "collect", "map", "filter", "and_then", "or_else", "as_ref", "as_str",
    "as_bytes", "push", "pop", "insert", "remove", "get", "len", "is_empty", "contains",
    "starts_with", "ends_with", "split", "join", "trim", "replace", "format", "parse",
    "lines", "chars", "new", "with_capacity", "sort", "sort_by", "dedup", "extend", "find",
    "next", "take", "skip", "enumerate", "zip", "min", "max", "count", "lock", "read",
    "write", "send", "recv", "ok", "err", "map_err", "context", "with_context",
    // Python builtins
    "append", "update", "keys", "values", "items", "strip", "lower", "upper", "encode",
    "decode", "isinstance", "open", "print", "range", "str", "int", "list", "dict", "set",
    "super", "type",
    // TypeScript/JavaScript
    "toString", "valueOf", "then", "catch", "finally", "forEach", "reduce", "some", "every",
    "includes", "indexOf", "slice", "splice", "concat", "flat", "flatMap", "match", "test",
    // Go
    "Error", "String", "Len", "Printf", "Sprintf", "Errorf",
];

#[derive(Debug, Clone, Serialize)]
pub struct CallGraphNode {
    pub id: String,
    pub name: String,
    pub file_path: String,
    /// 0-indexed declaration line.
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallGraphEdge {
    pub from: String,
    pub to: String,
    /// 0-indexed call-site line.
    pub line: u32,
}

/// Directed caller→callee graph derived from the symbol index.
///
/// Edges are best-effort: a call whose target cannot be resolved to exactly
/// one known symbol is dropped, never invented.
#[derive(Debug, Default, Serialize)]
pub struct CallGraph {
    nodes: HashMap<String, CallGraphNode>,
    outgoing: HashMap<String, Vec<CallGraphEdge>>,
    incoming: HashMap<String, Vec<CallGraphEdge>>,
}

impl CallGraph {
    pub fn node(&self, id: &str) -> Option<&CallGraphNode> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.outgoing.values().map(Vec::len).sum()
    }

    /// Direct callers of a symbol.
    pub fn callers(&self, id: &str) -> Vec<&CallGraphNode> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|edge| self.nodes.get(&edge.from))
            .collect()
    }

    /// Direct callees of a symbol.
    pub fn callees(&self, id: &str) -> Vec<&CallGraphNode> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|edge| self.nodes.get(&edge.to))
            .collect()
    }

    /// Everything transitively affected by a change to `id`: BFS over
    /// callers up to `max_depth`, deduplicated by id.
    pub fn impact(&self, id: &str, max_depth: usize) -> Vec<&CallGraphNode> {
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(id);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        queue.push_back((id, 0));
        let mut out = Vec::new();

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for edge in self.incoming.get(current).into_iter().flatten() {
                if seen.insert(edge.from.as_str()) {
                    if let Some(node) = self.nodes.get(&edge.from) {
                        out.push(node);
                    }
                    queue.push_back((edge.from.as_str(), depth + 1));
                }
            }
        }
        out
    }

    /// Shortest caller→callee path between two symbols, if one exists within
    /// `max_depth` hops.
    pub fn call_chain(&self, from: &str, to: &str, max_depth: usize) -> Option<Vec<&CallGraphNode>> {
        if from == to {
            return self.nodes.get(from).map(|n| vec![n]);
        }
        let mut prev: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        queue.push_back((from, 0));
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(from);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for edge in self.outgoing.get(current).into_iter().flatten() {
                if !seen.insert(edge.to.as_str()) {
                    continue;
                }
                prev.insert(edge.to.as_str(), current);
                if edge.to == to {
                    let mut chain = vec![to];
                    let mut cursor = to;
                    while let Some(&p) = prev.get(cursor) {
                        chain.push(p);
                        cursor = p;
                    }
                    chain.reverse();
                    return chain
                        .into_iter()
                        .map(|id| self.nodes.get(id))
                        .collect::<Option<Vec<_>>>();
                }
                queue.push_back((edge.to.as_str(), depth + 1));
            }
        }
        None
    }
}

struct RawCall {
    callee: String,
    /// 0-indexed line of the call site.
    line: u32,
}

/// Build the call graph for the indexed files.
pub fn build(
    root: &Path,
    files: &[FileEntry],
    index: &SymbolIndex,
    cancel: &CancellationToken,
    events: &EventBus,
) -> CoreResult<CallGraph> {
    cancel.check()?;

    let mut graph = CallGraph::default();
    for symbol in index.query(|s| s.kind.is_callable()) {
        graph.nodes.insert(
            symbol.id.clone(),
            CallGraphNode {
                id: symbol.id.clone(),
                name: symbol.name.clone(),
                file_path: symbol.file_path.clone(),
                line: symbol.start_line,
                package: symbol.package.clone(),
            },
        );
    }

    // Per-file sweep: collect raw call sites in parallel, resolve serially.
    let per_file: Vec<Option<(String, Vec<RawCall>)>> = worker_pool().install(|| {
        files
            .par_iter()
            .map(|entry| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some((entry.rel_path.clone(), collect_file_calls(&entry.abs_path)))
            })
            .collect()
    });
    cancel.check()?;

    for item in per_file.into_iter().flatten() {
        let (rel_path, calls) = item;
        if calls.is_empty() {
            continue;
        }
        let file_symbols = index.query(|s| s.kind.is_callable() && s.file_path == rel_path);
        let caller_package = rel_path.rsplit_once('/').map(|(dir, _)| dir.to_string());

        for call in calls {
            // Tightest enclosing callable declaration is the caller.
            let Some(caller) = file_symbols
                .iter()
                .filter(|s| s.start_line <= call.line && call.line <= s.end_line)
                .min_by_key(|s| s.end_line - s.start_line)
            else {
                continue;
            };

            let Some(target) = resolve_callee(index, &call.callee, caller_package.as_deref())
            else {
                continue;
            };
            if target.id == caller.id {
                // Self-recursion adds no information to the graph.
                continue;
            }

            graph.outgoing.entry(caller.id.clone()).or_default().push(CallGraphEdge {
                from: caller.id.clone(),
                to: target.id.clone(),
                line: call.line,
            });
            graph.incoming.entry(target.id.clone()).or_default().push(CallGraphEdge {
                from: caller.id.clone(),
                to: target.id.clone(),
                line: call.line,
            });
        }
    }

    events.publish(CoreEvent::CallGraphBuilt {
        root: root.to_string_lossy().to_string(),
        nodes: graph.node_count(),
        edges: graph.edge_count(),
    });

    Ok(graph)
}

/// Resolve a callee name: intra-package candidates first, then a unique
/// cross-package match; anything ambiguous is dropped.
fn resolve_callee(
    index: &SymbolIndex,
    callee: &str,
    caller_package: Option<&str>,
) -> Option<Symbol> {
    let candidates: Vec<Symbol> = index
        .find_by_name(callee, None)
        .into_iter()
        .filter(|s| s.kind.is_callable())
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let in_package: Vec<&Symbol> = candidates
        .iter()
        .filter(|s| s.package.as_deref() == caller_package)
        .collect();
    match in_package.len() {
        1 => return Some(in_package[0].clone()),
        n if n > 1 => return None,
        _ => {}
    }

    if candidates.len() == 1 {
        Some(candidates[0].clone())
    } else {
        None
    }
}

fn collect_file_calls(abs_path: &Path) -> Vec<RawCall> {
    let Some(kind) = languages::detect(abs_path) else {
        return vec![];
    };
    let Some(language) = languages::grammar(kind) else {
        return vec![];
    };
    let Ok(raw) = std::fs::read(abs_path) else {
        return vec![];
    };
    if raw.contains(&0u8) {
        return vec![];
    }
    let source_text = String::from_utf8_lossy(&raw).into_owned();
    if crate::symbols::is_minified_or_generated(&source_text) {
        return vec![];
    }

    let mut parser = Parser::new();
    if parser.set_language(&language).is_err() {
        return vec![];
    }
    let Some(tree) = parser.parse(&source_text, None) else {
        return vec![];
    };

    let mut out = Vec::new();
    collect_call_targets(tree.root_node(), source_text.as_bytes(), &mut out);
    out.retain(|call| !CALL_NOISE.contains(&call.callee.as_str()));
    out
}

/// Walk the AST for call nodes, skipping comment and string subtrees.
///
/// Handles `call_expression` (Rust/TS/JS/Go), `method_call_expression`
/// (Rust), `method_invocation` (Java), and `call` (Python).
fn collect_call_targets(node: Node, source: &[u8], out: &mut Vec<RawCall>) {
    let kind = node.kind();
    if kind.contains("comment") || kind.contains("string") || kind.contains("template") {
        return;
    }

    if matches!(
        kind,
        "call_expression" | "method_call_expression" | "method_invocation" | "call"
    ) {
        let target_node = node
            .child_by_field_name("function")
            .or_else(|| node.child_by_field_name("method"))
            .or_else(|| node.child_by_field_name("name"));
        if let Some(target) = target_node {
            if let Some(callee) = trailing_call_identifier(target, source) {
                out.push(RawCall {
                    callee: callee.to_string(),
                    line: node.start_position().row as u32,
                });
            }
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_call_targets(child, source, out);
    }
}

fn trailing_call_identifier<'a>(target: Node, source: &'a [u8]) -> Option<&'a str> {
    // Python attribute calls keep the trailing identifier in `attribute:`.
    if target.kind() == "attribute" {
        if let Some(attr) = target.child_by_field_name("attribute") {
            let text = std::str::from_utf8(&source[attr.start_byte()..attr.end_byte()]).ok()?;
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
    }

    // Fallback: full slice minus module/attribute/namespace prefixes.
    let text = std::str::from_utf8(&source[target.start_byte()..target.end_byte()]).ok()?;
    let last = text
        .rsplit(|c: char| c == '.' || c == ':')
        .next()
        .unwrap_or("")
        .trim();
    if last.is_empty() || !last.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some(last)
}

// ---------------------------------------------------------------------------
// Reference finder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Reference {
    pub file_path: String,
    /// 1-indexed line of the occurrence.
    pub line: u32,
    /// 1-indexed column of the occurrence.
    pub column: u32,
    pub line_text: String,
    /// A small window around the occurrence, hit line marked with `>>>`.
    pub context: String,
    pub is_definition: bool,
}

/// All semantic occurrences of `(name, kind)` across the project.
///
/// AST-level matching: identifier leaves only, with comment and string
/// subtrees pruned, so docs and string constants never produce hits.
pub fn find_references(
    files: &[FileEntry],
    index: &SymbolIndex,
    name: &str,
    kind: Option<SymbolKind>,
    cancel: &CancellationToken,
) -> CoreResult<Vec<Reference>> {
    cancel.check()?;

    let definition_lines: HashSet<(String, u32)> = index
        .find_by_name(name, kind)
        .into_iter()
        .map(|s| (s.file_path.clone(), s.start_line))
        .collect();

    let per_file: Vec<Option<Vec<Reference>>> = worker_pool().install(|| {
        files
            .par_iter()
            .map(|entry| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(file_references(entry, name, &definition_lines))
            })
            .collect()
    });
    cancel.check()?;

    let mut out: Vec<Reference> = per_file.into_iter().flatten().flatten().collect();
    out.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then_with(|| a.line.cmp(&b.line))
            .then_with(|| a.column.cmp(&b.column))
    });
    Ok(out)
}

/// References excluding the declaration sites themselves.
pub fn find_usages(
    files: &[FileEntry],
    index: &SymbolIndex,
    name: &str,
    kind: Option<SymbolKind>,
    cancel: &CancellationToken,
) -> CoreResult<Vec<Reference>> {
    let mut refs = find_references(files, index, name, kind, cancel)?;
    refs.retain(|r| !r.is_definition);
    Ok(refs)
}

fn file_references(
    entry: &FileEntry,
    name: &str,
    definition_lines: &HashSet<(String, u32)>,
) -> Vec<Reference> {
    let Some(kind) = languages::detect(&entry.abs_path) else {
        return vec![];
    };
    let Some(language) = languages::grammar(kind) else {
        return vec![];
    };
    let Ok(raw) = std::fs::read(&entry.abs_path) else {
        return vec![];
    };
    if raw.contains(&0u8) {
        return vec![];
    }
    let Ok(source_text) = std::str::from_utf8(&raw) else {
        return vec![];
    };
    // Fast substring pre-filter before paying the parse cost.
    if !source_text.contains(name) {
        return vec![];
    }

    let mut parser = Parser::new();
    if parser.set_language(&language).is_err() {
        return vec![];
    }
    let Some(tree) = parser.parse(source_text, None) else {
        return vec![];
    };

    let mut hits: Vec<(u32, u32)> = Vec::new();
    collect_identifier_refs(tree.root_node(), source_text.as_bytes(), name, &mut hits);
    hits.sort();
    hits.dedup();

    let lines: Vec<&str> = source_text.lines().collect();
    hits.into_iter()
        .map(|(row, col)| {
            let line_text = lines.get(row as usize).copied().unwrap_or("").to_string();
            Reference {
                file_path: entry.rel_path.clone(),
                line: row + 1,
                column: col + 1,
                line_text,
                context: context_window(&lines, row as usize, 2),
                is_definition: definition_lines.contains(&(entry.rel_path.clone(), row)),
            }
        })
        .collect()
}

/// Recursively collect AST leaf identifier nodes matching `name`, skipping
/// comment and string-literal subtrees entirely.
fn collect_identifier_refs(node: Node, source: &[u8], name: &str, out: &mut Vec<(u32, u32)>) {
    let kind = node.kind();
    if kind.contains("comment")
        || matches!(
            kind,
            "string"
                | "string_literal"
                | "raw_string_literal"
                | "interpreted_string_literal"
                | "char_literal"
                | "template_string"
                | "string_fragment"
        )
    {
        return;
    }

    if node.child_count() == 0 {
        if matches!(
            kind,
            "identifier"
                | "type_identifier"
                | "field_identifier"
                | "property_identifier"
                | "shorthand_property_identifier"
        ) {
            let slice = &source[node.start_byte()..node.end_byte()];
            if let Ok(text) = std::str::from_utf8(slice) {
                if text == name {
                    let pos = node.start_position();
                    out.push((pos.row as u32, pos.column as u32));
                }
            }
        }
        return;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_identifier_refs(child, source, name, out);
    }
}

/// Context block around a 0-indexed line, the hit line marked with `>>>`.
fn context_window(lines: &[&str], target: usize, ctx: usize) -> String {
    let start = target.saturating_sub(ctx);
    let end = (target + ctx + 1).min(lines.len());
    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, l)| {
            let marker = if start + i == target { ">>>" } else { "   " };
            format!("  {marker} {:>4} | {}", start + i + 1, l)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
