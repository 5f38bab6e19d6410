use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::callgraph::CallGraph;
use crate::cancel::CancellationToken;
use crate::config::SmartConfig;
use crate::error::CoreResult;
use crate::languages;
use crate::scanner::FileEntry;
use crate::symbols::{Symbol, SymbolIndex};
use crate::tokens::TokenCounter;

/// Shipped stop-word list (English + Russian); extensible via config.
const STOP_WORDS_EN: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "could", "should", "may", "might", "must", "can", "this",
    "that", "these", "those", "it", "its", "as", "if", "then", "than", "so", "not", "no",
    "all", "any", "some", "there", "here", "when", "where", "how", "what", "which", "who",
    "why", "fix", "bug", "add", "make", "need", "please", "implement", "update", "change",
];

const STOP_WORDS_RU: &[&str] = &[
    "и", "в", "на", "с", "по", "для", "не", "что", "это", "как", "из", "к", "у", "о", "же",
    "за", "бы", "от", "до", "или", "если", "то", "так", "но", "при", "надо", "нужно",
    "сделать", "исправить", "добавить", "изменить", "ошибку", "баг",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SmartContextRequest {
    pub task: String,
    pub selected_files: Vec<String>,
    pub selected_code: Option<String>,
    pub source_file: Option<String>,
    /// 0 = unlimited.
    pub max_tokens: usize,
    pub max_depth: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartFile {
    pub path: String,
    pub content: String,
    pub tokens: usize,
    pub relevance: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartContextResult {
    pub files: Vec<SmartFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_stack: Option<Vec<String>>,
    pub token_estimate: usize,
    pub truncated_files: Vec<String>,
    pub excluded_files: Vec<String>,
    pub confidence: f64,
}

/// Lowercased task words minus stop-words and anything shorter than 2 chars.
/// Underscores survive so identifier-shaped words match symbol names.
fn extract_keywords(task: &str, extra_stop_words: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for word in task
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
    {
        if word.chars().count() < 2 {
            continue;
        }
        if STOP_WORDS_EN.contains(&word)
            || STOP_WORDS_RU.contains(&word)
            || extra_stop_words.iter().any(|s| s == word)
        {
            continue;
        }
        if seen.insert(word.to_string()) {
            out.push(word.to_string());
        }
    }
    out
}

const EXCLUDED_DIRS: &[&str] = &["node_modules", "vendor", "dist", ".git", "target"];

fn in_excluded_dir(rel_path: &str) -> bool {
    rel_path
        .split('/')
        .any(|segment| EXCLUDED_DIRS.contains(&segment))
}

fn is_entrypoint(file_name: &str) -> bool {
    matches!(
        file_name,
        "main.rs"
            | "lib.rs"
            | "mod.rs"
            | "index.ts"
            | "index.tsx"
            | "index.js"
            | "main.ts"
            | "main.go"
            | "main.py"
            | "__init__.py"
            | "app.py"
            | "App.java"
    )
}

fn layer_boost(lower_path: &str) -> bool {
    ["/domain/", "/service/", "/services/", "/core/", "/usecase/", "/handlers/"]
        .iter()
        .any(|layer| lower_path.contains(layer))
        || lower_path.starts_with("domain/")
        || lower_path.starts_with("core/")
        || lower_path.starts_with("services/")
}

/// Keyword-class → file-name rules: a task that talks about configuration
/// should pull in config files even when no literal name matches.
const FILE_RULES: &[(&[&str], &[&str])] = &[
    (&["config", "configuration", "settings"], &["config", "settings"]),
    (&["api", "endpoint", "route", "request"], &["api", "route", "handler", "controller"]),
    (&["model", "schema", "entity"], &["model", "schema", "entity"]),
    (&["parse", "parser", "parsing"], &["parse", "parser", "lexer"]),
    (&["test", "tests", "testing"], &["test", "spec"]),
];

struct ScoredFile<'a> {
    entry: &'a FileEntry,
    score: f64,
    reason: String,
}

fn score_file<'a>(
    entry: &'a FileEntry,
    keywords: &[String],
    config: &SmartConfig,
) -> Option<ScoredFile<'a>> {
    let rel = entry.rel_path.as_str();
    if in_excluded_dir(rel) {
        return None;
    }
    let lower = rel.to_lowercase();
    let file_name = lower.rsplit('/').next().unwrap_or(&lower).to_string();
    let stem = file_name.split('.').next().unwrap_or(&file_name).to_string();

    let weights = &config.scoring;
    let mut score = 0.0;
    let mut matched_kw: Option<&str> = None;

    for kw in keywords {
        if stem.contains(kw.as_str()) {
            score += weights.name_hit;
            matched_kw.get_or_insert(kw.as_str());
        } else if lower.contains(kw.as_str()) {
            score += weights.path_hit;
            matched_kw.get_or_insert(kw.as_str());
        }
    }
    if languages::is_code_extension(rel) {
        score += weights.code_ext;
    }
    for (kw_class, name_parts) in FILE_RULES {
        let class_hit = keywords.iter().any(|k| kw_class.contains(&k.as_str()));
        let name_hit = name_parts.iter().any(|p| file_name.contains(p));
        if class_hit && name_hit {
            score += weights.file_rule;
            break;
        }
    }
    if layer_boost(&lower) {
        score += weights.layer;
    }
    if is_entrypoint(&file_name) {
        score += weights.entrypoint;
    }

    let reason = match matched_kw {
        Some(kw) => format!("keyword:{kw}"),
        None => "ranked".to_string(),
    };
    Some(ScoredFile {
        entry,
        score,
        reason,
    })
}

/// Locate the symbol the task is about inside `source_file`: a callable
/// whose name matches a task keyword, a name mentioned in the selected code,
/// or the file's first callable as a fallback.
fn enclosing_symbol(
    index: &SymbolIndex,
    source_rel: &str,
    keywords: &[String],
    selected_code: Option<&str>,
) -> Option<Symbol> {
    let symbols = index.query(|s| s.file_path == source_rel && s.kind.is_callable());
    if symbols.is_empty() {
        return None;
    }
    if let Some(found) = symbols
        .iter()
        .find(|s| keywords.iter().any(|k| s.name.to_lowercase() == *k))
    {
        return Some(found.clone());
    }
    if let Some(found) = symbols
        .iter()
        .find(|s| keywords.iter().any(|k| s.name.to_lowercase().contains(k.as_str())))
    {
        return Some(found.clone());
    }
    if let Some(code) = selected_code {
        if let Some(found) = symbols.iter().find(|s| code.contains(&s.name)) {
            return Some(found.clone());
        }
    }
    symbols.first().cloned()
}

struct CallStackExpansion {
    /// rel path → direction reason.
    files: Vec<(String, String)>,
    stack: Vec<String>,
}

fn expand_call_stack(
    graph: &CallGraph,
    origin: &Symbol,
    max_depth: usize,
) -> CallStackExpansion {
    let mut stack = vec![format!(
        "{} ({}:{})",
        origin.name,
        origin.file_path,
        origin.start_line + 1
    )];
    let mut files: Vec<(String, String)> = Vec::new();
    let mut seen_files: HashSet<String> = HashSet::new();
    seen_files.insert(origin.file_path.clone());

    for (direction, reason) in [(Direction::Callers, "callgraph:callers"), (Direction::Callees, "callgraph:callees")] {
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(origin.id.clone());
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((origin.id.clone(), 0));

        while let Some((id, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let next = match direction {
                Direction::Callers => graph.callers(&id),
                Direction::Callees => graph.callees(&id),
            };
            for node in next {
                if !seen.insert(node.id.clone()) {
                    continue;
                }
                stack.push(format!("{} ({}:{})", node.name, node.file_path, node.line + 1));
                if seen_files.insert(node.file_path.clone()) {
                    files.push((node.file_path.clone(), reason.to_string()));
                }
                queue.push_back((node.id.clone(), depth + 1));
            }
        }
    }

    CallStackExpansion { files, stack }
}

enum Direction {
    Callers,
    Callees,
}

/// Largest prefix of `content` ending at a symbol boundary (preferred) or a
/// line boundary that fits the remaining token budget.
fn truncate_preferring_symbols(
    content: &str,
    rel_path: &str,
    index: &SymbolIndex,
    budget: usize,
    counter: &dyn TokenCounter,
) -> Option<String> {
    if budget == 0 {
        return None;
    }
    let parts: Vec<&str> = content.split_inclusive('\n').collect();

    let mut boundaries: Vec<usize> = index
        .query(|s| s.file_path == rel_path)
        .iter()
        .map(|s| s.end_line as usize + 1)
        .filter(|&end| end <= parts.len())
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();

    for &end in boundaries.iter().rev() {
        let candidate: String = parts[..end].concat();
        if counter.count(&candidate) <= budget {
            return Some(candidate);
        }
    }

    // Line-boundary fallback.
    let mut kept = String::new();
    for part in &parts {
        let candidate_len = kept.len() + part.len();
        if counter.count(&content[..candidate_len]) > budget {
            break;
        }
        kept.push_str(part);
    }
    if kept.is_empty() {
        None
    } else {
        Some(kept)
    }
}

/// Task-driven expansion: seed files, keyword/symbol ranking, and an
/// optional call-stack walk, all under one token budget.
#[allow(clippy::too_many_arguments)]
pub fn collect(
    files: &[FileEntry],
    index: &SymbolIndex,
    graph: &CallGraph,
    request: &SmartContextRequest,
    config: &SmartConfig,
    counter: &dyn TokenCounter,
    cancel: &CancellationToken,
) -> CoreResult<SmartContextResult> {
    cancel.check()?;

    let keywords = extract_keywords(&request.task, &config.extra_stop_words);
    let by_rel: HashMap<&str, &FileEntry> =
        files.iter().map(|f| (f.rel_path.as_str(), f)).collect();

    // 1. Seed set: user selection plus the source file.
    let mut ordered: Vec<(String, f64, String)> = Vec::new();
    let mut queued: HashSet<String> = HashSet::new();
    let mut seed_count = 0usize;
    for selected in request
        .selected_files
        .iter()
        .chain(request.source_file.iter())
    {
        let rel = selected.replace('\\', "/");
        if queued.insert(rel.clone()) {
            ordered.push((rel, 1.0, "selected".to_string()));
            seed_count += 1;
        }
    }

    // 4. Call-stack expansion before generic ranking: these files carry a
    // fixed high relevance.
    let mut call_stack = None;
    if let Some(source) = &request.source_file {
        let source_rel = source.replace('\\', "/");
        if let Some(origin) =
            enclosing_symbol(index, &source_rel, &keywords, request.selected_code.as_deref())
        {
            let expansion = expand_call_stack(graph, &origin, request.max_depth.max(1));
            for (rel, reason) in expansion.files {
                if queued.insert(rel.clone()) {
                    ordered.push((rel, config.callgraph_relevance, reason));
                }
            }
            call_stack = Some(expansion.stack);
        }
    }

    // 2–3. Score and rank every remaining candidate.
    let mut scored: Vec<ScoredFile> = files
        .iter()
        .filter(|entry| !queued.contains(&entry.rel_path))
        .filter_map(|entry| score_file(entry, &keywords, config))
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let depth_a = a.entry.rel_path.matches('/').count();
                let depth_b = b.entry.rel_path.matches('/').count();
                depth_a.cmp(&depth_b)
            })
            .then_with(|| a.entry.rel_path.len().cmp(&b.entry.rel_path.len()))
            .then_with(|| a.entry.rel_path.cmp(&b.entry.rel_path))
    });

    let max_weight_sum = {
        let w = &config.scoring;
        (w.name_hit + w.path_hit) * keywords.len().max(1) as f64
            + w.code_ext
            + w.file_rule
            + w.layer
            + w.entrypoint
    };
    let top_score = scored.first().map(|s| s.score).unwrap_or(0.0);

    for candidate in scored {
        let relevance = (candidate.score / max_weight_sum).clamp(0.0, 0.89);
        ordered.push((
            candidate.entry.rel_path.clone(),
            relevance,
            candidate.reason,
        ));
    }

    // 5. Budgeted accumulation in rank order.
    let mut result_files: Vec<SmartFile> = Vec::new();
    let mut truncated_files: Vec<String> = Vec::new();
    let mut excluded_files: Vec<String> = Vec::new();
    let mut total_tokens = 0usize;
    let mut budget_spent = false;

    for (rel, relevance, reason) in ordered {
        cancel.check()?;
        let Some(entry) = by_rel.get(rel.as_str()) else {
            excluded_files.push(rel);
            continue;
        };
        if budget_spent {
            excluded_files.push(rel);
            continue;
        }

        let Ok(bytes) = std::fs::read(&entry.abs_path) else {
            excluded_files.push(rel);
            continue;
        };
        if bytes.contains(&0u8) {
            excluded_files.push(rel);
            continue;
        }
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let tokens = counter.count(&content);

        if request.max_tokens == 0 || total_tokens + tokens <= request.max_tokens {
            total_tokens += tokens;
            result_files.push(SmartFile {
                path: rel,
                content,
                tokens,
                relevance,
                reason,
            });
            continue;
        }

        let remaining = request.max_tokens.saturating_sub(total_tokens);
        match truncate_preferring_symbols(&content, &rel, index, remaining, counter) {
            Some(partial) => {
                let tokens = counter.count(&partial);
                total_tokens += tokens;
                truncated_files.push(rel.clone());
                result_files.push(SmartFile {
                    path: rel,
                    content: partial,
                    tokens,
                    relevance,
                    reason,
                });
            }
            None => excluded_files.push(rel),
        }
        // The budget is spent either way; everything after this is excluded.
        budget_spent = true;
    }

    // 6. Confidence from the top score and the seed count.
    let normalized_top = if max_weight_sum > 0.0 {
        (top_score / max_weight_sum).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let confidence =
        (0.3 + 0.1 * seed_count.min(3) as f64 + 0.4 * normalized_top).clamp(0.3, 0.95);

    Ok(SmartContextResult {
        files: result_files,
        call_stack,
        token_estimate: total_tokens,
        truncated_files,
        excluded_files,
        confidence,
    })
}
