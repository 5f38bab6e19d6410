use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::tokens::TokenCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitStrategy {
    #[default]
    Smart,
    Token,
    File,
}

#[derive(Debug, Clone, Copy)]
pub struct SplitOptions {
    /// 0 = unlimited (single chunk unless file markers force splits).
    pub max_tokens_per_chunk: usize,
    pub overlap_tokens: usize,
    pub strategy: SplitStrategy,
}

fn file_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^--- File: .+ ---\s*$").expect("file marker regex"))
}

/// Partition a finished context into chunks under a token budget.
///
/// - `file`: split only on `--- File: … ---` section boundaries.
/// - `token`: split on line boundaries when the running count would exceed
///   the cap.
/// - `smart`: prefer file boundaries, fall back to token boundaries
///   mid-file, duplicating up to `overlap_tokens` of trailing lines at the
///   head of the next chunk.
///
/// With `overlap_tokens == 0` the concatenation of the chunks reproduces the
/// input exactly.
pub fn split(text: &str, opts: &SplitOptions, counter: &dyn TokenCounter) -> Vec<String> {
    if text.is_empty() {
        return vec![];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    let flush = |chunks: &mut Vec<String>, current: &mut String| {
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
        }
    };

    for part in text.split_inclusive('\n') {
        let line = part.strip_suffix('\n').unwrap_or(part);
        let at_marker = file_marker().is_match(line);
        let cap = opts.max_tokens_per_chunk;

        match opts.strategy {
            SplitStrategy::File => {
                if at_marker {
                    flush(&mut chunks, &mut current);
                }
            }
            SplitStrategy::Token => {
                if cap > 0 && !current.is_empty() {
                    let candidate_tokens = counter.count(&format!("{current}{part}"));
                    if candidate_tokens > cap {
                        flush(&mut chunks, &mut current);
                    }
                }
            }
            SplitStrategy::Smart => {
                if at_marker {
                    // Clean section boundary: no overlap duplication.
                    flush(&mut chunks, &mut current);
                } else if cap > 0 && !current.is_empty() {
                    let candidate_tokens = counter.count(&format!("{current}{part}"));
                    if candidate_tokens > cap {
                        let overlap = trailing_overlap(&current, opts.overlap_tokens, counter);
                        flush(&mut chunks, &mut current);
                        current = overlap;
                    }
                }
            }
        }

        current.push_str(part);
    }
    flush(&mut chunks, &mut current);
    chunks
}

/// Trailing whole lines of `chunk` whose combined token count stays within
/// `budget`; duplicated at the head of the next chunk.
fn trailing_overlap(chunk: &str, budget: usize, counter: &dyn TokenCounter) -> String {
    if budget == 0 {
        return String::new();
    }
    let parts: Vec<&str> = chunk.split_inclusive('\n').collect();
    let mut start = parts.len();
    while start > 0 {
        let candidate: String = parts[start - 1..].concat();
        if counter.count(&candidate) > budget {
            break;
        }
        start -= 1;
    }
    parts[start..].concat()
}
