use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::languages::{self, CommentStyle};

/// Transform passes applied to file content before packing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformOptions {
    pub strip_license: bool,
    pub strip_comments: bool,
    pub trim_whitespace: bool,
    pub collapse_empty_lines: bool,
    pub compact_data_files: bool,
}

fn license_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(license|licence|copyright|spdx-license-identifier|all rights reserved)\b")
            .expect("license regex")
    })
}

fn contains_todo_fixme(s: &str) -> bool {
    let up = s.to_ascii_uppercase();
    up.contains("TODO") || up.contains("FIXME")
}

fn is_shebang(trimmed: &str) -> bool {
    trimmed.starts_with("#!") && !trimmed.starts_with("#![")
}

/// Pure content transformation with a fixed pass order: license strip,
/// comment strip, whitespace trim, empty-line collapse, data-file
/// compaction. Every pass is idempotent, so the whole pipeline is too.
pub fn transform(text: &str, path: &Path, opts: &TransformOptions) -> String {
    let style = languages::comment_style(path);
    let mut out = text.to_string();

    if opts.strip_license {
        if let Some(style) = style {
            out = strip_license_header(&out, &style);
        }
    }
    if opts.strip_comments {
        if let Some(style) = style {
            out = strip_comment_lines(&out, &style);
        }
    }
    if opts.trim_whitespace {
        out = trim_trailing_whitespace(&out);
    }
    if opts.collapse_empty_lines {
        out = collapse_empty_lines(&out);
    }
    if opts.compact_data_files {
        out = compact_data_file(&out, path);
    }
    out
}

/// Remove leading comment blocks that read like license headers. Repeats
/// until the file no longer opens with one, so stacked headers cannot
/// survive a single application.
fn strip_license_header(text: &str, style: &CommentStyle) -> String {
    let mut current = text.to_string();
    loop {
        let Some(next) = strip_one_license_header(&current, style) else {
            return current;
        };
        current = next;
    }
}

fn strip_one_license_header(text: &str, style: &CommentStyle) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut idx = 0;

    // Keep an optional shebang and any leading blank lines.
    if lines.first().map(|l| is_shebang(l.trim_start())).unwrap_or(false) {
        idx = 1;
    }
    while idx < lines.len() && lines[idx].trim().is_empty() {
        idx += 1;
    }
    if idx >= lines.len() {
        return None;
    }

    let first = lines[idx].trim_start();
    let header_range = if let Some((_, close)) = style.block.filter(|(open, _)| first.starts_with(open)) {
        let mut end = idx;
        while end < lines.len() && !lines[end].contains(close) {
            end += 1;
        }
        if end >= lines.len() {
            return None; // unterminated; leave untouched
        }
        (idx, end)
    } else if style.line.iter().any(|p| first.starts_with(p)) {
        let mut end = idx;
        while end + 1 < lines.len() {
            let t = lines[end + 1].trim_start();
            if style.line.iter().any(|p| t.starts_with(p)) && !is_shebang(t) {
                end += 1;
            } else {
                break;
            }
        }
        (idx, end)
    } else {
        return None;
    };

    let header_text = lines[header_range.0..=header_range.1].join("\n");
    if !license_marker().is_match(&header_text) || contains_todo_fixme(&header_text) {
        return None;
    }

    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    kept.extend(&lines[..header_range.0]);
    let mut rest = header_range.1 + 1;
    // Swallow the blank line(s) the header left behind.
    while rest < lines.len() && lines[rest].trim().is_empty() {
        rest += 1;
    }
    kept.extend(&lines[rest..]);

    let mut out = kept.join("\n");
    if text.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    Some(out)
}

/// Drop comment-only lines and line-anchored block comments, preserving
/// shebangs and anything carrying TODO/FIXME.
fn strip_comment_lines(text: &str, style: &CommentStyle) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out_lines: Vec<&str> = Vec::with_capacity(lines.len());
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_start();

        if is_shebang(trimmed) || contains_todo_fixme(trimmed) {
            out_lines.push(line);
            i += 1;
            continue;
        }

        if let Some((open, close)) = style.block {
            if trimmed.starts_with(open) {
                let mut j = i;
                let mut block_text = String::new();
                loop {
                    block_text.push_str(lines[j]);
                    block_text.push('\n');
                    if lines[j].contains(close) || j + 1 >= lines.len() {
                        break;
                    }
                    j += 1;
                }
                if contains_todo_fixme(&block_text) {
                    out_lines.extend(&lines[i..=j]);
                }
                i = j + 1;
                continue;
            }
        }

        if !trimmed.is_empty() && style.line.iter().any(|p| trimmed.starts_with(p)) {
            i += 1;
            continue;
        }

        out_lines.push(line);
        i += 1;
    }

    let mut out = out_lines.join("\n");
    if text.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

fn trim_trailing_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for part in text.split_inclusive('\n') {
        if let Some(line) = part.strip_suffix('\n') {
            out.push_str(line.trim_end_matches([' ', '\t', '\r']));
            out.push('\n');
        } else {
            out.push_str(part.trim_end_matches([' ', '\t', '\r']));
        }
    }
    out
}

/// Collapse runs of blank lines to a single empty line. Whitespace-only
/// lines count as blank and normalise to empty.
fn collapse_empty_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_blank = false;
    let mut wrote_any = false;

    for part in text.split_inclusive('\n') {
        let line = part.strip_suffix('\n').unwrap_or(part);
        if line.trim().is_empty() {
            pending_blank = wrote_any;
            continue;
        }
        if pending_blank {
            out.push('\n');
            pending_blank = false;
        }
        out.push_str(line);
        out.push('\n');
        wrote_any = true;
    }

    if !text.ends_with('\n') {
        // The source had no final newline; keep that shape.
        if out.ends_with('\n') {
            out.pop();
        }
    }
    out
}

/// Minify JSON and normalise YAML by re-emitting through their parsers.
/// Unparseable content passes through untouched.
fn compact_data_file(text: &str, path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "json" => serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|v| serde_json::to_string(&v).ok())
            .unwrap_or_else(|| text.to_string()),
        "yaml" | "yml" => serde_yaml::from_str::<serde_yaml::Value>(text)
            .ok()
            .and_then(|v| serde_yaml::to_string(&v).ok())
            .unwrap_or_else(|| text.to_string()),
        _ => text.to_string(),
    }
}
