use chrono::Utc;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use crate::cancel::CancellationToken;
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::languages;
use crate::splitter::SplitStrategy;
use crate::store::{ArtefactMetadata, ContextArtefact, ContextStore};
use crate::tokens::TokenCounter;
use crate::transform::{transform, TransformOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Manifest,
    Xml,
    Markdown,
    Plain,
}

/// Recognized build options. Unknown keys in a request are ignored with a
/// warning rather than rejected, so older UIs keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOptions {
    /// 0 = unlimited.
    pub max_tokens: usize,
    /// Per-file read ceiling in megabytes; 0 = use the ambient default.
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: usize,
    pub strip_comments: bool,
    pub include_manifest: bool,
    pub include_line_numbers: bool,
    pub exclude_tests: bool,
    pub output_format: OutputFormat,
    pub collapse_empty_lines: bool,
    pub strip_license: bool,
    pub compact_data_files: bool,
    pub trim_whitespace: bool,
    pub split_strategy: SplitStrategy,
    pub max_tokens_per_chunk: usize,
    pub overlap_tokens: usize,
    pub force_stream: bool,
    pub enable_progress_events: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_tokens: 0,
            max_memory_mb: 0,
            strip_comments: false,
            include_manifest: false,
            include_line_numbers: false,
            exclude_tests: false,
            output_format: OutputFormat::Manifest,
            collapse_empty_lines: false,
            strip_license: false,
            compact_data_files: false,
            trim_whitespace: false,
            split_strategy: SplitStrategy::Smart,
            max_tokens_per_chunk: 0,
            overlap_tokens: 0,
            force_stream: false,
            enable_progress_events: true,
        }
    }
}

const KNOWN_OPTION_KEYS: &[&str] = &[
    "maxTokens",
    "maxMemoryMB",
    "stripComments",
    "includeManifest",
    "includeLineNumbers",
    "includeTests",
    "excludeTests",
    "outputFormat",
    "collapseEmptyLines",
    "stripLicense",
    "compactDataFiles",
    "trimWhitespace",
    "splitStrategy",
    "maxTokensPerChunk",
    "overlapTokens",
    "forceStream",
    "enableProgressEvents",
];

/// Parse an options object from the wire. Unknown keys become warnings;
/// `includeTests: false` is accepted as a spelling of `excludeTests: true`.
pub fn parse_options(value: &serde_json::Value) -> (BuildOptions, Vec<String>) {
    let mut warnings = Vec::new();

    let Some(object) = value.as_object() else {
        if !value.is_null() {
            warnings.push("options must be an object; using defaults".to_string());
        }
        return (BuildOptions::default(), warnings);
    };

    let mut object = object.clone();
    for key in object.keys() {
        if !KNOWN_OPTION_KEYS.contains(&key.as_str()) {
            warnings.push(format!("unknown option `{key}` ignored"));
        }
    }
    object.retain(|key, _| KNOWN_OPTION_KEYS.contains(&key.as_str()));

    if let Some(include_tests) = object.remove("includeTests").and_then(|v| v.as_bool()) {
        object
            .entry("excludeTests".to_string())
            .or_insert(serde_json::Value::Bool(!include_tests));
    }

    match serde_json::from_value::<BuildOptions>(serde_json::Value::Object(object)) {
        Ok(options) => (options, warnings),
        Err(err) => {
            warnings.push(format!("malformed options ({err}); using defaults"));
            (BuildOptions::default(), warnings)
        }
    }
}

impl BuildOptions {
    fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            strip_license: self.strip_license,
            strip_comments: self.strip_comments,
            trim_whitespace: self.trim_whitespace,
            collapse_empty_lines: self.collapse_empty_lines,
            compact_data_files: self.compact_data_files,
        }
    }
}

/// Build phases, in order. Tracked for diagnostics; cancellation can land in
/// any of them and unwinds without leaving temp files behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildPhase {
    Reading,
    Transforming,
    Packing,
}

struct RenderedFile {
    rel_path: String,
    content: String,
}

/// The selection → filter → read → transform → pack → persist pipeline.
pub struct ContextBuilder<'a> {
    root: &'a Path,
    store: &'a ContextStore,
    counter: &'a dyn TokenCounter,
    events: &'a EventBus,
    /// Ambient per-file ceiling applied when options carry no `maxMemoryMB`.
    pub max_file_bytes: u64,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(
        root: &'a Path,
        store: &'a ContextStore,
        counter: &'a dyn TokenCounter,
        events: &'a EventBus,
    ) -> Self {
        Self {
            root,
            store,
            counter,
            events,
            max_file_bytes: 512 * 1024,
        }
    }

    pub fn build(
        &self,
        name: &str,
        selected_paths: &[String],
        options: &BuildOptions,
        warnings: Vec<String>,
        cancel: &CancellationToken,
    ) -> CoreResult<ContextArtefact> {
        match self.build_inner(name, selected_paths, options, warnings, cancel) {
            Ok(artefact) => Ok(artefact),
            Err(CoreError::OperationCancelled) => Err(CoreError::OperationCancelled),
            Err(err) => {
                self.events.publish(CoreEvent::ContextError {
                    context_id: None,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn build_inner(
        &self,
        name: &str,
        selected_paths: &[String],
        options: &BuildOptions,
        mut warnings: Vec<String>,
        cancel: &CancellationToken,
    ) -> CoreResult<ContextArtefact> {
        if selected_paths.is_empty() {
            return Err(CoreError::InvalidInput("empty selection".to_string()));
        }
        cancel.check()?;

        let mut skipped_files: Vec<String> = Vec::new();
        let mut skipped_reasons: BTreeMap<String, String> = BTreeMap::new();
        let skip = |path: &str,
                        reason: &str,
                        skipped_files: &mut Vec<String>,
                        skipped_reasons: &mut BTreeMap<String, String>| {
            skipped_files.push(path.to_string());
            skipped_reasons.insert(path.to_string(), reason.to_string());
        };

        // Steps 1–2: path containment and the optional test filter. Order of
        // survivors equals the caller's selection order.
        let mut candidates: Vec<(PathBuf, String)> = Vec::new();
        for raw in selected_paths {
            match contain_path(self.root, raw) {
                Some((abs, rel)) => {
                    if options.exclude_tests && languages::is_test_file(&rel) {
                        skip(&rel, "test", &mut skipped_files, &mut skipped_reasons);
                        continue;
                    }
                    candidates.push((abs, rel));
                }
                None => {
                    skip(raw, "outside project", &mut skipped_files, &mut skipped_reasons);
                }
            }
        }

        let total = candidates.len();
        let context_id = self.store.next_id();
        let byte_cap = if options.max_memory_mb > 0 {
            (options.max_memory_mb as u64) * 1024 * 1024
        } else {
            self.max_file_bytes
        };

        let mut rendered: Vec<RenderedFile> = Vec::new();
        let mut included_tokens = 0usize;
        let mut included_count = 0usize;
        let mut first_over_budget: Option<usize> = None;

        for (abs, rel) in candidates {
            cancel.check()?;
            log::trace!("{context_id}: {:?} {rel}", BuildPhase::Reading);

            // Step 3: read, honouring the memory cap before loading.
            let size = match std::fs::metadata(&abs) {
                Ok(meta) => meta.len(),
                Err(err) => {
                    warnings.push(format!("{rel}: {err}"));
                    skip(&rel, "unreadable", &mut skipped_files, &mut skipped_reasons);
                    continue;
                }
            };
            if size > byte_cap {
                skip(&rel, "too large", &mut skipped_files, &mut skipped_reasons);
                continue;
            }
            let bytes = match std::fs::read(&abs) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warnings.push(format!("{rel}: {err}"));
                    skip(&rel, "unreadable", &mut skipped_files, &mut skipped_reasons);
                    continue;
                }
            };
            if bytes.contains(&0u8) {
                skip(&rel, "binary", &mut skipped_files, &mut skipped_reasons);
                continue;
            }

            // Step 4: transform.
            log::trace!("{context_id}: {:?} {rel}", BuildPhase::Transforming);
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let content = transform(&text, &abs, &options.transform_options());

            // Step 5: token accounting.
            let file_tokens = self.counter.count(&content);
            let (content, file_tokens, truncated) = if options.max_tokens == 0
                || included_tokens + file_tokens <= options.max_tokens
            {
                (content, file_tokens, false)
            } else {
                let remaining = options.max_tokens.saturating_sub(included_tokens);
                match truncate_at_line_boundary(&content, remaining, self.counter) {
                    Some(partial) => {
                        let tokens = self.counter.count(&partial);
                        (partial, tokens, true)
                    }
                    None => {
                        if included_count == 0 {
                            first_over_budget = Some(file_tokens);
                        }
                        skip(
                            &rel,
                            "excluded:tokens",
                            &mut skipped_files,
                            &mut skipped_reasons,
                        );
                        continue;
                    }
                }
            };
            if truncated {
                warnings.push(format!("{rel}: truncated to fit the token budget"));
                skip(
                    &rel,
                    "truncated:tokens",
                    &mut skipped_files,
                    &mut skipped_reasons,
                );
            }

            included_tokens += file_tokens;
            included_count += 1;
            rendered.push(RenderedFile {
                rel_path: rel,
                content,
            });

            if options.enable_progress_events {
                self.events.publish(CoreEvent::ContextProgress {
                    context_id: context_id.clone(),
                    current: included_count,
                    total,
                });
            }
        }

        if rendered.is_empty() {
            if let Some(actual) = first_over_budget {
                return Err(CoreError::TokenLimitExceeded {
                    actual,
                    limit: options.max_tokens,
                });
            }
            return Err(CoreError::InvalidInput(format!(
                "selection produced no content: {}",
                summarize_reasons(&skipped_reasons)
            )));
        }

        // Step 6: render.
        log::debug!(
            "{context_id}: {:?} after {included_count} files",
            BuildPhase::Packing
        );
        cancel.check()?;
        let body = render_body(self.root, &rendered, options)?;

        let artefact = ContextArtefact {
            id: context_id.clone(),
            name: name.to_string(),
            project_path: self.root.to_string_lossy().to_string(),
            files: rendered.iter().map(|f| f.rel_path.clone()).collect(),
            line_count: body.lines().count(),
            total_bytes: body.len() as u64,
            token_count: included_tokens,
            created_at: Utc::now().to_rfc3339(),
            metadata: ArtefactMetadata {
                warnings,
                skipped_files,
                skipped_reasons,
            },
        };

        // Step 7: persist atomically, then announce.
        cancel.check()?;
        self.store.create(&artefact, &body)?;
        self.events.publish(CoreEvent::ContextReady {
            context_id: context_id.clone(),
            name: artefact.name.clone(),
            file_count: artefact.files.len(),
            token_count: artefact.token_count,
        });
        Ok(artefact)
    }
}

/// Normalise a selected path lexically and require it to stay inside `root`.
/// Returns `(absolute, relative-with-forward-slashes)`.
fn contain_path(root: &Path, raw: &str) -> Option<(PathBuf, String)> {
    let joined = {
        let candidate = Path::new(raw);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            root.join(candidate)
        }
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    let rel = normalized.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some((
        normalized.clone(),
        rel.to_string_lossy().replace('\\', "/"),
    ))
}

/// Longest prefix of whole lines whose token count stays within `budget`.
/// `None` when not even the first line fits.
fn truncate_at_line_boundary(
    content: &str,
    budget: usize,
    counter: &dyn TokenCounter,
) -> Option<String> {
    if budget == 0 {
        return None;
    }
    let mut kept = String::new();
    for part in content.split_inclusive('\n') {
        let candidate_len = kept.len() + part.len();
        let candidate = &content[..candidate_len];
        if counter.count(candidate) > budget {
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

fn summarize_reasons(reasons: &BTreeMap<String, String>) -> String {
    if reasons.is_empty() {
        return "no files matched".to_string();
    }
    reasons
        .iter()
        .map(|(path, reason)| format!("{path} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn decorate(content: &str, options: &BuildOptions) -> String {
    if !options.include_line_numbers {
        return content.to_string();
    }
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:>5} | {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

fn header_block(root: &Path) -> String {
    format!(
        "# Streaming Context\nProject Path: {}\nGenerated: {}\n\n",
        root.display(),
        Utc::now().to_rfc3339()
    )
}

fn manifest_section(files: &[RenderedFile]) -> String {
    let mut out = String::from("## Manifest\n");
    for file in files {
        out.push_str(&file.rel_path);
        out.push('\n');
    }
    out.push('\n');
    out
}

fn render_body(
    root: &Path,
    files: &[RenderedFile],
    options: &BuildOptions,
) -> CoreResult<String> {
    match options.output_format {
        OutputFormat::Xml => render_xml(root, files, options),
        OutputFormat::Manifest => {
            let mut out = header_block(root);
            if options.include_manifest {
                out.push_str(&manifest_section(files));
            }
            for file in files {
                let fence = languages::code_fence(Path::new(&file.rel_path));
                out.push_str(&format!("## File: {}\n", file.rel_path));
                out.push_str(&format!("```{fence}\n"));
                out.push_str(&decorate(&file.content, options));
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("```\n\n");
            }
            Ok(out)
        }
        OutputFormat::Markdown => {
            let mut out = header_block(root);
            if options.include_manifest {
                out.push_str(&manifest_section(files));
            }
            for file in files {
                out.push_str(&format!("## File: {}\n\n", file.rel_path));
                out.push_str(&decorate(&file.content, options));
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push('\n');
            }
            Ok(out)
        }
        OutputFormat::Plain => {
            let mut out = header_block(root);
            if options.include_manifest {
                out.push_str(&manifest_section(files));
            }
            for file in files {
                out.push_str(&format!("--- File: {} ---\n", file.rel_path));
                out.push_str(&decorate(&file.content, options));
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(out)
        }
    }
}

fn xml_err<E: std::fmt::Display>(e: E) -> CoreError {
    CoreError::InvalidInput(format!("xml rendering failed: {e}"))
}

fn render_xml(
    root: &Path,
    files: &[RenderedFile],
    options: &BuildOptions,
) -> CoreResult<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_err)?;

    let mut context_el = BytesStart::new("context");
    let project = root.to_string_lossy().to_string();
    context_el.push_attribute(("project", project.as_str()));
    let generated = Utc::now().to_rfc3339();
    context_el.push_attribute(("generated", generated.as_str()));
    writer.write_event(Event::Start(context_el)).map_err(xml_err)?;

    if options.include_manifest {
        let paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        writer
            .write_event(Event::Start(BytesStart::new("manifest")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::CData(BytesCData::new(paths.join("\n"))))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("manifest")))
            .map_err(xml_err)?;
    }

    for file in files {
        let mut file_el = BytesStart::new("file");
        file_el.push_attribute(("path", file.rel_path.as_str()));
        writer.write_event(Event::Start(file_el)).map_err(xml_err)?;
        let content = decorate(&file.content, options);
        writer
            .write_event(Event::CData(BytesCData::new(content.as_str())))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("file")))
            .map_err(xml_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("context")))
        .map_err(xml_err)?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes)
        .map_err(|e| CoreError::InvalidInput(format!("xml rendering produced invalid utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicCounter;

    #[test]
    fn unknown_options_warn_but_do_not_fail() {
        let value = serde_json::json!({
            "maxTokens": 50,
            "outputFormat": "xml",
            "frobnicate": true
        });
        let (options, warnings) = parse_options(&value);
        assert_eq!(options.max_tokens, 50);
        assert_eq!(options.output_format, OutputFormat::Xml);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("frobnicate"));
    }

    #[test]
    fn include_tests_false_spells_exclude_tests() {
        let value = serde_json::json!({ "includeTests": false });
        let (options, warnings) = parse_options(&value);
        assert!(options.exclude_tests);
        assert!(warnings.is_empty());
    }

    #[test]
    fn containment_rejects_traversal_and_accepts_relatives() {
        let root = Path::new("/p");
        assert!(contain_path(root, "../secret").is_none());
        assert!(contain_path(root, "a/../../secret").is_none());
        let (_, rel) = contain_path(root, "src/./main.rs").unwrap();
        assert_eq!(rel, "src/main.rs");
        let (_, rel) = contain_path(root, "/p/inner/file.rs").unwrap();
        assert_eq!(rel, "inner/file.rs");
    }

    #[test]
    fn truncation_cuts_on_line_boundaries_within_budget() {
        let counter = HeuristicCounter::default();
        // 10 lines of 11 chars each (with newline 12): ~3 tokens per line.
        let content: String = (0..10).map(|i| format!("line-{i:05}\n")).collect();
        let partial = truncate_at_line_boundary(&content, 9, &counter).unwrap();
        assert!(partial.ends_with('\n'));
        assert!(counter.count(&partial) <= 9);
        assert!(partial.lines().count() < 10);

        assert!(truncate_at_line_boundary(&content, 0, &counter).is_none());
    }

    #[test]
    fn xml_rendering_wraps_files_in_context() {
        let files = vec![RenderedFile {
            rel_path: "src/a.rs".into(),
            content: "fn a() {}\n".into(),
        }];
        let body = render_xml(Path::new("/p"), &files, &BuildOptions::default()).unwrap();
        assert!(body.starts_with("<?xml"));
        assert!(body.contains("<context"));
        assert!(body.contains(r#"<file path="src/a.rs">"#));
        assert!(body.contains("fn a() {}"));
        assert!(body.ends_with("</context>"));
    }

    #[test]
    fn plain_format_emits_splitter_compatible_separators() {
        let files = vec![
            RenderedFile {
                rel_path: "a.rs".into(),
                content: "a\n".into(),
            },
            RenderedFile {
                rel_path: "b.rs".into(),
                content: "b\n".into(),
            },
        ];
        let options = BuildOptions {
            output_format: OutputFormat::Plain,
            ..Default::default()
        };
        let body = render_body(Path::new("/p"), &files, &options).unwrap();
        assert!(body.contains("--- File: a.rs ---\n"));
        assert!(body.contains("--- File: b.rs ---\n"));
    }

    #[test]
    fn line_numbers_are_applied_at_render_time() {
        let files = vec![RenderedFile {
            rel_path: "a.rs".into(),
            content: "one\ntwo\n".into(),
        }];
        let options = BuildOptions {
            include_line_numbers: true,
            ..Default::default()
        };
        let body = render_body(Path::new("/p"), &files, &options).unwrap();
        assert!(body.contains("    1 | one"));
        assert!(body.contains("    2 | two"));
    }
}
