use std::path::{Path, PathBuf};
use std::sync::Arc;

use shotgun_core::cancel::CancellationToken;
use shotgun_core::container::{AnalysisContainer, Factories};
use shotgun_core::events::EventBus;
use shotgun_core::ignore_rules::IgnoreMatcher;
use shotgun_core::ingress::Ingress;
use shotgun_core::scanner::FileEntry;
use shotgun_core::smart::SmartContextRequest;
use shotgun_core::store::ContextStore;
use shotgun_core::symbols::{xxh3_hex, SymbolIndex};

fn factories(state: &Path) -> Factories {
    let cache: PathBuf = state.join("symbol_cache");
    let contexts: PathBuf = state.join("contexts");
    Factories {
        ignore: Box::new(|root, opts| IgnoreMatcher::compile(root, opts)),
        symbol_index: Box::new(move |root| SymbolIndex::open(root, Some(cache.as_path()))),
        context_store: Box::new(move || ContextStore::open(contexts.clone())),
    }
}

fn entries_for(project: &Path, names: &[&str]) -> Vec<FileEntry> {
    names
        .iter()
        .map(|name| FileEntry {
            abs_path: project.join(name),
            rel_path: (*name).to_string(),
            size: std::fs::metadata(project.join(name)).unwrap().len(),
        })
        .collect()
}

#[test]
fn reindexing_reparses_only_the_mutated_file() {
    let project = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    std::fs::write(
        project.path().join("stable.rs"),
        "pub fn stable() -> u32 { 1 }\n",
    )
    .unwrap();
    std::fs::write(
        project.path().join("volatile.rs"),
        "pub fn volatile() -> u32 { 2 }\n",
    )
    .unwrap();

    let mut index = SymbolIndex::open(project.path(), Some(cache.path()));
    let files = entries_for(project.path(), &["stable.rs", "volatile.rs"]);
    let first = index
        .index_project(&files, &CancellationToken::new(), &EventBus::disabled())
        .unwrap();
    assert_eq!(first.reparsed, 2);

    let stable_hash_before = index.file_hash("stable.rs").unwrap().to_string();
    let volatile_hash_before = index.file_hash("volatile.rs").unwrap().to_string();

    std::fs::write(
        project.path().join("volatile.rs"),
        "pub fn volatile() -> u32 { 99 }\n",
    )
    .unwrap();

    let files = entries_for(project.path(), &["stable.rs", "volatile.rs"]);
    let second = index
        .index_project(&files, &CancellationToken::new(), &EventBus::disabled())
        .unwrap();
    assert_eq!(second.reparsed, 1, "only the mutated file reparses");
    assert_eq!(second.reused, 1);

    assert_eq!(index.file_hash("stable.rs").unwrap(), stable_hash_before);
    let volatile_hash_after = index.file_hash("volatile.rs").unwrap().to_string();
    assert_ne!(volatile_hash_after, volatile_hash_before);
    assert_eq!(
        volatile_hash_after,
        xxh3_hex(&std::fs::read(project.path().join("volatile.rs")).unwrap())
    );

    // The persisted cache carries the refreshed rows.
    index.close().unwrap();
    let reopened = SymbolIndex::open(project.path(), Some(cache.path()));
    assert_eq!(reopened.file_hash("volatile.rs").unwrap(), volatile_hash_after);
}

#[test]
fn smart_context_walks_the_call_stack_from_the_source_file() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(
        project.path().join("parser.rs"),
        r#"
pub fn parse_header(input: &str) -> usize {
    decode_len(input)
}

pub fn decode_len(input: &str) -> usize {
    input.len()
}
"#,
    )
    .unwrap();
    std::fs::write(
        project.path().join("reader.rs"),
        r#"
pub fn read_message(input: &str) -> usize {
    parse_header(input)
}
"#,
    )
    .unwrap();
    std::fs::write(project.path().join("unrelated.rs"), "pub fn misc() {}\n").unwrap();

    let container =
        Arc::new(AnalysisContainer::new(factories(state.path()), EventBus::disabled()).unwrap());
    let ingress = Ingress::new(container);
    ingress.select_project(project.path()).unwrap();

    let request = SmartContextRequest {
        task: "fix bug in parse_header".to_string(),
        selected_files: vec![],
        selected_code: None,
        source_file: Some("parser.rs".to_string()),
        max_tokens: 4_000,
        max_depth: 2,
    };
    let result = ingress.collect_smart_context(&request, None).unwrap();

    let by_path = |path: &str| result.files.iter().find(|f| f.path == path);

    let parser = by_path("parser.rs").expect("source file included");
    assert_eq!(parser.reason, "selected");

    let reader = by_path("reader.rs").expect("caller file included via the call graph");
    assert_eq!(reader.reason, "callgraph:callers");

    assert!(result.files.iter().all(|f| !f.reason.is_empty()));
    assert!(result.token_estimate <= 4_000);
    let total: usize = result.files.iter().map(|f| f.tokens).sum();
    assert_eq!(total, result.token_estimate);

    let stack = result.call_stack.expect("call stack present");
    assert!(stack.iter().any(|frame| frame.contains("parse_header")));
    assert!(stack.iter().any(|frame| frame.contains("read_message")));
}

#[test]
fn smart_context_budget_truncates_and_excludes_in_rank_order() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    // Seed file fits; everything else competes for the remainder.
    std::fs::write(project.path().join("seed.rs"), "pub fn seed() {}\n").unwrap();
    for i in 0..4 {
        std::fs::write(
            project.path().join(format!("filler_{i}.rs")),
            "x".repeat(40).to_string() + "\n",
        )
        .unwrap();
    }

    let container =
        Arc::new(AnalysisContainer::new(factories(state.path()), EventBus::disabled()).unwrap());
    let ingress = Ingress::new(container);
    ingress.select_project(project.path()).unwrap();

    let request = SmartContextRequest {
        task: "review seed".to_string(),
        selected_files: vec!["seed.rs".to_string()],
        selected_code: None,
        source_file: None,
        max_tokens: 12,
        max_depth: 1,
    };
    let result = ingress.collect_smart_context(&request, None).unwrap();

    assert!(result.token_estimate <= 12);
    assert_eq!(result.files.first().map(|f| f.path.as_str()), Some("seed.rs"));
    assert!(
        !result.excluded_files.is_empty() || !result.truncated_files.is_empty(),
        "the budget must push some candidates out"
    );
    for path in &result.excluded_files {
        assert!(result.files.iter().all(|f| &f.path != path));
    }
    assert!((0.3..=0.95).contains(&result.confidence));
}

#[test]
fn project_switch_resets_the_active_analysis() {
    let project_a = tempfile::tempdir().unwrap();
    std::fs::write(project_a.path().join("a.rs"), "pub fn only_in_a() {}\n").unwrap();
    let project_b = tempfile::tempdir().unwrap();
    std::fs::write(project_b.path().join("b.rs"), "pub fn only_in_b() {}\n").unwrap();
    let state = tempfile::tempdir().unwrap();

    let container =
        Arc::new(AnalysisContainer::new(factories(state.path()), EventBus::disabled()).unwrap());
    let ingress = Ingress::new(container);

    ingress.select_project(project_a.path()).unwrap();
    let refs = ingress.find_references("only_in_a", None, None).unwrap();
    assert_eq!(refs.len(), 1);

    ingress.select_project(project_b.path()).unwrap();
    let refs = ingress.find_references("only_in_a", None, None).unwrap();
    assert!(refs.is_empty());
    let refs = ingress.find_references("only_in_b", None, None).unwrap();
    assert_eq!(refs.len(), 1);
}
