use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use shotgun_core::builder::{BuildOptions, ContextBuilder, OutputFormat};
use shotgun_core::cancel::CancellationToken;
use shotgun_core::container::{AnalysisContainer, Factories};
use shotgun_core::error::CoreError;
use shotgun_core::events::{CoreEvent, EventBus};
use shotgun_core::ignore_rules::IgnoreMatcher;
use shotgun_core::ingress::Ingress;
use shotgun_core::store::ContextStore;
use shotgun_core::symbols::SymbolIndex;
use shotgun_core::tokens::{HeuristicCounter, TokenCounter};

fn factories(state: &Path) -> Factories {
    let cache: PathBuf = state.join("symbol_cache");
    let contexts: PathBuf = state.join("contexts");
    Factories {
        ignore: Box::new(|root, opts| IgnoreMatcher::compile(root, opts)),
        symbol_index: Box::new(move |root| SymbolIndex::open(root, Some(cache.as_path()))),
        context_store: Box::new(move || ContextStore::open(contexts.clone())),
    }
}

fn ingress_with_events(project: &Path, state: &Path) -> (Ingress, std::sync::mpsc::Receiver<CoreEvent>) {
    let (bus, rx) = EventBus::bounded(64);
    let container = Arc::new(AnalysisContainer::new(factories(state), bus).unwrap());
    let ingress = Ingress::new(container);
    ingress.select_project(project).unwrap();
    (ingress, rx)
}

/// 200 runes: ten lines of twenty characters.
fn two_hundred_rune_file() -> String {
    "aaaaaaaaaaaaaaaaaaa\n".repeat(10)
}

#[test]
fn budgeted_build_keeps_two_of_three_files_and_orders_events() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    for name in ["f1.txt", "f2.txt", "f3.txt"] {
        std::fs::write(project.path().join(name), two_hundred_rune_file()).unwrap();
    }
    let (ingress, rx) = ingress_with_events(project.path(), state.path());

    let options = BuildOptions {
        max_tokens: 100,
        output_format: OutputFormat::Manifest,
        ..Default::default()
    };
    let artefact = ingress
        .build_context_with_options(
            "budgeted",
            &["f1.txt".into(), "f2.txt".into(), "f3.txt".into()],
            &options,
            vec![],
            None,
        )
        .unwrap();

    assert_eq!(artefact.files, vec!["f1.txt", "f2.txt"]);
    assert!(artefact.token_count <= 100);
    let reason = artefact.metadata.skipped_reasons.get("f3.txt").unwrap();
    assert!(
        reason == "excluded:tokens" || reason == "truncated:tokens",
        "unexpected reason {reason}"
    );
    assert!(artefact.metadata.skipped_files.contains(&"f3.txt".to_string()));

    // Progress (1,3) then (2,3), then contextReady — in that order.
    let mut progress: Vec<(usize, usize)> = Vec::new();
    let mut ready_after_progress = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            CoreEvent::ContextProgress { current, total, .. } => {
                assert!(!ready_after_progress, "progress after contextReady");
                progress.push((current, total));
            }
            CoreEvent::ContextReady { context_id, .. } => {
                assert_eq!(context_id, artefact.id);
                ready_after_progress = true;
            }
            _ => {}
        }
    }
    assert_eq!(progress, vec![(1, 3), (2, 3)]);
    assert!(ready_after_progress, "missing contextReady");
}

#[test]
fn traversal_paths_are_skipped_while_the_rest_builds() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(project.path().join("kept.txt"), "safe content\n").unwrap();
    let (ingress, _rx) = ingress_with_events(project.path(), state.path());

    let artefact = ingress
        .build_context_with_options(
            "traversal",
            &["../secret".into(), "kept.txt".into()],
            &BuildOptions::default(),
            vec![],
            None,
        )
        .unwrap();

    assert_eq!(artefact.files, vec!["kept.txt"]);
    assert_eq!(
        artefact.metadata.skipped_reasons.get("../secret").map(String::as_str),
        Some("outside project")
    );
}

#[test]
fn token_limit_is_fatal_when_not_even_the_first_file_fits() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    // A single long line cannot be cut at a line boundary under 3 tokens.
    std::fs::write(project.path().join("big.txt"), "x".repeat(400)).unwrap();
    let (ingress, _rx) = ingress_with_events(project.path(), state.path());

    let options = BuildOptions {
        max_tokens: 3,
        ..Default::default()
    };
    let err = ingress
        .build_context_with_options("over", &["big.txt".into()], &options, vec![], None)
        .unwrap_err();
    match err {
        CoreError::TokenLimitExceeded { actual, limit } => {
            assert_eq!(limit, 3);
            assert!(actual > limit);
        }
        other => panic!("expected TokenLimitExceeded, got {other}"),
    }
}

/// Counter wrapper that cancels the build token after the first file has
/// been accounted, deterministically landing the cancellation between file
/// boundaries.
struct CancelAfterFirst {
    inner: HeuristicCounter,
    token: CancellationToken,
    calls: AtomicUsize,
}

impl TokenCounter for CancelAfterFirst {
    fn count(&self, text: &str) -> usize {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.token.cancel();
        }
        self.inner.count(text)
    }
}

#[test]
fn cancel_mid_build_leaves_no_artefact_and_no_ready_event() {
    let project = tempfile::tempdir().unwrap();
    let contexts = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(project.path().join(name), two_hundred_rune_file()).unwrap();
    }

    let store = ContextStore::open(contexts.path().to_path_buf()).unwrap();
    let (bus, rx) = EventBus::bounded(64);
    let token = CancellationToken::new();
    let counter = CancelAfterFirst {
        inner: HeuristicCounter::default(),
        token: token.clone(),
        calls: AtomicUsize::new(0),
    };

    let builder = ContextBuilder::new(project.path(), &store, &counter, &bus);
    let err = builder
        .build(
            "cancelled",
            &["a.txt".into(), "b.txt".into(), "c.txt".into()],
            &BuildOptions::default(),
            vec![],
            &token,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::OperationCancelled));

    // No .ctx or sidecar may survive a cancelled build.
    let leftovers: Vec<_> = std::fs::read_dir(contexts.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".ctx") || n.ends_with(".json"))
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");

    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, CoreEvent::ContextReady { .. }),
            "contextReady after cancellation"
        );
    }
}

#[test]
fn empty_selection_is_invalid_input() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let (ingress, _rx) = ingress_with_events(project.path(), state.path());
    let err = ingress
        .build_context_with_options("empty", &[], &BuildOptions::default(), vec![], None)
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
}

#[test]
fn xml_and_plain_formats_render_through_the_same_pipeline() {
    let project = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(project.path().join("a.rs"), "pub fn a() {}\n").unwrap();
    let (ingress, _rx) = ingress_with_events(project.path(), state.path());

    let xml = ingress
        .build_context_with_options(
            "xml",
            &["a.rs".into()],
            &BuildOptions {
                output_format: OutputFormat::Xml,
                ..Default::default()
            },
            vec![],
            None,
        )
        .unwrap();
    let body = ingress.get_context_content(&xml.id).unwrap();
    assert!(body.contains(r#"<file path="a.rs">"#));

    let plain = ingress
        .build_context_with_options(
            "plain",
            &["a.rs".into()],
            &BuildOptions {
                output_format: OutputFormat::Plain,
                ..Default::default()
            },
            vec![],
            None,
        )
        .unwrap();
    let body = ingress.get_context_content(&plain.id).unwrap();
    assert!(body.contains("--- File: a.rs ---"));
}
