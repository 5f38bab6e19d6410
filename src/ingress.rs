use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::builder::{parse_options, BuildOptions, ContextBuilder};
use crate::callgraph::{self, Reference};
use crate::cancel::CancellationToken;
use crate::container::AnalysisContainer;
use crate::error::CoreResult;
use crate::events::EventBus;
use crate::ignore_rules::IgnoreOptions;
use crate::scanner::FileNode;
use crate::smart::{self, SmartContextRequest, SmartContextResult};
use crate::splitter::{self, SplitOptions};
use crate::store::ContextArtefact;
use crate::symbols::{IndexStats, SymbolKind};
use crate::tokens::HeuristicCounter;

/// Request-shaped front door for the desktop bridge.
///
/// Every method acquires a cancellation token keyed by the logical
/// operation; issuing the same operation again cancels the in-flight
/// predecessor (last-writer-wins), and an optional deadline turns into
/// `OperationCancelled` once exceeded.
pub struct Ingress {
    container: Arc<AnalysisContainer>,
    inflight: Mutex<HashMap<String, CancellationToken>>,
}

impl Ingress {
    pub fn new(container: Arc<AnalysisContainer>) -> Self {
        Self {
            container,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn container(&self) -> &Arc<AnalysisContainer> {
        &self.container
    }

    pub fn events(&self) -> &EventBus {
        self.container.events()
    }

    fn begin(&self, key: &str, deadline: Option<Duration>) -> CancellationToken {
        let token = match deadline {
            Some(timeout) => CancellationToken::with_deadline(timeout),
            None => CancellationToken::new(),
        };
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = inflight.insert(key.to_string(), token.clone()) {
            previous.cancel();
        }
        token
    }

    fn counter(&self) -> CoreResult<HeuristicCounter> {
        let cfg = self.container.config()?;
        Ok(HeuristicCounter::new(cfg.token_estimator.chars_per_token))
    }

    pub fn select_project(&self, path: &Path) -> CoreResult<()> {
        self.container.set_project(path)
    }

    pub fn list_files(
        &self,
        use_gitignore: bool,
        use_custom_ignore: bool,
        custom_rules: &str,
        deadline: Option<Duration>,
    ) -> CoreResult<Vec<FileNode>> {
        let token = self.begin("listFiles", deadline);
        let opts = IgnoreOptions {
            use_gitignore,
            use_custom: use_custom_ignore,
            custom_rules: custom_rules.to_string(),
        };
        self.container.tree(&opts, &token)
    }

    pub fn ensure_symbol_index_built(
        &self,
        deadline: Option<Duration>,
    ) -> CoreResult<IndexStats> {
        let token = self.begin("ensureSymbolIndexBuilt", deadline);
        self.container.ensure_index_built(&token)
    }

    /// Build a context from wire-shaped options (unknown keys → warnings).
    pub fn build_context(
        &self,
        name: &str,
        selected_paths: &[String],
        options: &serde_json::Value,
        deadline: Option<Duration>,
    ) -> CoreResult<ContextArtefact> {
        let (options, warnings) = parse_options(options);
        self.build_context_with_options(name, selected_paths, &options, warnings, deadline)
    }

    /// Typed-options variant used by the CLI and tests.
    pub fn build_context_with_options(
        &self,
        name: &str,
        selected_paths: &[String],
        options: &BuildOptions,
        warnings: Vec<String>,
        deadline: Option<Duration>,
    ) -> CoreResult<ContextArtefact> {
        let root = self.container.root()?;
        // One in-flight build per project: a new request cancels the old.
        let key = format!("buildContext:{}", root.display());
        let token = self.begin(&key, deadline);

        let cfg = self.container.config()?;
        let counter = self.counter()?;
        let store = self.container.store();
        let mut builder =
            ContextBuilder::new(&root, &store, &counter, self.container.events());
        builder.max_file_bytes = cfg.token_estimator.max_file_bytes;
        builder.build(name, selected_paths, options, warnings, &token)
    }

    pub fn get_context_lines(
        &self,
        context_id: &str,
        start_line: usize,
        end_line: usize,
    ) -> CoreResult<Vec<String>> {
        self.container.store().get_lines(context_id, start_line, end_line)
    }

    pub fn get_context_content(&self, context_id: &str) -> CoreResult<String> {
        self.container.store().get_full_content(context_id)
    }

    pub fn list_project_contexts(&self) -> CoreResult<Vec<ContextArtefact>> {
        let root = self.container.root()?;
        let root = root.to_string_lossy();
        self.container.store().list(Some(root.as_ref()))
    }

    pub fn delete_context(&self, context_id: &str) -> CoreResult<()> {
        self.container.store().delete(context_id)
    }

    pub fn collect_smart_context(
        &self,
        request: &SmartContextRequest,
        deadline: Option<Duration>,
    ) -> CoreResult<SmartContextResult> {
        let root = self.container.root()?;
        let key = format!("collectSmartContext:{}", root.display());
        let token = self.begin(&key, deadline);

        self.container.ensure_index_built(&token)?;
        let graph = self.container.call_graph(&token)?;
        let files = self.container.file_entries(&token)?;
        let index = self.container.symbol_index()?;
        let index = index.lock().unwrap_or_else(|e| e.into_inner());
        let cfg = self.container.config()?;
        let counter = self.counter()?;
        smart::collect(
            &files,
            &index,
            &graph,
            request,
            &cfg.smart,
            &counter,
            &token,
        )
    }

    pub fn find_references(
        &self,
        symbol_name: &str,
        kind: Option<SymbolKind>,
        deadline: Option<Duration>,
    ) -> CoreResult<Vec<Reference>> {
        let token = self.begin("findReferences", deadline);
        self.container.ensure_index_built(&token)?;
        let files = self.container.file_entries(&token)?;
        let index = self.container.symbol_index()?;
        let index = index.lock().unwrap_or_else(|e| e.into_inner());
        callgraph::find_references(&files, &index, symbol_name, kind, &token)
    }

    pub fn find_usages(
        &self,
        symbol_name: &str,
        kind: Option<SymbolKind>,
        deadline: Option<Duration>,
    ) -> CoreResult<Vec<Reference>> {
        let mut refs = self.find_references(symbol_name, kind, deadline)?;
        refs.retain(|r| !r.is_definition);
        Ok(refs)
    }

    /// Split a persisted context into token-bounded chunks.
    pub fn split_context(
        &self,
        context_id: &str,
        options: &SplitOptions,
    ) -> CoreResult<Vec<String>> {
        let body = self.get_context_content(context_id)?;
        let counter = self.counter()?;
        Ok(splitter::split(&body, options, &counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::OutputFormat;
    use crate::container::Factories;
    use crate::ignore_rules::IgnoreMatcher;
    use crate::store::ContextStore;
    use crate::symbols::SymbolIndex;
    use std::path::PathBuf;

    fn ingress_for(project: &Path) -> (tempfile::TempDir, Ingress) {
        let state = tempfile::tempdir().unwrap();
        let cache: PathBuf = state.path().join("symbol_cache");
        let contexts: PathBuf = state.path().join("contexts");
        let factories = Factories {
            ignore: Box::new(|root, opts| IgnoreMatcher::compile(root, opts)),
            symbol_index: Box::new(move |root| SymbolIndex::open(root, Some(cache.as_path()))),
            context_store: Box::new(move || ContextStore::open(contexts.clone())),
        };
        let container =
            Arc::new(AnalysisContainer::new(factories, EventBus::disabled()).unwrap());
        let ingress = Ingress::new(container);
        ingress.select_project(project).unwrap();
        (state, ingress)
    }

    #[test]
    fn end_to_end_build_and_paginated_read() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("a.rs"), "pub fn a() {}\n").unwrap();
        std::fs::write(project.path().join("b.rs"), "pub fn b() {}\n").unwrap();
        let (_state, ingress) = ingress_for(project.path());

        let options = BuildOptions {
            output_format: OutputFormat::Manifest,
            ..Default::default()
        };
        let artefact = ingress
            .build_context_with_options(
                "selection",
                &["a.rs".to_string(), "b.rs".to_string()],
                &options,
                vec![],
                None,
            )
            .unwrap();

        assert_eq!(artefact.files, vec!["a.rs", "b.rs"]);
        let lines = ingress.get_context_lines(&artefact.id, 1, 1).unwrap();
        assert_eq!(lines, vec!["# Streaming Context"]);

        let listed = ingress.list_project_contexts().unwrap();
        assert_eq!(listed.len(), 1);
        ingress.delete_context(&artefact.id).unwrap();
        assert!(ingress.get_context_content(&artefact.id).is_err());
    }

    #[test]
    fn a_new_build_cancels_the_previous_token_for_the_same_project() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("a.rs"), "pub fn a() {}\n").unwrap();
        let (_state, ingress) = ingress_for(project.path());

        let root = ingress.container().root().unwrap();
        let key = format!("buildContext:{}", root.display());
        let first = ingress.begin(&key, None);
        assert!(!first.is_cancelled());

        ingress
            .build_context_with_options(
                "second",
                &["a.rs".to_string()],
                &BuildOptions::default(),
                vec![],
                None,
            )
            .unwrap();
        assert!(first.is_cancelled(), "previous in-flight token must be cancelled");
    }

    #[test]
    fn references_flow_through_the_facade() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(
            project.path().join("lib.rs"),
            "pub fn used() {}\npub fn caller() { used(); }\n",
        )
        .unwrap();
        let (_state, ingress) = ingress_for(project.path());

        let refs = ingress.find_references("used", None, None).unwrap();
        assert_eq!(refs.len(), 2);
        let usages = ingress.find_usages("used", None, None).unwrap();
        assert_eq!(usages.len(), 1);
        assert!(!usages[0].is_definition);
    }
}
