use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::callgraph::{self, CallGraph};
use crate::cancel::CancellationToken;
use crate::config::{self, Config};
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::ignore_rules::{IgnoreMatcher, IgnoreOptions};
use crate::scanner::{self, FileEntry, FileNode};
use crate::store::ContextStore;
use crate::symbols::{IndexStats, SymbolIndex};
use crate::watcher::TreeWatcher;

/// Constructor callbacks for everything the container instantiates, so the
/// core never constructs infrastructure types directly and tests can swap
/// in temp-dir-backed implementations.
pub struct Factories {
    pub ignore: Box<dyn Fn(&Path, &IgnoreOptions) -> CoreResult<IgnoreMatcher> + Send + Sync>,
    pub symbol_index: Box<dyn Fn(&Path) -> SymbolIndex + Send + Sync>,
    pub context_store: Box<dyn Fn() -> CoreResult<ContextStore> + Send + Sync>,
}

impl Factories {
    /// Production wiring: symbol cache and context store under
    /// `~/.shotgun-code`. The symbol cache is scoped per project root so two
    /// projects with identical relative paths never share rows.
    pub fn production(cfg: Config) -> Self {
        let store_dir = cfg.effective_contexts_dir();
        Self {
            ignore: Box::new(|root, opts| IgnoreMatcher::compile(root, opts)),
            symbol_index: Box::new(|root| {
                let scope = crate::symbols::xxh3_hex(root.to_string_lossy().as_bytes());
                SymbolIndex::open(root, Some(config::symbol_cache_dir().join(scope).as_path()))
            }),
            context_store: Box::new(move || ContextStore::open(store_dir.clone())),
        }
    }
}

struct ProjectState {
    root: PathBuf,
    config: Config,
    ignore_opts: IgnoreOptions,
    ignore: Arc<IgnoreMatcher>,
    files: Option<Arc<Vec<FileEntry>>>,
    index: Option<Arc<Mutex<SymbolIndex>>>,
    index_stats: Option<IndexStats>,
    graph: Option<Arc<CallGraph>>,
    watcher: Option<TreeWatcher>,
}

/// Per-process owner of the analysis subsystems, scoped to one active
/// project root. Accessors are lazy; switching projects drops every cache
/// keyed by the old root while the context store survives.
///
/// The lock is held only to read or swap pointers — index building, call
/// graph construction, and scanning all happen outside it.
pub struct AnalysisContainer {
    factories: Factories,
    events: EventBus,
    store: Arc<ContextStore>,
    state: RwLock<Option<ProjectState>>,
}

impl AnalysisContainer {
    pub fn new(factories: Factories, events: EventBus) -> CoreResult<Self> {
        let store = Arc::new((factories.context_store)()?);
        Ok(Self {
            factories,
            events,
            store,
            state: RwLock::new(None),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> Arc<ContextStore> {
        Arc::clone(&self.store)
    }

    /// Activate a project root. All caches keyed by the previous root
    /// (symbol index, call graph, scan cache, watcher) are dropped.
    pub fn set_project(&self, root: &Path) -> CoreResult<()> {
        let root = std::fs::canonicalize(root).map_err(|e| CoreError::io("open", root, e))?;
        if !root.is_dir() {
            return Err(CoreError::InvalidInput(format!(
                "project root is not a directory: {}",
                root.display()
            )));
        }

        let cfg = config::load_config(&root);
        let ignore_opts = IgnoreOptions::default();
        let ignore = Arc::new((self.factories.ignore)(&root, &ignore_opts)?);

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = Some(ProjectState {
            root,
            config: cfg,
            ignore_opts,
            ignore,
            files: None,
            index: None,
            index_stats: None,
            graph: None,
            watcher: None,
        });
        Ok(())
    }

    pub fn root(&self) -> CoreResult<PathBuf> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .as_ref()
            .map(|s| s.root.clone())
            .ok_or_else(|| CoreError::PreconditionFailed("no project selected".to_string()))
    }

    pub fn config(&self) -> CoreResult<Config> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .as_ref()
            .map(|s| s.config.clone())
            .ok_or_else(|| CoreError::PreconditionFailed("no project selected".to_string()))
    }

    /// Scan the project tree with explicit ignore flags. Also refreshes the
    /// cached matcher and invalidates the flat-file cache when the flags
    /// differ from the previous scan.
    pub fn tree(
        &self,
        opts: &IgnoreOptions,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<FileNode>> {
        let root = self.root()?;
        let matcher = Arc::new((self.factories.ignore)(&root, opts)?);
        let nodes = scanner::scan(&root, &matcher, cancel)?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = state.as_mut() {
            let flags_changed = state.ignore_opts.use_gitignore != opts.use_gitignore
                || state.ignore_opts.use_custom != opts.use_custom
                || state.ignore_opts.custom_rules != opts.custom_rules;
            state.ignore = matcher;
            state.ignore_opts = opts.clone();
            if flags_changed {
                state.files = None;
            }
        }
        Ok(nodes)
    }

    /// Flat list of scannable files, cached until the watcher reports a
    /// change or the ignore flags move.
    pub fn file_entries(&self, cancel: &CancellationToken) -> CoreResult<Arc<Vec<FileEntry>>> {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            let state = state
                .as_ref()
                .ok_or_else(|| CoreError::PreconditionFailed("no project selected".to_string()))?;
            if let Some(files) = &state.files {
                return Ok(Arc::clone(files));
            }
        }

        let (root, matcher) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            let state = state
                .as_ref()
                .ok_or_else(|| CoreError::PreconditionFailed("no project selected".to_string()))?;
            (state.root.clone(), Arc::clone(&state.ignore))
        };
        let nodes = scanner::scan(&root, &matcher, cancel)?;
        let files = Arc::new(scanner::collect_files(&nodes));

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = state.as_mut() {
            state.files = Some(Arc::clone(&files));
        }
        Ok(files)
    }

    /// Lazy symbol-index accessor; the index itself may not be built yet.
    pub fn symbol_index(&self) -> CoreResult<Arc<Mutex<SymbolIndex>>> {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            let state = state
                .as_ref()
                .ok_or_else(|| CoreError::PreconditionFailed("no project selected".to_string()))?;
            if let Some(index) = &state.index {
                return Ok(Arc::clone(index));
            }
        }

        let root = self.root()?;
        let index = Arc::new(Mutex::new((self.factories.symbol_index)(&root)));
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let state = state
            .as_mut()
            .ok_or_else(|| CoreError::PreconditionFailed("no project selected".to_string()))?;
        if let Some(existing) = &state.index {
            return Ok(Arc::clone(existing));
        }
        state.index = Some(Arc::clone(&index));
        Ok(index)
    }

    /// Build (or incrementally refresh) the symbol index over the current
    /// file set. Cheap when nothing changed: unchanged hashes skip reparse.
    pub fn ensure_index_built(&self, cancel: &CancellationToken) -> CoreResult<IndexStats> {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let Some(stats) = state.as_ref().and_then(|s| s.index_stats.clone()) {
                return Ok(stats);
            }
        }

        let files = self.file_entries(cancel)?;
        let index = self.symbol_index()?;
        let stats = {
            let mut index = index.lock().unwrap_or_else(|e| e.into_inner());
            index.index_project(&files, cancel, &self.events)?
        };

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = state.as_mut() {
            state.index_stats = Some(stats.clone());
        }
        Ok(stats)
    }

    /// Call graph over the current index; rebuilt after invalidation.
    pub fn call_graph(&self, cancel: &CancellationToken) -> CoreResult<Arc<CallGraph>> {
        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let Some(graph) = state.as_ref().and_then(|s| s.graph.clone()) {
                return Ok(graph);
            }
        }

        self.ensure_index_built(cancel)?;
        let root = self.root()?;
        let files = self.file_entries(cancel)?;
        let index = self.symbol_index()?;
        let graph = {
            let index = index.lock().unwrap_or_else(|e| e.into_inner());
            Arc::new(callgraph::build(
                &root,
                &files,
                &index,
                cancel,
                &self.events,
            )?)
        };

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = state.as_mut() {
            state.graph = Some(Arc::clone(&graph));
        }
        Ok(graph)
    }

    /// Start the filesystem watcher for the active project. Each debounced
    /// batch invalidates the symbol rows of the changed files, marks the
    /// call graph for rebuild, and publishes `fileTreeChanged`.
    pub fn start_watcher(self: &Arc<Self>) -> CoreResult<()> {
        let root = self.root()?;
        let debounce = Duration::from_millis(self.config()?.watcher.debounce_ms);
        let weak: Weak<AnalysisContainer> = Arc::downgrade(self);
        let watch_root = root.clone();

        let watcher = TreeWatcher::start(root, debounce, move |changed| {
            let Some(container) = weak.upgrade() else {
                return;
            };
            container.on_tree_changed(&watch_root, changed);
        })?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = state.as_mut() {
            state.watcher = Some(watcher);
        }
        Ok(())
    }

    fn on_tree_changed(&self, root: &Path, changed: Vec<String>) {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = state.as_mut() {
                if state.root != root {
                    return; // stale watcher from a previous project
                }
                state.files = None;
                state.graph = None;
                state.index_stats = None;
                if let Some(index) = &state.index {
                    let mut index = index.lock().unwrap_or_else(|e| e.into_inner());
                    index.invalidate(&changed);
                }
            }
        }
        self.events.publish(CoreEvent::FileTreeChanged {
            root: root.to_string_lossy().to_string(),
            changed,
        });
    }

    /// Flush durable caches. Called on shutdown.
    pub fn close(&self) -> CoreResult<()> {
        let index = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.as_ref().and_then(|s| s.index.clone())
        };
        if let Some(index) = index {
            let mut index = index.lock().unwrap_or_else(|e| e.into_inner());
            index.close()?;
        }
        Ok(())
    }
}
