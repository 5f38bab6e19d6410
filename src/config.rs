use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the per-user state directory under `$HOME`.
pub const APP_DIR: &str = ".shotgun-code";

/// Per-user application state root (`~/.shotgun-code`).
pub fn app_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Root of the generic analysis cache (`~/.shotgun-code/analysis`).
pub fn analysis_dir() -> PathBuf {
    app_home().join("analysis")
}

/// Where context artefacts live (`<analysis>/contexts/<id>.ctx` + sidecars).
pub fn contexts_dir() -> PathBuf {
    analysis_dir().join("contexts")
}

/// On-disk symbol cache directory.
pub fn symbol_cache_dir() -> PathBuf {
    app_home().join("embeddings").join("symbol_cache")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenEstimatorConfig {
    pub chars_per_token: usize,
    /// Files larger than this are skipped before load, regardless of options.
    pub max_file_bytes: u64,
}

impl Default for TokenEstimatorConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            // 512 KB default — enough for any real source file, blocks
            // log/generated bloat.
            max_file_bytes: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Debounce window for coalescing filesystem events.
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

/// Weights of the smart-collector scoring terms. Exposed as configuration so
/// a workstation profile can retune ranking without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub name_hit: f64,
    pub path_hit: f64,
    pub code_ext: f64,
    pub file_rule: f64,
    pub layer: f64,
    pub entrypoint: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            name_hit: 10.0,
            path_hit: 4.0,
            code_ext: 2.0,
            file_rule: 3.0,
            layer: 2.0,
            entrypoint: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartConfig {
    pub scoring: ScoringWeights,
    /// Additional stop-words merged with the shipped English+Russian list.
    pub extra_stop_words: Vec<String>,
    /// Relevance assigned to files pulled in by the call-graph walk.
    pub callgraph_relevance: f64,
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringWeights::default(),
            extra_stop_words: vec![],
            callgraph_relevance: 0.9,
        }
    }
}

/// Age/count cap applied when purging old context artefacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_contexts: usize,
    pub max_age_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_contexts: 200,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub token_estimator: TokenEstimatorConfig,
    pub watcher: WatcherConfig,
    pub smart: SmartConfig,
    pub retention: RetentionConfig,
    /// Override for the context artefact directory (defaults to
    /// `~/.shotgun-code/analysis/contexts`).
    pub contexts_dir: Option<PathBuf>,
}

impl Config {
    pub fn effective_contexts_dir(&self) -> PathBuf {
        self.contexts_dir.clone().unwrap_or_else(contexts_dir)
    }
}

/// Load `.shotgun-code.json` from the project root; every field falls back to
/// its default, and a malformed file degrades to the defaults rather than
/// failing project selection.
pub fn load_config(project_root: &Path) -> Config {
    let primary = project_root.join(".shotgun-code.json");

    let Ok(text) = std::fs::read_to_string(&primary) else {
        return Config::default();
    };

    serde_json::from_str::<Config>(&text).unwrap_or_else(|err| {
        log::warn!(
            "malformed {} ({err}); using default configuration",
            primary.display()
        );
        Config::default()
    })
}
