use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

use crate::error::{CoreError, CoreResult};

/// Embedded default ignore rules: common high-noise artifacts that are never
/// useful inside an LLM context, regardless of the project's own ignore
/// files. Gitignore syntax; a trailing `/` anchors the pattern to
/// directories.
const DEFAULT_RULES: &[&str] = &[
    // Lockfiles
    "*.lock",
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    // Sourcemaps + images/icons
    "*.map",
    "*.svg",
    "*.png",
    "*.ico",
    "*.jpg",
    "*.jpeg",
    "*.gif",
    // Build outputs / heavy dirs
    ".git/",
    "node_modules/",
    "target/",
    "dist/",
    "build/",
    "coverage/",
    ".next/",
    ".nuxt/",
    ".vscode/",
    ".idea/",
    "out/",
    ".DS_Store",
];

/// Which rule source a path matched, if any. Later sources override earlier
/// ones, so the scanner can attribute a decision precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreSource {
    /// Not ignored by any source (or explicitly whitelisted).
    None,
    /// Matched by the embedded default rules.
    Default,
    /// Matched by the project's `.gitignore`.
    Gitignore,
    /// Matched by user-supplied custom rules.
    Custom,
}

#[derive(Debug, Clone)]
pub struct IgnoreOptions {
    pub use_gitignore: bool,
    pub use_custom: bool,
    /// Raw rule text in gitignore syntax, one pattern per line.
    pub custom_rules: String,
}

impl Default for IgnoreOptions {
    fn default() -> Self {
        Self {
            use_gitignore: true,
            use_custom: true,
            custom_rules: String::new(),
        }
    }
}

/// Compiled form of the ordered rule sources. Pure given its inputs and
/// immutable once built; recompilation replaces the whole matcher.
pub struct IgnoreMatcher {
    defaults: Gitignore,
    gitignore: Option<Gitignore>,
    custom: Option<Gitignore>,
}

fn build_err(err: ignore::Error) -> CoreError {
    CoreError::InvalidInput(format!("failed to compile ignore rules: {err}"))
}

impl IgnoreMatcher {
    /// Compile the layered matcher for `root`. Precedence is custom >
    /// `.gitignore` > embedded defaults; within one source later patterns win
    /// (gitignore semantics, including `!` negations).
    pub fn compile(root: &Path, opts: &IgnoreOptions) -> CoreResult<Self> {
        let mut defaults = GitignoreBuilder::new(root);
        for rule in DEFAULT_RULES {
            defaults.add_line(None, rule).map_err(build_err)?;
        }
        let defaults = defaults.build().map_err(build_err)?;

        let gitignore = if opts.use_gitignore {
            let file = root.join(".gitignore");
            if file.is_file() {
                let mut builder = GitignoreBuilder::new(root);
                if let Some(err) = builder.add(&file) {
                    log::warn!("skipping unreadable {}: {err}", file.display());
                }
                Some(builder.build().map_err(build_err)?)
            } else {
                None
            }
        } else {
            None
        };

        let custom = if opts.use_custom && !opts.custom_rules.trim().is_empty() {
            let mut builder = GitignoreBuilder::new(root);
            for line in opts.custom_rules.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                builder.add_line(None, line).map_err(build_err)?;
            }
            Some(builder.build().map_err(build_err)?)
        } else {
            None
        };

        Ok(Self {
            defaults,
            gitignore,
            custom,
        })
    }

    /// Which source, if any, ignores `rel_path`. A whitelist match in a
    /// higher-precedence source stops the cascade.
    pub fn match_source(&self, rel_path: &str, is_dir: bool) -> IgnoreSource {
        if let Some(custom) = &self.custom {
            let matched = custom.matched(rel_path, is_dir);
            if matched.is_ignore() {
                return IgnoreSource::Custom;
            }
            if matched.is_whitelist() {
                return IgnoreSource::None;
            }
        }
        if let Some(gitignore) = &self.gitignore {
            let matched = gitignore.matched(rel_path, is_dir);
            if matched.is_ignore() {
                return IgnoreSource::Gitignore;
            }
            if matched.is_whitelist() {
                return IgnoreSource::None;
            }
        }
        if self.defaults.matched(rel_path, is_dir).is_ignore() {
            return IgnoreSource::Default;
        }
        IgnoreSource::None
    }

    pub fn is_ignored(&self, rel_path: &str, is_dir: bool) -> bool {
        self.match_source(rel_path, is_dir) != IgnoreSource::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher_with(custom: &str, gitignore: Option<&str>) -> IgnoreMatcher {
        let dir = tempfile::tempdir().unwrap();
        if let Some(text) = gitignore {
            std::fs::write(dir.path().join(".gitignore"), text).unwrap();
        }
        IgnoreMatcher::compile(
            dir.path(),
            &IgnoreOptions {
                use_gitignore: gitignore.is_some(),
                use_custom: true,
                custom_rules: custom.to_string(),
            },
        )
        .unwrap()
    }

    #[test]
    fn embedded_defaults_cover_heavy_dirs() {
        let m = matcher_with("", None);
        assert_eq!(
            m.match_source("node_modules", true),
            IgnoreSource::Default
        );
        assert_eq!(m.match_source("sub/target", true), IgnoreSource::Default);
        assert_eq!(m.match_source("Cargo.lock", false), IgnoreSource::Default);
        assert_eq!(m.match_source("src/main.rs", false), IgnoreSource::None);
    }

    #[test]
    fn gitignore_layers_over_defaults() {
        let m = matcher_with("", Some("generated/\n*.tmp\n"));
        assert_eq!(m.match_source("generated", true), IgnoreSource::Gitignore);
        assert_eq!(m.match_source("a/b.tmp", false), IgnoreSource::Gitignore);
    }

    #[test]
    fn custom_rules_win_over_gitignore() {
        let m = matcher_with("docs/\n", Some("docs/important.md\n"));
        assert_eq!(m.match_source("docs", true), IgnoreSource::Custom);
    }

    #[test]
    fn custom_whitelist_overrides_lower_sources() {
        // .gitignore hides all logs; the custom layer re-includes one.
        let m = matcher_with("!keep.log\n", Some("*.log\n"));
        assert_eq!(m.match_source("keep.log", false), IgnoreSource::None);
        assert_eq!(m.match_source("other.log", false), IgnoreSource::Gitignore);
    }

    #[test]
    fn later_patterns_win_within_a_source() {
        let m = matcher_with("*.md\n!README.md\n", None);
        assert!(m.is_ignored("notes.md", false));
        assert!(!m.is_ignored("README.md", false));
    }

    #[test]
    fn recompilation_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let opts = IgnoreOptions {
            use_gitignore: false,
            use_custom: true,
            custom_rules: "vendor/\n".into(),
        };
        let first = IgnoreMatcher::compile(dir.path(), &opts).unwrap();
        let second = IgnoreMatcher::compile(dir.path(), &opts).unwrap();
        for (path, is_dir) in [("vendor", true), ("src/lib.rs", false), ("dist", true)] {
            assert_eq!(
                first.is_ignored(path, is_dir),
                second.is_ignored(path, is_dir)
            );
        }
    }
}
