use std::path::Path;
use tree_sitter::Language;

use crate::symbols::SymbolKind;

/// Languages with a registered tree-sitter grammar.
///
/// The registry is a pure lookup table: adding a language means adding an
/// enum arm, its extension mapping, its symbol queries, and (optionally) a
/// grammar feature — the rest of the core never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LanguageKind {
    Rust,
    TypeScript,
    Tsx,
    Python,
    Go,
    Java,
}

fn path_ext_lower(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Detect the language of a file by extension. `None` means "no parser":
/// the file still flows through scanning, transforms, and context packing,
/// it just contributes no symbols.
pub fn detect(path: &Path) -> Option<LanguageKind> {
    match path_ext_lower(path).as_str() {
        "rs" => Some(LanguageKind::Rust),
        "ts" | "mts" | "cts" | "js" | "mjs" | "cjs" => Some(LanguageKind::TypeScript),
        "tsx" | "jsx" => Some(LanguageKind::Tsx),
        "py" => Some(LanguageKind::Python),
        "go" => Some(LanguageKind::Go),
        "java" => Some(LanguageKind::Java),
        _ => None,
    }
}

/// Grammar lookup. Returns `None` when the grammar was compiled out via
/// feature flags; callers treat that exactly like an unknown extension.
pub fn grammar(kind: LanguageKind) -> Option<Language> {
    match kind {
        LanguageKind::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
        // JS/TS share the TypeScript grammar for our purposes.
        LanguageKind::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        LanguageKind::Tsx => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        LanguageKind::Python => Some(tree_sitter_python::LANGUAGE.into()),
        #[cfg(feature = "lang-go")]
        LanguageKind::Go => Some(tree_sitter_go::LANGUAGE.into()),
        #[cfg(not(feature = "lang-go"))]
        LanguageKind::Go => None,
        #[cfg(feature = "lang-java")]
        LanguageKind::Java => Some(tree_sitter_java::LANGUAGE.into()),
        #[cfg(not(feature = "lang-java"))]
        LanguageKind::Java => None,
    }
}

/// One tree-sitter query: `@name` captures the identifier, `@def` the whole
/// declaration node.
pub struct SymbolQuery {
    pub query: &'static str,
    pub kind: SymbolKind,
    /// Record a collapsed first-line signature for this symbol class.
    pub signature: bool,
}

const fn q(query: &'static str, kind: SymbolKind, signature: bool) -> SymbolQuery {
    SymbolQuery {
        query,
        kind,
        signature,
    }
}

/// Symbol extraction queries, most specific first: when two queries capture
/// the same `(name, line)` the earlier query's kind wins, which is how
/// methods shadow the plain function query and interfaces shadow the generic
/// type query.
pub fn symbol_queries(kind: LanguageKind) -> &'static [SymbolQuery] {
    match kind {
        LanguageKind::Rust => RUST_QUERIES,
        LanguageKind::TypeScript | LanguageKind::Tsx => TYPESCRIPT_QUERIES,
        LanguageKind::Python => PYTHON_QUERIES,
        LanguageKind::Go => GO_QUERIES,
        LanguageKind::Java => JAVA_QUERIES,
    }
}

static RUST_QUERIES: &[SymbolQuery] = &[
    q(
        r#"(impl_item body: (declaration_list (function_item name: (identifier) @name) @def))"#,
        SymbolKind::Method,
        true,
    ),
    q(
        r#"(trait_item body: (declaration_list (function_item name: (identifier) @name) @def))"#,
        SymbolKind::Method,
        true,
    ),
    q(
        r#"(function_item name: (identifier) @name) @def"#,
        SymbolKind::Function,
        true,
    ),
    q(
        r#"(trait_item name: (type_identifier) @name) @def"#,
        SymbolKind::Interface,
        false,
    ),
    q(
        r#"(struct_item name: (type_identifier) @name) @def"#,
        SymbolKind::Type,
        false,
    ),
    q(
        r#"(enum_item name: (type_identifier) @name) @def"#,
        SymbolKind::Type,
        false,
    ),
    q(
        r#"(type_item name: (type_identifier) @name) @def"#,
        SymbolKind::Type,
        false,
    ),
    q(
        r#"(const_item name: (identifier) @name) @def"#,
        SymbolKind::Constant,
        false,
    ),
    q(
        r#"(static_item name: (identifier) @name) @def"#,
        SymbolKind::Variable,
        false,
    ),
];

static TYPESCRIPT_QUERIES: &[SymbolQuery] = &[
    q(
        r#"(method_definition name: (property_identifier) @name) @def"#,
        SymbolKind::Method,
        true,
    ),
    q(
        r#"(function_declaration name: (identifier) @name) @def"#,
        SymbolKind::Function,
        true,
    ),
    q(
        r#"(interface_declaration name: (type_identifier) @name) @def"#,
        SymbolKind::Interface,
        false,
    ),
    q(
        r#"(class_declaration name: (type_identifier) @name) @def"#,
        SymbolKind::Type,
        false,
    ),
    q(
        r#"(enum_declaration name: (identifier) @name) @def"#,
        SymbolKind::Type,
        false,
    ),
    q(
        r#"(type_alias_declaration name: (type_identifier) @name) @def"#,
        SymbolKind::Type,
        false,
    ),
    q(
        r#"(lexical_declaration (variable_declarator name: (identifier) @name)) @def"#,
        SymbolKind::Variable,
        false,
    ),
];

static PYTHON_QUERIES: &[SymbolQuery] = &[
    q(
        r#"(class_definition body: (block (function_definition name: (identifier) @name) @def))"#,
        SymbolKind::Method,
        true,
    ),
    q(
        r#"(function_definition name: (identifier) @name) @def"#,
        SymbolKind::Function,
        true,
    ),
    q(
        r#"(class_definition name: (identifier) @name) @def"#,
        SymbolKind::Type,
        false,
    ),
];

static GO_QUERIES: &[SymbolQuery] = &[
    q(
        r#"(method_declaration name: (field_identifier) @name) @def"#,
        SymbolKind::Method,
        true,
    ),
    q(
        r#"(function_declaration name: (identifier) @name) @def"#,
        SymbolKind::Function,
        true,
    ),
    q(
        r#"(type_declaration (type_spec name: (type_identifier) @name type: (interface_type))) @def"#,
        SymbolKind::Interface,
        false,
    ),
    q(
        r#"(type_declaration (type_spec name: (type_identifier) @name)) @def"#,
        SymbolKind::Type,
        false,
    ),
    q(
        r#"(const_declaration (const_spec name: (identifier) @name)) @def"#,
        SymbolKind::Constant,
        false,
    ),
    q(
        r#"(var_declaration (var_spec name: (identifier) @name)) @def"#,
        SymbolKind::Variable,
        false,
    ),
];

static JAVA_QUERIES: &[SymbolQuery] = &[
    q(
        r#"(method_declaration name: (identifier) @name) @def"#,
        SymbolKind::Method,
        true,
    ),
    q(
        r#"(interface_declaration name: (identifier) @name) @def"#,
        SymbolKind::Interface,
        false,
    ),
    q(
        r#"(class_declaration name: (identifier) @name) @def"#,
        SymbolKind::Type,
        false,
    ),
    q(
        r#"(enum_declaration name: (identifier) @name) @def"#,
        SymbolKind::Type,
        false,
    ),
];

/// Line/block comment delimiters for the transformer's comment pass.
#[derive(Debug, Clone, Copy)]
pub struct CommentStyle {
    pub line: &'static [&'static str],
    pub block: Option<(&'static str, &'static str)>,
}

/// Comment style by extension. Wider than the parser registry on purpose:
/// the transformer must handle config and markup files no parser covers.
pub fn comment_style(path: &Path) -> Option<CommentStyle> {
    let style = match path_ext_lower(path).as_str() {
        "rs" | "go" | "java" | "kt" | "swift" | "ts" | "tsx" | "mts" | "cts" | "js" | "jsx"
        | "mjs" | "cjs" | "c" | "h" | "cc" | "cpp" | "hpp" | "cs" | "scala" | "dart" => {
            CommentStyle {
                line: &["//"],
                block: Some(("/*", "*/")),
            }
        }
        "py" | "rb" | "sh" | "bash" | "zsh" | "yaml" | "yml" | "toml" | "dockerfile" | "tf" => {
            CommentStyle {
                line: &["#"],
                block: None,
            }
        }
        "sql" | "lua" => CommentStyle {
            line: &["--"],
            block: None,
        },
        "html" | "xml" | "vue" | "svelte" => CommentStyle {
            line: &[],
            block: Some(("<!--", "-->")),
        },
        "css" | "scss" | "less" => CommentStyle {
            line: &[],
            block: Some(("/*", "*/")),
        },
        _ => return None,
    };
    Some(style)
}

/// Test/spec file patterns per language, plus a language-neutral fallback.
/// Globs are matched against the forward-slash relative path.
fn test_globs(kind: Option<LanguageKind>) -> &'static [&'static str] {
    match kind {
        Some(LanguageKind::Rust) => &["tests/**", "**/tests/**", "**/*_test.rs", "benches/**"],
        Some(LanguageKind::Go) => &["**/*_test.go"],
        Some(LanguageKind::Python) => &[
            "**/test_*.py",
            "**/*_test.py",
            "tests/**",
            "**/tests/**",
            "**/conftest.py",
        ],
        Some(LanguageKind::TypeScript) | Some(LanguageKind::Tsx) => &[
            "**/*.spec.*",
            "**/*.test.*",
            "**/__tests__/**",
            "test/**",
            "tests/**",
        ],
        Some(LanguageKind::Java) => &["**/src/test/**", "**/*Test.java"],
        None => &["test/**", "tests/**", "**/test/**", "**/tests/**"],
    }
}

/// Whether a relative path looks like a test or spec file for its detected
/// language.
pub fn is_test_file(rel_path: &str) -> bool {
    let kind = detect(Path::new(rel_path));
    test_globs(kind)
        .iter()
        .chain(test_globs(None))
        .any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(rel_path))
                .unwrap_or(false)
        })
}

/// Markdown fence language tag for a path, used by the manifest renderer.
pub fn code_fence(path: &Path) -> &'static str {
    match path_ext_lower(path).as_str() {
        "rs" => "rust",
        "py" => "python",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "tsx",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "jsx",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "cs" => "csharp",
        "cpp" | "cc" | "cxx" | "hpp" | "h" => "cpp",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "sh" | "bash" => "bash",
        "sql" => "sql",
        "html" => "html",
        "css" => "css",
        _ => "",
    }
}

/// Extensions the smart collector treats as "code" for scoring purposes.
pub fn is_code_extension(rel_path: &str) -> bool {
    detect(Path::new(rel_path)).is_some()
        || matches!(
            path_ext_lower(Path::new(rel_path)).as_str(),
            "c" | "h" | "cc" | "cpp" | "hpp" | "cs" | "kt" | "swift" | "rb" | "php" | "scala"
        )
}
