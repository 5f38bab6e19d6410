use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shotgun_core::builder::{BuildOptions, OutputFormat};
use shotgun_core::config::load_config;
use shotgun_core::container::{AnalysisContainer, Factories};
use shotgun_core::events::{CoreEvent, EventBus};
use shotgun_core::ingress::Ingress;
use shotgun_core::smart::SmartContextRequest;
use shotgun_core::splitter::{SplitOptions, SplitStrategy};
use shotgun_core::symbols::SymbolKind;

#[derive(Debug, Parser)]
#[command(name = "shotgun-core")]
#[command(version)]
#[command(about = "Context assembly and static-analysis core for Shotgun Code")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Per-request deadline in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the project file tree as JSON
    Scan {
        /// Do not honour .gitignore
        #[arg(long)]
        no_gitignore: bool,
        /// Extra ignore rules, gitignore syntax, one per line
        #[arg(long, value_name = "RULES")]
        custom_rules: Option<String>,
    },
    /// Build or refresh the symbol index and print stats
    Index,
    /// Build a context from the selected paths
    Build {
        /// Repo-relative paths to include, in order
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<String>,
        /// Context display name
        #[arg(long, default_value = "selection")]
        name: String,
        /// Token budget (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max_tokens: usize,
        /// Per-file read ceiling in MB (0 = ambient default)
        #[arg(long, default_value_t = 0)]
        max_memory_mb: usize,
        #[arg(long, value_enum, default_value = "manifest")]
        format: CliFormat,
        #[arg(long)]
        strip_comments: bool,
        #[arg(long)]
        strip_license: bool,
        #[arg(long)]
        trim_whitespace: bool,
        #[arg(long)]
        collapse_empty_lines: bool,
        #[arg(long)]
        compact_data_files: bool,
        #[arg(long)]
        exclude_tests: bool,
        #[arg(long)]
        line_numbers: bool,
        /// Prepend a manifest section listing the included files
        #[arg(long)]
        manifest: bool,
        /// Print the context body instead of the artefact summary
        #[arg(long)]
        print_body: bool,
    },
    /// Task-driven smart context collection
    Smart {
        /// Task description, e.g. "fix bug in parse_header"
        task: String,
        /// Seed files
        #[arg(long = "file", value_name = "PATH")]
        files: Vec<String>,
        /// File the task is anchored in (enables the call-stack walk)
        #[arg(long)]
        source_file: Option<String>,
        #[arg(long, default_value_t = 32_000)]
        max_tokens: usize,
        #[arg(long, default_value_t = 2)]
        max_depth: usize,
    },
    /// Split a persisted context into token-bounded chunks
    Split {
        context_id: String,
        #[arg(long, default_value_t = 8_000)]
        max_tokens_per_chunk: usize,
        #[arg(long, default_value_t = 0)]
        overlap_tokens: usize,
        #[arg(long, value_enum, default_value = "smart")]
        strategy: CliStrategy,
    },
    /// Find references to a symbol
    Refs {
        symbol: String,
        /// Restrict to a symbol kind (function, method, type, …)
        #[arg(long)]
        kind: Option<String>,
        /// Exclude definition sites
        #[arg(long)]
        usages_only: bool,
    },
    /// Manage persisted contexts
    Contexts {
        #[command(subcommand)]
        cmd: ContextsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ContextsCommand {
    /// List contexts for this project
    List,
    /// Print a context body
    Show { context_id: String },
    /// Delete a context
    Delete { context_id: String },
    /// Apply the retention policy (count + age caps)
    Purge,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliFormat {
    Manifest,
    Xml,
    Markdown,
    Plain,
}

impl From<CliFormat> for OutputFormat {
    fn from(value: CliFormat) -> Self {
        match value {
            CliFormat::Manifest => OutputFormat::Manifest,
            CliFormat::Xml => OutputFormat::Xml,
            CliFormat::Markdown => OutputFormat::Markdown,
            CliFormat::Plain => OutputFormat::Plain,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliStrategy {
    Smart,
    Token,
    File,
}

impl From<CliStrategy> for SplitStrategy {
    fn from(value: CliStrategy) -> Self {
        match value {
            CliStrategy::Smart => SplitStrategy::Smart,
            CliStrategy::Token => SplitStrategy::Token,
            CliStrategy::File => SplitStrategy::File,
        }
    }
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(Duration::from_millis(80));
    bar.set_message(message.to_string());
    bar
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("failed to get current dir")?,
    };
    let deadline = cli.timeout_secs.map(Duration::from_secs);
    let cfg = load_config(&root);

    let (bus, events_rx) = EventBus::bounded(256);
    let container = Arc::new(AnalysisContainer::new(Factories::production(cfg), bus)?);
    let ingress = Ingress::new(Arc::clone(&container));
    ingress.select_project(&root)?;

    match cli.cmd {
        Command::Scan {
            no_gitignore,
            custom_rules,
        } => {
            let rules = custom_rules.unwrap_or_default();
            let tree = ingress.list_files(!no_gitignore, !rules.is_empty(), &rules, deadline)?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
        Command::Index => {
            let bar = spinner("indexing symbols...");
            let stats = ingress.ensure_symbol_index_built(deadline)?;
            bar.finish_with_message(format!(
                "indexed {} files ({} symbols, {} reparsed, {} reused)",
                stats.files, stats.symbols, stats.reparsed, stats.reused
            ));
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Build {
            paths,
            name,
            max_tokens,
            max_memory_mb,
            format,
            strip_comments,
            strip_license,
            trim_whitespace,
            collapse_empty_lines,
            compact_data_files,
            exclude_tests,
            line_numbers,
            manifest,
            print_body,
        } => {
            let options = BuildOptions {
                max_tokens,
                max_memory_mb,
                strip_comments,
                strip_license,
                trim_whitespace,
                collapse_empty_lines,
                compact_data_files,
                exclude_tests,
                include_line_numbers: line_numbers,
                include_manifest: manifest,
                output_format: format.into(),
                ..Default::default()
            };

            // Drain progress events into a live bar while the build runs.
            let bar = ProgressBar::new(paths.len() as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
                    .unwrap(),
            );
            let progress_bar = bar.clone();
            let drain = std::thread::spawn(move || {
                while let Ok(event) = events_rx.recv() {
                    match event {
                        CoreEvent::ContextProgress { current, total, .. } => {
                            progress_bar.set_length(total as u64);
                            progress_bar.set_position(current as u64);
                        }
                        CoreEvent::ContextReady { .. } => break,
                        CoreEvent::ContextError { message, .. } => {
                            progress_bar.set_message(message);
                            break;
                        }
                        _ => {}
                    }
                }
            });

            let result =
                ingress.build_context_with_options(&name, &paths, &options, vec![], deadline);
            bar.finish_and_clear();
            // The drain thread exits on contextReady/contextError; on other
            // failures the process ends before it matters.
            drop(drain);

            let artefact = result?;
            if print_body {
                print!("{}", ingress.get_context_content(&artefact.id)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&artefact)?);
            }
        }
        Command::Smart {
            task,
            files,
            source_file,
            max_tokens,
            max_depth,
        } => {
            let bar = spinner("collecting smart context...");
            let request = SmartContextRequest {
                task,
                selected_files: files,
                selected_code: None,
                source_file,
                max_tokens,
                max_depth,
            };
            let result = ingress.collect_smart_context(&request, deadline)?;
            bar.finish_with_message(format!(
                "{} files, ~{} tokens, confidence {:.2}",
                result.files.len(),
                result.token_estimate,
                result.confidence
            ));
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Split {
            context_id,
            max_tokens_per_chunk,
            overlap_tokens,
            strategy,
        } => {
            let chunks = ingress.split_context(
                &context_id,
                &SplitOptions {
                    max_tokens_per_chunk,
                    overlap_tokens,
                    strategy: strategy.into(),
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&chunks)?);
        }
        Command::Refs {
            symbol,
            kind,
            usages_only,
        } => {
            let kind = kind.as_deref().and_then(SymbolKind::parse);
            let refs = if usages_only {
                ingress.find_usages(&symbol, kind, deadline)?
            } else {
                ingress.find_references(&symbol, kind, deadline)?
            };
            println!("{}", serde_json::to_string_pretty(&refs)?);
        }
        Command::Contexts { cmd } => match cmd {
            ContextsCommand::List => {
                let contexts = ingress.list_project_contexts()?;
                println!("{}", serde_json::to_string_pretty(&contexts)?);
            }
            ContextsCommand::Show { context_id } => {
                print!("{}", ingress.get_context_content(&context_id)?);
            }
            ContextsCommand::Delete { context_id } => {
                ingress.delete_context(&context_id)?;
                eprintln!("deleted {context_id}");
            }
            ContextsCommand::Purge => {
                let cfg = container.config()?;
                let removed = container
                    .store()
                    .purge(cfg.retention.max_contexts, cfg.retention.max_age_days)?;
                eprintln!("purged {removed} context(s)");
            }
        },
    }

    container.close()?;
    Ok(())
}
