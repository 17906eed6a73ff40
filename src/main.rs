//! revdb command-line tool.
//!
//! Manages branches, commits JSON change sets, and compares and merges
//! branches of a git-backed store. Results are printed as JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use revdb::config::BackendConfig;
use revdb::{BranchPath, Cancellation, ChangeSet, CommitQuery, CompareRequest, Database, MergeRequest, ObjectId, StoreConfig};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "revdb", version, about = "Revision-indexed branching document store")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "revdb.toml")]
    config: PathBuf,

    /// Store directory; overrides the configured backend.
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage branches.
    Branch {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// Apply a JSON change set as one commit.
    Commit {
        branch: String,
        /// File holding a JSON array of mutations.
        file: PathBuf,
        #[arg(short, long, default_value = "revdb")]
        author: String,
        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Read one object.
    Get {
        branch: String,
        /// Object identity as `type:id`.
        object: String,
        /// Read as of this timestamp instead of the head.
        #[arg(long)]
        at: Option<i64>,
    },

    /// Compare a branch with its parent, or with another branch.
    Compare {
        compare: String,
        #[arg(long)]
        base: Option<String>,
        #[arg(short, long)]
        limit: Option<i64>,
        /// Report only additions and removals.
        #[arg(long)]
        exclude_component_changes: bool,
    },

    /// Merge one branch into another.
    Merge {
        source: String,
        target: String,
        #[arg(long)]
        squash: bool,
        #[arg(short, long, default_value = "revdb")]
        author: String,
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show a branch's commit log.
    Log {
        branch: String,
        #[arg(long)]
        author: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum BranchAction {
    /// Fork a child branch from a parent's head.
    Create {
        parent: String,
        name: String,
        /// Metadata entries as `key=value`.
        #[arg(long = "meta")]
        metadata: Vec<String>,
    },
    /// Show one branch.
    Show { path: String },
    /// List branches, optionally under a prefix.
    List { prefix: Option<String> },
    /// Delete a branch; its descendants become STRAY.
    Delete { path: String },
    /// Bring a branch up to date with its parent.
    Rebase { path: String },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let db = open_database(&cli.config, cli.store)?;
    let cancel = Cancellation::new();

    match cli.command {
        Commands::Branch { action } => cmd_branch(&db, action, &cancel),
        Commands::Commit {
            branch,
            file,
            author,
            message,
        } => {
            let contents = std::fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()))?;
            let changes: ChangeSet = serde_json::from_str(&contents).context("change set is not valid JSON")?;
            print_json(&db.commit(&parse_branch(&branch)?, &author, &message, changes)?)
        }
        Commands::Get { branch, object, at } => {
            let object: ObjectId = object.parse().with_context(|| format!("invalid object id '{}'", object))?;
            match db.get(&object, &parse_branch(&branch)?, at)? {
                Some(revision) => print_json(&revision),
                None => bail!("{} does not exist on {}", object, branch),
            }
        }
        Commands::Compare {
            compare,
            base,
            limit,
            exclude_component_changes,
        } => {
            let mut request = CompareRequest::new(compare).exclude_component_changes(exclude_component_changes);
            if let Some(base) = base {
                request = request.against(base);
            }
            if let Some(limit) = limit {
                request = request.limit(limit);
            }
            print_json(&db.compare_request(&request)?)
        }
        Commands::Merge {
            source,
            target,
            squash,
            author,
            message,
        } => {
            let mut request = MergeRequest::new(parse_branch(&source)?, parse_branch(&target)?)
                .squash(squash)
                .author(author);
            if let Some(message) = message {
                request = request.comment(message);
            }
            let outcome = db.merge(&request, &cancel)?;
            print_json(&outcome.result())?;
            if !outcome.is_applied() {
                bail!("merge of {} into {} rejected", source, target);
            }
            Ok(())
        }
        Commands::Log { branch, author, limit } => {
            let mut query = CommitQuery::new().branch(parse_branch(&branch)?).limit(limit);
            if let Some(author) = author {
                query = query.author(author);
            }
            print_json(&db.search_commits(&query)?)
        }
    }
}

fn cmd_branch(db: &Database, action: BranchAction, cancel: &Cancellation) -> Result<()> {
    match action {
        BranchAction::Create { parent, name, metadata } => {
            let metadata = parse_metadata(&metadata)?;
            print_json(&db.create_branch(&parse_branch(&parent)?, &name, metadata)?)
        }
        BranchAction::Show { path } => print_json(&db.get_branch(&parse_branch(&path)?)?),
        BranchAction::List { prefix } => {
            let prefix = prefix.as_deref().map(parse_branch).transpose()?;
            print_json(&db.list_branches(prefix.as_ref())?)
        }
        BranchAction::Delete { path } => {
            db.delete_branch(&parse_branch(&path)?)?;
            println!("deleted {}", path);
            Ok(())
        }
        BranchAction::Rebase { path } => {
            let outcome = db.rebase(&parse_branch(&path)?, cancel)?;
            print_json(&outcome.result())?;
            if !outcome.is_applied() {
                bail!("rebase of {} rejected", path);
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_database(config_path: &Path, store: Option<PathBuf>) -> Result<Database> {
    let mut config = StoreConfig::load(config_path).context("failed to load configuration file")?;
    match store {
        Some(path) => config = config.with_backend(BackendConfig::Git { path }),
        // an in-memory store would forget everything on exit
        None if config.backend == BackendConfig::Memory => {
            config = config.with_backend(BackendConfig::Git {
                path: PathBuf::from(".revdb"),
            })
        }
        None => {}
    }
    Database::open(config).context("failed to open store")
}

fn parse_branch(raw: &str) -> Result<BranchPath> {
    BranchPath::new(raw).with_context(|| format!("invalid branch path '{}'", raw))
}

fn parse_metadata(entries: &[String]) -> Result<BTreeMap<String, String>> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => Ok((key.to_string(), value.to_string())),
            None => bail!("metadata entry '{}' is not key=value", entry),
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
