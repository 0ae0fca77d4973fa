//! Clap CLI definitions for AIMOS.

use aimos_types::config::Backend;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  aimos atom add --text \"first note\" --tag topic=0.6
  aimos snapshot create --note baseline
  aimos mpd seed-core
  aimos mpd blast-radius aimos.cmc
  aimos retrieve --query \"critical information\" --file notes.md --baseline

Every command prints JSON on stdout; logs go to stderr (RUST_LOG).";

/// AIMOS memory core: atoms, snapshots, bitemporal registry and retrieval.
#[derive(Parser, Debug)]
#[command(name = "aimos", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Store directory (overrides config and AIMOS_STORE_DIR).
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Repository backend (overrides config and CMC_BACKEND).
    #[arg(long, global = true)]
    pub backend: Option<Backend>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show counts, the latest snapshot and counters.
    Status,
    /// Check every journal stream without modifying it.
    Integrity,
    /// Create, list and read atoms [*].
    #[command(subcommand)]
    Atom(AtomCommands),
    /// Create, list and replay snapshots [*].
    #[command(subcommand)]
    Snapshot(SnapshotCommands),
    /// Bitemporal MPD registry [*].
    #[command(subcommand)]
    Mpd(MpdCommands),
    /// Index documents and run the two-stage retriever.
    Retrieve(RetrieveArgs),
    /// Evidence graph stored as an export file [*].
    #[command(subcommand)]
    Seg(SegCommands),
}

#[derive(Subcommand, Debug)]
pub enum AtomCommands {
    /// Ingest one atom.
    Add {
        /// Inline text content.
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "text")]
        modality: String,
        /// Weighted tag as `key=weight`; repeatable.
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, f64)>,
        #[arg(long)]
        correlation_id: Option<String>,
        /// Build the hierarchical index for this atom.
        #[arg(long)]
        index: bool,
    },
    /// List atoms in creation order.
    List {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Show one atom.
    Get { id: String },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommands {
    /// Snapshot every atom stored so far.
    Create {
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    List,
    /// Print the atoms of a snapshot in order.
    Replay { id: String },
}

#[derive(Args, Debug, Default)]
pub struct TimeArgs {
    /// Query valid time instead of transaction time.
    #[arg(long)]
    pub valid_time: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MatchMode {
    All,
    Any,
}

#[derive(Subcommand, Debug)]
pub enum MpdCommands {
    /// Insert the core platform nodes if missing.
    SeedCore,
    /// List nodes.
    Nodes {
        #[arg(long)]
        lifecycle: Option<String>,
        /// Required policy pack; repeatable.
        #[arg(long = "policy")]
        policies: Vec<String>,
        #[arg(long = "match", value_enum, default_value = "all")]
        policy_match: MatchMode,
        /// Include closed versions.
        #[arg(long)]
        history: bool,
    },
    /// List edges.
    Edges {
        #[arg(long)]
        relation: Option<String>,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        target: Option<String>,
        #[arg(long = "policy")]
        policies: Vec<String>,
        #[arg(long = "match", value_enum, default_value = "all")]
        policy_match: MatchMode,
        #[arg(long)]
        history: bool,
    },
    /// Draft and persist the trunk nodes.
    SeedTrunk {
        #[arg(long, default_value = "")]
        summary: String,
        #[arg(long)]
        correlation_id: Option<String>,
        #[arg(long = "policy")]
        policies: Vec<String>,
        #[arg(long = "owner")]
        owners: Vec<String>,
    },
    /// Impact and policy coverage reachable from the given roots.
    BlastRadius {
        #[arg(required = true)]
        roots: Vec<String>,
        /// Relation to follow; repeatable. Defaults to depends_on both ways.
        #[arg(long = "relation")]
        relations: Vec<String>,
        /// Required policy pack; repeatable.
        #[arg(long = "require")]
        required: Vec<String>,
    },
    /// Everything in force at an instant.
    AsOf {
        /// RFC 3339 timestamp.
        at: String,
        #[command(flatten)]
        time: TimeArgs,
        #[arg(long)]
        edges: bool,
    },
    /// Versions of one node.
    History {
        id: String,
        #[command(flatten)]
        time: TimeArgs,
    },
    /// Versions of a node plus the edges that touched it.
    Audit {
        id: String,
        #[arg(long)]
        edges: bool,
    },
    /// Rows added, modified and removed in `[from, to)`.
    Changes {
        from: String,
        to: String,
        #[command(flatten)]
        time: TimeArgs,
    },
}

#[derive(Args, Debug)]
pub struct RetrieveArgs {
    #[arg(long)]
    pub query: String,
    /// Document to index; repeatable. Without files the store's inline atoms are indexed.
    #[arg(long = "file")]
    pub files: Vec<PathBuf>,
    /// Token budget (defaults to `[retrieval] token_budget`).
    #[arg(long)]
    pub budget: Option<usize>,
    /// Also run without DVNS and report the lift.
    #[arg(long)]
    pub baseline: bool,
    /// Embedding provider name.
    #[arg(long)]
    pub provider: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum SegCommands {
    /// Record counts of a graph file.
    Stats {
        #[arg(long)]
        graph: PathBuf,
    },
    /// Add an entity.
    AddEntity {
        #[arg(long)]
        graph: PathBuf,
        #[arg(long, default_value = "")]
        id: String,
        #[arg(long = "type")]
        entity_type: String,
        #[arg(long)]
        name: String,
    },
    /// Relate two entities.
    Relate {
        #[arg(long)]
        graph: PathBuf,
        source: String,
        target: String,
        /// SUPPORTS, CONTRADICTS, REFERENCES, DERIVES_FROM or RELATES_TO.
        #[arg(long)]
        kind: String,
        #[arg(long, default_value_t = 1.0)]
        confidence: f64,
    },
    /// Add evidence, optionally backed by an atom of the store.
    AddEvidence {
        #[arg(long)]
        graph: PathBuf,
        #[arg(long)]
        content: String,
        #[arg(long)]
        source: String,
        #[arg(long)]
        atom: Option<String>,
    },
    /// Ancestors through DERIVES_FROM relations.
    Trace {
        #[arg(long)]
        graph: PathBuf,
        id: String,
        #[arg(long, default_value_t = 5)]
        depth: usize,
    },
    /// Materialize contradiction records.
    Contradictions {
        #[arg(long)]
        graph: PathBuf,
    },
}

fn parse_tag(raw: &str) -> Result<(String, f64), String> {
    let (key, weight) = raw
        .split_once('=')
        .ok_or_else(|| format!("tag '{raw}' must look like key=weight"))?;
    let weight = weight
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("tag '{raw}': {e}"))?;
    Ok((key.trim().to_string(), weight))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags_and_tags() {
        let cli = Cli::try_parse_from([
            "aimos", "--backend", "jsonl", "--store", "/tmp/s", "atom", "add", "--text", "hi", "--tag",
            "priority=0.9",
        ])
        .unwrap();
        assert_eq!(cli.backend, Some(Backend::Jsonl));
        match cli.command {
            Commands::Atom(AtomCommands::Add { tags, .. }) => {
                assert_eq!(tags, vec![("priority".to_string(), 0.9)]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_tag_and_backend_rejected() {
        assert!(Cli::try_parse_from(["aimos", "atom", "add", "--text", "x", "--tag", "nope"]).is_err());
        assert!(Cli::try_parse_from(["aimos", "--backend", "oracle", "status"]).is_err());
        assert!(Cli::try_parse_from(["aimos", "mpd", "blast-radius"]).is_err());
    }
}
