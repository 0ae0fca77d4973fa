//! Command implementations. Each returns the JSON printed on stdout.

pub mod mpd;
pub mod retrieve;
pub mod seg;
pub mod store;

use crate::cli::{Cli, Commands};
use aimos_hhni::embedding::ProviderRegistry;
use aimos_hhni::index::HierarchicalIndex;
use aimos_hhni::safety::{QueryGates, SafetyGates};
use aimos_memory::config::load_config;
use aimos_memory::MemoryStore;
use aimos_seg::witness::WITNESS_FILE;
use aimos_seg::JsonlWitnessEmitter;
use aimos_types::config::AimosConfig;
use aimos_types::{AimosError, AimosResult};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Resolved configuration for one invocation.
pub struct Context {
    pub config: AimosConfig,
}

impl Context {
    /// File config, then environment, then command-line flags.
    pub fn from_cli(cli: &Cli) -> Self {
        let mut config = load_config(cli.config.as_deref());
        if let Some(dir) = &cli.store {
            config.store.dir = dir.clone();
        }
        if let Some(backend) = cli.backend {
            config.store.backend = backend;
        }
        Self { config }
    }

    pub fn open_store(&self) -> AimosResult<MemoryStore> {
        let witness_path = self.config.store.dir.join("seg").join(WITNESS_FILE);
        Ok(MemoryStore::open(self.config.store.clone())?
            .with_witness_emitter(Arc::new(JsonlWitnessEmitter::new(witness_path)))
            .with_priority_threshold(self.config.hhni.priority_threshold))
    }

    pub fn providers(&self) -> ProviderRegistry {
        ProviderRegistry::from_config(&self.config.embedding)
    }

    /// A fresh index using the default embedding provider.
    pub fn index(&self, providers: &ProviderRegistry) -> HierarchicalIndex {
        HierarchicalIndex::with_gates(
            providers.default_provider(),
            SafetyGates::from_config(&self.config.hhni),
            QueryGates::from_config(&self.config.hhni),
        )
    }
}

/// Drive an async command on a single-threaded runtime.
pub fn block_on<F: Future>(future: F) -> AimosResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| AimosError::Internal(format!("failed to start runtime: {e}")))?;
    Ok(runtime.block_on(future))
}

pub fn to_json<T: Serialize>(value: &T) -> AimosResult<Value> {
    Ok(serde_json::to_value(value)?)
}

pub fn run(cli: Cli) -> AimosResult<Value> {
    let ctx = Context::from_cli(&cli);
    match cli.command {
        Commands::Status => store::status(&ctx),
        Commands::Integrity => store::integrity(&ctx),
        Commands::Atom(command) => store::atom(&ctx, command),
        Commands::Snapshot(command) => store::snapshot(&ctx, command),
        Commands::Mpd(command) => mpd::run(&ctx, command),
        Commands::Retrieve(args) => retrieve::run(&ctx, args),
        Commands::Seg(command) => seg::run(&ctx, command),
    }
}
