/// Hot-reload flow registry using ArcSwap
///
/// Holds the compiled latest version of every active flow for trigger matching, plus
/// lazily compiled older versions that paused executions are still pinned to. The
/// registry is an explicit dependency handed to the engine, never global state, so
/// several engine instances can run the same flows side by side.

use crate::error::{EngineError, EngineResult};
use crate::workflow::compiler::{compile, CompiledFlow, ValidationIssue, ValidationReport};
use crate::workflow::{storage::FlowStorage, types::FlowGraph};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Result of publishing a flow
#[derive(Debug)]
pub enum PublishOutcome {
    /// Stored and hot-loaded as `version`
    Published {
        version: i64,
        warnings: Vec<ValidationIssue>,
    },
    /// Failed validation; nothing was stored
    Rejected(ValidationReport),
}

/// Lock-free flow registry
#[derive(Debug)]
pub struct FlowRegistry {
    /// Latest compiled version per flow id
    active: ArcSwap<HashMap<String, Arc<CompiledFlow>>>,
    /// Older versions still referenced by paused executions
    pinned: ArcSwap<HashMap<(String, i64), Arc<CompiledFlow>>>,
    /// Reference to persistent storage for reload operations
    storage: FlowStorage,
}

impl FlowRegistry {
    /// Create new registry instance with storage backend
    pub fn new(storage: FlowStorage) -> Self {
        Self {
            active: ArcSwap::new(Arc::new(HashMap::new())),
            pinned: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    pub fn storage(&self) -> &FlowStorage {
        &self.storage
    }

    /// Load and compile the latest version of every stored flow
    ///
    /// Flows that no longer compile are skipped with an error log rather than
    /// blocking startup.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_latest_flows().await?;
        let mut compiled = HashMap::new();
        for flow in stored {
            match compile(&flow) {
                Ok(c) => {
                    compiled.insert(flow.id.clone(), Arc::new(c));
                }
                Err(report) => {
                    tracing::error!(
                        "❌ Stored flow '{}' v{} does not compile: {:?}",
                        flow.id,
                        flow.version,
                        report.errors
                    );
                }
            }
        }

        self.active.store(Arc::new(compiled));
        tracing::info!("Initialized flow registry with {} flows", self.active.load().len());
        Ok(())
    }

    /// Validate, store as a new version and hot-load a flow
    pub async fn publish(&self, flow: &FlowGraph) -> Result<PublishOutcome> {
        if let Err(report) = compile(flow) {
            tracing::warn!("🚫 Rejected flow '{}': {} errors", flow.id, report.errors.len());
            return Ok(PublishOutcome::Rejected(report));
        }

        let version = self.storage.save_flow(flow).await?;
        let compiled = self.reload_flow(&flow.id).await?;

        tracing::info!("🔥 Published flow '{}' v{}", flow.id, version);
        Ok(PublishOutcome::Published {
            version,
            warnings: compiled.warnings.clone(),
        })
    }

    /// Hot-reload the latest version of a single flow
    pub async fn reload_flow(&self, flow_id: &str) -> Result<Arc<CompiledFlow>> {
        let flow = self
            .storage
            .get_latest_flow(flow_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Flow not found: {}", flow_id))?;

        let compiled = Arc::new(
            compile(&flow).map_err(|r| anyhow::anyhow!("Flow '{}' does not compile: {:?}", flow_id, r.errors))?,
        );

        // A concurrent reload that already installed a newer version wins
        self.active.rcu(|current| {
            let mut next = HashMap::clone(current);
            match next.get(flow_id) {
                Some(existing) if existing.version() > compiled.version() => {}
                _ => {
                    next.insert(flow_id.to_string(), Arc::clone(&compiled));
                }
            }
            next
        });

        tracing::info!("Hot-reloaded flow: {} v{}", flow_id, compiled.version());
        Ok(compiled)
    }

    /// Latest compiled version (lock-free read)
    pub fn get_active(&self, flow_id: &str) -> Option<Arc<CompiledFlow>> {
        self.active.load().get(flow_id).cloned()
    }

    /// All active flows, used for trigger matching
    pub fn active_flows(&self) -> Vec<Arc<CompiledFlow>> {
        self.active.load().values().cloned().collect()
    }

    /// Exact version an execution is pinned to
    pub async fn get_version(&self, flow_id: &str, version: i64) -> EngineResult<Arc<CompiledFlow>> {
        if let Some(active) = self.get_active(flow_id).filter(|f| f.version() == version) {
            return Ok(active);
        }
        let key = (flow_id.to_string(), version);
        if let Some(pinned) = self.pinned.load().get(&key) {
            return Ok(Arc::clone(pinned));
        }

        let flow = self
            .storage
            .get_flow_version(flow_id, version)
            .await
            .map_err(|e| EngineError::ResourceUnavailable(e.to_string()))?
            .ok_or_else(|| EngineError::FlowNotFound(format!("{} v{}", flow_id, version)))?;
        let compiled = Arc::new(compile(&flow).map_err(|r| {
            EngineError::graph(
                flow_id,
                None,
                format!("pinned version {} no longer compiles: {:?}", version, r.errors),
            )
        })?);

        self.pinned.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(key.clone(), Arc::clone(&compiled));
            next
        });
        tracing::debug!("📌 Loaded pinned flow version {} v{}", flow_id, version);
        Ok(compiled)
    }

    /// Remove a flow from the active set; pinned versions stay for running contexts
    pub fn remove_flow(&self, flow_id: &str) -> bool {
        let previous = self.active.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(flow_id);
            next
        });
        let removed = previous.contains_key(flow_id);
        if removed {
            tracing::info!("Removed flow from registry: {}", flow_id);
        }
        removed
    }
}
