//! Task expansion and provider load balancing.
//!
//! Expands raw task requests into fully specified agent tasks: resolves the
//! effective capability, synthesizes missing instructions, enforces the
//! machine-readable output contract, and spreads tasks across the healthy
//! providers of each capability's candidate ladder.

use crate::error::{OrchestratorError, Result};
use crate::routing::resolver::Resolver;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Non-negotiable suffix appended to every prompt so that every downstream
/// response stays machine-parseable.
const OUTPUT_CONTRACT: &str = "\n\nRespond ONLY with a JSON array of findings. Each finding must be an \
object with \"type\", \"description\", \"severity\" and an optional \"location\" field. Do not wrap \
the array in prose or markdown fences.";

/// Marker used to detect an already-present output contract.
const OUTPUT_CONTRACT_MARKER: &str = "Respond ONLY with a JSON array";

/// Capability assigned when a task carries neither an explicit capability
/// nor a role the alias table knows.
const DEFAULT_CAPABILITY: &str = "general_analysis";

/// Definition of one named role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Capability this role maps to.
    #[serde(default)]
    pub capability: Option<String>,
    /// System prompt for agents running this role.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Role alias table: role name -> capability and instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleBook {
    roles: HashMap<String, RoleSpec>,
}

impl RoleBook {
    /// Creates an empty role book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a role book from a JSON file mapping role name -> [`RoleSpec`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let roles: HashMap<String, RoleSpec> = serde_json::from_str(&raw)?;
        Ok(Self { roles })
    }

    /// Registers or replaces a role.
    pub fn insert(&mut self, name: impl Into<String>, spec: RoleSpec) {
        self.roles.insert(name.into(), spec);
    }

    fn get(&self, name: &str) -> Option<&RoleSpec> {
        self.roles.get(name)
    }
}

/// A raw task request, before routing.
#[derive(Debug, Clone)]
pub struct RawTask {
    /// Subject file (already sandbox-validated by the orchestrator).
    pub path: PathBuf,
    /// Role name, when supplied by the caller.
    pub role: Option<String>,
    /// Explicitly requested capability, overriding the role alias table.
    pub capability: Option<String>,
    /// Custom instruction, overriding the role's system prompt.
    pub instruction: Option<String>,
}

/// A fully specified, load-balanced agent task. Immutable once created.
#[derive(Debug, Clone)]
pub struct AgentTask {
    /// Task identifier used in results (role name or `custom`).
    pub role: String,
    /// Subject file.
    pub path: PathBuf,
    /// Effective capability the task requires.
    pub capability: String,
    /// System prompt, output contract included.
    pub prompt: String,
    /// Assigned provider.
    pub provider: String,
    /// Assigned provider-specific model string.
    pub model: String,
}

/// Expands raw tasks into assigned agent tasks.
pub struct Router {
    resolver: Arc<Resolver>,
    role_book: RoleBook,
    default_capability: String,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("default_capability", &self.default_capability)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Creates a router over a resolver and role alias table.
    pub fn new(resolver: Arc<Resolver>, role_book: RoleBook) -> Self {
        Self {
            resolver,
            role_book,
            default_capability: DEFAULT_CAPABILITY.to_string(),
        }
    }

    /// Overrides the fallback capability.
    pub fn with_default_capability(mut self, capability: impl Into<String>) -> Self {
        self.default_capability = capability.into();
        self
    }

    /// Effective capability for a raw task.
    ///
    /// Precedence: explicit request > role alias table > the role name used
    /// directly as a capability > default capability.
    fn effective_capability(&self, raw: &RawTask) -> String {
        if let Some(capability) = &raw.capability {
            return capability.clone();
        }
        if let Some(role) = &raw.role {
            if let Some(spec) = self.role_book.get(role) {
                if let Some(capability) = &spec.capability {
                    return capability.clone();
                }
            }
            return role.clone();
        }
        self.default_capability.clone()
    }

    /// System prompt for a raw task, with the output contract appended.
    fn build_prompt(&self, raw: &RawTask) -> String {
        let mut prompt = raw
            .instruction
            .clone()
            .or_else(|| {
                raw.role
                    .as_deref()
                    .and_then(|role| self.role_book.get(role))
                    .and_then(|spec| spec.system_prompt.clone())
            })
            .unwrap_or_else(|| {
                let role = raw.role.as_deref().unwrap_or("code review");
                format!(
                    "You are a {role} analyst. Review the provided content and report concrete, \
actionable findings with precise locations."
                )
            });

        if !prompt.contains(OUTPUT_CONTRACT_MARKER) {
            prompt.push_str(OUTPUT_CONTRACT);
        }
        prompt
    }

    /// Expands raw tasks into assigned tasks, one per input, in input order.
    ///
    /// Tasks are grouped by capability; each group resolves its candidate
    /// ladder once, intersects it with `healthy_providers`, and assigns
    /// providers round-robin over the distinct providers remaining — that
    /// spreads a group across destinations instead of piling onto the
    /// ladder head.
    ///
    /// # Errors
    /// Propagates resolver failures and returns `NoHealthyProvider` when a
    /// capability's ladder has no healthy provider left.
    pub fn expand(&self, raw_tasks: &[RawTask], healthy_providers: &HashSet<String>) -> Result<Vec<AgentTask>> {
        // Group input indices by capability, preserving input order.
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, raw) in raw_tasks.iter().enumerate() {
            let capability = self.effective_capability(raw);
            match groups.iter_mut().find(|(cap, _)| *cap == capability) {
                Some((_, indices)) => indices.push(idx),
                None => groups.push((capability, vec![idx])),
            }
        }

        let mut tasks: Vec<Option<AgentTask>> = vec![None; raw_tasks.len()];

        for (capability, indices) in groups {
            let ladder = self.resolver.resolve(&capability)?;

            // Distinct providers in ladder order, healthy only.
            let mut available: Vec<&str> = Vec::new();
            for candidate in &ladder {
                if healthy_providers.contains(&candidate.provider)
                    && !available.contains(&candidate.provider.as_str())
                {
                    available.push(&candidate.provider);
                }
            }

            if available.is_empty() {
                warn!(capability = %capability, "Ladder intersected with healthy providers is empty");
                return Err(OrchestratorError::NoHealthyProvider { capability });
            }

            for (group_pos, &idx) in indices.iter().enumerate() {
                let raw = &raw_tasks[idx];
                let provider = available[group_pos % available.len()];
                let candidate = ladder
                    .iter()
                    .find(|c| c.provider == provider)
                    .unwrap_or(&ladder[0]);

                debug!(
                    path = %raw.path.display(),
                    capability = %capability,
                    provider = %candidate.provider,
                    model = %candidate.model_string,
                    "Assigned task"
                );

                tasks[idx] = Some(AgentTask {
                    role: raw.role.clone().unwrap_or_else(|| "custom".to_string()),
                    path: raw.path.clone(),
                    capability: capability.clone(),
                    prompt: self.build_prompt(raw),
                    provider: candidate.provider.clone(),
                    model: candidate.model_string.clone(),
                });
            }
        }

        // Every slot was filled by exactly one group above.
        Ok(tasks.into_iter().flatten().collect())
    }
}
