//! Model catalog and allow-list policy.
//!
//! The relay only forwards model identifiers it knows about. An
//! unrecognized id is silently replaced with the configured default; this
//! is a fallback policy, not an error, so stale clients keep working when
//! the catalog changes underneath them.

use serde::{Deserialize, Serialize};

/// Marker the upstream aggregator uses to route a model through its
/// web-search pipeline.
pub const ONLINE_SUFFIX: &str = ":online";

/// The set of model ids the relay will forward upstream.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    allowed: Vec<String>,
    default_model: String,
}

/// One catalog entry as served by the models endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Upstream model identifier.
    pub id: String,
    /// Whether this is the substitution default.
    pub default: bool,
}

impl ModelCatalog {
    /// Build a catalog from an allow-list and a default id. The default
    /// is always part of the catalog, listed or not.
    pub fn new(allowed: Vec<String>, default_model: String) -> Self {
        let mut allowed = allowed;
        if !allowed.iter().any(|m| *m == default_model) {
            allowed.insert(0, default_model.clone());
        }
        Self {
            allowed,
            default_model,
        }
    }

    /// The id substituted for unrecognized requests.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Whether the id is in the allow-list.
    pub fn is_allowed(&self, model: &str) -> bool {
        self.allowed.iter().any(|m| m == model)
    }

    /// Resolve a requested id against the allow-list, falling back to the
    /// default for anything unrecognized.
    pub fn resolve(&self, requested: &str) -> String {
        if self.is_allowed(requested) {
            requested.to_owned()
        } else {
            tracing::debug!(
                requested,
                default = %self.default_model,
                "requested model not in allow-list, substituting default"
            );
            self.default_model.clone()
        }
    }

    /// Catalog entries for the models endpoint.
    pub fn entries(&self) -> Vec<ModelEntry> {
        self.allowed
            .iter()
            .map(|id| ModelEntry {
                id: id.clone(),
                default: *id == self.default_model,
            })
            .collect()
    }
}

/// Suffix a model id with the upstream's online-search marker. Idempotent:
/// an already-suffixed id passes through unchanged.
pub fn with_web_search(model: &str, enabled: bool) -> String {
    if enabled && !model.ends_with(ONLINE_SUFFIX) {
        format!("{model}{ONLINE_SUFFIX}")
    } else {
        model.to_owned()
    }
}
