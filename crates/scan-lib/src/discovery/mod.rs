//! Workload discovery
//!
//! Enumerates workloads, their containers and the resources currently set
//! in their specs. The [`WorkloadDiscoverer`] trait is what the scan
//! orchestrator depends on; [`KubeDiscoverer`] implements it against the
//! Kubernetes API.

mod kubernetes;
mod quantity;

pub use kubernetes::{KubeDiscoverer, DEFAULT_PAGE_SIZE};
pub use quantity::{parse_quantity, QuantityError};

use crate::error::DiscoveryError;
use crate::models::{ClusterContext, Workload, WorkloadKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which namespaces, labels and kinds a scan covers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceFilter {
    /// Namespaces to scan; empty means all namespaces
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Kubernetes label selector applied to workloads
    #[serde(default)]
    pub label_selector: Option<String>,
    /// Workload kinds to include; empty means every supported kind
    #[serde(default)]
    pub kinds: Vec<WorkloadKind>,
}

impl NamespaceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn includes_kind(&self, kind: WorkloadKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    /// True when the filter narrows the scan beyond "everything"
    pub fn is_restrictive(&self) -> bool {
        !self.namespaces.is_empty() || self.label_selector.is_some() || !self.kinds.is_empty()
    }
}

/// Contract for enumerating workloads in one cluster
#[async_trait]
pub trait WorkloadDiscoverer: Send + Sync {
    /// List workloads matching `filter`, paginating as needed
    ///
    /// Returns [`DiscoveryError::EmptySelection`] when a restrictive filter
    /// matches nothing, so callers can tell it apart from an unreachable API.
    async fn discover(
        &self,
        cluster: &ClusterContext,
        filter: &NamespaceFilter,
    ) -> Result<Vec<Workload>, DiscoveryError>;
}
