//! Workload discovery through the Kubernetes API
//!
//! Lists Deployments, StatefulSets, DaemonSets, Jobs and CronJobs page by
//! page, resolves the pods each workload currently owns and reads the
//! resources set on every container.

use super::{parse_quantity, NamespaceFilter, WorkloadDiscoverer};
use crate::error::DiscoveryError;
use crate::models::{ClusterContext, Container, ResourceAllocation, Workload, WorkloadKind};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Container as PodContainer, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, ObjectList};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::future::Future;
use tracing::{debug, info};

/// Items requested per list call
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Workload kinds that own a pod template
trait WorkloadResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    const KIND: WorkloadKind;

    fn pod_spec(&self) -> Option<&PodSpec>;

    fn match_labels(&self) -> Option<&BTreeMap<String, String>>;
}

impl WorkloadResource for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }

    fn match_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.spec.as_ref()?.selector.match_labels.as_ref()
    }
}

impl WorkloadResource for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }

    fn match_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.spec.as_ref()?.selector.match_labels.as_ref()
    }
}

impl WorkloadResource for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }

    fn match_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.spec.as_ref()?.selector.match_labels.as_ref()
    }
}

impl WorkloadResource for Job {
    const KIND: WorkloadKind = WorkloadKind::Job;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref()?.template.spec.as_ref()
    }

    fn match_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.spec.as_ref()?.selector.as_ref()?.match_labels.as_ref()
    }
}

impl WorkloadResource for CronJob {
    const KIND: WorkloadKind = WorkloadKind::CronJob;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec
            .as_ref()?
            .job_template
            .spec
            .as_ref()?
            .template
            .spec
            .as_ref()
    }

    // Pods of a CronJob belong to short-lived Jobs; they are matched by name prefix
    fn match_labels(&self) -> Option<&BTreeMap<String, String>> {
        None
    }
}

/// A workload plus the pod selector used to find its pods
struct Discovered {
    workload: Workload,
    match_labels: Option<BTreeMap<String, String>>,
}

/// [`super::WorkloadDiscoverer`] backed by one `kube::Client` per cluster
///
/// Clients are built by the caller (from kubeconfig contexts or in-cluster
/// configuration) and registered under the cluster name.
#[derive(Clone, Default)]
pub struct KubeDiscoverer {
    clients: HashMap<String, Client>,
    page_size: u32,
}

impl KubeDiscoverer {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_client(mut self, cluster: impl Into<String>, client: Client) -> Self {
        self.clients.insert(cluster.into(), client);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    async fn list_kind<K: WorkloadResource>(
        &self,
        client: &Client,
        cluster: &str,
        filter: &NamespaceFilter,
    ) -> Result<Vec<Discovered>, DiscoveryError> {
        if !filter.includes_kind(K::KIND) {
            return Ok(Vec::new());
        }

        let mut params = ListParams::default();
        if let Some(selector) = &filter.label_selector {
            params = params.labels(selector);
        }

        let mut discovered = Vec::new();
        for api in apis::<K>(client, filter) {
            let objects = paginate(params.clone(), self.page_size, |p| {
                let api = api.clone();
                async move { api.list(&p).await }
            })
            .await?;

            for obj in &objects {
                if let Some(d) = to_discovered(cluster, obj)? {
                    discovered.push(d);
                }
            }
        }

        debug!(cluster = %cluster, kind = %K::KIND, count = discovered.len(), "Listed workloads");
        Ok(discovered)
    }

    async fn list_pods(
        &self,
        client: &Client,
        filter: &NamespaceFilter,
    ) -> Result<HashMap<String, Vec<PodLabels>>, DiscoveryError> {
        let mut by_namespace: HashMap<String, Vec<PodLabels>> = HashMap::new();
        for api in apis::<Pod>(client, filter) {
            let pods = paginate(ListParams::default(), self.page_size, |p| {
                let api = api.clone();
                async move { api.list(&p).await }
            })
            .await?;

            for pod in pods {
                let namespace = pod.namespace().unwrap_or_default();
                by_namespace.entry(namespace).or_default().push(PodLabels {
                    name: pod.name_any(),
                    labels: pod.labels().clone(),
                });
            }
        }
        Ok(by_namespace)
    }
}

#[async_trait]
impl WorkloadDiscoverer for KubeDiscoverer {
    async fn discover(
        &self,
        cluster: &ClusterContext,
        filter: &NamespaceFilter,
    ) -> Result<Vec<Workload>, DiscoveryError> {
        let client = self
            .clients
            .get(&cluster.name)
            .ok_or_else(|| DiscoveryError::MissingClient(cluster.name.clone()))?;

        let mut discovered = Vec::new();
        discovered.extend(self.list_kind::<Deployment>(client, &cluster.name, filter).await?);
        discovered.extend(self.list_kind::<StatefulSet>(client, &cluster.name, filter).await?);
        discovered.extend(self.list_kind::<DaemonSet>(client, &cluster.name, filter).await?);
        discovered.extend(self.list_kind::<Job>(client, &cluster.name, filter).await?);
        discovered.extend(self.list_kind::<CronJob>(client, &cluster.name, filter).await?);

        if discovered.is_empty() {
            if filter.is_restrictive() {
                return Err(DiscoveryError::EmptySelection {
                    namespaces: filter.namespaces.clone(),
                });
            }
            return Ok(Vec::new());
        }

        let pods = self.list_pods(client, filter).await?;
        let mut workloads = assign_pods(discovered, &pods);
        workloads.sort_by(|a, b| {
            (&a.namespace, &a.name, a.kind).cmp(&(&b.namespace, &b.name, b.kind))
        });

        info!(
            cluster = %cluster.name,
            workloads = workloads.len(),
            containers = workloads.iter().map(|w| w.containers.len()).sum::<usize>(),
            "Discovery completed"
        );
        Ok(workloads)
    }
}

struct PodLabels {
    name: String,
    labels: BTreeMap<String, String>,
}

fn apis<K>(client: &Client, filter: &NamespaceFilter) -> Vec<Api<K>>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    if filter.namespaces.is_empty() {
        vec![Api::all(client.clone())]
    } else {
        filter
            .namespaces
            .iter()
            .map(|ns| Api::namespaced(client.clone(), ns))
            .collect()
    }
}

/// Follow continue tokens until the API reports the last page
async fn paginate<K, F, Fut>(
    base: ListParams,
    page_size: u32,
    mut fetch: F,
) -> Result<Vec<K>, kube::Error>
where
    K: Clone,
    F: FnMut(ListParams) -> Fut,
    Fut: Future<Output = Result<ObjectList<K>, kube::Error>>,
{
    let mut items = Vec::new();
    let mut params = base.limit(page_size);
    loop {
        let page = fetch(params.clone()).await?;
        items.extend(page.items);
        match page.metadata.continue_ {
            Some(token) if !token.is_empty() => params = params.continue_token(&token),
            _ => return Ok(items),
        }
    }
}

fn to_discovered<K: WorkloadResource>(
    cluster: &str,
    obj: &K,
) -> Result<Option<Discovered>, DiscoveryError> {
    // Jobs spawned by a CronJob are reported through the CronJob
    if obj.owner_references().iter().any(|o| o.kind == "CronJob") {
        return Ok(None);
    }

    let name = obj.name_any();
    let namespace = obj.namespace().ok_or_else(|| {
        DiscoveryError::MalformedResponse(format!("{} {} has no namespace", K::KIND, name))
    })?;

    let containers = match obj.pod_spec() {
        Some(spec) => spec
            .containers
            .iter()
            .map(to_container)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    Ok(Some(Discovered {
        workload: Workload {
            cluster: cluster.to_string(),
            namespace,
            kind: K::KIND,
            name,
            containers,
            pods: Vec::new(),
        },
        match_labels: obj.match_labels().cloned(),
    }))
}

fn to_container(container: &PodContainer) -> Result<Container, DiscoveryError> {
    let resources = container.resources.as_ref();
    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());

    let read = |map: Option<&BTreeMap<String, Quantity>>, key: &str| {
        map.and_then(|m| m.get(key))
            .map(|q| parse_quantity(&q.0))
            .transpose()
            .map_err(|e| {
                DiscoveryError::MalformedResponse(format!("container {}: {}", container.name, e))
            })
    };

    Ok(Container {
        name: container.name.clone(),
        resources: ResourceAllocation {
            cpu_request: read(requests, "cpu")?,
            cpu_limit: read(limits, "cpu")?,
            memory_request: read(requests, "memory")?,
            memory_limit: read(limits, "memory")?,
        },
    })
}

fn assign_pods(
    discovered: Vec<Discovered>,
    pods: &HashMap<String, Vec<PodLabels>>,
) -> Vec<Workload> {
    discovered
        .into_iter()
        .map(|d| {
            let mut workload = d.workload;
            if let (Some(selector), Some(candidates)) =
                (d.match_labels.as_ref(), pods.get(&workload.namespace))
            {
                if !selector.is_empty() {
                    let mut names: Vec<String> = candidates
                        .iter()
                        .filter(|p| selector.iter().all(|(k, v)| p.labels.get(k) == Some(v)))
                        .map(|p| p.name.clone())
                        .collect();
                    names.sort();
                    workload.pods = names;
                }
            }
            workload
        })
        .collect()
}
