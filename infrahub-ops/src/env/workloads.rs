//! Kubernetes pod and workload resolution.
//!
//! Logical services are located through a list of label selectors, with
//! substring matching on resource names as the last resort.

use crate::runner::{argv, CommandRunner};
use crate::utils::format::non_empty_lines;
use crate::utils::{OpsError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

pub const KUBECTL: &str = "kubectl";

/// Label carried by every pod of an Infrahub deployment.
pub const PRODUCT_SELECTOR: &str = "app.kubernetes.io/name=infrahub";

pub const NAME_JSONPATH: &str = r#"jsonpath={range .items[*]}{.metadata.name}{"\n"}{end}"#;
pub const PHASE_JSONPATH: &str = r#"jsonpath={range .items[*]}{.status.phase}{"\n"}{end}"#;
pub const NAME_PHASE_JSONPATH: &str =
    r#"jsonpath={range .items[*]}{.metadata.name}{";"}{.status.phase}{"\n"}{end}"#;

const WORKLOAD_KINDS: [&str; 2] = ["deployment", "statefulset"];

/// Role labels inspected, in order, to elect the primary of a replicated service.
const ROLE_LABEL_PATHS: [&str; 2] = [
    r"jsonpath={.metadata.labels.cnpg\.io/instanceRole}",
    r"jsonpath={.metadata.labels.role}",
];

/// Label selectors tried, in order, for a logical service.
pub fn pod_selectors(service: &str) -> Vec<String> {
    vec![
        format!("app.kubernetes.io/component={}", service),
        format!("app={}", service),
        format!("component={}", service),
        format!("infrahub/service={}", service),
    ]
}

/// Evaluates an equality-based selector (`k=v,k2=v2` or bare `k`) against labels.
pub fn selector_matches_labels(selector: &str, labels: &HashMap<String, String>) -> bool {
    let selector = selector.trim();
    if labels.is_empty() || selector.is_empty() {
        return false;
    }

    for condition in selector.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        match condition.split_once('=') {
            Some((key, value)) => {
                if labels.get(key.trim()).map(String::as_str) != Some(value.trim()) {
                    return false;
                }
            }
            None => {
                if !labels.contains_key(condition) {
                    return false;
                }
            }
        }
    }
    true
}

/// A deployment or statefulset backing a logical service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: &'static str,
    pub name: String,
}

impl WorkloadRef {
    /// Replica cache key, `<kind>/<name>`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct Workload {
    pub name: String,
    pub selector_labels: HashMap<String, String>,
    pub template_labels: HashMap<String, String>,
}

#[derive(Deserialize)]
struct WorkloadList {
    #[serde(default)]
    items: Vec<WorkloadItem>,
}

#[derive(Deserialize)]
struct WorkloadItem {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: WorkloadSpec,
}

#[derive(Deserialize, Default)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Default)]
struct WorkloadSpec {
    #[serde(default)]
    selector: LabelSelector,
    #[serde(default)]
    template: PodTemplate,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LabelSelector {
    #[serde(default)]
    match_labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Default)]
struct PodTemplate {
    #[serde(default)]
    metadata: ObjectMeta,
}

/// Parses `kubectl get <kind> -o json` output.
pub fn parse_workloads(json: &str) -> Result<Vec<Workload>> {
    let list: WorkloadList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .map(|item| Workload {
            name: item.metadata.name,
            selector_labels: item.spec.selector.match_labels.unwrap_or_default(),
            template_labels: item.spec.template.metadata.labels.unwrap_or_default(),
        })
        .collect())
}

/// Namespace-scoped kubectl queries.
pub struct Kubectl<'a> {
    pub runner: &'a dyn CommandRunner,
    pub namespace: &'a str,
}

impl<'a> Kubectl<'a> {
    pub fn new(runner: &'a dyn CommandRunner, namespace: &'a str) -> Self {
        Self { runner, namespace }
    }

    async fn get(&self, resource: &str, selector: Option<&str>, output: &str) -> Result<String> {
        let mut args = argv(&["get", resource, "-n", self.namespace]);
        if let Some(selector) = selector {
            args.push("-l".to_string());
            args.push(selector.to_string());
        }
        args.push("-o".to_string());
        args.push(output.to_string());
        self.runner.run(KUBECTL, &args).await
    }

    /// Names of resources of `kind` matching `selector`, or all when `None`.
    pub async fn names(&self, kind: &str, selector: Option<&str>) -> Result<Vec<String>> {
        Ok(non_empty_lines(&self.get(kind, selector, NAME_JSONPATH).await?))
    }

    /// Resolves the pod that should receive commands for `service`.
    pub async fn find_pod(&self, service: &str) -> Result<String> {
        for selector in pod_selectors(service) {
            let pods = match self.names("pods", Some(&selector)).await {
                Ok(pods) if !pods.is_empty() => pods,
                Ok(_) => continue,
                Err(e) => {
                    debug!(selector = %selector, "Pod lookup failed: {}", e);
                    continue;
                }
            };
            if pods.len() > 1 {
                if let Some(primary) = self.find_primary_pod(&pods).await {
                    return Ok(primary);
                }
            }
            return Ok(pods[0].clone());
        }

        self.names("pods", None)
            .await?
            .into_iter()
            .find(|name| name.contains(service))
            .ok_or_else(|| {
                OpsError::other(format!(
                    "no pods found for service {} in namespace {}",
                    service, self.namespace
                ))
            })
    }

    /// First pod whose role label marks it as primary.
    pub async fn find_primary_pod(&self, pods: &[String]) -> Option<String> {
        for pod in pods {
            for path in ROLE_LABEL_PATHS {
                let args = argv(&["get", "pod", pod.as_str(), "-n", self.namespace, "-o", path]);
                if let Ok(role) = self.runner.run(KUBECTL, &args).await {
                    if role.trim() == "primary" {
                        return Some(pod.clone());
                    }
                }
            }
        }
        None
    }

    /// Pod phases for `service`, used as the liveness signal.
    pub async fn pod_phases(&self, service: &str) -> Result<Vec<String>> {
        for selector in pod_selectors(service) {
            if let Ok(output) = self.get("pods", Some(&selector), PHASE_JSONPATH).await {
                let phases = non_empty_lines(&output);
                if !phases.is_empty() {
                    return Ok(phases);
                }
            }
        }

        let output = self.get("pods", None, NAME_PHASE_JSONPATH).await?;
        Ok(non_empty_lines(&output)
            .into_iter()
            .filter_map(|line| {
                let (name, phase) = line.split_once(';')?;
                name.contains(service).then(|| phase.to_string())
            })
            .collect())
    }

    /// Locates the deployment or statefulset behind `service`.
    pub async fn find_workload(&self, service: &str) -> Result<WorkloadRef> {
        let selectors = pod_selectors(service);

        for kind in WORKLOAD_KINDS {
            for selector in &selectors {
                if let Ok(names) = self.names(kind, Some(selector)).await {
                    if let Some(name) = names.into_iter().next() {
                        return Ok(WorkloadRef { kind, name });
                    }
                }
            }

            if let Ok(output) = self.get(kind, None, "json").await {
                match parse_workloads(&output) {
                    Ok(workloads) => {
                        if let Some(name) = match_workload(&workloads, &selectors, service) {
                            return Ok(WorkloadRef { kind, name });
                        }
                    }
                    Err(e) => debug!(kind, "Could not parse workload list: {}", e),
                }
            }

            if let Ok(names) = self.names(kind, None).await {
                if let Some(name) = names.into_iter().find(|n| n.contains(service)) {
                    return Ok(WorkloadRef { kind, name });
                }
            }
        }

        Err(OpsError::other(format!(
            "no workloads found for service {} in namespace {}",
            service, self.namespace
        )))
    }

    pub async fn replica_count(&self, workload: &WorkloadRef) -> Result<u32> {
        let args = argv(&[
            "get",
            workload.kind,
            workload.name.as_str(),
            "-n",
            self.namespace,
            "-o",
            "jsonpath={.spec.replicas}",
        ]);
        let output = self.runner.run(KUBECTL, &args).await?;
        output.trim().parse().map_err(|_| OpsError::Parse {
            what: format!("replica count of {}", workload),
            message: format!("unexpected value {:?}", output.trim()),
        })
    }

    pub async fn scale(&self, workload: &WorkloadRef, replicas: u32) -> Result<()> {
        let args = argv(&[
            "scale".to_string(),
            "-n".to_string(),
            self.namespace.to_string(),
            workload.key(),
            format!("--replicas={}", replicas),
        ]);
        self.runner.run_quiet(KUBECTL, &args).await
    }
}

/// Picks a workload by selector labels, falling back to a name containing `service`.
pub fn match_workload(
    workloads: &[Workload],
    selectors: &[String],
    service: &str,
) -> Option<String> {
    let mut candidate = None;
    for workload in workloads {
        if selectors.iter().any(|selector| {
            selector_matches_labels(selector, &workload.selector_labels)
                || selector_matches_labels(selector, &workload.template_labels)
        }) {
            return Some(workload.name.clone());
        }
        if candidate.is_none() && workload.name.contains(service) {
            candidate = Some(workload.name.clone());
        }
    }
    candidate
}
