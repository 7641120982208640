use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use eyre::{Context, Result};
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, span, warn, Instrument, Level};

use crate::backend::Evacuate;
use crate::error_codes::{is_404_not_found_error, is_transient_error};
use crate::metadata::ScheduledEvent;

/// Marks nodes cordoned by us, so uncordon only touches what we drained.
pub const MANAGED_LABEL_KEY: &str = "scheduled-events-drain/managed";

const FIELD_MANAGER: &str = "scheduled-events-drain";
const MIRROR_POD_ANNOTATION_KEY: &str = "kubernetes.io/config.mirror";
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct KubernetesDrainConfig {
    pub grace_period: Option<Duration>,
    pub timeout: Duration,
    pub force: bool,
    pub ignore_daemonsets: bool,
    pub delete_emptydir_data: bool,
    pub pod_selector: Option<String>,
    pub dry_run: bool,
}

impl Default for KubernetesDrainConfig {
    fn default() -> Self {
        Self {
            grace_period: None,
            timeout: Duration::from_secs(300),
            force: false,
            ignore_daemonsets: false,
            delete_emptydir_data: false,
            pod_selector: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum KubernetesBackendError {
    #[error("kube error")]
    Kube(#[from] kube::Error),
    #[error("cannot evict pods: {0}")]
    Blocked(String),
    #[error("pods are not gone after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, PartialEq, Eq)]
enum PodDisposition {
    Evict,
    Skip(&'static str),
    Block(&'static str),
}

/// Same rules `kubectl drain` applies before it evicts anything.
fn classify_pod(pod: &Pod, config: &KubernetesDrainConfig) -> PodDisposition {
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION_KEY) {
        return PodDisposition::Skip("mirror pod");
    }

    let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
    if matches!(phase, Some("Succeeded" | "Failed")) {
        return PodDisposition::Skip("finished");
    }

    let controller = pod
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true));
    match controller {
        Some(owner) if owner.kind == "DaemonSet" => {
            return if config.ignore_daemonsets {
                PodDisposition::Skip("daemonset")
            } else {
                PodDisposition::Block("managed by a DaemonSet")
            };
        }
        None if !config.force => return PodDisposition::Block("not managed by a controller"),
        _ => {}
    }

    let has_empty_dir = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|volume| volume.empty_dir.is_some()));
    if has_empty_dir && !config.delete_emptydir_data {
        return PodDisposition::Block("uses emptyDir local storage");
    }

    PodDisposition::Evict
}

/// Pods to evict, or every pod that keeps the node from being drained.
fn plan_evictions(
    pods: Vec<Pod>,
    config: &KubernetesDrainConfig,
) -> Result<Vec<Pod>, KubernetesBackendError> {
    let mut evictions = Vec::new();
    let mut blocked = Vec::new();
    for pod in pods {
        match classify_pod(&pod, config) {
            PodDisposition::Evict => evictions.push(pod),
            PodDisposition::Skip(reason) => debug!(pod = %describe(&pod), reason, "skip"),
            PodDisposition::Block(reason) => blocked.push(format!("{} ({reason})", describe(&pod))),
        }
    }

    if !blocked.is_empty() {
        return Err(KubernetesBackendError::Blocked(blocked.join(", ")));
    }

    Ok(evictions)
}

fn grace_period_seconds(grace_period: Duration) -> u32 {
    u32::try_from(grace_period.as_secs()).unwrap_or(u32::MAX)
}

fn describe(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

pub struct KubernetesBackend {
    client: Client,
    node_name: String,
    config: KubernetesDrainConfig,
}

impl KubernetesBackend {
    pub fn new(client: Client, node_name: impl Into<String>, config: KubernetesDrainConfig) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            config,
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            dry_run: self.config.dry_run,
            field_manager: Some(String::from(FIELD_MANAGER)),
            ..PatchParams::default()
        }
    }

    async fn patch_node(&self, name: &str, patch: Value) -> kube::Result<()> {
        self.nodes()
            .patch(name, &self.patch_params(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> kube::Result<()> {
        self.patch_node(name, json!({ "spec": { "unschedulable": unschedulable } }))
            .await
    }

    async fn try_drain(&self) -> Result<(), KubernetesBackendError> {
        // refuse before the node is touched
        plan_evictions(self.list_node_pods().await?, &self.config)?;

        info!(node = %self.node_name, "label node");
        self.patch_node(
            &self.node_name,
            json!({ "metadata": { "labels": { MANAGED_LABEL_KEY: self.node_name } } }),
        )
        .await?;

        info!(node = %self.node_name, "cordon node");
        self.set_unschedulable(&self.node_name, true).await?;

        // again, for pods scheduled before the cordon
        let evictions = plan_evictions(self.list_node_pods().await?, &self.config)?;

        info!(node = %self.node_name, pods = evictions.len(), "evicting pods");
        let evict_all = try_join_all(evictions.iter().map(|pod| self.evict_and_wait(pod)));
        match tokio::time::timeout(self.config.timeout, evict_all).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(KubernetesBackendError::Timeout(self.config.timeout)),
        }
    }

    async fn list_node_pods(&self) -> kube::Result<Vec<Pod>> {
        let mut list_params =
            ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        if let Some(selector) = &self.config.pod_selector {
            list_params = list_params.labels(selector);
        }

        Ok(Api::<Pod>::all(self.client.clone())
            .list(&list_params)
            .await?
            .items)
    }

    async fn evict_and_wait(&self, pod: &Pod) -> kube::Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace().unwrap_or_default());
        let name = pod.name_any();
        let evict_params = EvictParams {
            delete_options: Some(DeleteParams {
                dry_run: self.config.dry_run,
                grace_period_seconds: self.config.grace_period.map(grace_period_seconds),
                ..DeleteParams::default()
            }),
            post_options: PostParams {
                dry_run: self.config.dry_run,
                field_manager: Some(String::from(FIELD_MANAGER)),
            },
        };

        let span = span!(Level::DEBUG, "evict", pod = %describe(pod));
        async move {
            let mut backoff = ExponentialBackoff::default();
            loop {
                match api.evict(&name, &evict_params).await {
                    Ok(_) => {
                        info!("pod is evicted");
                        break;
                    }
                    Err(err) if is_404_not_found_error(&err) => {
                        debug!("pod is gone anyway");
                        return Ok(());
                    }
                    // 429 when a PodDisruptionBudget doesn't allow it yet
                    Err(err) if is_transient_error(&err) => {
                        let Some(delay) = backoff.next_backoff() else {
                            return Err(err);
                        };
                        debug!(%err, ?delay, "retry eviction");
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => return Err(err),
                }
            }

            if self.config.dry_run {
                return Ok(());
            }

            loop {
                match api.get_opt(&name).await? {
                    Some(current) if current.metadata.uid == pod.metadata.uid => {
                        tokio::time::sleep(DELETION_POLL_INTERVAL).await;
                    }
                    _ => return Ok(()),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_uncordon(&self) -> Result<(), KubernetesBackendError> {
        let selector = format!("{MANAGED_LABEL_KEY}={}", self.node_name);
        let nodes = self.nodes().list(&ListParams::default().labels(&selector)).await?;
        for node in nodes.items {
            let name = node.name_any();
            info!(node = %name, "uncordon node");
            self.set_unschedulable(&name, false).await?;
        }

        info!(node = %self.node_name, "remove node label");
        self.patch_node(
            &self.node_name,
            json!({ "metadata": { "labels": { MANAGED_LABEL_KEY: null } } }),
        )
        .await?;

        Ok(())
    }
}

impl Evacuate for KubernetesBackend {
    fn instance_name(&self) -> &str {
        &self.node_name
    }

    async fn test(&self) -> Result<()> {
        self.nodes()
            .get(&self.node_name)
            .await
            .with_context(|| format!("unable to get node '{}' from kubernetes api", self.node_name))?;
        Ok(())
    }

    async fn drain(&self, _event: &ScheduledEvent) -> bool {
        match self.try_drain().await {
            Ok(()) => true,
            Err(KubernetesBackendError::Blocked(pods)) => {
                warn!(%pods, "drain blocked");
                false
            }
            Err(err) => {
                error!(?err, node = %self.node_name, "drain failed");
                false
            }
        }
    }

    async fn uncordon(&self) -> bool {
        match self.try_uncordon().await {
            Ok(()) => true,
            Err(err) => {
                error!(?err, node = %self.node_name, "uncordon failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! from_json {
        ($($json:tt)+) => {
            ::serde_json::from_value(::serde_json::json!($($json)+)).expect("Invalid json")
        };
    }

    fn owned_by(kind: &str) -> Pod {
        from_json!({
            "metadata": {
                "name": "some-pod",
                "namespace": "default",
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": kind,
                    "name": "owner",
                    "uid": "uid1234",
                    "controller": true,
                }],
            },
            "spec": { "containers": [] },
        })
    }

    #[test]
    fn should_evict_replicaset_pods() {
        let pod = owned_by("ReplicaSet");
        assert_eq!(
            classify_pod(&pod, &KubernetesDrainConfig::default()),
            PodDisposition::Evict
        );
    }

    #[test]
    fn should_skip_mirror_pods() {
        let pod: Pod = from_json!({
            "metadata": {
                "name": "kube-proxy",
                "annotations": { "kubernetes.io/config.mirror": "abc" },
            },
        });
        assert_matches!(
            classify_pod(&pod, &KubernetesDrainConfig::default()),
            PodDisposition::Skip(_)
        );
    }

    #[test]
    fn should_skip_finished_pods() {
        let mut pod = owned_by("Job");
        pod.status = Some(from_json!({ "phase": "Succeeded" }));
        assert_matches!(
            classify_pod(&pod, &KubernetesDrainConfig::default()),
            PodDisposition::Skip(_)
        );
    }

    #[test]
    fn daemonset_pods_block_unless_ignored() {
        let pod = owned_by("DaemonSet");
        assert_matches!(
            classify_pod(&pod, &KubernetesDrainConfig::default()),
            PodDisposition::Block(_)
        );

        let config = KubernetesDrainConfig {
            ignore_daemonsets: true,
            ..KubernetesDrainConfig::default()
        };
        assert_matches!(classify_pod(&pod, &config), PodDisposition::Skip(_));
    }

    #[test]
    fn unmanaged_pods_require_force() {
        let pod: Pod = from_json!({
            "metadata": { "name": "bare", "namespace": "default" },
        });
        assert_matches!(
            classify_pod(&pod, &KubernetesDrainConfig::default()),
            PodDisposition::Block(_)
        );

        let config = KubernetesDrainConfig {
            force: true,
            ..KubernetesDrainConfig::default()
        };
        assert_eq!(classify_pod(&pod, &config), PodDisposition::Evict);
    }

    #[test]
    fn blocked_pods_fail_the_whole_plan() {
        let bare: Pod = from_json!({
            "metadata": { "name": "bare", "namespace": "default" },
        });
        let result = plan_evictions(
            vec![owned_by("ReplicaSet"), bare],
            &KubernetesDrainConfig::default(),
        );
        assert_matches!(
            result,
            Err(KubernetesBackendError::Blocked(pods)) if pods == "default/bare (not managed by a controller)"
        );

        let plan = plan_evictions(
            vec![owned_by("ReplicaSet"), owned_by("DaemonSet")],
            &KubernetesDrainConfig {
                ignore_daemonsets: true,
                ..KubernetesDrainConfig::default()
            },
        )
        .unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn grace_period_saturates() {
        assert_eq!(grace_period_seconds(Duration::from_secs(30)), 30);
        assert_eq!(grace_period_seconds(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn empty_dir_requires_opt_in() {
        let mut pod = owned_by("ReplicaSet");
        pod.spec = Some(from_json!({
            "containers": [],
            "volumes": [{ "name": "scratch", "emptyDir": {} }],
        }));
        assert_matches!(
            classify_pod(&pod, &KubernetesDrainConfig::default()),
            PodDisposition::Block(_)
        );

        let config = KubernetesDrainConfig {
            delete_emptydir_data: true,
            ..KubernetesDrainConfig::default()
        };
        assert_eq!(classify_pod(&pod, &config), PodDisposition::Evict);
    }
}
