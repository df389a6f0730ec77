//! Kubernetes implementation of [`ClusterStateClient`]
//!
//! Each log source maps to one Deployment named `lfr-<source>` whose pods
//! carry the labels `app=lfr,source=<source>`. Resource usage comes from
//! the `metrics.k8s.io` API served by metrics-server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, Pod, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use super::quantity::{parse_cpu_millicores, parse_memory_bytes};
use super::{
    source_labels, workload_name, ClusterStateClient, WorkloadPatch, WorkloadTemplate,
    SOURCE_LABEL,
};
use crate::error::{Error, Result};
use crate::model::{Member, ObservedWorkload, ResourceUsage};

/// Field manager recorded on every write
const FIELD_MANAGER: &str = "lfr-manager";

/// Name of the LFR container and of its health port
const CONTAINER_NAME: &str = "lfr";
const HEALTH_PORT_NAME: &str = "health";

/// Cluster client bound to a single namespace
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pod_metrics(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        Api::namespaced_with(self.client.clone(), &self.namespace, &resource)
    }
}

#[async_trait]
impl ClusterStateClient for KubeClusterClient {
    async fn create_workload(&self, template: &WorkloadTemplate) -> Result<()> {
        let name = workload_name(&template.source);
        let deployment = build_deployment(&self.namespace, template);

        match self
            .deployments()
            .create(&PostParams::default(), &deployment)
            .await
        {
            Ok(_) => info!(
                "Created Deployment {}/{} with {} replica(s)",
                self.namespace, name, template.replicas
            ),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!("Deployment {}/{} already exists", self.namespace, name);
            }
            Err(e) => return Err(Error::KubeError(e)),
        }

        Ok(())
    }

    async fn list_workloads(&self, selector: &str) -> Result<Vec<ObservedWorkload>> {
        let deployments = self
            .deployments()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(Error::KubeError)?;

        Ok(deployments
            .items
            .iter()
            .filter_map(observed_from_deployment)
            .collect())
    }

    async fn get_workload(&self, source: &str) -> Result<Option<ObservedWorkload>> {
        let deployment = self
            .deployments()
            .get_opt(&workload_name(source))
            .await
            .map_err(Error::KubeError)?;

        Ok(deployment.as_ref().and_then(observed_from_deployment))
    }

    async fn patch_workload(&self, source: &str, patch: &WorkloadPatch) -> Result<()> {
        let name = workload_name(source);
        let body = patch.to_merge_patch();

        match self
            .deployments()
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
            .await
        {
            Ok(_) => {
                debug!("Patched Deployment {}/{}: {:?}", self.namespace, name, patch);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::NotFound {
                kind: "Deployment".to_string(),
                name,
                namespace: self.namespace.clone(),
            }),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn delete_workload(&self, source: &str) -> Result<()> {
        let name = workload_name(source);

        match self
            .deployments()
            .delete(&name, &DeleteParams::default())
            .await
        {
            Ok(_) => info!("Deleted Deployment {}/{}", self.namespace, name),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!("Deployment {}/{} not found, already deleted", self.namespace, name);
            }
            Err(e) => return Err(Error::KubeError(e)),
        }

        Ok(())
    }

    async fn list_members(&self, selector: &str) -> Result<Vec<Member>> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(Error::KubeError)?;

        Ok(pods
            .items
            .iter()
            .map(|pod| Member {
                name: pod.name_any(),
                address: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
            })
            .collect())
    }

    async fn sample_usage(&self, selector: &str) -> Result<Option<ResourceUsage>> {
        let samples = self
            .pod_metrics()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(Error::KubeError)?;

        if samples.items.is_empty() {
            return Ok(None);
        }

        let mut usage = ResourceUsage::default();
        for pod in &samples.items {
            usage.members += 1;
            let containers = pod.data["containers"].as_array();
            for container in containers.into_iter().flatten() {
                let cpu = container["usage"]["cpu"].as_str().and_then(parse_cpu_millicores);
                let memory = container["usage"]["memory"]
                    .as_str()
                    .and_then(parse_memory_bytes);
                usage.cpu_millicores += cpu.unwrap_or(0.0);
                usage.memory_bytes += memory.unwrap_or(0.0);
            }
        }

        Ok(Some(usage))
    }
}

/// Convert a Deployment into the observed view, skipping unlabelled ones
fn observed_from_deployment(deployment: &Deployment) -> Option<ObservedWorkload> {
    let Some(source) = deployment.labels().get(SOURCE_LABEL) else {
        warn!(
            "Deployment {} matches the LFR selector but has no '{}' label, ignoring",
            deployment.name_any(),
            SOURCE_LABEL
        );
        return None;
    };

    // The API server defaults an unset replica count to 1
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);

    Some(ObservedWorkload::new(source.clone(), desired, available))
}

fn build_deployment(namespace: &str, template: &WorkloadTemplate) -> Deployment {
    let labels = source_labels(&template.source);

    Deployment {
        metadata: ObjectMeta {
            name: Some(workload_name(&template.source)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(template.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![build_container(template)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn build_container(template: &WorkloadTemplate) -> Container {
    let mut requests = BTreeMap::new();
    requests.insert(
        "cpu".to_string(),
        Quantity(format!("{}m", template.cpu_request_millicores)),
    );
    requests.insert(
        "memory".to_string(),
        Quantity(template.memory_request.clone()),
    );

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(template.image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(template.health_port),
            name: Some(HEALTH_PORT_NAME.to_string()),
            ..Default::default()
        }]),
        env: Some(vec![EnvVar {
            name: "LOG_SOURCE".to_string(),
            value: Some(template.source.clone()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_string()),
                port: IntOrString::String(HEALTH_PORT_NAME.to_string()),
                ..Default::default()
            }),
            period_seconds: Some(10),
            ..Default::default()
        }),
        ..Default::default()
    }
}
