/* -------------------------------------------------------------------------- *\
 *        Apache 2.0 License Copyright © 2023-2025 The Kubuild Authors        *
 *                                                                            *
 *         +-------------------------------------------------------+          *
 *         | ██╗  ██╗██╗   ██╗██████╗ ██╗   ██╗██╗██╗     ██████╗  |          *
 *         | ██║ ██╔╝██║   ██║██╔══██╗██║   ██║██║██║     ██╔══██╗ |          *
 *         | █████╔╝ ██║   ██║██████╔╝██║   ██║██║██║     ██║  ██║ |          *
 *         | ██╔═██╗ ██║   ██║██╔══██╗██║   ██║██║██║     ██║  ██║ |          *
 *         | ██║  ██╗╚██████╔╝██████╔╝╚██████╔╝██║███████╗██████╔╝ |          *
 *         | ╚═╝  ╚═╝ ╚═════╝ ╚═════╝  ╚═════╝ ╚═╝╚══════╝╚═════╝  |          *
 *         +-------------------------------------------------------+          *
 *                                                                            *
 *                   In-Cluster Image Builds for Kubernetes                   *
 *                                                                            *
 * -------------------------------------------------------------------------- *
 *                                                                            *
 *   Licensed under the Apache License, Version 2.0 (the "License");          *
 *   you may not use this file except in compliance with the License.         *
 *   You may obtain a copy of the License at                                  *
 *                                                                            *
 *       http://www.apache.org/licenses/LICENSE-2.0                           *
 *                                                                            *
 *   Unless required by applicable law or agreed to in writing, software      *
 *   distributed under the License is distributed on an "AS IS" BASIS,        *
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. *
 *   See the License for the specific language governing permissions and      *
 *   limitations under the License.                                           *
 *                                                                            *
\* -------------------------------------------------------------------------- */

//! The driver proper: capability-set implementation over the cluster
//! APIs, with control connections tunneled into builder pods.

use super::authprovider::KubeAuthProvider;
use super::manifest::{DeploymentOpt, ANNOTATION_KEY};
use super::podchooser::{
    list_running_pods, PodChooser, WorkerIntrospect,
};
use super::tunnel::ExecTunnel;
use super::{
    KubernetesDriverState, BUILDKITD_SOCKET_PATH,
    DEFAULT_CONTAINERD_SOCK_PATH, DEFAULT_DOCKER_SOCK_PATH, DRIVER_NAME,
    PROXY_SOCKET_PATH, RUNTIME_CONTAINERD, RUNTIME_DOCKER,
};
use crate::error::{DriverError, Result};
use crate::{
    BootLog, Builder, BuilderClients, Driver, Feature, Info, InitConfig,
    Node, NodeClient, Platform, Status,
};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams};
use kubuild_client::session::Attachable;
use kubuild_client::BuildKitClient;
use kubuild_proto::control::WorkerRecord;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const FEATURE_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const INFO_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything the convergence loop may rewrite when it flips the
/// runtime; guarded by one async mutex so concurrent in-process calls
/// serialize.
#[derive(Debug)]
pub(super) struct DriverInner {
    pub opt: DeploymentOpt,
    pub deployment: Deployment,
    pub config_map: ConfigMap,
    pub min_replicas: i32,
    pub user_specified_runtime: bool,
    pub user_specified_config: bool,
    pub loadbalance: String,
    pub namespace: String,
}

pub struct KubernetesDriver {
    pub(super) init: InitConfig,
    pub(super) inner: Mutex<DriverInner>,
    pub(super) chooser: Box<dyn PodChooser>,
    pub(super) state: Arc<KubernetesDriverState>,
    deployment_name: String,

    pub(super) deployment_api: Api<Deployment>,
    pub(super) replicaset_api: Api<ReplicaSet>,
    pub(super) pod_api: Api<Pod>,
    pub(super) event_api: Api<Event>,
    pub(super) config_map_api: Api<ConfigMap>,
    pub(super) secret_api: Api<Secret>,
}

impl std::fmt::Debug for KubernetesDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesDriver")
            .field("name", &self.deployment_name)
            .finish()
    }
}

pub(super) fn is_child_of(meta: &ObjectMeta, parent_uid: &str) -> bool {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|owner| owner.uid == parent_uid)
}

fn pod_containers(pod: &Pod) -> Result<&Vec<k8s_openapi::api::core::v1::Container>> {
    let containers = pod
        .spec
        .as_ref()
        .map(|s| &s.containers)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| DriverError::PodWithoutContainers {
            pod: pod.metadata.name.clone().unwrap_or_default(),
        })?;
    Ok(containers)
}

fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

fn is_rootless(pod: &Pod) -> bool {
    pod_label(pod, "rootless")
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false)
}

impl KubernetesDriver {
    pub(super) fn new(
        init: InitConfig,
        inner: DriverInner,
        chooser: Box<dyn PodChooser>,
        state: Arc<KubernetesDriverState>,
    ) -> Self {
        let kube = init.kube_client.clone();
        let namespace = inner.namespace.clone();
        let deployment_name = inner.opt.name.clone();
        Self {
            init,
            inner: Mutex::new(inner),
            chooser,
            state,
            deployment_name,
            deployment_api: Api::namespaced(kube.clone(), &namespace),
            replicaset_api: Api::namespaced(kube.clone(), &namespace),
            pod_api: Api::namespaced(kube.clone(), &namespace),
            event_api: Api::namespaced(kube.clone(), &namespace),
            config_map_api: Api::namespaced(kube.clone(), &namespace),
            secret_api: Api::namespaced(kube, &namespace),
        }
    }

    /// A control client whose transport redials an exec tunnel into the
    /// pod for each new connection.
    async fn node_client(&self, pod: &Pod) -> Result<NodeClient> {
        let containers = pod_containers(pod)?;
        let container = containers[0].name.clone();
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let rootless = is_rootless(pod);

        let socket = if rootless {
            BUILDKITD_SOCKET_PATH
        } else {
            PROXY_SOCKET_PATH
        };
        let cmd = vec![
            "buildctl".to_string(),
            "--addr".to_string(),
            format!("unix://{socket}"),
            "dial-stdio".to_string(),
        ];

        let pod_api = self.pod_api.clone();
        let dial_pod = pod_name.clone();
        let client = BuildKitClient::connect_with(move || {
            let pod_api = pod_api.clone();
            let pod_name = dial_pod.clone();
            let container = container.clone();
            let cmd = cmd.clone();
            async move {
                ExecTunnel::open(&pod_api, &pod_name, &container, cmd)
                    .await
                    .map_err(std::io::Error::other)
            }
        })
        .await?;

        Ok(NodeClient {
            node_name: pod_name,
            cluster_addr: pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default(),
            proxy: (!rootless).then(|| client.clone()),
            client,
        })
    }

    async fn node_with_platforms(&self, pod: &Pod) -> Node {
        let platforms = match self
            .workers_for_pod(pod, INFO_QUERY_TIMEOUT)
            .await
        {
            Ok(workers) => workers
                .iter()
                .flat_map(|w| &w.platforms)
                .map(|p| {
                    Platform {
                        os: p.os.clone(),
                        architecture: p.architecture.clone(),
                        variant: p.variant.clone(),
                    }
                    .normalize()
                })
                .collect(),
            Err(e) => {
                debug!("worker introspection failed: {e}");
                Vec::new()
            }
        };
        Node {
            name: pod.metadata.name.clone().unwrap_or_default(),
            status: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default(),
            platforms,
        }
    }
}

#[async_trait::async_trait]
impl WorkerIntrospect for KubernetesDriver {
    async fn workers_for_pod(
        &self,
        pod: &Pod,
        timeout: Duration,
    ) -> Result<Vec<WorkerRecord>> {
        let client = self.node_client(pod).await?;
        Ok(client.client.list_workers(timeout).await?)
    }
}

#[async_trait::async_trait]
impl Driver for KubernetesDriver {
    fn name(&self) -> String {
        self.deployment_name.clone()
    }

    fn factory_name(&self) -> String {
        DRIVER_NAME.to_string()
    }

    async fn bootstrap(
        &self,
        log: &BootLog,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        log.log(format!(
            "waiting for {} pods to be ready for {}",
            inner.min_replicas, self.deployment_name
        ));
        self.ensure_config_map(&inner, log, cancel).await?;
        self.create_builder(&mut inner, log, cancel).await
    }

    async fn info(&self) -> Result<Info> {
        let deployment = match self
            .deployment_api
            .get_opt(&self.deployment_name)
            .await?
        {
            Some(deployment) => deployment,
            None => {
                return Ok(Info {
                    status: Status::Inactive,
                    dynamic_nodes: Vec::new(),
                })
            }
        };
        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        if ready <= 0 {
            return Ok(Info {
                status: Status::Stopped,
                dynamic_nodes: Vec::new(),
            });
        }

        let pods =
            list_running_pods(&self.pod_api, &self.deployment_name)
                .await?;
        let mut nodes = Vec::with_capacity(pods.len());
        for pod in &pods {
            nodes.push(self.node_with_platforms(pod).await);
        }
        Ok(Info { status: Status::Running, dynamic_nodes: nodes })
    }

    async fn list(&self) -> Result<Vec<Builder>> {
        let deployments =
            self.deployment_api.list(&ListParams::default()).await?;
        let mut builders = Vec::new();
        for deployment in deployments.items {
            let annotated = deployment
                .metadata
                .annotations
                .as_ref()
                .map(|a| a.contains_key(ANNOTATION_KEY))
                .unwrap_or(false);
            if !annotated {
                continue;
            }
            let name =
                deployment.metadata.name.clone().unwrap_or_default();
            let pods =
                list_running_pods(&self.pod_api, &name).await?;
            let mut nodes = Vec::with_capacity(pods.len());
            for pod in &pods {
                nodes.push(self.node_with_platforms(pod).await);
            }
            builders.push(Builder {
                name,
                driver: DRIVER_NAME.to_string(),
                nodes,
            });
        }
        Ok(builders)
    }

    async fn rm(&self) -> Result<()> {
        self.deployment_api
            .delete(&self.deployment_name, &DeleteParams::default())
            .await
            .map_err(|e| {
                DriverError::Other(anyhow::anyhow!(
                    "error while deleting deployment {:?}: {e}",
                    self.deployment_name
                ))
            })?;
        self.config_map_api
            .delete(&self.deployment_name, &DeleteParams::default())
            .await
            .map_err(|e| {
                DriverError::Other(anyhow::anyhow!(
                    "error while deleting configmap {:?}: {e}",
                    self.deployment_name
                ))
            })?;
        Ok(())
    }

    async fn features(&self) -> HashMap<Feature, bool> {
        let mut features = HashMap::from([
            (Feature::OciExporter, true),
            (Feature::DockerExporter, false),
            (Feature::ContainerdExporter, false),
            (Feature::CacheExport, true),
            (Feature::MultiPlatform, true),
        ]);

        // Runtime-specific exporters depend on which pod serves us.
        let choice = tokio::time::timeout(
            FEATURE_QUERY_TIMEOUT,
            self.chooser.choose_pod(self, &[]),
        )
        .await;
        if let Ok(Ok((pod, _))) = choice {
            if !is_rootless(&pod) {
                match pod_label(&pod, "runtime") {
                    Some(RUNTIME_CONTAINERD) => {
                        let _ = features
                            .insert(Feature::ContainerdExporter, true);
                    }
                    Some(RUNTIME_DOCKER) => {
                        let _ = features
                            .insert(Feature::DockerExporter, true);
                    }
                    other => {
                        debug!("unrecognized runtime label: {other:?}")
                    }
                }
            }
        }
        features
    }

    async fn clients(&self) -> Result<BuilderClients> {
        let (chosen, others) =
            self.chooser.choose_pod(self, &[]).await?;
        let chosen = self.node_client(&chosen).await?;
        let mut other_clients = Vec::with_capacity(others.len());
        for pod in &others {
            other_clients.push(self.node_client(pod).await?);
        }
        Ok(BuilderClients { chosen, others: other_clients })
    }

    async fn runtime_sock_proxy(
        &self,
        node_name: &str,
    ) -> Result<ExecTunnel> {
        let pods =
            list_running_pods(&self.pod_api, &self.deployment_name)
                .await?;
        for pod in &pods {
            if pod.metadata.name.as_deref() != Some(node_name) {
                continue;
            }
            let containers = pod_containers(pod)?;
            let container = containers[0].name.clone();
            let sock_path = match pod_label(pod, "runtime") {
                Some(RUNTIME_CONTAINERD) => {
                    DEFAULT_CONTAINERD_SOCK_PATH
                }
                Some(RUNTIME_DOCKER) => DEFAULT_DOCKER_SOCK_PATH,
                other => {
                    return Err(DriverError::UnexpectedRuntimeLabel {
                        runtime: other.unwrap_or_default().to_string(),
                        pod: node_name.to_string(),
                    })
                }
            };
            let cmd = vec![
                "buildctl".to_string(),
                "--addr".to_string(),
                format!("unix://{sock_path}"),
                "dial-stdio".to_string(),
            ];
            return ExecTunnel::open(
                &self.pod_api,
                node_name,
                &container,
                cmd,
            )
            .await;
        }
        Err(DriverError::NodeNotFound { node: node_name.to_string() })
    }

    async fn version(&self) -> Result<String> {
        let (pod, _) = self.chooser.choose_pod(self, &[]).await?;
        let containers = pod_containers(&pod)?;
        ExecTunnel::capture(
            &self.pod_api,
            &pod.metadata.name.clone().unwrap_or_default(),
            &containers[0].name,
            vec!["buildkitd".to_string(), "--version".to_string()],
        )
        .await
    }

    fn auth_provider(&self, secret_name: &str) -> Arc<dyn Attachable> {
        Arc::new(self.make_auth_provider(secret_name))
    }

    fn auth_config(
        &self,
        secret_name: &str,
    ) -> Arc<dyn crate::RegistryAuth> {
        Arc::new(self.make_auth_provider(secret_name))
    }

    fn auth_hint(&self) -> String {
        self.state.auth_hint()
    }
}

impl KubernetesDriver {
    fn make_auth_provider(&self, secret_name: &str) -> KubeAuthProvider {
        let secret_name = if secret_name.is_empty() {
            self.deployment_name.clone()
        } else {
            secret_name.to_string()
        };
        KubeAuthProvider::new(
            self.secret_api.clone(),
            secret_name,
            Arc::clone(&self.state),
        )
    }
}
