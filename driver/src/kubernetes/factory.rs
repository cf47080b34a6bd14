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

//! Constructs Kubernetes drivers from driver options.

use super::driver::{DriverInner, KubernetesDriver};
use super::manifest::{self, DeploymentOpt};
use super::podchooser::{PodChooser, RandomPodChooser, StickyPodChooser};
use super::{
    default_config_file, KubernetesDriverState, DEFAULT_BUILDER_NAME,
    DEFAULT_CONTAINERD_NAMESPACE, DEFAULT_CONTAINERD_SOCK_PATH,
    DEFAULT_CONTAINER_RUNTIME, DEFAULT_DOCKER_SOCK_PATH, DRIVER_NAME,
    LOADBALANCE_RANDOM, LOADBALANCE_STICKY, RUNTIME_CONTAINERD,
    RUNTIME_DOCKER, WORKER_AUTO, WORKER_CONTAINERD, WORKER_RUNC,
};
use crate::error::{DriverError, Result};
use crate::{Driver, Factory, InitConfig};
use kube::Api;
use std::sync::Arc;

const PRIORITY_SUPPORTED: i32 = 40;

/// Normalize a user-facing builder name into a Deployment name.
pub fn normalize_builder_name(name: &str) -> String {
    let name = name.replace('_', "-");
    if name.is_empty() || name == DRIVER_NAME {
        // A deployment literally named "kubernetes" is confusing.
        return DEFAULT_BUILDER_NAME.to_string();
    }
    name
}

#[derive(Debug, Default)]
pub struct KubernetesFactory {}

#[async_trait::async_trait]
impl Factory for KubernetesFactory {
    fn name(&self) -> String {
        DRIVER_NAME.to_string()
    }

    fn priority(&self) -> i32 {
        PRIORITY_SUPPORTED
    }

    fn allows_instances(&self) -> bool {
        true
    }

    async fn new_driver(
        &self,
        cfg: InitConfig,
    ) -> Result<Arc<dyn Driver>> {
        let inner = init_driver_inner(&cfg, false)?;
        let namespace = inner.namespace.clone();
        let deployment_name =
            inner.opt.name.clone();

        let kube = cfg.kube_client.clone();
        let pod_api = Api::namespaced(kube.clone(), &namespace);
        let chooser: Box<dyn PodChooser> =
            match inner.loadbalance.as_str() {
                LOADBALANCE_RANDOM => Box::new(RandomPodChooser {
                    pod_api: pod_api.clone(),
                    deployment_name: deployment_name.clone(),
                }),
                _ => Box::new(StickyPodChooser {
                    key: cfg.context_path_hash.clone(),
                    pod_api: pod_api.clone(),
                    deployment_name: deployment_name.clone(),
                }),
            };

        Ok(Arc::new(KubernetesDriver::new(
            cfg,
            inner,
            chooser,
            Arc::new(KubernetesDriverState::default()),
        )))
    }
}

/// Parse driver options into the deployment/config-map pair the
/// convergence loop maintains. Re-run after a runtime flip with
/// `force_user_specified_runtime` to prevent flip cycles.
pub(super) fn init_driver_inner(
    cfg: &InitConfig,
    force_user_specified_runtime: bool,
) -> Result<DriverInner> {
    let deployment_name = normalize_builder_name(&cfg.name);
    let mut namespace = cfg.namespace.clone();
    let mut loadbalance = LOADBALANCE_STICKY.to_string();
    let mut user_specified_runtime = force_user_specified_runtime;
    let mut image_override = String::new();

    let mut opt = DeploymentOpt {
        namespace: namespace.clone(),
        name: deployment_name,
        image: manifest::DEFAULT_IMAGE.to_string(),
        replicas: 1,
        buildkit_flags: cfg.buildkit_flags.clone(),
        rootless: false,
        worker: String::new(),
        containerd_namespace: DEFAULT_CONTAINERD_NAMESPACE.to_string(),
        containerd_sock_host_path: DEFAULT_CONTAINERD_SOCK_PATH
            .to_string(),
        docker_sock_host_path: DEFAULT_DOCKER_SOCK_PATH.to_string(),
        container_runtime: DEFAULT_CONTAINER_RUNTIME.to_string(),
        custom_config: String::new(),
    };

    for (key, value) in &cfg.driver_opts {
        match key.as_str() {
            "image" => image_override = value.clone(),
            "namespace" => namespace = value.clone(),
            "replicas" => {
                opt.replicas = value.parse().map_err(|_| {
                    DriverError::InvalidOptionValue {
                        key: key.clone(),
                        value: value.clone(),
                    }
                })?
            }
            "rootless" => {
                opt.rootless = value.parse().map_err(|_| {
                    DriverError::InvalidOptionValue {
                        key: key.clone(),
                        value: value.clone(),
                    }
                })?;
                opt.image =
                    manifest::DEFAULT_ROOTLESS_IMAGE.to_string();
            }
            "loadbalance" => match value.as_str() {
                LOADBALANCE_STICKY | LOADBALANCE_RANDOM => {
                    loadbalance = value.clone()
                }
                _ => {
                    return Err(DriverError::InvalidOptionValue {
                        key: "loadbalance".to_string(),
                        value: value.clone(),
                    })
                }
            },
            "worker" => match value.as_str() {
                WORKER_CONTAINERD | WORKER_RUNC => {
                    opt.worker = value.clone()
                }
                // "auto" leaves the worker to runtime-based wiring;
                // the flip path resets to it.
                WORKER_AUTO => opt.worker = String::new(),
                _ => {
                    return Err(DriverError::InvalidOptionValue {
                        key: "worker".to_string(),
                        value: value.clone(),
                    })
                }
            },
            "containerd-namespace" => {
                opt.containerd_namespace = value.clone()
            }
            "containerd-sock" => {
                opt.containerd_sock_host_path = value.clone()
            }
            "docker-sock" => opt.docker_sock_host_path = value.clone(),
            "runtime" => match value.as_str() {
                RUNTIME_DOCKER | RUNTIME_CONTAINERD => {
                    opt.container_runtime = value.clone();
                    user_specified_runtime = true;
                }
                _ => {
                    return Err(DriverError::InvalidOptionValue {
                        key: "runtime".to_string(),
                        value: value.clone(),
                    })
                }
            },
            _ => {
                return Err(DriverError::InvalidOption {
                    key: key.clone(),
                    driver: DRIVER_NAME.to_string(),
                })
            }
        }
    }
    opt.namespace = namespace.clone();

    // Wire up worker defaults based on the chosen runtime.
    if opt.worker.is_empty() {
        opt.worker = match opt.container_runtime.as_str() {
            RUNTIME_CONTAINERD => WORKER_CONTAINERD.to_string(),
            _ => WORKER_RUNC.to_string(),
        };
    }

    if opt.rootless && opt.worker == WORKER_CONTAINERD {
        return Err(DriverError::RootlessContainerd);
    }

    if !image_override.is_empty() {
        opt.image = image_override;
    }

    let config_contents = match &cfg.config_file {
        Some(path) => {
            std::fs::read(path).map_err(DriverError::ConfigFile)?
        }
        None => default_config_file(&opt.containerd_namespace),
    };
    let user_specified_config = cfg.config_file.is_some();

    let deployment = manifest::new_deployment(&opt)?;
    let config_map = manifest::new_config_map(&opt, config_contents);
    let min_replicas = opt.replicas;

    Ok(DriverInner {
        opt,
        deployment,
        config_map,
        min_replicas,
        user_specified_runtime,
        user_specified_config,
        loadbalance,
        namespace,
    })
}
