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

//! Declarative builder objects.
//!
//! Everything here is a pure function of [`DeploymentOpt`]: the same
//! options always produce byte-identical Deployment and ConfigMap
//! objects, which is what makes concurrent CLI convergence safe to
//! retry.

use crate::error::Result;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container, ExecAction,
    HostPathVolumeSource, PodAffinityTerm, PodAntiAffinity, PodSpec,
    PodTemplateSpec, Probe, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

pub const ANNOTATION_KEY: &str = "buildkit.mobyproject.org/builder";

pub const CONTAINER_NAME: &str = "buildkitd";
pub const PROXY_CONTAINER_NAME: &str = "proxy";

pub const DEFAULT_IMAGE: &str = "moby/buildkit:buildx-stable-1";
pub const DEFAULT_ROOTLESS_IMAGE: &str =
    "moby/buildkit:buildx-stable-1-rootless";

const PROXY_IMAGE_REPO: &str = "ghcr.io/kubuild/buildkit-proxy";

/// The component version stamped into the builder annotation.
pub fn version_string() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub fn proxy_image() -> String {
    format!("{PROXY_IMAGE_REPO}:{}", version_string())
}

#[derive(Debug, Clone)]
pub struct DeploymentOpt {
    pub namespace: String,
    pub name: String,
    pub image: String,
    pub replicas: i32,
    pub buildkit_flags: Vec<String>,
    pub rootless: bool,
    pub worker: String,
    pub containerd_namespace: String,
    pub containerd_sock_host_path: String,
    pub docker_sock_host_path: String,
    pub container_runtime: String,
    pub custom_config: String,
}

pub fn labels(opt: &DeploymentOpt) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), opt.name.clone()),
        ("runtime".to_string(), opt.container_runtime.clone()),
        ("worker".to_string(), opt.worker.clone()),
        ("rootless".to_string(), opt.rootless.to_string()),
    ])
}

fn annotations() -> BTreeMap<String, String> {
    BTreeMap::from([(ANNOTATION_KEY.to_string(), version_string())])
}

pub fn new_deployment(opt: &DeploymentOpt) -> Result<Deployment> {
    let labels = labels(opt);

    let buildkitd = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(opt.image.clone()),
        args: Some(opt.buildkit_flags.clone()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "buildctl".to_string(),
                    "debug".to_string(),
                    "workers".to_string(),
                ]),
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "buildkitd-config".to_string(),
                mount_path: "/etc/buildkit/".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "run-buildkit".to_string(),
                mount_path: "/run/buildkit".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let mut deployment = Deployment {
        metadata: ObjectMeta {
            namespace: Some(opt.namespace.clone()),
            name: Some(opt.name.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(opt.replicas),
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
                    containers: vec![buildkitd],
                    volumes: Some(vec![
                        Volume {
                            name: "buildkitd-config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(opt.name.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "run-buildkit".to_string(),
                            empty_dir: Some(Default::default()),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    if opt.rootless {
        to_rootless(&mut deployment)?;
    } else {
        add_proxy_sidecar(&mut deployment, opt)?;
    }

    if opt.worker == super::WORKER_CONTAINERD {
        to_containerd_worker(&mut deployment, opt)?;
    }
    if opt.container_runtime == super::RUNTIME_DOCKER && !opt.rootless {
        add_docker_sock_mount(&mut deployment, opt)?;
    }
    if opt.container_runtime == super::RUNTIME_CONTAINERD && !opt.rootless {
        ensure_containerd_sock(&mut deployment, opt)?;
    }
    if !opt.custom_config.is_empty() {
        add_custom_config_mount(&mut deployment, opt)?;
    }

    Ok(deployment)
}

pub fn new_config_map(
    opt: &DeploymentOpt,
    contents: Vec<u8>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            namespace: Some(opt.namespace.clone()),
            name: Some(opt.name.clone()),
            labels: Some(labels(opt)),
            annotations: Some(annotations()),
            ..Default::default()
        },
        binary_data: Some(BTreeMap::from([(
            "buildkitd.toml".to_string(),
            ByteString(contents),
        )])),
        ..Default::default()
    }
}

fn pod_spec(deployment: &mut Deployment) -> &mut PodSpec {
    deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .expect("deployment constructed with a pod spec")
}

fn to_rootless(deployment: &mut Deployment) -> Result<()> {
    let spec = pod_spec(deployment);
    let container = &mut spec.containers[0];
    container
        .args
        .get_or_insert_with(Vec::new)
        .push("--oci-worker-no-process-sandbox".to_string());
    container.security_context = None;

    let template_meta = deployment
        .spec
        .as_mut()
        .map(|s| s.template.metadata.get_or_insert_with(Default::default))
        .expect("deployment constructed with a spec");
    let annotations =
        template_meta.annotations.get_or_insert_with(BTreeMap::new);
    let _ = annotations.insert(
        format!(
            "container.apparmor.security.beta.kubernetes.io/{CONTAINER_NAME}"
        ),
        "unconfined".to_string(),
    );
    let _ = annotations.insert(
        format!(
            "container.seccomp.security.alpha.kubernetes.io/{CONTAINER_NAME}"
        ),
        "unconfined".to_string(),
    );
    Ok(())
}

fn add_proxy_sidecar(
    deployment: &mut Deployment,
    opt: &DeploymentOpt,
) -> Result<()> {
    let mut args = vec!["serve".to_string()];
    match opt.container_runtime.as_str() {
        super::RUNTIME_CONTAINERD => {
            args.push("--containerd".to_string());
            args.push("/run/containerd/containerd.sock".to_string());
        }
        _ => {
            args.push("--dockerd".to_string());
            args.push("/run/docker.sock".to_string());
        }
    }

    let proxy = Container {
        name: PROXY_CONTAINER_NAME.to_string(),
        image: Some(proxy_image()),
        command: Some(vec!["buildkit-proxy".to_string()]),
        args: Some(args),
        volume_mounts: Some(vec![VolumeMount {
            name: "run-buildkit".to_string(),
            mount_path: "/run/buildkit".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    pod_spec(deployment).containers.push(proxy);
    Ok(())
}

fn anti_affinity(labels: BTreeMap<String, String>) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(
                vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(labels),
                        ..Default::default()
                    }),
                    topology_key: "kubernetes.io/hostname".to_string(),
                    ..Default::default()
                }],
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_path_volume(
    name: &str,
    path: &str,
    type_: &str,
) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    }
}

fn bidirectional_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        mount_propagation: Some("Bidirectional".to_string()),
        ..Default::default()
    }
}

fn to_containerd_worker(
    deployment: &mut Deployment,
    opt: &DeploymentOpt,
) -> Result<()> {
    let labels = labels(opt);
    let buildkit_root = format!("/var/lib/buildkit/{}", opt.name);
    let spec = pod_spec(deployment);
    let container = &mut spec.containers[0];
    container.args.get_or_insert_with(Vec::new).extend([
        "--oci-worker=false".to_string(),
        "--containerd-worker=true".to_string(),
        "--root".to_string(),
        buildkit_root.clone(),
    ]);
    container.volume_mounts.get_or_insert_with(Vec::new).extend([
        VolumeMount {
            name: "containerd-sock".to_string(),
            mount_path: "/run/containerd/containerd.sock".to_string(),
            ..Default::default()
        },
        bidirectional_mount("var-lib-buildkit", &buildkit_root),
        bidirectional_mount("var-lib-containerd", "/var/lib/containerd"),
        bidirectional_mount("run-containerd", "/run/containerd"),
        bidirectional_mount("var-log", "/var/log"),
        bidirectional_mount("tmp", "/tmp"),
    ]);

    spec.volumes.get_or_insert_with(Vec::new).extend([
        host_path_volume(
            "containerd-sock",
            &opt.containerd_sock_host_path,
            "Socket",
        ),
        // Scoped per builder so multiple builders can share a node.
        host_path_volume(
            "var-lib-buildkit",
            &buildkit_root,
            "DirectoryOrCreate",
        ),
        host_path_volume(
            "var-lib-containerd",
            "/var/lib/containerd",
            "Directory",
        ),
        host_path_volume("run-containerd", "/run/containerd", "Directory"),
        host_path_volume("var-log", "/var/log", "Directory"),
        host_path_volume("tmp", "/tmp", "Directory"),
    ]);

    // Spread builders out on a multi-node cluster.
    spec.affinity = Some(anti_affinity(labels));
    Ok(())
}

fn add_docker_sock_mount(
    deployment: &mut Deployment,
    opt: &DeploymentOpt,
) -> Result<()> {
    let labels = labels(opt);
    let spec = pod_spec(deployment);
    for container in &mut spec.containers {
        container.volume_mounts.get_or_insert_with(Vec::new).push(
            VolumeMount {
                name: "docker-sock".to_string(),
                mount_path: "/run/docker.sock".to_string(),
                ..Default::default()
            },
        );
    }
    spec.volumes.get_or_insert_with(Vec::new).push(host_path_volume(
        "docker-sock",
        &opt.docker_sock_host_path,
        "Socket",
    ));

    // Images load through the node's dockerd, so keep workers spread
    // across the cluster rather than clumped on one node.
    spec.affinity = Some(anti_affinity(labels));
    Ok(())
}

// The proxy sidecar always needs the containerd socket when that is the
// node runtime, including worker=runc deployments that never mounted it.
fn ensure_containerd_sock(
    deployment: &mut Deployment,
    opt: &DeploymentOpt,
) -> Result<()> {
    let spec = pod_spec(deployment);
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if !volumes.iter().any(|v| v.name == "containerd-sock") {
        volumes.push(host_path_volume(
            "containerd-sock",
            &opt.containerd_sock_host_path,
            "Socket",
        ));
    }
    if let Some(proxy) = spec
        .containers
        .iter_mut()
        .find(|c| c.name == PROXY_CONTAINER_NAME)
    {
        let mounts = proxy.volume_mounts.get_or_insert_with(Vec::new);
        if !mounts.iter().any(|m| m.name == "containerd-sock") {
            mounts.push(VolumeMount {
                name: "containerd-sock".to_string(),
                mount_path: "/run/containerd/containerd.sock".to_string(),
                ..Default::default()
            });
        }
    }
    Ok(())
}

fn add_custom_config_mount(
    deployment: &mut Deployment,
    opt: &DeploymentOpt,
) -> Result<()> {
    let spec = pod_spec(deployment);
    spec.containers[0].volume_mounts.get_or_insert_with(Vec::new).push(
        VolumeMount {
            name: "custom-config".to_string(),
            mount_path: "/etc/config/".to_string(),
            ..Default::default()
        },
    );
    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: "custom-config".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(opt.custom_config.clone()),
            ..Default::default()
        }),
        ..Default::default()
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_opt() -> DeploymentOpt {
        DeploymentOpt {
            namespace: "default".to_string(),
            name: "buildkit".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            replicas: 1,
            buildkit_flags: Vec::new(),
            rootless: false,
            worker: super::super::WORKER_RUNC.to_string(),
            containerd_namespace: "k8s.io".to_string(),
            containerd_sock_host_path: "/run/containerd/containerd.sock"
                .to_string(),
            docker_sock_host_path: "/var/run/docker.sock".to_string(),
            container_runtime: super::super::RUNTIME_DOCKER.to_string(),
            custom_config: String::new(),
        }
    }

    #[test]
    fn test_deployment_is_deterministic() {
        let opt = base_opt();
        let a = new_deployment(&opt).expect("deployment");
        let b = new_deployment(&opt).expect("deployment");
        assert_eq!(
            serde_json::to_vec(&a).expect("serialize"),
            serde_json::to_vec(&b).expect("serialize"),
        );
    }

    #[test]
    fn test_labels_present() {
        let opt = base_opt();
        let deployment = new_deployment(&opt).expect("deployment");
        let labels =
            deployment.metadata.labels.expect("labels present");
        assert_eq!(labels.get("app"), Some(&"buildkit".to_string()));
        assert_eq!(labels.get("runtime"), Some(&"docker".to_string()));
        assert_eq!(labels.get("worker"), Some(&"runc".to_string()));
        assert_eq!(labels.get("rootless"), Some(&"false".to_string()));
    }

    #[test]
    fn test_annotation_carries_version() {
        let opt = base_opt();
        let deployment = new_deployment(&opt).expect("deployment");
        let annotations =
            deployment.metadata.annotations.expect("annotations");
        assert_eq!(
            annotations.get(ANNOTATION_KEY),
            Some(&version_string())
        );
    }

    #[test]
    fn test_docker_runtime_mounts_socket_and_spreads() {
        let opt = base_opt();
        let deployment = new_deployment(&opt).expect("deployment");
        let spec = deployment
            .spec
            .expect("spec")
            .template
            .spec
            .expect("pod spec");
        assert!(spec
            .volumes
            .as_ref()
            .expect("volumes")
            .iter()
            .any(|v| v.name == "docker-sock"));
        assert!(spec.affinity.is_some());
    }

    #[test]
    fn test_rootless_drops_privilege_and_sidecar() {
        let mut opt = base_opt();
        opt.rootless = true;
        let deployment = new_deployment(&opt).expect("deployment");
        let spec = deployment
            .spec
            .expect("spec")
            .template
            .spec
            .expect("pod spec");
        assert_eq!(spec.containers.len(), 1);
        assert!(spec.containers[0].security_context.is_none());
        let args =
            spec.containers[0].args.as_ref().expect("args present");
        assert!(args
            .iter()
            .any(|a| a == "--oci-worker-no-process-sandbox"));
    }

    #[test]
    fn test_containerd_worker_mounts() {
        let mut opt = base_opt();
        opt.worker = super::super::WORKER_CONTAINERD.to_string();
        opt.container_runtime =
            super::super::RUNTIME_CONTAINERD.to_string();
        let deployment = new_deployment(&opt).expect("deployment");
        let spec = deployment
            .spec
            .expect("spec")
            .template
            .spec
            .expect("pod spec");

        let mounts = spec.containers[0]
            .volume_mounts
            .as_ref()
            .expect("mounts");
        for name in [
            "containerd-sock",
            "var-lib-buildkit",
            "var-lib-containerd",
            "run-containerd",
            "var-log",
            "tmp",
        ] {
            assert!(
                mounts.iter().any(|m| m.name == name),
                "missing mount {name}"
            );
        }
        let args = spec.containers[0].args.as_ref().expect("args");
        assert!(args.iter().any(|a| a == "--containerd-worker=true"));
        assert!(args
            .iter()
            .any(|a| a == "/var/lib/buildkit/buildkit"));
    }

    #[test]
    fn test_custom_config_mount() {
        let mut opt = base_opt();
        opt.custom_config = "my-config".to_string();
        let deployment = new_deployment(&opt).expect("deployment");
        let spec = deployment
            .spec
            .expect("spec")
            .template
            .spec
            .expect("pod spec");
        assert!(spec.containers[0]
            .volume_mounts
            .as_ref()
            .expect("mounts")
            .iter()
            .any(|m| m.mount_path == "/etc/config/"));
    }

    #[test]
    fn test_config_map_payload_key() {
        let opt = base_opt();
        let cm = new_config_map(&opt, b"debug = false\n".to_vec());
        let data = cm.binary_data.expect("binary data");
        assert!(data.contains_key("buildkitd.toml"));
    }
}
