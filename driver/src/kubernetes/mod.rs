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

//! The Kubernetes builder driver: one Deployment plus one ConfigMap per
//! builder, converged idempotently, with control connections tunneled
//! through the exec API into whichever pod the chooser picks.

use std::sync::Mutex;

pub mod authprovider;
mod convergence;
mod driver;
mod factory;
pub mod manifest;
pub mod podchooser;
pub mod tunnel;

pub use driver::KubernetesDriver;
pub use factory::{normalize_builder_name, KubernetesFactory};

pub const DRIVER_NAME: &str = "kubernetes";

pub const LOADBALANCE_RANDOM: &str = "random";
pub const LOADBALANCE_STICKY: &str = "sticky";

pub const WORKER_CONTAINERD: &str = "containerd";
pub const WORKER_RUNC: &str = "runc";
pub const WORKER_AUTO: &str = "auto";

pub const RUNTIME_CONTAINERD: &str = "containerd";
pub const RUNTIME_DOCKER: &str = "docker";

pub const DEFAULT_CONTAINERD_NAMESPACE: &str = "k8s.io";
pub const DEFAULT_CONTAINERD_SOCK_PATH: &str =
    "/run/containerd/containerd.sock";
pub const DEFAULT_DOCKER_SOCK_PATH: &str = "/var/run/docker.sock";

// Most clusters still run a docker-compatible runtime; when the guess is
// wrong the convergence loop flips it automatically.
pub const DEFAULT_CONTAINER_RUNTIME: &str = RUNTIME_DOCKER;

/// In-pod socket the proxy listens on.
pub const PROXY_SOCKET_PATH: &str = "/run/buildkit/buildkit-proxy.sock";

/// In-pod socket of the daemon itself, used directly in rootless mode
/// where no proxy sidecar runs.
pub const BUILDKITD_SOCKET_PATH: &str = "/run/buildkit/buildkitd.sock";

pub const DEFAULT_BUILDER_NAME: &str = "buildkit";

/// The generated daemon configuration when the user supplies none.
pub fn default_config_file(containerd_namespace: &str) -> Vec<u8> {
    format!(
        "# Default buildkitd configuration.  Use --config <path/to/file> to override during create\n\
         debug = false\n\
         [worker.containerd]\n  namespace = \"{containerd_namespace}\"\n"
    )
    .into_bytes()
}

/// Mutable driver-wide state shared with the auth provider.
#[derive(Debug, Default)]
pub struct KubernetesDriverState {
    auth_hint: Mutex<String>,
}

impl KubernetesDriverState {
    pub fn set_auth_hint(&self, hint: String) {
        if let Ok(mut guard) = self.auth_hint.lock() {
            *guard = hint;
        }
    }

    pub fn auth_hint(&self) -> String {
        self.auth_hint
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_names_namespace() {
        let config = default_config_file("k8s.io");
        let text = String::from_utf8(config).expect("utf8");
        assert!(text.contains("debug = false"));
        assert!(text.contains("[worker.containerd]"));
        assert!(text.contains("namespace = \"k8s.io\""));
    }
}
