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

//! The in-cluster proxy daemon.
//!
//! Runs next to buildkitd in every builder pod as a gRPC facade on a
//! local unix socket: control RPCs pass through, build sessions are
//! hijacked where export payloads need to land in the node's container
//! runtime, and finished images replicate to peer builder pods over a
//! TCP port on the pod network.

// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(clippy::unwrap_used)]

use std::fmt;
use thiserror::Error;

pub use server::ProxyServer;

mod imageload;
mod proxies;
mod server;
mod session;

/// TCP port peers dial for image replication.
pub const REPLICATION_PORT: u16 = 1234;

pub const DEFAULT_BUILDKITD_SOCKET: &str = "/run/buildkit/buildkitd.sock";
pub const DEFAULT_PROXY_SOCKET: &str = "/run/buildkit/buildkit-proxy.sock";

/// Namespace images land in; kubelet runs containers from the same one.
pub const CONTAINERD_NAMESPACE: &str = "k8s.io";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("buildkitd sock path must be specified")]
    MissingBuildkitdSocket,
    #[error("proxy sock path must be specified")]
    MissingProxySocket,
    #[error(
        "you must specify exactly one of containerd or dockerd runtime socket paths"
    )]
    AmbiguousRuntime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Containerd,
    Dockerd,
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runtime::Containerd => write!(f, "containerd"),
            Runtime::Dockerd => write!(f, "dockerd"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub buildkitd_socket_path: String,
    pub containerd_socket_path: String,
    pub dockerd_socket_path: String,
    pub helper_socket_path: String,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buildkitd_socket_path.is_empty() {
            return Err(ConfigError::MissingBuildkitdSocket);
        }
        if self.helper_socket_path.is_empty() {
            return Err(ConfigError::MissingProxySocket);
        }
        let containerd = !self.containerd_socket_path.is_empty();
        let dockerd = !self.dockerd_socket_path.is_empty();
        if containerd == dockerd {
            return Err(ConfigError::AmbiguousRuntime);
        }
        Ok(())
    }

    pub fn runtime(&self) -> Runtime {
        if self.containerd_socket_path.is_empty() {
            Runtime::Dockerd
        } else {
            Runtime::Containerd
        }
    }
}
