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

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid driver option {key} for driver {driver}")]
    InvalidOption { key: String, driver: String },
    #[error("invalid {key} {value:?}")]
    InvalidOptionValue { key: String, value: String },
    #[error(
        "containerd worker does not support rootless mode - use the 'runc' worker"
    )]
    RootlessContainerd,
    #[error("no drivers registered")]
    NoDriversRegistered,
    #[error("no builder pods are running")]
    NoPodsRunning,
    #[error("multi-worker pods are not yet implemented")]
    MultiWorkerPods,
    #[error("pod {pod} does not have any container")]
    PodWithoutContainers { pod: String },
    #[error("no available builder pods for {node}")]
    NodeNotFound { node: String },
    #[error("unexpected runtime label ({runtime:?}) on pod ({pod})")]
    UnexpectedRuntimeLabel { runtime: String, pod: String },
    #[error(
        "pod failed to initialize - did you pick the correct runtime? - {message}"
    )]
    RuntimeMismatch { message: String },
    #[error("timed out waiting for builder to become ready: {source}")]
    BootstrapTimeout { source: Box<DriverError> },
    #[error("failed to load config file: {0}")]
    ConfigFile(#[source] std::io::Error),
    #[error("exec stream did not open {stream}")]
    ExecStreamMissing { stream: &'static str },
    #[error("malformed registry secret: {reason}")]
    MalformedRegistrySecret { reason: String },
    #[error("{message}")]
    WorkloadFailure { message: String },
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Client(#[from] kubuild_client::ClientError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
