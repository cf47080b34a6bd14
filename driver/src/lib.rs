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

//! The builder driver abstraction and its Kubernetes implementation.
//!
//! A driver owns the lifecycle of one named builder: converging its
//! cluster objects, introspecting its pods, handing out control clients
//! tunneled into the chosen pod, and reporting the feature set the
//! builder supports.

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

use kubuild_client::session::Attachable;
use kubuild_client::BuildKitClient;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use error::{DriverError, Result};
pub use platforms::{parse_list, Platform, PlatformParseError};

mod error;
pub mod kubernetes;
mod platforms;

/// Builder feature toggles reported by [`Driver::features`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    OciExporter,
    DockerExporter,
    ContainerdExporter,
    CacheExport,
    MultiPlatform,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::OciExporter => "OCI exporter",
            Feature::DockerExporter => "Docker exporter",
            Feature::ContainerdExporter => "Containerd exporter",
            Feature::CacheExport => "cache export",
            Feature::MultiPlatform => "multiple platforms",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle state of a builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Inactive,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Inactive => "inactive",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// One builder pod as seen by list/info.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub status: String,
    pub platforms: Vec<Platform>,
}

/// A builder known to the cluster.
#[derive(Debug, Clone)]
pub struct Builder {
    pub name: String,
    pub driver: String,
    pub nodes: Vec<Node>,
}

/// Driver status plus the live node set.
#[derive(Debug, Clone)]
pub struct Info {
    pub status: Status,
    pub dynamic_nodes: Vec<Node>,
}

/// A control client bound to one builder pod.
#[derive(Clone)]
pub struct NodeClient {
    pub node_name: String,
    pub cluster_addr: String,
    pub client: BuildKitClient,
    /// None when the builder runs rootless (no runtime to load into, so
    /// no proxy endpoint either).
    pub proxy: Option<BuildKitClient>,
}

impl fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeClient")
            .field("node_name", &self.node_name)
            .field("cluster_addr", &self.cluster_addr)
            .finish()
    }
}

/// Clients for the chosen pod and its peers.
#[derive(Debug, Clone)]
pub struct BuilderClients {
    pub chosen: NodeClient,
    pub others: Vec<NodeClient>,
}

/// Inputs for constructing a driver.
#[derive(Clone)]
pub struct InitConfig {
    pub name: String,
    pub kube_client: kube::Client,
    pub namespace: String,
    pub buildkit_flags: Vec<String>,
    pub config_file: Option<PathBuf>,
    pub driver_opts: HashMap<String, String>,
    /// Hash of the absolute context path; the sticky pod chooser keys
    /// on it.
    pub context_path_hash: String,
}

impl fmt::Debug for InitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitConfig")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("driver_opts", &self.driver_opts)
            .finish()
    }
}

/// Line-oriented progress log for the long-running lifecycle operations.
/// Messages are dropped when the consumer has gone away.
#[derive(Debug, Clone)]
pub struct BootLog {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl BootLog {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn sink() -> Self {
        Self { tx: None }
    }

    pub fn log(&self, msg: impl Into<String>) {
        let msg = msg.into();
        match &self.tx {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => debug!("{msg}"),
        }
    }
}

/// The capability set every builder driver provides.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> String;

    fn factory_name(&self) -> String;

    /// Idempotently converge the builder to ready. Safe to call from
    /// concurrent CLIs against the same builder name.
    async fn bootstrap(
        &self,
        log: &BootLog,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn info(&self) -> Result<Info>;

    async fn list(&self) -> Result<Vec<Builder>>;

    async fn rm(&self) -> Result<()>;

    async fn features(&self) -> HashMap<Feature, bool>;

    /// Build control clients for the chosen pod and its peers.
    async fn clients(&self) -> Result<BuilderClients>;

    /// Open a byte stream to the container runtime socket on the named
    /// pod (tunneled `buildctl --addr <runtime sock> dial-stdio`).
    async fn runtime_sock_proxy(
        &self,
        node_name: &str,
    ) -> Result<kubernetes::tunnel::ExecTunnel>;

    /// The daemon version string reported by the chosen pod.
    async fn version(&self) -> Result<String>;

    /// Session attachable resolving registry credentials.
    fn auth_provider(&self, secret_name: &str) -> Arc<dyn Attachable>;

    /// Registry credential source for the imagetools client.
    fn auth_config(
        &self,
        secret_name: &str,
    ) -> Arc<dyn RegistryAuth>;

    /// Hint recorded by the auth provider when credential lookup soft-
    /// failed; surfaced when a build later fails with an auth error.
    fn auth_hint(&self) -> String;
}

/// Credential lookup for registry operations outside a session.
#[async_trait::async_trait]
pub trait RegistryAuth: Send + Sync {
    async fn credentials(
        &self,
        registry_hostname: &str,
    ) -> Result<(String, String)>;
}

/// Constructs drivers of one kind.
#[async_trait::async_trait]
pub trait Factory: Send + Sync {
    fn name(&self) -> String;

    fn priority(&self) -> i32;

    fn allows_instances(&self) -> bool;

    async fn new_driver(&self, cfg: InitConfig) -> Result<Arc<dyn Driver>>;
}

/// Explicit factory registry; constructed once at startup and passed
/// through rather than held in process-global state.
#[derive(Default)]
pub struct DriverRegistry {
    factories: Vec<Arc<dyn Factory>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> =
            self.factories.iter().map(|f| f.name()).collect();
        f.debug_struct("DriverRegistry").field("factories", &names).finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn Factory>) {
        self.factories.push(factory);
    }

    pub fn factory(&self, name: &str) -> Option<Arc<dyn Factory>> {
        self.factories.iter().find(|f| f.name() == name).cloned()
    }

    /// The lowest-priority-value factory wins, mirroring the usual
    /// "smaller sorts first" convention.
    pub fn default_factory(&self) -> Result<Arc<dyn Factory>> {
        self.factories
            .iter()
            .min_by_key(|f| f.priority())
            .cloned()
            .ok_or(DriverError::NoDriversRegistered)
    }
}

/// Sleep a uniformly random duration between 25 ms and `max_ms`;
/// concurrent CLIs racing on create/update back off with
/// de-synchronized retries.
pub async fn rand_sleep(max_ms: u64) {
    let ms = rand::thread_rng().gen_range(25..=max_ms.max(25));
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Errors we refuse to retry during bootstrap convergence.
pub fn fail_fast(err: &DriverError) -> bool {
    let msg = err.to_string();
    msg.contains("Failed to pull image") || msg.contains("ErrImagePull")
}

/// Converge the builder and hand back its clients, retrying transient
/// failures until `cancel` fires.
pub async fn boot(
    driver: &dyn Driver,
    log: &BootLog,
    cancel: &CancellationToken,
) -> Result<BuilderClients> {
    let mut last_err =
        DriverError::Other(anyhow::anyhow!("timeout before starting"));
    loop {
        if cancel.is_cancelled() {
            return Err(DriverError::BootstrapTimeout {
                source: Box::new(last_err),
            });
        }

        let info = driver.info().await?;
        if info.status != Status::Running {
            if let Err(e) = driver.bootstrap(log, cancel).await {
                if fail_fast(&e) {
                    return Err(e);
                }
                // Possibly another CLI converging in parallel.
                last_err = e;
                rand_sleep(100).await;
                continue;
            }
        }

        match driver.clients().await {
            Ok(clients) => return Ok(clients),
            Err(e) => {
                if fail_fast(&e) {
                    return Err(e);
                }
                last_err = e;
                rand_sleep(1000).await;
            }
        }
    }
}
