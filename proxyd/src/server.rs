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

//! The gRPC facade: pass-through control methods, the solve
//! interceptor that arms session hijacking, and server lifecycle.

use crate::imageload::{Replication, RuntimeLoader};
use crate::{ServerConfig, CONTAINERD_NAMESPACE};
use kubuild_client::BuildKitClient;
use kubuild_imageload::{ContainerdLoader, DockerLoader};
use kubuild_proto::control::control_server::{Control, ControlServer};
use kubuild_proto::control::{
    BytesMessage, DiskUsageRequest, DiskUsageResponse,
    ListWorkersRequest, ListWorkersResponse, PruneRequest, SolveRequest,
    SolveResponse, StatusRequest, StatusResponse, UsageRecord,
};
use kubuild_proto::proxy::proxy_server::ProxyServer as ProxyExtServer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

// Exporters whose payload may need to land in the node runtime.
const HIJACKABLE_EXPORTERS: [&str; 3] = ["image", "docker", "oci"];

/// Per-session state: the exporter attributes a Solve declared, armed
/// before the session's sub-RPCs consult it.
///
/// The wire protocol has no ordering guarantee between Solve and the
/// session sub-streams; hijack decisions rely on the observed temporal
/// ordering (Solve is dispatched before the daemon starts exporting).
/// When the attributes are absent the transfer falls through to the
/// client untouched, which fails safe.
#[derive(Debug, Default, Clone)]
pub(crate) struct SessionState {
    pub exporter_attrs: HashMap<String, String>,
}

pub(crate) struct Inner {
    pub cfg: ServerConfig,
    pub buildkitd: BuildKitClient,
    pub loader: RuntimeLoader,
    pub sessions: Mutex<HashMap<String, SessionState>>,
    pub replication: Mutex<Replication>,
}

/// The proxy service; cheap to clone, all clones share state.
#[derive(Clone)]
pub struct ProxyServer {
    pub(crate) inner: Arc<Inner>,
}

impl ProxyServer {
    pub async fn new(cfg: ServerConfig) -> anyhow::Result<Self> {
        cfg.validate()?;

        debug!(
            "dialing buildkit socket: {}",
            cfg.buildkitd_socket_path
        );
        let buildkitd = BuildKitClient::connect_unix(
            cfg.buildkitd_socket_path.clone(),
        )
        .await?;

        let runtime = cfg.runtime();
        info!(
            "starting BuildKit proxy for {runtime} runtime on {}",
            cfg.helper_socket_path
        );
        let loader = match runtime {
            crate::Runtime::Containerd => RuntimeLoader::Containerd(
                ContainerdLoader::connect_unix(
                    &cfg.containerd_socket_path,
                    CONTAINERD_NAMESPACE,
                )
                .await?,
            ),
            crate::Runtime::Dockerd => RuntimeLoader::Docker(
                DockerLoader::connect_unix(&format!(
                    "unix://{}",
                    cfg.dockerd_socket_path
                ))?,
            ),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                buildkitd,
                loader,
                sessions: Mutex::new(HashMap::new()),
                replication: Mutex::new(Replication::new()),
            }),
        })
    }

    /// Block until buildkitd answers a worker listing.
    pub async fn wait_for_buildkit_health(&self) {
        info!("checking for buildkitd health");
        loop {
            match self
                .inner
                .buildkitd
                .control()
                .list_workers(ListWorkersRequest::default())
                .await
            {
                Ok(resp) => {
                    info!(
                        "buildkitd workers detected: {:?}",
                        resp.into_inner().record
                    );
                    return;
                }
                Err(e) => debug!("buildkitd not ready yet: {e}"),
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Serve the control facade and proxy extension on the unix socket
    /// until `shutdown` resolves.
    pub async fn serve(
        self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let socket_path = self.inner.cfg.helper_socket_path.clone();
        // A stale socket file from a previous run would fail the bind.
        let _ = std::fs::remove_file(&socket_path);
        let listener = tokio::net::UnixListener::bind(&socket_path)?;

        self.wait_for_buildkit_health().await;
        info!("proxy is ready");

        Server::builder()
            .add_service(ControlServer::new(self.clone()))
            .add_service(ProxyExtServer::new(self.clone()))
            .serve_with_incoming_shutdown(
                UnixListenerStream::new(listener),
                shutdown,
            )
            .await?;
        info!("proxy exited");
        Ok(())
    }

    pub(crate) async fn get_session(
        &self,
        session_id: &str,
    ) -> SessionState {
        let mut sessions = self.inner.sessions.lock().await;
        sessions.entry(session_id.to_string()).or_default().clone()
    }

    pub(crate) async fn arm_session(
        &self,
        session_id: &str,
        exporter_attrs: HashMap<String, String>,
    ) {
        let mut sessions = self.inner.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .exporter_attrs = exporter_attrs;
    }

    pub(crate) async fn drop_session(&self, session_id: &str) {
        let mut sessions = self.inner.sessions.lock().await;
        let _ = sessions.remove(session_id);
    }

    pub(crate) async fn hijack_required(&self, session_id: &str) -> bool {
        !self.get_session(session_id).await.exporter_attrs.is_empty()
    }
}

/// Re-wrap a request for the daemon with the caller's metadata intact.
pub(crate) fn forward<T>(request: Request<T>) -> Request<T> {
    let (metadata, extensions, message) = request.into_parts();
    Request::from_parts(metadata, extensions, message)
}

#[tonic::async_trait]
impl Control for ProxyServer {
    async fn disk_usage(
        &self,
        request: Request<DiskUsageRequest>,
    ) -> Result<Response<DiskUsageResponse>, Status> {
        debug!("proxying DiskUsage {:?}", request.get_ref().filter);
        self.inner.buildkitd.control().disk_usage(forward(request)).await
    }

    async fn list_workers(
        &self,
        request: Request<ListWorkersRequest>,
    ) -> Result<Response<ListWorkersResponse>, Status> {
        debug!("proxying ListWorkers {:?}", request.get_ref().filter);
        self.inner
            .buildkitd
            .control()
            .list_workers(forward(request))
            .await
    }

    type PruneStream = ReceiverStream<Result<UsageRecord, Status>>;

    async fn prune(
        &self,
        request: Request<PruneRequest>,
    ) -> Result<Response<Self::PruneStream>, Status> {
        debug!("proxying Prune request: {:?}", request.get_ref());
        let mut upstream = self
            .inner
            .buildkitd
            .control()
            .prune(forward(request))
            .await?
            .into_inner();

        let (tx, rx) = mpsc::channel(16);
        let _ = tokio::spawn(async move {
            loop {
                match upstream.message().await {
                    Ok(Some(record)) => {
                        if tx.send(Ok(record)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn solve(
        &self,
        request: Request<SolveRequest>,
    ) -> Result<Response<SolveResponse>, Status> {
        let req = request.get_ref();
        debug!(
            "proxying Solve ref {} session {}",
            req.r#ref, req.session
        );

        // An exporter with attributes means the payload is an image the
        // local runtime (and any peers) should receive.
        if !req.exporter.is_empty()
            && HIJACKABLE_EXPORTERS
                .contains(&req.exporter.as_str())
            && !req.exporter_attrs.is_empty()
        {
            info!(
                "detected build with {} exporter - hijacking",
                req.exporter
            );
            self.arm_session(
                &req.session,
                req.exporter_attrs.clone(),
            )
            .await;
        }

        let resp = self
            .inner
            .buildkitd
            .control()
            .solve(forward(request))
            .await;
        debug!("solve finished: {resp:?}");
        resp
    }

    type StatusStream = ReceiverStream<Result<StatusResponse, Status>>;

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<Self::StatusStream>, Status> {
        debug!("proxying Status for {}", request.get_ref().r#ref);
        let mut upstream = self
            .inner
            .buildkitd
            .control()
            .status(forward(request))
            .await?
            .into_inner();

        let (tx, rx) = mpsc::channel(16);
        let _ = tokio::spawn(async move {
            loop {
                match upstream.message().await {
                    Ok(Some(status)) => {
                        if tx.send(Ok(status)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type SessionStream = ReceiverStream<Result<BytesMessage, Status>>;

    async fn session(
        &self,
        request: Request<Streaming<BytesMessage>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        self.intercept_session(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubuild_imageload::DockerLoader;

    fn test_server() -> ProxyServer {
        ProxyServer {
            inner: Arc::new(Inner {
                cfg: ServerConfig {
                    buildkitd_socket_path: "/nonexistent/buildkitd.sock"
                        .to_string(),
                    containerd_socket_path: String::new(),
                    dockerd_socket_path: "/nonexistent/docker.sock"
                        .to_string(),
                    helper_socket_path:
                        "/nonexistent/buildkit-proxy.sock".to_string(),
                },
                buildkitd: BuildKitClient::connect_lazy_unix(
                    "/nonexistent/buildkitd.sock".to_string(),
                ),
                loader: RuntimeLoader::Docker(
                    DockerLoader::connect_unix(
                        "unix:///nonexistent/docker.sock",
                    )
                    .expect("lazy docker client"),
                ),
                sessions: Mutex::new(HashMap::new()),
                replication: Mutex::new(Replication::new()),
            }),
        }
    }

    #[tokio::test]
    async fn test_session_armed_by_solve_attrs() {
        let server = test_server();
        assert!(!server.hijack_required("s1").await);

        server
            .arm_session(
                "s1",
                HashMap::from([(
                    "name".to_string(),
                    "repo:tag".to_string(),
                )]),
            )
            .await;
        assert!(server.hijack_required("s1").await);
        // Other sessions stay untouched.
        assert!(!server.hijack_required("s2").await);
    }

    #[tokio::test]
    async fn test_session_state_dropped_on_return() {
        let server = test_server();
        server
            .arm_session(
                "s1",
                HashMap::from([(
                    "name".to_string(),
                    "repo:tag".to_string(),
                )]),
            )
            .await;
        server.drop_session("s1").await;
        assert!(!server.hijack_required("s1").await);
        assert!(server.inner.sessions.lock().await.is_empty());
    }
}
