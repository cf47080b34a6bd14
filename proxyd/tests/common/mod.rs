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

//! A buildkitd stand-in the proxy can front during tests.

use kubuild_proto::control::control_server::{Control, ControlServer};
use kubuild_proto::control::{
    BytesMessage, DiskUsageRequest, DiskUsageResponse,
    ListWorkersRequest, ListWorkersResponse, Platform, PruneRequest,
    SolveRequest, SolveResponse, StatusRequest, StatusResponse,
    UsageRecord, Vertex, WorkerRecord,
};
use kubuild_proxyd::{ProxyServer, ServerConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

#[derive(Default)]
pub struct BuildkitdStandIn {
    pub solves: Arc<Mutex<Vec<SolveRequest>>>,
}

#[tonic::async_trait]
impl Control for BuildkitdStandIn {
    async fn disk_usage(
        &self,
        _request: Request<DiskUsageRequest>,
    ) -> Result<Response<DiskUsageResponse>, Status> {
        Ok(Response::new(DiskUsageResponse {
            record: vec![UsageRecord {
                id: "layer-1".to_string(),
                size: 42,
                ..Default::default()
            }],
        }))
    }

    type PruneStream = ReceiverStream<Result<UsageRecord, Status>>;

    async fn prune(
        &self,
        _request: Request<PruneRequest>,
    ) -> Result<Response<Self::PruneStream>, Status> {
        let (tx, rx) = mpsc::channel(2);
        let _ = tx
            .send(Ok(UsageRecord {
                id: "pruned-1".to_string(),
                ..Default::default()
            }))
            .await;
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn solve(
        &self,
        request: Request<SolveRequest>,
    ) -> Result<Response<SolveResponse>, Status> {
        self.solves
            .lock()
            .expect("solves lock")
            .push(request.into_inner());
        Ok(Response::new(SolveResponse {
            exporter_response: HashMap::from([(
                "containerimage.digest".to_string(),
                "sha256:feedface".to_string(),
            )]),
        }))
    }

    type StatusStream = ReceiverStream<Result<StatusResponse, Status>>;

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<Self::StatusStream>, Status> {
        let (tx, rx) = mpsc::channel(4);
        for name in ["step one", "step two"] {
            let _ = tx
                .send(Ok(StatusResponse {
                    vertexes: vec![Vertex {
                        name: name.to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }))
                .await;
        }
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type SessionStream = ReceiverStream<Result<BytesMessage, Status>>;

    async fn session(
        &self,
        _request: Request<Streaming<BytesMessage>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn list_workers(
        &self,
        _request: Request<ListWorkersRequest>,
    ) -> Result<Response<ListWorkersResponse>, Status> {
        Ok(Response::new(ListWorkersResponse {
            record: vec![WorkerRecord {
                id: "worker-0".to_string(),
                labels: HashMap::new(),
                platforms: vec![Platform {
                    os: "linux".to_string(),
                    architecture: "amd64".to_string(),
                    ..Default::default()
                }],
            }],
        }))
    }
}

pub fn serve_buildkitd(
    dir: &Path,
) -> (Arc<Mutex<Vec<SolveRequest>>>, String) {
    let socket = dir.join("buildkitd.sock");
    let listener =
        tokio::net::UnixListener::bind(&socket).expect("bind");
    let stand_in = BuildkitdStandIn::default();
    let solves = Arc::clone(&stand_in.solves);
    let _ = tokio::spawn(async move {
        Server::builder()
            .add_service(ControlServer::new(stand_in))
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
            .expect("buildkitd stand-in");
    });
    (solves, socket.to_string_lossy().into_owned())
}

pub async fn start_proxy(
    dir: &Path,
) -> (ProxyServer, Arc<Mutex<Vec<SolveRequest>>>, String) {
    let (solves, buildkitd_socket) = serve_buildkitd(dir);
    let proxy_socket = dir
        .join("buildkit-proxy.sock")
        .to_string_lossy()
        .into_owned();
    let cfg = ServerConfig {
        buildkitd_socket_path: buildkitd_socket,
        containerd_socket_path: String::new(),
        // The engine is never reached in these tests; the loader dials
        // lazily.
        dockerd_socket_path: dir
            .join("docker.sock")
            .to_string_lossy()
            .into_owned(),
        helper_socket_path: proxy_socket.clone(),
    };
    let proxy = ProxyServer::new(cfg).await.expect("proxy");
    (proxy, solves, proxy_socket)
}
