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

//! Local image loading and peer replication.
//!
//! When an export is hijacked, the payload fans out through one pipe
//! per destination: the node's own runtime plus every peer in the
//! replication roster. Peers receive the bytes over the fixed TCP port,
//! authenticated by the rotating listen key. Delivery is prefix
//! consistent per destination; overall throughput is bounded by the
//! slowest reader since there is no per-destination buffering.

use crate::server::ProxyServer;
use crate::REPLICATION_PORT;
use bytes::Bytes;
use kubuild_imageload::{ContainerdLoader, DockerLoader};
use kubuild_proto::proxy::image_loader_client::ImageLoaderClient;
use kubuild_proto::proxy::image_loader_server::{
    ImageLoader, ImageLoaderServer,
};
use kubuild_proto::proxy::proxy_server::Proxy;
use kubuild_proto::proxy::{
    BytesMessage, ListenRequest, ListenResponse, LoadResponse, Node,
    ReplicateRequest, ReplicateResponse, StopListenResponse,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tonic::transport::{Endpoint, Server};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

const FANOUT_CHUNK_SIZE: usize = 32 * 1024;
const PEER_DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Which local runtime receives loaded images.
#[derive(Debug, Clone)]
pub(crate) enum RuntimeLoader {
    Containerd(ContainerdLoader),
    Docker(DockerLoader),
}

impl RuntimeLoader {
    pub async fn load(
        &self,
        input: impl AsyncRead + Send + Unpin + 'static,
    ) -> anyhow::Result<()> {
        match self {
            RuntimeLoader::Containerd(loader) => {
                debug!("loading image to local containerd runtime");
                let _ = loader.import(input).await?;
            }
            RuntimeLoader::Docker(loader) => {
                debug!("loading image to local dockerd runtime");
                loader.load(input).await?;
            }
        }
        Ok(())
    }
}

/// Roster plus the ref-counted TCP listener serving peer loads.
pub(crate) struct Replication {
    listen_key: String,
    listen_refcount: u32,
    pub(crate) remotes: Vec<Node>,
    listener_task: Option<JoinHandle<()>>,
}

impl Replication {
    pub fn new() -> Self {
        Self {
            listen_key: Uuid::new_v4().to_string(),
            listen_refcount: 0,
            remotes: Vec::new(),
            listener_task: None,
        }
    }

    pub fn listen_key(&self) -> &str {
        &self.listen_key
    }

    fn rotate_key(&mut self) {
        self.listen_key = Uuid::new_v4().to_string();
    }
}

impl ProxyServer {
    /// Split the payload into one local load plus one transfer per
    /// roster peer. Any destination failure fails the load; unhealthy
    /// peers are expected to have been filtered out upstream by pod
    /// readiness.
    pub(crate) async fn image_load(
        &self,
        mut input: impl AsyncRead + Send + Unpin + 'static,
    ) -> anyhow::Result<()> {
        let remotes =
            self.inner.replication.lock().await.remotes.clone();

        if remotes.is_empty() {
            return self.inner.loader.load(input).await;
        }
        debug!("replicating image load to {} nodes", remotes.len());

        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
        let mut senders: Vec<
            mpsc::Sender<Result<Bytes, std::io::Error>>,
        > = Vec::new();

        // Local runtime gets the first pipe.
        let (local_tx, local_rx) = mpsc::channel(16);
        senders.push(local_tx);
        let loader = self.inner.loader.clone();
        let _ = tasks.spawn(async move {
            loader
                .load(StreamReader::new(ReceiverStream::new(local_rx)))
                .await
        });

        for node in remotes {
            let (tx, rx) = mpsc::channel(16);
            senders.push(tx);
            let _ = tasks.spawn(async move {
                debug!(
                    "sending image to remote builder at {}",
                    node.addr
                );
                let endpoint = Endpoint::from_shared(format!(
                    "http://{}:{REPLICATION_PORT}",
                    node.addr
                ))?
                .connect_timeout(PEER_DIAL_TIMEOUT);
                let channel =
                    endpoint.connect().await.map_err(|e| {
                        anyhow::anyhow!(
                            "failed to connect to remote builder {}: {e}",
                            node.addr
                        )
                    })?;

                let payload = ReceiverStream::new(rx)
                    .filter_map(|chunk: Result<Bytes, std::io::Error>| {
                        chunk.ok().map(|data| BytesMessage {
                            data: data.to_vec(),
                        })
                    });
                let mut req = Request::new(payload);
                let _ = req.metadata_mut().insert(
                    "key",
                    node.key.parse().map_err(|_| {
                        anyhow::anyhow!("listen key is not valid metadata")
                    })?,
                );

                let _ = ImageLoaderClient::new(channel)
                    .load(req)
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!(
                            "failed to transfer image to {}: {e}",
                            node.addr
                        )
                    })?;
                Ok(())
            });
        }

        // Fan-out driver: every destination sees the same byte
        // sequence, at the pace of the slowest consumer.
        let _ = tasks.spawn(async move {
            let mut buf = vec![0u8; FANOUT_CHUNK_SIZE];
            loop {
                match input.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        for tx in &senders {
                            if tx
                                .send(Ok(chunk.clone()))
                                .await
                                .is_err()
                            {
                                return Err(anyhow::anyhow!(
                                    "image load destination went away"
                                ));
                            }
                        }
                    }
                    Err(e) => {
                        for tx in &senders {
                            let _ = tx
                                .send(Err(std::io::Error::other(
                                    e.to_string(),
                                )))
                                .await;
                        }
                        return Err(e.into());
                    }
                }
            }
            Ok(())
        });

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| anyhow::anyhow!("load task panicked: {e}"))??;
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Proxy for ProxyServer {
    async fn listen(
        &self,
        _request: Request<ListenRequest>,
    ) -> Result<Response<ListenResponse>, Status> {
        let mut replication = self.inner.replication.lock().await;
        if replication.listen_refcount == 0 {
            info!(
                "starting TCP based listen on port {REPLICATION_PORT}"
            );
            replication.rotate_key();
            let listener = tokio::net::TcpListener::bind((
                "0.0.0.0",
                REPLICATION_PORT,
            ))
            .await
            .map_err(|e| {
                Status::internal(format!(
                    "failed to start gRPC listener on port {REPLICATION_PORT}: {e}"
                ))
            })?;

            let server = self.clone();
            replication.listener_task =
                Some(tokio::spawn(async move {
                    let result = Server::builder()
                        .add_service(ImageLoaderServer::new(server))
                        .serve_with_incoming(TcpListenerStream::new(
                            listener,
                        ))
                        .await;
                    if let Err(e) = result {
                        warn!("replication listener failed: {e}");
                    }
                }));
        }
        replication.listen_refcount += 1;
        Ok(Response::new(ListenResponse {
            key: replication.listen_key().to_string(),
        }))
    }

    async fn stop_listen(
        &self,
        _request: Request<ListenResponse>,
    ) -> Result<Response<StopListenResponse>, Status> {
        let mut replication = self.inner.replication.lock().await;
        if replication.listen_refcount == 0 {
            return Err(Status::internal(
                "internal error - zero refcount on StopListen",
            ));
        }
        replication.listen_refcount -= 1;
        if replication.listen_refcount == 0 {
            if let Some(task) = replication.listener_task.take() {
                task.abort();
            }
            replication.remotes.clear();
        }
        Ok(Response::new(StopListenResponse {}))
    }

    async fn replicate(
        &self,
        request: Request<ReplicateRequest>,
    ) -> Result<Response<ReplicateResponse>, Status> {
        let nodes = request.into_inner().nodes;
        debug!(
            "setting up replication to {} remote nodes",
            nodes.len()
        );
        let mut replication = self.inner.replication.lock().await;
        for node in nodes {
            match replication
                .remotes
                .iter_mut()
                .find(|existing| existing.addr == node.addr)
            {
                Some(existing) => {
                    if existing.key != node.key {
                        warn!(
                            "key drift detected for node {} - updating key",
                            node.addr
                        );
                        existing.key = node.key;
                    }
                }
                None => replication.remotes.push(node),
            }
        }
        Ok(Response::new(ReplicateResponse {}))
    }
}

#[tonic::async_trait]
impl ImageLoader for ProxyServer {
    async fn load(
        &self,
        request: Request<Streaming<BytesMessage>>,
    ) -> Result<Response<LoadResponse>, Status> {
        let key = request
            .metadata()
            .get("key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(key) = key else {
            info!(
                "received image from remote builder without key, rejecting"
            );
            return Err(Status::unauthenticated(
                "valid key must be specified in request metadata",
            ));
        };
        {
            let replication = self.inner.replication.lock().await;
            if key != replication.listen_key() {
                info!(
                    "received image from remote builder with invalid key, rejecting"
                );
                return Err(Status::unauthenticated(
                    "invalid key sent from remote",
                ));
            }
        }
        debug!("receiving image from remote builder with valid key");

        let mut incoming = request.into_inner();
        let (tx, rx) =
            mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let _ = tokio::spawn(async move {
            loop {
                match incoming.message().await {
                    Ok(Some(msg)) => {
                        if tx
                            .send(Ok(Bytes::from(msg.data)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        let _ = tx
                            .send(Err(std::io::Error::other(status)))
                            .await;
                        return;
                    }
                }
            }
        });

        self.inner
            .loader
            .load(StreamReader::new(ReceiverStream::new(rx)))
            .await
            .map_err(|e| {
                Status::internal(format!(
                    "failed to load image into local runtime: {e}"
                ))
            })?;
        Ok(Response::new(LoadResponse {}))
    }
}
