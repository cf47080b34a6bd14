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

//! Client-side export sinks that land the payload in the cluster.
//!
//! When a build must be loadable without a registry, the exported
//! tarball is written through here: one pipe per builder pod, each
//! feeding the pod's container runtime through an exec tunnel. Dials
//! are deferred until the first byte arrives so a failed solve never
//! opens runtime connections.

use crate::error::Result;
use crate::progress::ProgressWriter;
use bytes::Bytes;
use kubuild_client::session::filesend::ExportSink;
use kubuild_client::BuildKitClient;
use kubuild_driver::{Builder, BuilderClients, Driver};
use kubuild_imageload::{docker_load_over_stream, ContainerdLoader};
use kubuild_proto::proxy::{
    ListenRequest, ListenResponse, Node, ReplicateRequest,
};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;
use tracing::{debug, warn};

// Matches the per-builder subdirectory the manifest mounts for the
// containerd worker; images land in the shared kubelet namespace.
const CONTAINERD_NAMESPACE: &str = "k8s.io";

/// Which runtime helper consumes the tunnel on each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoaderKind {
    Docker,
    Containerd,
}

/// `AsyncWrite` half of a byte pipe.
pub(crate) struct ChannelWriter {
    tx: PollSender<Result<Bytes, io::Error>>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>) -> Self {
        Self { tx: PollSender::new(tx) }
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if ready!(self.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "image load pipe closed",
            )));
        }
        if self
            .tx
            .send_item(Ok(Bytes::copy_from_slice(buf)))
            .is_err()
        {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "image load pipe closed",
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

/// Guard completing the per-node load tasks; await it after the solve
/// finishes so load failures surface.
#[derive(Debug)]
pub(crate) struct LoaderGuard {
    tasks: JoinSet<anyhow::Result<()>>,
}

impl LoaderGuard {
    pub async fn finish(mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            joined
                .map_err(|e| {
                    crate::BuildError::Other(anyhow::anyhow!(
                        "image load task panicked: {e}"
                    ))
                })?
                .map_err(crate::BuildError::Other)?;
        }
        Ok(())
    }
}

/// Node names of one builder, for the load fan-out.
pub(crate) fn builder_node_names(
    builders: &[Builder],
    builder_name: &str,
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for builder in builders {
        if builder.name != builder_name {
            continue;
        }
        names.extend(builder.nodes.iter().map(|n| n.name.clone()));
    }
    if names.is_empty() {
        return Err(crate::BuildError::NoBuilderNodes {
            builder: builder_name.to_string(),
        });
    }
    Ok(names)
}

/// Build the export sink that replicates the payload to every node of
/// the builder and loads it into the node runtime.
pub(crate) fn new_runtime_loader(
    kind: LoaderKind,
    driver: Arc<dyn Driver>,
    node_names: Vec<String>,
    progress: ProgressWriter,
) -> (ExportSink, LoaderGuard) {
    let mut tasks = JoinSet::new();
    let mut dests = Vec::with_capacity(node_names.len());

    for node_name in node_names {
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(16);
        dests.push(tx);
        let driver = Arc::clone(&driver);
        let progress = progress.clone();
        let _ = tasks.spawn(async move {
            let mut rx = rx;
            // Defer the runtime dial until the exporter produces data.
            let Some(first) = rx.recv().await else {
                return Ok(());
            };
            progress
                .message(format!(
                    "loading image to {} runtime via pod {node_name}",
                    match kind {
                        LoaderKind::Docker => "docker",
                        LoaderKind::Containerd => "containerd",
                    }
                ))
                .await;

            let tunnel = driver
                .runtime_sock_proxy(&node_name)
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "failed to set up runtime proxy through pod {node_name}: {e}"
                    )
                })?;

            let replay = tokio_stream::once(first)
                .chain(ReceiverStream::new(rx));
            let reader = StreamReader::new(replay);

            match kind {
                LoaderKind::Docker => {
                    docker_load_over_stream(tunnel, reader)
                        .await
                        .map_err(|e| anyhow::anyhow!(e))?;
                }
                LoaderKind::Containerd => {
                    let tunnel_slot =
                        Arc::new(Mutex::new(Some(tunnel)));
                    let client = BuildKitClient::connect_with(
                        move || {
                            let slot = Arc::clone(&tunnel_slot);
                            async move {
                                slot.lock().await.take().ok_or_else(
                                    || {
                                        io::Error::other(
                                            "runtime tunnel already consumed",
                                        )
                                    },
                                )
                            }
                        },
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;
                    let loader = ContainerdLoader::from_channel(
                        client.channel(),
                        CONTAINERD_NAMESPACE,
                    );
                    let _ = loader
                        .import(reader)
                        .await
                        .map_err(|e| anyhow::anyhow!(e))?;
                }
            }
            debug!("image loaded via pod {node_name}");
            Ok(())
        });
    }

    // Fan-out driver: one writer, every node sees the same bytes.
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, io::Error>>(16);
    let _ = tasks.spawn(async move {
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(data) => {
                    for dest in &dests {
                        if dest.send(Ok(data.clone())).await.is_err()
                        {
                            return Err(anyhow::anyhow!(
                                "image load destination went away"
                            ));
                        }
                    }
                }
                Err(e) => {
                    let msg = e.to_string();
                    for dest in &dests {
                        let _ = dest
                            .send(Err(io::Error::other(msg.clone())))
                            .await;
                    }
                    return Err(anyhow::anyhow!(msg));
                }
            }
        }
        Ok(())
    });

    (Box::new(ChannelWriter::new(tx)), LoaderGuard { tasks })
}

/// Peer replication wiring for daemon-side loads: every peer pod
/// starts its listener, the chosen pod learns the roster. Dropping
/// without `release` leaves listeners running until their pods recycle
/// the key, so release on every exit path.
pub(crate) struct ReplicationGuard {
    peers: Vec<(BuildKitClient, String)>,
}

impl ReplicationGuard {
    pub async fn setup(clients: &BuilderClients) -> Result<Self> {
        let mut peers = Vec::new();
        let mut roster = Vec::new();
        for other in &clients.others {
            let Some(proxy) = &other.proxy else {
                continue;
            };
            let key = proxy
                .proxy()
                .listen(ListenRequest {})
                .await
                .map_err(kubuild_client::ClientError::from)?
                .into_inner()
                .key;
            roster.push(Node {
                addr: other.cluster_addr.clone(),
                key: key.clone(),
            });
            peers.push((proxy.clone(), key));
        }

        if !roster.is_empty() {
            if let Some(proxy) = &clients.chosen.proxy {
                let _ = proxy
                    .proxy()
                    .replicate(ReplicateRequest { nodes: roster })
                    .await
                    .map_err(kubuild_client::ClientError::from)?;
            }
        }
        Ok(Self { peers })
    }

    pub async fn release(self) {
        for (proxy, key) in self.peers {
            if let Err(e) = proxy
                .proxy()
                .stop_listen(ListenResponse { key })
                .await
            {
                warn!("failed to stop peer listener: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_channel_writer_delivers_bytes() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut writer = ChannelWriter::new(tx);
        writer.write_all(b"abc").await.expect("write");
        writer.shutdown().await.expect("shutdown");

        let chunk =
            rx.recv().await.expect("chunk").expect("not an error");
        assert_eq!(&chunk[..], b"abc");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_writer_errors_after_receiver_drop() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut writer = ChannelWriter::new(tx);
        assert!(writer.write_all(b"abc").await.is_err());
    }

    #[test]
    fn test_builder_node_names_filters_by_name() {
        let builders = vec![
            Builder {
                name: "one".to_string(),
                driver: "kubernetes".to_string(),
                nodes: vec![kubuild_driver::Node {
                    name: "pod-a".to_string(),
                    ..Default::default()
                }],
            },
            Builder {
                name: "two".to_string(),
                driver: "kubernetes".to_string(),
                nodes: vec![kubuild_driver::Node {
                    name: "pod-b".to_string(),
                    ..Default::default()
                }],
            },
        ];
        let names =
            builder_node_names(&builders, "two").expect("names");
        assert_eq!(names, vec!["pod-b"]);
    }

    #[test]
    fn test_builder_node_names_missing_builder() {
        assert!(matches!(
            builder_node_names(&[], "ghost"),
            Err(crate::BuildError::NoBuilderNodes { .. })
        ));
    }
}
