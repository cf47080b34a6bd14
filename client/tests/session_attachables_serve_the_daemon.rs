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

//! End-to-end exercise of the session fabric against an in-process
//! daemon stand-in: the "daemon" opens the session stream, dials the
//! nested gRPC connection back over it, and drives the attachable
//! sub-protocols the way buildkitd would.

use futures::future::BoxFuture;
use hyper_util::rt::TokioIo;
use kubuild_client::session::secrets::SecretStore;
use kubuild_client::session::filesend::FileSendSink;
use kubuild_client::session::filesync::LocalDirSource;
use kubuild_client::session::{server_io, Session};
use kubuild_client::BuildKitClient;
use kubuild_proto::control::control_server::{Control, ControlServer};
use kubuild_proto::control::{
    BytesMessage, DiskUsageRequest, DiskUsageResponse,
    ListWorkersRequest, ListWorkersResponse, PruneRequest,
    SolveRequest, SolveResponse, StatusRequest, StatusResponse,
    UsageRecord,
};
use kubuild_proto::filesync::file_send_client::FileSendClient;
use kubuild_proto::filesync::file_sync_client::FileSyncClient;
use kubuild_proto::filesync::{
    BytesMessage as FsBytesMessage, Packet, PacketType,
};
use kubuild_proto::secrets::secrets_client::SecretsClient;
use kubuild_proto::secrets::GetSecretRequest;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tonic::{Request, Response, Status, Streaming};
use tower::service_fn;

type SessionProbe =
    Box<dyn FnOnce(Channel) -> BoxFuture<'static, ()> + Send>;

/// Control stand-in whose Session handler dials the nested connection
/// and runs a per-test probe against the attachables.
struct DaemonStandIn {
    probe: Mutex<Option<SessionProbe>>,
}

#[tonic::async_trait]
impl Control for DaemonStandIn {
    async fn disk_usage(
        &self,
        _request: Request<DiskUsageRequest>,
    ) -> Result<Response<DiskUsageResponse>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    type PruneStream = ReceiverStream<Result<UsageRecord, Status>>;

    async fn prune(
        &self,
        _request: Request<PruneRequest>,
    ) -> Result<Response<Self::PruneStream>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    async fn solve(
        &self,
        _request: Request<SolveRequest>,
    ) -> Result<Response<SolveResponse>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    type StatusStream = ReceiverStream<Result<StatusResponse, Status>>;

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<Self::StatusStream>, Status> {
        Err(Status::unimplemented("not under test"))
    }

    type SessionStream = ReceiverStream<Result<BytesMessage, Status>>;

    async fn session(
        &self,
        request: Request<Streaming<BytesMessage>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let probe = self
            .probe
            .lock()
            .expect("probe lock")
            .take()
            .expect("exactly one session per test");

        let incoming = request.into_inner();
        let (tx, rx) = mpsc::channel(8);
        let io = server_io(incoming, tx);
        let slot = Arc::new(tokio::sync::Mutex::new(Some(io)));

        let _ = tokio::spawn(async move {
            let channel = Endpoint::from_static("http://session")
                .connect_with_connector(service_fn(move |_: Uri| {
                    let slot = Arc::clone(&slot);
                    async move {
                        slot.lock().await.take().map(TokioIo::new).ok_or_else(
                            || {
                                std::io::Error::other(
                                    "session already dialed",
                                )
                            },
                        )
                    }
                }))
                .await
                .expect("nested connect");
            probe(channel).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn list_workers(
        &self,
        _request: Request<ListWorkersRequest>,
    ) -> Result<Response<ListWorkersResponse>, Status> {
        Ok(Response::new(ListWorkersResponse::default()))
    }
}

async fn start_daemon(
    probe: SessionProbe,
) -> (BuildKitClient, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("buildkitd.sock");
    let listener = tokio::net::UnixListener::bind(&socket)
        .expect("bind socket");
    let daemon = DaemonStandIn { probe: Mutex::new(Some(probe)) };
    let _ = tokio::spawn(async move {
        Server::builder()
            .add_service(ControlServer::new(daemon))
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
            .expect("daemon server");
    });

    let socket_path = socket.to_string_lossy().into_owned();
    let client = BuildKitClient::connect_with(move || {
        let socket_path = socket_path.clone();
        async move { UnixStream::connect(socket_path).await }
    })
    .await
    .expect("connect");
    (client, dir)
}

#[tokio::test]
async fn test_secret_lookup_round_trips() {
    let secret_dir = tempfile::tempdir().expect("tempdir");
    let secret_path = secret_dir.path().join("token");
    std::fs::write(&secret_path, b"s3cr3t").expect("write secret");

    let (result_tx, mut result_rx) = mpsc::channel(1);
    let probe: SessionProbe = Box::new(move |channel| {
        Box::pin(async move {
            let resp = SecretsClient::new(channel)
                .get_secret(GetSecretRequest {
                    id: "token".to_string(),
                    annotations: HashMap::new(),
                })
                .await
                .expect("get_secret")
                .into_inner();
            let _ = result_tx.send(resp.data).await;
        })
    });

    let (client, _daemon_dir) = start_daemon(probe).await;

    let mut session = Session::new("test");
    session.allow(Arc::new(
        SecretStore::from_specs(&[format!(
            "id=token,src={}",
            secret_path.display()
        )])
        .expect("specs"),
    ));
    let handle = session.run(&client).await.expect("session");

    let data = result_rx.recv().await.expect("secret result");
    assert_eq!(data, b"s3cr3t");
    handle.close();
}

#[tokio::test]
async fn test_file_sync_serves_context_directory() {
    let context = tempfile::tempdir().expect("tempdir");
    std::fs::write(context.path().join("Dockerfile"), b"FROM scratch\n")
        .expect("write");
    std::fs::write(context.path().join("app.txt"), b"hello")
        .expect("write");

    let (result_tx, mut result_rx) = mpsc::channel(1);
    let probe: SessionProbe = Box::new(move |channel| {
        Box::pin(async move {
            let (req_tx, req_rx) = mpsc::channel::<Packet>(8);
            let mut request =
                Request::new(ReceiverStream::new(req_rx));
            let _ = request
                .metadata_mut()
                .insert("dir-name", "context".parse().expect("meta"));

            let mut stream = FileSyncClient::new(channel)
                .diff_copy(request)
                .await
                .expect("diff_copy")
                .into_inner();

            // Phase one: stats until the empty terminator.
            let mut stats = Vec::new();
            loop {
                let packet = stream
                    .message()
                    .await
                    .expect("recv")
                    .expect("stream open");
                assert_eq!(
                    packet.r#type,
                    PacketType::PacketStat as i32
                );
                match packet.stat {
                    Some(stat) => stats.push(stat),
                    None => break,
                }
            }

            // Request the content of app.txt by its stat index.
            let idx = stats
                .iter()
                .position(|s| s.path == "app.txt")
                .expect("app.txt stat") as u32;
            req_tx
                .send(Packet {
                    r#type: PacketType::PacketReq as i32,
                    stat: None,
                    id: idx,
                    data: Vec::new(),
                })
                .await
                .expect("send req");

            let mut content = Vec::new();
            loop {
                let packet = stream
                    .message()
                    .await
                    .expect("recv")
                    .expect("stream open");
                assert_eq!(
                    packet.r#type,
                    PacketType::PacketData as i32
                );
                if packet.data.is_empty() {
                    break;
                }
                content.extend_from_slice(&packet.data);
            }

            req_tx
                .send(Packet {
                    r#type: PacketType::PacketFin as i32,
                    stat: None,
                    id: 0,
                    data: Vec::new(),
                })
                .await
                .expect("send fin");

            let paths: Vec<String> =
                stats.into_iter().map(|s| s.path).collect();
            let _ = result_tx.send((paths, content)).await;
        })
    });

    let (client, _daemon_dir) = start_daemon(probe).await;

    let mut session = Session::new("test");
    session.allow(Arc::new(LocalDirSource::new(HashMap::from([(
        "context".to_string(),
        PathBuf::from(context.path()),
    )]))));
    let handle = session.run(&client).await.expect("session");

    let (paths, content) =
        result_rx.recv().await.expect("sync result");
    assert_eq!(paths, vec!["Dockerfile", "app.txt"]);
    assert_eq!(content, b"hello");
    handle.close();
}

#[tokio::test]
async fn test_file_send_payload_reaches_export_sink() {
    let (sink, mut reader) = tokio::io::duplex(64 * 1024);

    let probe: SessionProbe = Box::new(move |channel| {
        Box::pin(async move {
            let (req_tx, req_rx) =
                mpsc::channel::<FsBytesMessage>(8);
            let request = Request::new(ReceiverStream::new(req_rx));
            let stream_task = tokio::spawn(async move {
                let mut stream = FileSendClient::new(channel)
                    .diff_copy(request)
                    .await
                    .expect("diff_copy")
                    .into_inner();
                while stream
                    .message()
                    .await
                    .expect("recv")
                    .is_some()
                {}
            });

            for chunk in [b"oci-".to_vec(), b"tarball".to_vec()] {
                req_tx
                    .send(FsBytesMessage { data: chunk })
                    .await
                    .expect("send");
            }
            drop(req_tx);
            stream_task.await.expect("stream task");
        })
    });

    let (client, _daemon_dir) = start_daemon(probe).await;

    let mut session = Session::new("test");
    session.allow(Arc::new(FileSendSink::new(Box::new(sink))));
    let handle = session.run(&client).await.expect("session");

    let mut received = Vec::new();
    let _ = reader
        .read_to_end(&mut received)
        .await
        .expect("read payload");
    assert_eq!(received, b"oci-tarball");
    handle.close();
}
