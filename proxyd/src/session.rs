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

//! Session interception.
//!
//! A build session overlays a nested gRPC connection on one
//! `Control.Session` byte stream: the daemon acts as the nested client,
//! the CLI as the nested server. Sitting in the middle, the proxy runs
//! both roles at once: towards buildkitd it serves the session
//! sub-protocols (so it can hijack the ones it cares about), towards
//! the CLI it is a plain client the untouched sub-protocols forward to.

use crate::proxies::{
    AuthProxy, FileSendProxy, FileSyncProxy, SecretsProxy, SshProxy,
    UploadProxy,
};
use crate::server::ProxyServer;
use hyper_util::rt::TokioIo;
use kubuild_client::session::{
    client_io, server_io, HEADER_SESSION_ID, HEADER_SESSION_NAME,
    HEADER_SESSION_SHARED_KEY,
};
use kubuild_proto::control::BytesMessage;
use kubuild_proto::filesync::auth_client::AuthClient;
use kubuild_proto::filesync::file_send_client::FileSendClient;
use kubuild_proto::filesync::file_sync_client::FileSyncClient;
use kubuild_proto::secrets::secrets_client::SecretsClient;
use kubuild_proto::ssh::ssh_client::SshClient;
use kubuild_proto::upload::upload_client::UploadClient;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::transport::{Endpoint, Server, Uri};
use tonic::{Request, Response, Status, Streaming};
use tower::service_fn;
use tracing::{debug, error};

// The connector ignores the URI; the transport is the hijacked stream.
const NESTED_ENDPOINT: &str = "http://session";

fn required_header(
    md: &MetadataMap,
    key: &'static str,
) -> Result<String, Status> {
    md.get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            Status::invalid_argument(format!(
                "malformed session header {key}"
            ))
        })
}

impl ProxyServer {
    pub(crate) async fn intercept_session(
        &self,
        request: Request<Streaming<BytesMessage>>,
    ) -> Result<
        Response<ReceiverStream<Result<BytesMessage, Status>>>,
        Status,
    > {
        let (md, _extensions, incoming) = request.into_parts();

        let session_name = required_header(&md, HEADER_SESSION_NAME)?;
        let session_key =
            required_header(&md, HEADER_SESSION_SHARED_KEY)?;
        let session_id = required_header(&md, HEADER_SESSION_ID)?;
        debug!(
            "starting proxying Session Name={session_name} ID={session_id} Key={session_key}"
        );

        // Make sure the session entry exists even if Solve has not
        // arrived yet; its attrs stay empty until it does.
        let _ = self.get_session(&session_id).await;

        // Outbound session stream to buildkitd, metadata forwarded.
        let (daemon_tx, daemon_rx) = mpsc::channel::<BytesMessage>(8);
        let mut daemon_req =
            Request::new(ReceiverStream::new(daemon_rx));
        *daemon_req.metadata_mut() = md.clone();
        let daemon_stream = self
            .inner
            .buildkitd
            .control()
            .session(daemon_req)
            .await
            .map_err(|e| {
                error!("unable to establish Session stream: {e}");
                e
            })?
            .into_inner();
        let daemon_io = client_io(daemon_stream, daemon_tx);

        // The response stream back to the CLI carries the nested bytes
        // our client half writes.
        let (cli_tx, cli_rx) =
            mpsc::channel::<Result<BytesMessage, Status>>(8);
        let cli_io = server_io(incoming, cli_tx);

        // Nested gRPC client over the hijacked CLI stream. The
        // connector hands out the one stream exactly once; the channel
        // never re-dials because the session dies with the stream.
        let cli_io_slot = Arc::new(Mutex::new(Some(cli_io)));
        let channel = Endpoint::from_static(NESTED_ENDPOINT)
            .connect_with_connector_lazy(service_fn(move |_: Uri| {
                let slot = Arc::clone(&cli_io_slot);
                async move {
                    slot.lock().await.take().map(TokioIo::new).ok_or_else(
                        || {
                            std::io::Error::other(
                                "session stream already consumed",
                            )
                        },
                    )
                }
            }));

        // Sub-protocol servers facing buildkitd; pass-throughs forward
        // over the nested channel, the file-send proxy hijacks.
        let (_, health_service) = tonic_health::server::health_reporter();
        let router = Server::builder()
            .add_service(health_service)
            .add_service(
                kubuild_proto::filesync::file_send_server::FileSendServer::new(
                    FileSendProxy {
                        client: FileSendClient::new(channel.clone()),
                        session_id: session_id.clone(),
                        server: self.clone(),
                        metadata: md.clone(),
                    },
                ),
            )
            .add_service(
                kubuild_proto::filesync::file_sync_server::FileSyncServer::new(
                    FileSyncProxy {
                        client: FileSyncClient::new(channel.clone()),
                        metadata: md.clone(),
                    },
                ),
            )
            .add_service(
                kubuild_proto::filesync::auth_server::AuthServer::new(
                    AuthProxy {
                        client: AuthClient::new(channel.clone()),
                    },
                ),
            )
            .add_service(
                kubuild_proto::secrets::secrets_server::SecretsServer::new(
                    SecretsProxy {
                        client: SecretsClient::new(channel.clone()),
                    },
                ),
            )
            .add_service(
                kubuild_proto::ssh::ssh_server::SshServer::new(
                    SshProxy {
                        client: SshClient::new(channel.clone()),
                        metadata: md.clone(),
                    },
                ),
            )
            .add_service(
                kubuild_proto::upload::upload_server::UploadServer::new(
                    UploadProxy {
                        client: UploadClient::new(channel),
                        metadata: md.clone(),
                    },
                ),
            );

        let server = self.clone();
        let _ = tokio::spawn(async move {
            let result = router
                .serve_with_incoming(tokio_stream::once(Ok::<
                    _,
                    std::io::Error,
                >(
                    daemon_io
                )))
                .await;
            debug!(
                "finished proxying Session Name={session_name} ID={session_id}: {result:?}"
            );
            if let Err(e) = result {
                error!("session server failed: {e}");
            }
            server.drop_session(&session_id).await;
        });

        Ok(Response::new(ReceiverStream::new(cli_rx)))
    }
}
