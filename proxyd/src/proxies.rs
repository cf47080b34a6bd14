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

//! Sub-protocol proxies mounted on the buildkitd-facing session server.
//!
//! Most are transparent: requests from the daemon forward over the
//! nested channel to the CLI's session server, responses stream back.
//! The file-send proxy is the hijack site: export payloads that belong
//! in the node runtime are diverted into the image loader (and the
//! replication roster) instead of crossing back to the CLI.

use crate::server::ProxyServer;
use bytes::Bytes;
use kubuild_proto::filesync::auth_client::AuthClient;
use kubuild_proto::filesync::file_send_client::FileSendClient;
use kubuild_proto::filesync::file_sync_client::FileSyncClient;
use kubuild_proto::filesync::{
    BytesMessage as FsBytesMessage, CredentialsRequest,
    CredentialsResponse, FetchTokenRequest, FetchTokenResponse,
    GetTokenAuthorityRequest, GetTokenAuthorityResponse, Packet,
    VerifyTokenAuthorityRequest, VerifyTokenAuthorityResponse,
};
use kubuild_proto::secrets::secrets_client::SecretsClient;
use kubuild_proto::secrets::{GetSecretRequest, GetSecretResponse};
use kubuild_proto::ssh::ssh_client::SshClient;
use kubuild_proto::ssh::{
    BytesMessage as SshBytesMessage, CheckAgentRequest,
    CheckAgentResponse,
};
use kubuild_proto::upload::upload_client::UploadClient;
use kubuild_proto::upload::BytesMessage as UploadBytesMessage;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

// Exporter metadata marker the daemon attaches to export transfers.
const KEY_EXPORTER_META_PREFIX: &str = "exporter-md-";

type RespStream<M> = ReceiverStream<Result<M, Status>>;

fn forwarded<T>(metadata: &MetadataMap, message: T) -> Request<T> {
    let mut req = Request::new(message);
    *req.metadata_mut() = metadata.clone();
    req
}

/// Forward daemon-side stream messages into a client request channel.
fn pump_requests<M: Send + 'static>(
    mut from: Streaming<M>,
    to: mpsc::Sender<M>,
) {
    let _ = tokio::spawn(async move {
        loop {
            match from.message().await {
                Ok(Some(msg)) => {
                    if to.send(msg).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(status) => {
                    debug!("stream pump ended: {status}");
                    return;
                }
            }
        }
    });
}

/// Forward client response messages back to the daemon-side stream.
fn pump_responses<M: Send + 'static>(
    mut from: Streaming<M>,
    to: mpsc::Sender<Result<M, Status>>,
) {
    let _ = tokio::spawn(async move {
        loop {
            match from.message().await {
                Ok(Some(msg)) => {
                    if to.send(Ok(msg)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(status) => {
                    let _ = to.send(Err(status)).await;
                    return;
                }
            }
        }
    });
}

/// Routes credential and token requests through to the CLI.
pub(crate) struct AuthProxy {
    pub client: AuthClient<Channel>,
}

#[tonic::async_trait]
impl kubuild_proto::filesync::auth_server::Auth for AuthProxy {
    async fn credentials(
        &self,
        request: Request<CredentialsRequest>,
    ) -> Result<Response<CredentialsResponse>, Status> {
        debug!(
            "proxying Auth Credentials request for {}",
            request.get_ref().host
        );
        self.client.clone().credentials(request).await
    }

    async fn fetch_token(
        &self,
        request: Request<FetchTokenRequest>,
    ) -> Result<Response<FetchTokenResponse>, Status> {
        self.client.clone().fetch_token(request).await
    }

    async fn get_token_authority(
        &self,
        request: Request<GetTokenAuthorityRequest>,
    ) -> Result<Response<GetTokenAuthorityResponse>, Status> {
        self.client.clone().get_token_authority(request).await
    }

    async fn verify_token_authority(
        &self,
        request: Request<VerifyTokenAuthorityRequest>,
    ) -> Result<Response<VerifyTokenAuthorityResponse>, Status> {
        self.client.clone().verify_token_authority(request).await
    }
}

/// Routes secret lookups through to the CLI.
pub(crate) struct SecretsProxy {
    pub client: SecretsClient<Channel>,
}

#[tonic::async_trait]
impl kubuild_proto::secrets::secrets_server::Secrets for SecretsProxy {
    async fn get_secret(
        &self,
        request: Request<GetSecretRequest>,
    ) -> Result<Response<GetSecretResponse>, Status> {
        debug!("proxying Secrets {:?}", request.get_ref());
        self.client.clone().get_secret(request).await
    }
}

/// Routes agent checks and pipes agent forwarding streams.
pub(crate) struct SshProxy {
    pub client: SshClient<Channel>,
    pub metadata: MetadataMap,
}

#[tonic::async_trait]
impl kubuild_proto::ssh::ssh_server::Ssh for SshProxy {
    async fn check_agent(
        &self,
        request: Request<CheckAgentRequest>,
    ) -> Result<Response<CheckAgentResponse>, Status> {
        debug!("proxying SSH CheckAgent {:?}", request.get_ref());
        self.client.clone().check_agent(request).await
    }

    type ForwardAgentStream = RespStream<SshBytesMessage>;

    async fn forward_agent(
        &self,
        request: Request<Streaming<SshBytesMessage>>,
    ) -> Result<Response<Self::ForwardAgentStream>, Status> {
        let incoming = request.into_inner();
        let (req_tx, req_rx) = mpsc::channel(8);
        let client_resp = self
            .client
            .clone()
            .forward_agent(forwarded(
                &self.metadata,
                ReceiverStream::new(req_rx),
            ))
            .await
            .map_err(|e| {
                Status::unavailable(format!(
                    "failed to establish SSH ForwardAgent to CLI: {e}"
                ))
            })?
            .into_inner();

        pump_requests(incoming, req_tx);
        let (resp_tx, resp_rx) = mpsc::channel(8);
        pump_responses(client_resp, resp_tx);
        Ok(Response::new(ReceiverStream::new(resp_rx)))
    }
}

/// Pipes build-context transfers between daemon and CLI.
pub(crate) struct FileSyncProxy {
    pub client: FileSyncClient<Channel>,
    pub metadata: MetadataMap,
}

#[tonic::async_trait]
impl kubuild_proto::filesync::file_sync_server::FileSync for FileSyncProxy {
    type DiffCopyStream = RespStream<Packet>;

    async fn diff_copy(
        &self,
        request: Request<Streaming<Packet>>,
    ) -> Result<Response<Self::DiffCopyStream>, Status> {
        debug!("proxying files from build context");
        let incoming = request.into_inner();
        let (req_tx, req_rx) = mpsc::channel(16);
        let client_resp = self
            .client
            .clone()
            .diff_copy(forwarded(
                &self.metadata,
                ReceiverStream::new(req_rx),
            ))
            .await
            .map_err(|e| {
                Status::unavailable(format!(
                    "failed to establish DiffCopy to CLI: {e}"
                ))
            })?
            .into_inner();

        pump_requests(incoming, req_tx);
        let (resp_tx, resp_rx) = mpsc::channel(16);
        pump_responses(client_resp, resp_tx);
        Ok(Response::new(ReceiverStream::new(resp_rx)))
    }

    type TarStreamStream = RespStream<Packet>;

    async fn tar_stream(
        &self,
        request: Request<Streaming<Packet>>,
    ) -> Result<Response<Self::TarStreamStream>, Status> {
        // Unused by the daemon as far as observed; define the failure
        // rather than silently misbehave if that ever changes.
        warn!(
            "the TarStream API is not implemented for the proxy, metadata: {:?}",
            request.metadata()
        );
        Err(Status::unimplemented(
            "the TarStream API is not implemented for the proxy",
        ))
    }
}

/// Pipes stdin-context uploads between daemon and CLI.
pub(crate) struct UploadProxy {
    pub client: UploadClient<Channel>,
    pub metadata: MetadataMap,
}

#[tonic::async_trait]
impl kubuild_proto::upload::upload_server::Upload for UploadProxy {
    type PullStream = RespStream<UploadBytesMessage>;

    async fn pull(
        &self,
        request: Request<Streaming<UploadBytesMessage>>,
    ) -> Result<Response<Self::PullStream>, Status> {
        debug!("proxying Upload Pull");
        let metadata = request.metadata().clone();
        let incoming = request.into_inner();
        let (req_tx, req_rx) = mpsc::channel(8);
        let client_resp = self
            .client
            .clone()
            .pull(forwarded(&metadata, ReceiverStream::new(req_rx)))
            .await
            .map_err(|e| {
                Status::unavailable(format!(
                    "failed to establish Upload Pull to CLI: {e}"
                ))
            })?
            .into_inner();

        pump_requests(incoming, req_tx);
        let (resp_tx, resp_rx) = mpsc::channel(8);
        pump_responses(client_resp, resp_tx);
        Ok(Response::new(ReceiverStream::new(resp_rx)))
    }
}

/// The hijack site: export payloads either divert into the node
/// runtime (and peers) or pass through to the CLI untouched.
pub(crate) struct FileSendProxy {
    pub client: FileSendClient<Channel>,
    pub session_id: String,
    pub server: ProxyServer,
    pub metadata: MetadataMap,
}

fn exporter_metadata_keys(md: &MetadataMap) -> Vec<String> {
    md.iter()
        .filter_map(|entry| match entry {
            KeyAndValueRef::Ascii(key, _) => {
                let key = key.as_str();
                key.starts_with(KEY_EXPORTER_META_PREFIX).then(|| {
                    key.trim_start_matches(KEY_EXPORTER_META_PREFIX)
                        .to_string()
                })
            }
            KeyAndValueRef::Binary(..) => None,
        })
        .collect()
}

#[tonic::async_trait]
impl kubuild_proto::filesync::file_send_server::FileSend for FileSendProxy {
    type DiffCopyStream = RespStream<FsBytesMessage>;

    async fn diff_copy(
        &self,
        request: Request<Streaming<FsBytesMessage>>,
    ) -> Result<Response<Self::DiffCopyStream>, Status> {
        let exporter_meta = exporter_metadata_keys(request.metadata());
        let mut incoming = request.into_inner();

        if !exporter_meta.is_empty()
            && self.server.hijack_required(&self.session_id).await
        {
            debug!(
                "detected a FileSend requiring hijack ({exporter_meta:?})"
            );

            // The return direction to the daemon is unused; complete it
            // once the load finishes.
            let (done_tx, done_rx) =
                mpsc::channel::<Result<FsBytesMessage, Status>>(1);

            let (bytes_tx, bytes_rx) =
                mpsc::channel::<Result<Bytes, std::io::Error>>(16);
            let _ = tokio::spawn(async move {
                loop {
                    match incoming.message().await {
                        Ok(Some(msg)) => {
                            if bytes_tx
                                .send(Ok(Bytes::from(msg.data)))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(status) => {
                            let _ = bytes_tx
                                .send(Err(std::io::Error::other(
                                    status,
                                )))
                                .await;
                            return;
                        }
                    }
                }
            });

            let server = self.server.clone();
            let _ = tokio::spawn(async move {
                let reader =
                    StreamReader::new(ReceiverStream::new(bytes_rx));
                let result = server.image_load(reader).await;
                if let Err(e) = &result {
                    let _ = done_tx
                        .send(Err(Status::internal(format!(
                            "image load failed: {e}"
                        ))))
                        .await;
                }
                // Dropping done_tx ends the stream towards the daemon.
            });

            return Ok(Response::new(ReceiverStream::new(done_rx)));
        }

        // Transparent pass-through to the CLI's export sink.
        let (req_tx, req_rx) = mpsc::channel(16);
        let client_resp = self
            .client
            .clone()
            .diff_copy(forwarded(
                &self.metadata,
                ReceiverStream::new(req_rx),
            ))
            .await
            .map_err(|e| {
                Status::unavailable(format!(
                    "failed to establish DiffCopy to CLI: {e}"
                ))
            })?
            .into_inner();

        pump_requests(incoming, req_tx);
        let (resp_tx, resp_rx) = mpsc::channel(16);
        pump_responses(client_resp, resp_tx);
        Ok(Response::new(ReceiverStream::new(resp_rx)))
    }
}
