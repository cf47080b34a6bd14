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

//! Forwards a local SSH agent socket to the daemon for builds that use
//! `RUN --mount=type=ssh`.

use super::Attachable;
use kubuild_proto::ssh::ssh_server::{Ssh, SshServer};
use kubuild_proto::ssh::{
    BytesMessage, CheckAgentRequest, CheckAgentResponse,
};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::Router;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

const AGENT_CHUNK_SIZE: usize = 32 * 1024;
const DEFAULT_ID: &str = "default";

#[derive(Error, Debug)]
pub enum SshSpecError {
    #[error("ssh forwarding requested but $SSH_AUTH_SOCK is not set")]
    NoAgentSocket,
}

/// An agent socket exposed to the daemon under an id ("default" unless
/// the caller names one).
#[derive(Debug, Clone)]
pub struct SshAgentProvider {
    id: String,
    socket: PathBuf,
}

impl SshAgentProvider {
    pub fn new(id: Option<String>, socket: PathBuf) -> Self {
        Self {
            id: id.unwrap_or_else(|| DEFAULT_ID.to_string()),
            socket,
        }
    }

    /// Parse `[id[=socket]]` specs, defaulting the socket to
    /// `$SSH_AUTH_SOCK`.
    pub fn from_specs(
        specs: &[String],
    ) -> Result<Vec<Self>, SshSpecError> {
        let mut out = Vec::new();
        for spec in specs {
            let (id, socket) = match spec.split_once('=') {
                Some((id, path)) => {
                    (Some(id.to_string()), PathBuf::from(path))
                }
                None => {
                    let sock = std::env::var("SSH_AUTH_SOCK")
                        .map_err(|_| SshSpecError::NoAgentSocket)?;
                    let id = if spec.is_empty() {
                        None
                    } else {
                        Some(spec.clone())
                    };
                    (id, PathBuf::from(sock))
                }
            };
            out.push(Self::new(id, socket));
        }
        Ok(out)
    }
}

impl Attachable for SshAgentProvider {
    fn attach(&self, router: Router) -> Router {
        router.add_service(SshServer::new(self.clone()))
    }
}

#[tonic::async_trait]
impl Ssh for SshAgentProvider {
    async fn check_agent(
        &self,
        request: Request<CheckAgentRequest>,
    ) -> Result<Response<CheckAgentResponse>, Status> {
        let id = request.into_inner().id;
        let id = if id.is_empty() { DEFAULT_ID } else { &id };
        if id != self.id {
            return Err(Status::not_found(format!(
                "unknown ssh agent id {id}"
            )));
        }
        Ok(Response::new(CheckAgentResponse {}))
    }

    type ForwardAgentStream = ReceiverStream<Result<BytesMessage, Status>>;

    async fn forward_agent(
        &self,
        request: Request<Streaming<BytesMessage>>,
    ) -> Result<Response<Self::ForwardAgentStream>, Status> {
        let agent =
            UnixStream::connect(&self.socket).await.map_err(|e| {
                Status::unavailable(format!(
                    "failed to connect to ssh agent {}: {e}",
                    self.socket.display()
                ))
            })?;
        debug!("forwarding ssh agent {}", self.socket.display());

        let (mut agent_rx, mut agent_tx) = agent.into_split();
        let mut incoming = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<BytesMessage, Status>>(8);

        // Daemon -> agent.
        let _ = tokio::spawn(async move {
            while let Ok(Some(msg)) = incoming.message().await {
                if agent_tx.write_all(&msg.data).await.is_err() {
                    break;
                }
            }
            let _ = agent_tx.shutdown().await;
        });

        // Agent -> daemon.
        let _ = tokio::spawn(async move {
            let mut buf = vec![0u8; AGENT_CHUNK_SIZE];
            loop {
                match agent_rx.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx
                            .send(Ok(BytesMessage {
                                data: buf[..n].to_vec(),
                            }))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(Status::internal(format!(
                                "ssh agent read failed: {e}"
                            ))))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_with_explicit_socket() {
        let providers = SshAgentProvider::from_specs(&[
            "deploy=/run/agent.sock".to_string(),
        ])
        .expect("parse");
        assert_eq!(providers[0].id, "deploy");
        assert_eq!(providers[0].socket, PathBuf::from("/run/agent.sock"));
    }

    #[tokio::test]
    async fn test_check_agent_rejects_unknown_id() {
        let provider = SshAgentProvider::new(
            None,
            PathBuf::from("/nonexistent.sock"),
        );
        let status = provider
            .check_agent(Request::new(CheckAgentRequest {
                id: "other".to_string(),
            }))
            .await
            .expect_err("must fail");
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_check_agent_accepts_default_id() {
        let provider = SshAgentProvider::new(
            None,
            PathBuf::from("/nonexistent.sock"),
        );
        let _ = provider
            .check_agent(Request::new(CheckAgentRequest {
                id: String::new(),
            }))
            .await
            .expect("default id accepted");
    }
}
