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

//! Receives export payloads (image or tar streams) the daemon sends back
//! at the end of a solve and hands them to a caller-supplied writer.

use super::Attachable;
use kubuild_proto::filesync::file_send_server::{FileSend, FileSendServer};
use kubuild_proto::filesync::BytesMessage;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::Router;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

pub type ExportSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Sink for one export transfer. The writer is consumed by the first
/// transfer; a second transfer on the same session is a protocol error.
#[derive(Clone)]
pub struct FileSendSink {
    writer: Arc<Mutex<Option<ExportSink>>>,
}

impl FileSendSink {
    pub fn new(writer: ExportSink) -> Self {
        Self { writer: Arc::new(Mutex::new(Some(writer))) }
    }
}

impl Attachable for FileSendSink {
    fn attach(&self, router: Router) -> Router {
        router.add_service(FileSendServer::new(self.clone()))
    }
}

#[tonic::async_trait]
impl FileSend for FileSendSink {
    type DiffCopyStream = ReceiverStream<Result<BytesMessage, Status>>;

    async fn diff_copy(
        &self,
        request: Request<Streaming<BytesMessage>>,
    ) -> Result<Response<Self::DiffCopyStream>, Status> {
        let mut writer =
            self.writer.lock().await.take().ok_or_else(|| {
                Status::failed_precondition(
                    "no export sink configured for this session",
                )
            })?;

        let mut incoming = request.into_inner();
        // The return direction of the transfer is unused.
        let (tx, rx) = mpsc::channel::<Result<BytesMessage, Status>>(1);
        let _ = tokio::spawn(async move {
            let mut total = 0usize;
            loop {
                match incoming.message().await {
                    Ok(Some(msg)) => {
                        total += msg.data.len();
                        if let Err(e) = writer.write_all(&msg.data).await {
                            let _ = tx
                                .send(Err(Status::internal(format!(
                                    "export sink write failed: {e}"
                                ))))
                                .await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
            }
            debug!("export transfer complete ({total} bytes)");
            let _ = writer.shutdown().await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
