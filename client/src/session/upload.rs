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

//! Streams a caller-supplied reader to the daemon on request; used when
//! the build context arrives on standard input as a tar archive.

use super::Attachable;
use kubuild_proto::upload::upload_server::{Upload, UploadServer};
use kubuild_proto::upload::BytesMessage;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::Router;
use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

const UPLOAD_CHUNK_SIZE: usize = 32 * 1024;

// Path metadata key set by the daemon when it pulls an upload.
const KEY_URL_PATH: &str = "urlpath";

pub type UploadReader = Box<dyn AsyncRead + Send + Unpin>;

/// A single one-shot upload, addressed by a synthetic URL passed to the
/// frontend as the build context.
#[derive(Clone)]
pub struct UploadSource {
    id: String,
    reader: Arc<Mutex<Option<UploadReader>>>,
}

impl UploadSource {
    pub fn new(reader: UploadReader) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            reader: Arc::new(Mutex::new(Some(reader))),
        }
    }

    /// The context URL to hand to the frontend.
    pub fn url(&self) -> String {
        format!("http://buildkit-session/{}", self.id)
    }
}

impl Attachable for UploadSource {
    fn attach(&self, router: Router) -> Router {
        router.add_service(UploadServer::new(self.clone()))
    }
}

#[tonic::async_trait]
impl Upload for UploadSource {
    type PullStream = ReceiverStream<Result<BytesMessage, Status>>;

    async fn pull(
        &self,
        request: Request<Streaming<BytesMessage>>,
    ) -> Result<Response<Self::PullStream>, Status> {
        let path = request
            .metadata()
            .get(KEY_URL_PATH)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if path.trim_start_matches('/') != self.id {
            return Err(Status::not_found(format!(
                "no upload registered for {path}"
            )));
        }

        let mut reader =
            self.reader.lock().await.take().ok_or_else(|| {
                Status::failed_precondition("upload already consumed")
            })?;

        let (tx, rx) = mpsc::channel::<Result<BytesMessage, Status>>(8);
        let _ = tokio::spawn(async move {
            let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf).await {
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
                                "upload read failed: {e}"
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
