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

//! The client half of a build session.
//!
//! A session lets the daemon reach back into the caller while a solve is
//! in flight: pulling build-context files, looking up registry
//! credentials and secrets, forwarding an SSH agent, and delivering
//! export payloads. The daemon drives a nested gRPC connection overlaid
//! on the `Control.Session` byte stream; this module runs the server side
//! of that nested connection and lets callers attach the sub-protocol
//! services they need.

use crate::client::{BuildKitClient, ClientError};
use kubuild_proto::control::BytesMessage;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataValue;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tracing::debug;
use uuid::Uuid;

pub mod filesend;
pub mod filesync;
pub mod secrets;
pub mod ssh;
mod stream;
pub mod upload;

pub use stream::{client_io, server_io, SessionConnectInfo, StreamIo};

// Session identity travels in gRPC metadata; the daemon echoes these
// headers when it needs to resolve the caller for a session ID.
pub const HEADER_SESSION_ID: &str = "x-docker-expose-session-uuid";
pub const HEADER_SESSION_NAME: &str = "x-docker-expose-session-name";
pub const HEADER_SESSION_SHARED_KEY: &str =
    "x-docker-expose-session-sharedkey";

/// A sub-protocol service that can be mounted on a session server.
pub trait Attachable: Send + Sync + 'static {
    fn attach(&self, router: Router) -> Router;
}

/// One build session: an identity plus the set of attached sub-protocol
/// services.
pub struct Session {
    id: String,
    name: String,
    shared_key: String,
    attachables: Vec<Arc<dyn Attachable>>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            shared_key: Uuid::new_v4().simple().to_string(),
            attachables: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn allow(&mut self, attachable: Arc<dyn Attachable>) {
        self.attachables.push(attachable);
    }

    /// Open the session stream and serve the attached sub-protocols over
    /// it until the daemon hangs up or the handle is closed.
    pub async fn run(
        self,
        client: &BuildKitClient,
    ) -> Result<SessionHandle, ClientError> {
        let (tx, rx) = mpsc::channel::<BytesMessage>(8);
        let mut control = client.control();

        let mut req = tonic::Request::new(ReceiverStream::new(rx));
        let md = req.metadata_mut();
        let _ = md.insert(
            HEADER_SESSION_ID,
            MetadataValue::try_from(self.id.as_str())
                .map_err(|e| ClientError::Other(e.into()))?,
        );
        let _ = md.insert(
            HEADER_SESSION_NAME,
            MetadataValue::try_from(self.name.as_str())
                .map_err(|e| ClientError::Other(e.into()))?,
        );
        let _ = md.insert(
            HEADER_SESSION_SHARED_KEY,
            MetadataValue::try_from(self.shared_key.as_str())
                .map_err(|e| ClientError::Other(e.into()))?,
        );

        let resp = control.session(req).await?;
        let io = client_io(resp.into_inner(), tx);

        // The health service anchors the router; sub-protocols chain
        // onto it.
        let (_, health_service) = tonic_health::server::health_reporter();
        let mut router = Server::builder().add_service(health_service);
        for attachable in &self.attachables {
            router = attachable.attach(router);
        }

        debug!(session_id = %self.id, "session stream established");
        let id = self.id.clone();
        let task = tokio::spawn(async move {
            let result = router
                .serve_with_incoming(tokio_stream::once(
                    Ok::<_, io::Error>(io),
                ))
                .await;
            debug!(session_id = %id, "session server finished: {result:?}");
        });

        Ok(SessionHandle { id: self.id, task })
    }
}

/// A running session; dropping the handle leaves the session running
/// until the daemon closes the stream, `close` tears it down actively.
pub struct SessionHandle {
    pub id: String,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn close(self) {
        self.task.abort();
    }
}
