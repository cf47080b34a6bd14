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

//! A client for a BuildKit control endpoint.
//!
//! The channel is built over a caller-supplied connector so the same
//! client works against a local unix socket or a byte stream tunneled
//! through a cluster exec API.

use hyper_util::rt::TokioIo;
use kubuild_proto::control::control_client::ControlClient;
use kubuild_proto::control::{
    ListWorkersRequest, WorkerRecord,
};
use kubuild_proto::proxy::proxy_client::ProxyClient;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

// The connector ignores the URI; it exists to satisfy the endpoint API.
const IGNORED_ENDPOINT: &str = "http://ignored";

type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    ConnectionError(#[from] tonic::transport::Error),
    #[error("rpc failed: {0}")]
    RpcError(#[from] tonic::Status),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A control-API client for one builder endpoint.
///
/// Cloning is cheap; all clones share the underlying channel.
#[derive(Debug, Clone)]
pub struct BuildKitClient {
    pub(crate) channel: Channel,
}

impl BuildKitClient {
    /// Connect to a control socket on the local filesystem.
    pub async fn connect_unix(socket: String) -> Result<Self> {
        Self::connect_with(move || {
            let socket = socket.clone();
            async move {
                let stream = UnixStream::connect(socket).await?;
                Ok::<_, std::io::Error>(stream)
            }
        })
        .await
    }

    /// Like [`connect_unix`](Self::connect_unix), but defers the dial
    /// until the first RPC.
    pub fn connect_lazy_unix(socket: String) -> Self {
        let channel = Endpoint::from_static(IGNORED_ENDPOINT)
            .connect_with_connector_lazy(service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move {
                    UnixStream::connect(socket).await.map(TokioIo::new)
                }
            }));
        Self { channel }
    }

    /// Connect over a caller-supplied byte stream factory.
    ///
    /// The factory is invoked for every new transport connection, so a
    /// reconnect dials a fresh stream rather than reusing a dead one.
    pub async fn connect_with<F, Fut, IO>(factory: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = std::io::Result<IO>> + Send,
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let channel = Endpoint::from_static(IGNORED_ENDPOINT)
            .connect_timeout(Duration::from_secs(20))
            .connect_with_connector(service_fn(move |_: Uri| {
                let fut = factory();
                async move { fut.await.map(TokioIo::new) }
            }))
            .await?;
        Ok(Self { channel })
    }

    /// The raw transport channel, for wiring additional service clients
    /// (e.g. the proxy extension RPCs) over the same connection.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn control(&self) -> ControlClient<Channel> {
        ControlClient::new(self.channel.clone())
    }

    pub fn proxy(&self) -> ProxyClient<Channel> {
        ProxyClient::new(self.channel.clone())
    }

    /// Introspect the daemon's workers, bounded by `timeout`.
    pub async fn list_workers(
        &self,
        timeout: Duration,
    ) -> Result<Vec<WorkerRecord>> {
        let mut control = self.control();
        let mut req = tonic::Request::new(ListWorkersRequest::default());
        req.set_timeout(timeout);
        let resp = control.list_workers(req).await?;
        Ok(resp.into_inner().record)
    }
}
