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

//! Listener lifecycle: concurrent builds share one listener and one
//! key; peer loads authenticate with that key.

use kubuild_proto::proxy::image_loader_client::ImageLoaderClient;
use kubuild_proto::proxy::proxy_server::Proxy;
use kubuild_proto::proxy::{BytesMessage, ListenRequest, ListenResponse};
use kubuild_proxyd::REPLICATION_PORT;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Request;

mod common;

#[tokio::test]
async fn test_listener_refcount_and_key_auth() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (proxy, _solves, _socket) =
        common::start_proxy(dir.path()).await;

    // Two concurrent builds share one listener and see the same key.
    let first = proxy
        .listen(Request::new(ListenRequest {}))
        .await
        .expect("listen")
        .into_inner();
    let second = proxy
        .listen(Request::new(ListenRequest {}))
        .await
        .expect("listen")
        .into_inner();
    assert!(!first.key.is_empty());
    assert_eq!(first.key, second.key);

    // A peer with the wrong key is rejected before any bytes land.
    let endpoint = format!("http://127.0.0.1:{REPLICATION_PORT}");
    let channel = tonic::transport::Endpoint::from_shared(endpoint)
        .expect("endpoint")
        .connect()
        .await
        .expect("dial replication port");

    let (tx, rx) = tokio::sync::mpsc::channel::<BytesMessage>(1);
    drop(tx);
    let mut req = Request::new(ReceiverStream::new(rx));
    let _ = req
        .metadata_mut()
        .insert("key", "wrong-key".parse().expect("metadata"));
    let err = ImageLoaderClient::new(channel.clone())
        .load(req)
        .await
        .expect_err("wrong key must be rejected");
    assert_eq!(err.code(), tonic::Code::Unauthenticated);

    // No key at all is also rejected.
    let (tx, rx) = tokio::sync::mpsc::channel::<BytesMessage>(1);
    drop(tx);
    let err = ImageLoaderClient::new(channel)
        .load(Request::new(ReceiverStream::new(rx)))
        .await
        .expect_err("missing key must be rejected");
    assert_eq!(err.code(), tonic::Code::Unauthenticated);

    // Ref-counted teardown: two stops succeed, a third over-release
    // is an internal error.
    let _ = proxy
        .stop_listen(Request::new(ListenResponse {
            key: first.key.clone(),
        }))
        .await
        .expect("first stop");
    let _ = proxy
        .stop_listen(Request::new(ListenResponse {
            key: first.key.clone(),
        }))
        .await
        .expect("second stop");
    let err = proxy
        .stop_listen(Request::new(ListenResponse { key: first.key }))
        .await
        .expect_err("over-release must fail");
    assert_eq!(err.code(), tonic::Code::Internal);
}
