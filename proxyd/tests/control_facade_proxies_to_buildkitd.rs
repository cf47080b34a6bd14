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

//! The control facade must hand requests through to buildkitd
//! unmodified and stream responses back in order.

use kubuild_proto::control::control_client::ControlClient;
use kubuild_proto::control::{
    DiskUsageRequest, SolveRequest, StatusRequest,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::UnixStream;

mod common;

async fn proxy_client(
    socket: String,
) -> ControlClient<tonic::transport::Channel> {
    let client = kubuild_client::BuildKitClient::connect_with(
        move || {
            let socket = socket.clone();
            async move { UnixStream::connect(socket).await }
        },
    )
    .await
    .expect("connect to proxy");
    client.control()
}

#[tokio::test]
async fn test_disk_usage_and_workers_pass_through() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (proxy, _solves, socket) =
        common::start_proxy(dir.path()).await;
    let _ = tokio::spawn(
        proxy.serve(std::future::pending::<()>()),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut control = proxy_client(socket).await;

    let usage = control
        .disk_usage(DiskUsageRequest::default())
        .await
        .expect("disk usage")
        .into_inner();
    assert_eq!(usage.record.len(), 1);
    assert_eq!(usage.record[0].id, "layer-1");

    let workers = control
        .list_workers(
            kubuild_proto::control::ListWorkersRequest::default(),
        )
        .await
        .expect("list workers")
        .into_inner();
    assert_eq!(workers.record.len(), 1);
    assert_eq!(workers.record[0].platforms[0].architecture, "amd64");
}

#[tokio::test]
async fn test_solve_passes_through_and_returns_digest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (proxy, solves, socket) =
        common::start_proxy(dir.path()).await;
    let _ = tokio::spawn(
        proxy.serve(std::future::pending::<()>()),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut control = proxy_client(socket).await;
    let resp = control
        .solve(SolveRequest {
            r#ref: "build-1".to_string(),
            exporter: "image".to_string(),
            exporter_attrs: HashMap::from([(
                "name".to_string(),
                "registry.example.com/app:v1".to_string(),
            )]),
            session: "session-1".to_string(),
            frontend: "dockerfile.v0".to_string(),
            ..Default::default()
        })
        .await
        .expect("solve")
        .into_inner();

    assert_eq!(
        resp.exporter_response.get("containerimage.digest"),
        Some(&"sha256:feedface".to_string())
    );
    let seen = solves.lock().expect("solves lock");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].r#ref, "build-1");
    assert_eq!(seen[0].session, "session-1");
}

#[tokio::test]
async fn test_status_streams_in_daemon_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (proxy, _solves, socket) =
        common::start_proxy(dir.path()).await;
    let _ = tokio::spawn(
        proxy.serve(std::future::pending::<()>()),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut control = proxy_client(socket).await;
    let mut stream = control
        .status(StatusRequest { r#ref: "build-1".to_string() })
        .await
        .expect("status")
        .into_inner();

    let mut names = Vec::new();
    while let Some(status) =
        stream.message().await.expect("status message")
    {
        for vertex in status.vertexes {
            names.push(vertex.name);
        }
    }
    assert_eq!(names, vec!["step one", "step two"]);
}
