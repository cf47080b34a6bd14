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

//! A net connection tunneled through the cluster's attach-and-exec API.
//!
//! `buildctl dial-stdio` runs inside the target container and splices
//! its stdin/stdout onto a local socket; attaching to that process gives
//! the caller a duplex byte stream that gRPC (or the docker engine API)
//! can ride. Each tunnel is single-owner and lives exactly as long as
//! the in-container process.

use crate::error::{DriverError, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// A duplex byte stream to a process inside a builder container.
pub struct ExecTunnel {
    stdin: Pin<Box<dyn AsyncWrite + Send>>,
    stdout: Pin<Box<dyn AsyncRead + Send>>,
}

impl std::fmt::Debug for ExecTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecTunnel").finish()
    }
}

impl ExecTunnel {
    /// Exec `command` in `container` of `pod` and wrap the attached
    /// stdio streams.
    pub async fn open(
        pod_api: &Api<Pod>,
        pod_name: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<Self> {
        debug!("opening exec tunnel to {pod_name}/{container}: {command:?}");
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(true)
            .stderr(false)
            .tty(false);
        let mut attached =
            pod_api.exec(pod_name, command, &params).await?;

        let stdin = attached
            .stdin()
            .ok_or(DriverError::ExecStreamMissing { stream: "stdin" })?;
        let stdout = attached
            .stdout()
            .ok_or(DriverError::ExecStreamMissing { stream: "stdout" })?;

        // The attached process outlives this call; reap it in the
        // background so stream teardown surfaces as EOF, not a hang.
        let _ = tokio::spawn(async move {
            attached.join().await.ok();
        });

        Ok(Self { stdin: Box::pin(stdin), stdout: Box::pin(stdout) })
    }

    /// Capture the stdout of a one-shot command in the container, for
    /// small introspection calls like the daemon version.
    pub async fn capture(
        pod_api: &Api<Pod>,
        pod_name: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);
        let mut attached =
            pod_api.exec(pod_name, command, &params).await?;
        let stdout = attached
            .stdout()
            .ok_or(DriverError::ExecStreamMissing { stream: "stdout" })?;

        let mut buf = Vec::new();
        let mut stdout = Box::pin(stdout);
        tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        attached.join().await.ok();
        Ok(String::from_utf8_lossy(&buf).trim().to_string())
    }
}

impl AsyncRead for ExecTunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.stdout.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for ExecTunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.stdin.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        self.stdin.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        self.stdin.as_mut().poll_shutdown(cx)
    }
}
