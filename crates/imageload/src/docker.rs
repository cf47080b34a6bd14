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

//! Loads a docker-save tarball through the engine's image-load
//! endpoint, either on a local socket or over a tunneled byte stream.

use crate::error::{ImageLoadError, Result};
use bollard::image::ImportImageOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, trace};

/// Loader for a docker-compatible engine reachable on a local socket.
#[derive(Debug, Clone)]
pub struct DockerLoader {
    docker: Docker,
}

impl DockerLoader {
    pub fn connect_unix(socket: &str) -> Result<Self> {
        let docker = Docker::connect_with_unix(
            socket,
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| ImageLoadError::RuntimeConnect(e.into()))?;
        Ok(Self { docker })
    }

    pub async fn load(
        &self,
        mut input: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<()> {
        let mut payload = Vec::new();
        let _ = input.read_to_end(&mut payload).await?;
        debug!("posting {} bytes to image load", payload.len());

        let mut stream = self.docker.import_image(
            ImportImageOptions { quiet: false },
            bollard::body_full(Bytes::from(payload)),
            None,
        );
        while let Some(progress) = stream.next().await {
            let info = progress?;
            if let Some(error) = info.error {
                return Err(ImageLoadError::Other(anyhow::anyhow!(
                    "image load reported: {error}"
                )));
            }
            trace!("load progress: {:?}", info.stream);
        }
        Ok(())
    }
}

/// Post an image tarball to `/images/load` over an already-open byte
/// stream to the engine (an exec tunnel to the runtime socket). A
/// hand-rolled HTTP/1.1 exchange keeps the transfer streaming.
pub async fn docker_load_over_stream(
    io: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
    mut input: impl AsyncRead + Send + Unpin + 'static,
) -> Result<()> {
    let (reader, mut writer) = tokio::io::split(io);

    writer
        .write_all(
            b"POST /v1.41/images/load?quiet=0 HTTP/1.1\r\n\
              Host: docker\r\n\
              Content-Type: application/x-tar\r\n\
              Transfer-Encoding: chunked\r\n\
              Connection: close\r\n\r\n",
        )
        .await?;

    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer
            .write_all(format!("{n:x}\r\n").as_bytes())
            .await?;
        writer.write_all(&buf[..n]).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b"0\r\n\r\n").await?;
    writer.flush().await?;

    let mut reader = BufReader::new(reader);
    let mut response = Vec::new();
    let _ = reader.read_to_end(&mut response).await?;
    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    debug!("image load response: {status_line}");
    let ok = status_line.split_whitespace().nth(1) == Some("200");
    if !ok {
        return Err(ImageLoadError::Other(anyhow::anyhow!(
            "image load over tunnel failed: {status_line}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_over_stream_posts_chunked_tar() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let payload = b"fake-tar-bytes".to_vec();

        let server_task = tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(server);
            let mut got = vec![0u8; 4096];
            let mut total = 0;
            loop {
                let n = rx.read(&mut got[total..]).await.expect("read");
                total += n;
                let text = String::from_utf8_lossy(&got[..total]);
                if text.contains("0\r\n\r\n") {
                    break;
                }
            }
            tx.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}",
            )
            .await
            .expect("write");
            tx.shutdown().await.expect("shutdown");
            String::from_utf8_lossy(&got[..total]).into_owned()
        });

        docker_load_over_stream(
            client,
            std::io::Cursor::new(payload),
        )
        .await
        .expect("load");

        let request = server_task.await.expect("server");
        assert!(request.starts_with("POST /v1.41/images/load"));
        assert!(request.contains("fake-tar-bytes"));
        assert!(request.contains("Transfer-Encoding: chunked"));
    }

    #[tokio::test]
    async fn test_load_over_stream_surfaces_http_errors() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let _server_task = tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(server);
            let mut buf = vec![0u8; 4096];
            let mut total = 0;
            loop {
                let n = rx.read(&mut buf[total..]).await.expect("read");
                total += n;
                if String::from_utf8_lossy(&buf[..total])
                    .contains("0\r\n\r\n")
                {
                    break;
                }
            }
            tx.write_all(b"HTTP/1.1 500 Internal Server Error\r\n\r\n")
                .await
                .expect("write");
            tx.shutdown().await.expect("shutdown");
        });

        let err = docker_load_over_stream(
            client,
            std::io::Cursor::new(b"x".to_vec()),
        )
        .await
        .expect_err("must fail");
        assert!(err.to_string().contains("500"));
    }
}
