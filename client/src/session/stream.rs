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

//! Bridges a bidirectional gRPC byte-message stream into a duplex
//! `AsyncRead + AsyncWrite` value.
//!
//! A build session is a nested gRPC connection overlaid on a single
//! `Control.Session` RPC: one side runs an HTTP/2 server over the raw
//! stream, the other a client. This adapter is what both halves (and the
//! in-cluster proxy, which does both at once) plug into tonic.

use kubuild_proto::control::BytesMessage;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::PollSender;
use tonic::transport::server::Connected;
use tonic::Status;

/// Duplex IO over a byte-message stream pair.
///
/// `S` is the inbound message stream; outbound messages are produced with
/// `make` so the same adapter serves both the client side (plain messages)
/// and the server side (`Result`-wrapped messages).
pub struct StreamIo<S, T: Send> {
    incoming: S,
    outgoing: PollSender<T>,
    make: fn(Vec<u8>) -> T,
    read_buf: Vec<u8>,
    read_pos: usize,
}

/// The client half: wraps the response stream of a `Session` call plus the
/// sender feeding its request stream.
pub fn client_io<S>(
    incoming: S,
    outgoing: mpsc::Sender<BytesMessage>,
) -> StreamIo<S, BytesMessage>
where
    S: Stream<Item = Result<BytesMessage, Status>> + Unpin,
{
    StreamIo {
        incoming,
        outgoing: PollSender::new(outgoing),
        make: |data| BytesMessage { data },
        read_buf: Vec::new(),
        read_pos: 0,
    }
}

/// The server half: wraps an inbound request stream plus the sender feeding
/// the response stream back to the caller.
pub fn server_io<S>(
    incoming: S,
    outgoing: mpsc::Sender<Result<BytesMessage, Status>>,
) -> StreamIo<S, Result<BytesMessage, Status>>
where
    S: Stream<Item = Result<BytesMessage, Status>> + Unpin,
{
    StreamIo {
        incoming,
        outgoing: PollSender::new(outgoing),
        make: |data| Ok(BytesMessage { data }),
        read_buf: Vec::new(),
        read_pos: 0,
    }
}

impl<S, T> AsyncRead for StreamIo<S, T>
where
    S: Stream<Item = Result<BytesMessage, Status>> + Unpin,
    T: Send + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let available = &this.read_buf[this.read_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.incoming).poll_next(cx)) {
                Some(Ok(msg)) => {
                    this.read_buf = msg.data;
                    this.read_pos = 0;
                    // Zero-length messages are legal; loop to wait for data.
                }
                Some(Err(status)) => {
                    return Poll::Ready(Err(io::Error::other(status)));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<S, T> AsyncWrite for StreamIo<S, T>
where
    S: Stream<Item = Result<BytesMessage, Status>> + Unpin,
    T: Send + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if ready!(this.outgoing.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session stream closed",
            )));
        }
        let item = (this.make)(buf.to_vec());
        if this.outgoing.send_item(item).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session stream closed",
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().outgoing.close();
        Poll::Ready(Ok(()))
    }
}

/// Connection metadata for tonic's incoming-connection machinery; a
/// session stream carries none.
#[derive(Debug, Clone)]
pub struct SessionConnectInfo {}

impl<S, T> Connected for StreamIo<S, T>
where
    S: Stream<Item = Result<BytesMessage, Status>> + Unpin,
    T: Send + Unpin,
{
    type ConnectInfo = SessionConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        SessionConnectInfo {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_read_reassembles_chunked_messages() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, _out_rx) = mpsc::channel(4);
        let mut io = client_io(
            ReceiverStream::new(in_rx).map(Ok),
            out_tx,
        );

        in_tx
            .send(BytesMessage { data: b"hello ".to_vec() })
            .await
            .expect("send");
        in_tx
            .send(BytesMessage { data: b"world".to_vec() })
            .await
            .expect("send");
        drop(in_tx);

        let mut buf = Vec::new();
        let n = io.read_to_end(&mut buf).await.expect("read");
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_write_frames_into_messages() {
        let (_in_tx, in_rx) = mpsc::channel::<BytesMessage>(1);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let mut io = client_io(
            ReceiverStream::new(in_rx).map(Ok),
            out_tx,
        );

        io.write_all(b"payload").await.expect("write");
        io.shutdown().await.expect("shutdown");

        let msg = out_rx.recv().await.expect("message");
        assert_eq!(msg.data, b"payload");
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_surfaces_stream_errors() {
        let (in_tx, in_rx) = mpsc::channel::<Result<BytesMessage, Status>>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let mut io = client_io(ReceiverStream::new(in_rx), out_tx);

        in_tx
            .send(Err(Status::unavailable("daemon went away")))
            .await
            .expect("send");

        let mut buf = [0u8; 8];
        let err = io.read(&mut buf).await.expect_err("must error");
        assert!(err.to_string().contains("daemon went away"));
    }
}
