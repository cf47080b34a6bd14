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

//! Fan-in of per-solve status streams onto one writer.
//!
//! Each target (and helper task) gets a prefixed sub-writer; the
//! printer at the end of the channel renders everything in arrival
//! order. The channel closes when the multi-writer and every derived
//! sub-writer have been dropped, and `Printer::wait` observes that.

use kubuild_proto::control::StatusResponse;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod printer;

pub use printer::Printer;

/// One rendered progress event.
#[derive(Debug)]
pub enum ProgressEvent {
    Status { prefix: String, status: StatusResponse },
    Message { prefix: String, line: String },
}

/// The fan-in point; derive prefixed sub-writers from it.
#[derive(Debug, Clone)]
pub struct MultiWriter {
    tx: mpsc::Sender<ProgressEvent>,
}

impl MultiWriter {
    pub fn new() -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }

    pub fn with_prefix(
        &self,
        name: &str,
        force: bool,
    ) -> ProgressWriter {
        let prefix = if force || !name.is_empty() {
            name.to_string()
        } else {
            String::new()
        };
        ProgressWriter { prefix, tx: self.tx.clone() }
    }
}

/// A prefixed sub-writer for one solve (or helper task).
#[derive(Debug, Clone)]
pub struct ProgressWriter {
    prefix: String,
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressWriter {
    pub async fn status(&self, status: StatusResponse) {
        let _ = self
            .tx
            .send(ProgressEvent::Status {
                prefix: self.prefix.clone(),
                status,
            })
            .await;
    }

    pub async fn message(&self, line: impl Into<String>) {
        let _ = self
            .tx
            .send(ProgressEvent::Message {
                prefix: self.prefix.clone(),
                line: line.into(),
            })
            .await;
    }

    /// A plain status channel for APIs that stream `StatusResponse`;
    /// events forward into the fan-in until the producer hangs up.
    pub fn status_channel(&self) -> mpsc::Sender<StatusResponse> {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = self.clone();
        let _: JoinHandle<()> = tokio::spawn(async move {
            while let Some(status) = rx.recv().await {
                writer.status(status).await;
            }
        });
        tx
    }

    /// A line sink for lifecycle logs; lines forward until the
    /// producer hangs up.
    pub fn line_channel(&self) -> mpsc::UnboundedSender<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = self.clone();
        let _: JoinHandle<()> = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                writer.message(line).await;
            }
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefixes_flow_through() {
        let (mw, mut rx) = MultiWriter::new();
        let a = mw.with_prefix("frontend", true);
        let b = mw.with_prefix("backend", true);
        drop(mw);

        a.message("building").await;
        b.message("building").await;
        drop(a);
        drop(b);

        let mut prefixes = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::Message { prefix, .. } = event {
                prefixes.push(prefix);
            }
        }
        assert_eq!(prefixes, vec!["frontend", "backend"]);
    }

    #[tokio::test]
    async fn test_channel_closes_when_writers_drop() {
        let (mw, mut rx) = MultiWriter::new();
        let writer = mw.with_prefix("t", false);
        drop(mw);
        drop(writer);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_status_channel_forwards() {
        let (mw, mut rx) = MultiWriter::new();
        let writer = mw.with_prefix("t", true);
        drop(mw);

        let status_tx = writer.status_channel();
        drop(writer);
        status_tx
            .send(StatusResponse::default())
            .await
            .expect("send");
        drop(status_tx);

        match rx.recv().await {
            Some(ProgressEvent::Status { prefix, .. }) => {
                assert_eq!(prefix, "t")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
