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

//! Plain-text progress rendering.

use super::ProgressEvent;
use std::io::Write;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Consumes the fan-in channel and renders events line by line.
#[derive(Debug)]
pub struct Printer {
    task: JoinHandle<()>,
}

impl Printer {
    /// Render to standard error until the channel closes.
    pub fn stderr(rx: mpsc::Receiver<ProgressEvent>) -> Self {
        Self::start(rx, std::io::stderr())
    }

    pub fn start(
        mut rx: mpsc::Receiver<ProgressEvent>,
        mut out: impl Write + Send + 'static,
    ) -> Self {
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for line in render(&event) {
                    let _ = writeln!(out, "{line}");
                }
            }
        });
        Self { task }
    }

    /// Wait for the channel to drain; call after every writer has been
    /// dropped.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

fn render(event: &ProgressEvent) -> Vec<String> {
    let mut lines = Vec::new();
    match event {
        ProgressEvent::Message { prefix, line } => {
            lines.push(prefixed(prefix, line));
        }
        ProgressEvent::Status { prefix, status } => {
            for vertex in &status.vertexes {
                if vertex.completed.is_some() {
                    let state = if vertex.cached {
                        "CACHED"
                    } else if vertex.error.is_empty() {
                        "DONE"
                    } else {
                        "ERROR"
                    };
                    lines.push(prefixed(
                        prefix,
                        &format!("=> {state} {}", vertex.name),
                    ));
                    if !vertex.error.is_empty() {
                        lines.push(prefixed(prefix, &vertex.error));
                    }
                } else if vertex.started.is_some() {
                    lines.push(prefixed(
                        prefix,
                        &format!("=> {}", vertex.name),
                    ));
                }
            }
            for log in &status.logs {
                let text = String::from_utf8_lossy(&log.msg);
                for log_line in text.lines() {
                    lines.push(prefixed(prefix, log_line));
                }
            }
        }
    }
    lines
}

fn prefixed(prefix: &str, line: &str) -> String {
    if prefix.is_empty() {
        line.to_string()
    } else {
        format!("[{prefix}] {line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubuild_proto::control::{StatusResponse, Vertex};

    #[test]
    fn test_render_completed_vertex() {
        let event = ProgressEvent::Status {
            prefix: "web".to_string(),
            status: StatusResponse {
                vertexes: vec![Vertex {
                    name: "[1/2] FROM alpine".to_string(),
                    completed: Some(Default::default()),
                    ..Default::default()
                }],
                ..Default::default()
            },
        };
        let lines = render(&event);
        assert_eq!(lines, vec!["[web] => DONE [1/2] FROM alpine"]);
    }

    #[test]
    fn test_render_cached_vertex() {
        let event = ProgressEvent::Status {
            prefix: String::new(),
            status: StatusResponse {
                vertexes: vec![Vertex {
                    name: "step".to_string(),
                    cached: true,
                    completed: Some(Default::default()),
                    ..Default::default()
                }],
                ..Default::default()
            },
        };
        assert_eq!(render(&event), vec!["=> CACHED step"]);
    }

    #[test]
    fn test_render_message_without_prefix() {
        let event = ProgressEvent::Message {
            prefix: String::new(),
            line: "warming up".to_string(),
        };
        assert_eq!(render(&event), vec!["warming up"]);
    }
}
