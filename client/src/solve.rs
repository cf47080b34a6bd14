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

//! Drives one solve against a builder endpoint: runs the session serving
//! the caller's attachables, submits the solve request, and streams
//! status back to the caller until the build finishes.

use crate::client::{BuildKitClient, ClientError};
use crate::session::filesend::{ExportSink, FileSendSink};
use crate::session::filesync::LocalDirSource;
use crate::session::{Attachable, Session};
use kubuild_proto::control::{
    CacheOptions, CacheOptionsEntry, SolveRequest, StatusRequest,
    StatusResponse,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A cache import or export descriptor, passed through to the daemon.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub kind: String,
    pub attrs: HashMap<String, String>,
}

/// One requested build output.
pub struct ExportEntry {
    pub kind: String,
    pub attrs: HashMap<String, String>,
    /// Local writer receiving the payload for client-side outputs (oci,
    /// docker, tar).
    pub output: Option<ExportSink>,
}

impl std::fmt::Debug for ExportEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportEntry")
            .field("kind", &self.kind)
            .field("attrs", &self.attrs)
            .field("output", &self.output.is_some())
            .finish()
    }
}

/// Everything needed to run one solve.
#[derive(Default)]
pub struct SolveOpt {
    pub frontend: String,
    pub frontend_attrs: HashMap<String, String>,
    pub local_dirs: HashMap<String, PathBuf>,
    pub exports: Vec<ExportEntry>,
    pub cache_exports: Vec<CacheEntry>,
    pub cache_imports: Vec<CacheEntry>,
    pub entitlements: Vec<String>,
    pub session: Vec<Arc<dyn Attachable>>,
}

impl std::fmt::Debug for SolveOpt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolveOpt")
            .field("frontend", &self.frontend)
            .field("frontend_attrs", &self.frontend_attrs)
            .field("local_dirs", &self.local_dirs)
            .field("exports", &self.exports)
            .field("attachables", &self.session.len())
            .finish()
    }
}

/// The daemon's exporter response for a finished solve.
#[derive(Debug, Clone, Default)]
pub struct SolveResult {
    pub exporter_response: HashMap<String, String>,
}

impl SolveResult {
    pub fn image_digest(&self) -> Option<&str> {
        self.exporter_response
            .get("containerimage.digest")
            .map(String::as_str)
    }
}

impl BuildKitClient {
    /// Run one solve. Status events are forwarded to `statuses` in daemon
    /// order; the channel is dropped when the stream ends.
    pub async fn solve(
        &self,
        mut opt: SolveOpt,
        statuses: mpsc::Sender<StatusResponse>,
    ) -> Result<SolveResult, ClientError> {
        let mut session = Session::new("kubuild");

        if !opt.local_dirs.is_empty() {
            session.allow(Arc::new(LocalDirSource::new(
                opt.local_dirs.clone(),
            )));
        }
        let mut exporter = String::new();
        let mut exporter_attrs = HashMap::new();
        if let Some(export) = opt.exports.first_mut() {
            exporter = export.kind.clone();
            exporter_attrs = export.attrs.clone();
            if let Some(output) = export.output.take() {
                session.allow(Arc::new(FileSendSink::new(output)));
            }
        }
        for attachable in &opt.session {
            session.allow(Arc::clone(attachable));
        }

        let session_id = session.id().to_string();
        let handle = session.run(self).await?;

        let reference = Uuid::new_v4().simple().to_string();
        debug!(reference = %reference, session = %session_id, "starting solve");

        let request = SolveRequest {
            r#ref: reference.clone(),
            exporter,
            exporter_attrs,
            session: session_id,
            frontend: opt.frontend.clone(),
            frontend_attrs: opt.frontend_attrs.clone(),
            cache: Some(CacheOptions {
                exports: opt
                    .cache_exports
                    .iter()
                    .map(to_cache_entry)
                    .collect(),
                imports: opt
                    .cache_imports
                    .iter()
                    .map(to_cache_entry)
                    .collect(),
            }),
            entitlements: opt.entitlements.clone(),
        };

        let mut solve_control = self.control();
        let solve_task = async move {
            solve_control
                .solve(request)
                .await
                .map(|resp| resp.into_inner())
        };

        let mut status_control = self.control();
        let status_task = async move {
            let mut stream = status_control
                .status(StatusRequest { r#ref: reference })
                .await?
                .into_inner();
            while let Some(status) = stream.message().await? {
                if statuses.send(status).await.is_err() {
                    // Status consumer went away; keep draining so the
                    // solve is not held up by backpressure.
                    break;
                }
            }
            Ok::<_, tonic::Status>(())
        };

        let (solve_res, status_res) =
            tokio::join!(solve_task, status_task);
        handle.close();

        let resp = solve_res?;
        status_res?;

        Ok(SolveResult { exporter_response: resp.exporter_response })
    }
}

fn to_cache_entry(entry: &CacheEntry) -> CacheOptionsEntry {
    CacheOptionsEntry {
        r#type: entry.kind.clone(),
        attrs: entry.attrs.clone(),
    }
}
