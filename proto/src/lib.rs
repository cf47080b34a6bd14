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

//! Generated gRPC bindings for the BuildKit control API subset, the
//! session sub-protocols, and the kubuild proxy extension RPCs.
//!
//! Service paths must stay wire compatible with upstream BuildKit; the
//! message subset only carries the fields this project populates or reads.

#![allow(clippy::derive_partial_eq_without_eq)]
#![allow(clippy::doc_lazy_continuation)]

/// BuildKit control API (`moby.buildkit.v1.Control`).
pub mod control {
    tonic::include_proto!("moby.buildkit.v1");
}

/// File synchronization and export sub-protocols, plus the Auth service
/// which shares the `moby.filesync.v1` package upstream.
pub mod filesync {
    tonic::include_proto!("moby.filesync.v1");
}

/// Build secret lookups (`moby.buildkit.secrets.v1.Secrets`).
pub mod secrets {
    tonic::include_proto!("moby.buildkit.secrets.v1");
}

/// SSH agent forwarding (`moby.sshforward.v1.SSH`).
pub mod ssh {
    tonic::include_proto!("moby.sshforward.v1");
}

/// Client-to-daemon content upload (`moby.upload.v1.Upload`).
pub mod upload {
    tonic::include_proto!("moby.upload.v1");
}

/// Proxy extension RPCs (`kubuild.proxy.v1`).
pub mod proxy {
    tonic::include_proto!("kubuild.proxy.v1");
}
