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

use kubuild_driver::Feature;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("driver required for build")]
    NoDrivers,
    #[error("no valid drivers found: {0}")]
    NoValidDrivers(String),
    #[error(
        "invalid argument: can't use stdin for both build context and dockerfile"
    )]
    StdinConflict,
    #[error(
        "ambiguous Dockerfile source: both stdin and flag correspond to Dockerfiles"
    )]
    DockerfileConflict,
    #[error(
        "please specify build context (e.g. \".\" for the current directory)"
    )]
    MissingContext,
    #[error("unable to prepare context: path {path:?} not found")]
    ContextNotFound { path: String },
    #[error(
        "Dockerfile from stdin is not supported with remote contexts"
    )]
    StdinWithRemoteContext,
    #[error(
        "{feature} feature is currently not supported for {driver} driver. Please switch to a different driver (eg. \"kubectl build create --use\")"
    )]
    NotSupported { feature: Feature, driver: String },
    #[error("zero outputs currently unsupported")]
    ZeroOutputs,
    #[error("multiple outputs currently unsupported")]
    MultipleOutputs,
    #[error("tag is needed when pushing to registry")]
    PushWithoutTag,
    #[error("invalid tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: String },
    #[error(
        "local and tar exporters are incompatible with image ID file"
    )]
    ImageIdFileWithLocalOutput,
    #[error(
        "image ID file cannot be specified when building for multiple platforms"
    )]
    ImageIdFileWithMultiPlatform,
    #[error(
        "loading image into cluster runtime not supported by this builder, please specify --push or a client local output: --output=type=local,dest=. --output=type=tar,dest=out.tar "
    )]
    NoRuntimeLoadAvailable,
    #[error("local exporter is not supported by this driver")]
    LocalExporterUnsupported,
    #[error("network mode {mode:?} not supported by buildkit")]
    InvalidNetworkMode { mode: String },
    #[error("invalid extra host {host:?}, expected host:ip")]
    InvalidExtraHost { host: String },
    #[error("invalid output specification {spec:?}: {reason}")]
    InvalidOutputSpec { spec: String, reason: String },
    #[error("{kind} for multi-node builds currently not supported")]
    OutputUnsupportedMultiNode { kind: String },
    #[error("no builders found for {builder}")]
    NoBuilderNodes { builder: String },
    #[error("{hint}: {source}")]
    AuthFailed {
        hint: String,
        source: kubuild_client::ClientError,
    },
    #[error("registry error: {reason}")]
    Registry { reason: String },
    #[error(transparent)]
    Driver(#[from] kubuild_driver::DriverError),
    #[error(transparent)]
    Client(#[from] kubuild_client::ClientError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
