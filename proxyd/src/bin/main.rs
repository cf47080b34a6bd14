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

use anyhow::Result;
use clap::{Parser, Subcommand};
use kubuild_proxyd::{
    ProxyServer, ServerConfig, DEFAULT_BUILDKITD_SOCKET,
    DEFAULT_PROXY_SOCKET,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Run the BuildKit proxy gRPC service.
#[derive(Parser, Debug)]
#[clap(name = "buildkit-proxy", version, about, long_about = None)]
struct ProxyOptions {
    #[clap(subcommand)]
    subcmd: SubCommands,
}

#[derive(Subcommand, Debug)]
enum SubCommands {
    /// Run the gRPC server.
    Serve {
        /// Specify the buildkitd socket path.
        #[clap(long, default_value = DEFAULT_BUILDKITD_SOCKET)]
        buildkitd: String,
        /// Connect to local containerd with the specified socket path.
        #[clap(long, default_value = "")]
        containerd: String,
        /// Connect to local dockerd with the specified socket path.
        #[clap(long, default_value = "")]
        dockerd: String,
        /// Socket path for this proxy to listen on.
        #[clap(long, default_value = DEFAULT_PROXY_SOCKET)]
        listen: String,
        /// Enable debug level logging.
        #[clap(long)]
        debug: bool,
    },
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{e:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let options = ProxyOptions::parse();

    match options.subcmd {
        SubCommands::Serve {
            buildkitd,
            containerd,
            dockerd,
            listen,
            debug,
        } => {
            let default_level =
                if debug { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| default_level.into()),
                )
                .init();

            let cfg = ServerConfig {
                buildkitd_socket_path: buildkitd,
                containerd_socket_path: containerd,
                dockerd_socket_path: dockerd,
                helper_socket_path: listen,
            };
            let server = ProxyServer::new(cfg).await?;
            server.serve(shutdown_signal()).await
        }
        SubCommands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate())
        .expect("failed to listen for SIGTERM");
    let mut int = signal(SignalKind::interrupt())
        .expect("failed to listen for SIGINT");
    tokio::select! {
        _ = term.recv() => {},
        _ = int.recv() => {},
    }
    info!("received shutdown signal...");
}
