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
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

/// Build container images inside your Kubernetes cluster.
#[derive(Parser, Debug)]
#[clap(name = "kubectl-build", version, about, long_about = None)]
struct Cli {
    /// Kubernetes namespace (defaults to the kubeconfig default).
    #[clap(long, global = true)]
    namespace: Option<String>,
    /// Builder instance to use.
    #[clap(long, global = true, default_value = "")]
    builder: String,
    /// Toggle verbosity.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    subcmd: SubCommands,
}

#[derive(Subcommand, Debug)]
enum SubCommands {
    /// Build an image from a Dockerfile on one or more builder pods.
    Build(commands::BuildArgs),
    /// Create (or converge) a builder.
    Create(commands::CreateArgs),
    /// Remove a builder and its configuration.
    Rm,
    /// List builders in the namespace.
    Ls,
    /// Show client and builder version information.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.subcmd {
        SubCommands::Build(args) => {
            commands::run_build(&cli.builder, cli.namespace, args)
                .await
        }
        SubCommands::Create(args) => {
            commands::run_create(&cli.builder, cli.namespace, args)
                .await
        }
        SubCommands::Rm => {
            commands::run_rm(&cli.builder, cli.namespace).await
        }
        SubCommands::Ls => {
            commands::run_ls(&cli.builder, cli.namespace).await
        }
        SubCommands::Version => {
            commands::run_version(&cli.builder, cli.namespace).await
        }
    }
}
