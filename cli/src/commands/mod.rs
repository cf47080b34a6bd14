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

//! Command wiring: translate flags into driver and orchestrator calls.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use kubuild_build::progress::{MultiWriter, Printer};
use kubuild_build::{
    build, parse_outputs, DriverInfo, ExportSpec, Inputs, Options,
};
use kubuild_client::session::secrets::SecretStore;
use kubuild_client::session::ssh::SshAgentProvider;
use kubuild_client::session::Attachable;
use kubuild_client::CacheEntry;
use kubuild_driver::kubernetes::KubernetesFactory;
use kubuild_driver::{
    parse_list, BootLog, Driver, DriverRegistry, InitConfig,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Build context (directory, URL, or `-` for stdin).
    #[clap(default_value = ".")]
    context: String,
    /// Name of the Dockerfile (default: PATH/Dockerfile).
    #[clap(short = 'f', long = "file", default_value = "")]
    file: String,
    /// Name and optionally tag (name:tag).
    #[clap(short = 't', long = "tag")]
    tags: Vec<String>,
    /// Set metadata for an image.
    #[clap(long = "label")]
    labels: Vec<String>,
    /// Set build-time variables.
    #[clap(long = "build-arg")]
    build_args: Vec<String>,
    /// External cache sources (e.g. type=registry,ref=...).
    #[clap(long = "cache-from")]
    cache_from: Vec<String>,
    /// Cache export destinations.
    #[clap(long = "cache-to")]
    cache_to: Vec<String>,
    /// Set the target build stage.
    #[clap(long, default_value = "")]
    target: String,
    /// Set target platform for the build.
    #[clap(long = "platform")]
    platforms: Vec<String>,
    /// Secret to expose to the build (id=NAME[,src=PATH]).
    #[clap(long = "secret")]
    secrets: Vec<String>,
    /// SSH agent socket to expose ([id[=socket]]).
    #[clap(long = "ssh")]
    ssh: Vec<String>,
    /// Output destination (type=TYPE[,key=value]).
    #[clap(short = 'o', long = "output")]
    outputs: Vec<String>,
    /// Write the image ID to the file.
    #[clap(long = "iidfile")]
    image_id_file: Option<std::path::PathBuf>,
    /// Add a custom host-to-IP mapping (host:ip).
    #[clap(long = "add-host")]
    extra_hosts: Vec<String>,
    /// Set the networking mode for RUN instructions.
    #[clap(long = "network", default_value = "default")]
    network_mode: String,
    /// Do not use cache when building.
    #[clap(long = "no-cache")]
    no_cache: bool,
    /// Always attempt to pull newer versions of base images.
    #[clap(long)]
    pull: bool,
    /// Push the result to the registry.
    #[clap(long)]
    push: bool,
    /// Load the result into the cluster container runtime.
    #[clap(long)]
    load: bool,
    /// Allow extra privileged entitlements (e.g. network.host).
    #[clap(long = "allow")]
    allow: Vec<String>,
    /// Use an alternate frontend image.
    #[clap(long, default_value = "")]
    frontend: String,
    /// Registry secret for push/pull credentials.
    #[clap(long = "registry-secret", default_value = "")]
    registry_secret: String,
    /// Builder options passed at implicit create (key=value).
    #[clap(long = "driver-opt")]
    driver_opts: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Driver options (key=value), e.g. replicas=3, rootless=true.
    #[clap(long = "driver-opt")]
    driver_opts: Vec<String>,
    /// Flags appended to the build daemon invocation.
    #[clap(long = "buildkitd-flag")]
    buildkitd_flags: Vec<String>,
    /// Daemon configuration file stored in the builder's ConfigMap.
    #[clap(long)]
    config: Option<std::path::PathBuf>,
}

fn list_to_map(
    entries: &[String],
    allow_empty_values: bool,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for entry in entries {
        match entry.split_once('=') {
            Some((key, value)) => {
                let _ =
                    out.insert(key.to_string(), value.to_string());
            }
            None if allow_empty_values => {
                // A bare key forwards the caller's environment value.
                let value =
                    std::env::var(entry).unwrap_or_default();
                let _ = out.insert(entry.clone(), value);
            }
            None => {
                let _ = out.insert(entry.clone(), String::new());
            }
        }
    }
    out
}

fn parse_cache_entries(specs: &[String]) -> Result<Vec<CacheEntry>> {
    let mut out = Vec::new();
    for spec in specs {
        if spec.is_empty() {
            continue;
        }
        if !spec.contains('=') {
            // Shorthand for a registry ref.
            out.push(CacheEntry {
                kind: "registry".to_string(),
                attrs: HashMap::from([(
                    "ref".to_string(),
                    spec.clone(),
                )]),
            });
            continue;
        }
        let mut entry = CacheEntry::default();
        for field in spec.split(',') {
            match field.split_once('=') {
                Some(("type", value)) => {
                    entry.kind = value.to_string()
                }
                Some((key, value)) => {
                    let _ = entry
                        .attrs
                        .insert(key.to_string(), value.to_string());
                }
                None => {
                    return Err(anyhow!(
                        "invalid cache entry field {field:?}"
                    ))
                }
            }
        }
        if entry.kind.is_empty() {
            return Err(anyhow!(
                "cache entry {spec:?} is missing a type"
            ));
        }
        out.push(entry);
    }
    Ok(out)
}

async fn new_driver(
    builder: &str,
    namespace: Option<String>,
    driver_opts: Vec<String>,
    buildkitd_flags: Vec<String>,
    config: Option<std::path::PathBuf>,
    context_path: &str,
) -> Result<Arc<dyn Driver>> {
    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(KubernetesFactory::default()));

    let kube_client = kube::Client::try_default()
        .await
        .context("kubernetes driver requires cluster API access")?;
    let namespace = namespace
        .unwrap_or_else(|| kube_client.default_namespace().to_string());

    let context_path_hash = {
        let absolute = Path::new(context_path)
            .canonicalize()
            .unwrap_or_else(|_| Path::new(context_path).to_path_buf());
        format!(
            "{:x}",
            Sha256::digest(absolute.to_string_lossy().as_bytes())
        )
    };

    let factory = registry.default_factory()?;
    let driver = factory
        .new_driver(InitConfig {
            name: builder.to_string(),
            kube_client,
            namespace,
            buildkit_flags: buildkitd_flags,
            config_file: config,
            driver_opts: list_to_map(&driver_opts, false),
            context_path_hash,
        })
        .await?;
    Ok(driver)
}

pub async fn run_build(
    builder: &str,
    namespace: Option<String>,
    args: BuildArgs,
) -> Result<()> {
    let driver = new_driver(
        builder,
        namespace,
        args.driver_opts,
        Vec::new(),
        None,
        &args.context,
    )
    .await?;

    let mut outputs = parse_outputs(&args.outputs)?;
    if args.push {
        if args.load {
            return Err(anyhow!(
                "push and load may not be set together at the moment"
            ));
        }
        match outputs.first_mut() {
            None => outputs.push(ExportSpec {
                kind: "image".to_string(),
                attrs: HashMap::from([(
                    "push".to_string(),
                    "true".to_string(),
                )]),
            }),
            Some(output) if output.kind == "image" => {
                let _ = output
                    .attrs
                    .insert("push".to_string(), "true".to_string());
            }
            Some(output) => {
                return Err(anyhow!(
                    "push and {:?} output can't be used together",
                    output.kind
                ))
            }
        }
    }
    if args.load && outputs.is_empty() {
        outputs.push(ExportSpec {
            // Rewritten to the applicable runtime exporter before
            // solving.
            kind: "runtime".to_string(),
            attrs: HashMap::new(),
        });
    }
    if outputs.is_empty() {
        // The default intent is an image usable on the cluster.
        outputs.push(ExportSpec {
            kind: "runtime".to_string(),
            attrs: HashMap::new(),
        });
    }

    let mut session: Vec<Arc<dyn Attachable>> = Vec::new();
    let secret_store = SecretStore::from_specs(&args.secrets)?;
    if !secret_store.is_empty() {
        session.push(Arc::new(secret_store));
    }
    for provider in SshAgentProvider::from_specs(&args.ssh)? {
        session.push(Arc::new(provider));
    }

    let options = Options {
        inputs: Some(Inputs {
            context_path: args.context.clone(),
            dockerfile_path: args.file.clone(),
            in_stream: Some(Box::new(tokio::io::stdin())),
        }),
        tags: args.tags,
        labels: list_to_map(&args.labels, false),
        build_args: list_to_map(&args.build_args, true),
        pull: args.pull,
        image_id_file: args.image_id_file,
        extra_hosts: args.extra_hosts,
        network_mode: args.network_mode,
        no_cache: args.no_cache,
        target: args.target,
        platforms: parse_list(&args.platforms)?,
        exports: outputs,
        session,
        cache_from: parse_cache_entries(&args.cache_from)?,
        cache_to: parse_cache_entries(&args.cache_to)?,
        allow: args.allow,
        frontend_image: (!args.frontend.is_empty())
            .then(|| args.frontend.clone()),
    };

    let (mw, rx) = MultiWriter::new();
    let printer = Printer::stderr(rx);
    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let drivers = vec![DriverInfo {
        driver: Some(driver),
        name: builder_display_name(builder),
        platforms: Vec::new(),
        err: None,
    }];
    let mut opts = HashMap::new();
    let _ = opts.insert("default".to_string(), options);

    let result =
        build(drivers, opts, &args.registry_secret, &mw, &cancel)
            .await;
    drop(mw);
    printer.wait().await;

    let responses = result?;
    if let Some(response) = responses.get("default") {
        if let Some(digest) = response.image_digest() {
            println!("{digest}");
        }
    }
    Ok(())
}

pub async fn run_create(
    builder: &str,
    namespace: Option<String>,
    args: CreateArgs,
) -> Result<()> {
    let driver = new_driver(
        builder,
        namespace,
        args.driver_opts,
        args.buildkitd_flags,
        args.config,
        ".",
    )
    .await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let echo = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            eprintln!("{line}");
        }
    });
    let log = BootLog::new(tx);
    let cancel = CancellationToken::new();
    driver.bootstrap(&log, &cancel).await?;
    drop(log);
    let _ = echo.await;

    println!("{}", driver.name());
    Ok(())
}

pub async fn run_rm(
    builder: &str,
    namespace: Option<String>,
) -> Result<()> {
    let driver = new_driver(
        builder,
        namespace,
        Vec::new(),
        Vec::new(),
        None,
        ".",
    )
    .await?;
    driver.rm().await?;
    println!("removed {}", driver.name());
    Ok(())
}

pub async fn run_ls(
    builder: &str,
    namespace: Option<String>,
) -> Result<()> {
    let driver = new_driver(
        builder,
        namespace,
        Vec::new(),
        Vec::new(),
        None,
        ".",
    )
    .await?;
    let builders = driver.list().await?;
    println!("{:<24} {:<12} NODES", "NAME", "DRIVER");
    for builder in builders {
        let nodes: Vec<String> = builder
            .nodes
            .iter()
            .map(|node| {
                let platforms: Vec<String> = node
                    .platforms
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                if platforms.is_empty() {
                    node.name.clone()
                } else {
                    format!("{} ({})", node.name, platforms.join(" "))
                }
            })
            .collect();
        println!(
            "{:<24} {:<12} {}",
            builder.name,
            builder.driver,
            nodes.join(", ")
        );
    }
    Ok(())
}

pub async fn run_version(
    builder: &str,
    namespace: Option<String>,
) -> Result<()> {
    println!("client: {}", env!("CARGO_PKG_VERSION"));
    let driver = new_driver(
        builder,
        namespace,
        Vec::new(),
        Vec::new(),
        None,
        ".",
    )
    .await?;
    match driver.version().await {
        Ok(version) => println!("builder: {version}"),
        Err(e) => println!("builder: unavailable ({e})"),
    }
    Ok(())
}

fn builder_display_name(builder: &str) -> String {
    kubuild_driver::kubernetes::normalize_builder_name(builder)
}
