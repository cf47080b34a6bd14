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

//! The orchestrator: platform-to-driver assignment, per-driver solve
//! options, parallel execution, and the multi-driver manifest-list
//! combine and push.

use crate::error::{BuildError, Result};
use crate::imagetools::{Descriptor, ImageReference, Resolver};
use crate::inputs::{load_inputs, StagingGuard};
use crate::loaders::{
    builder_node_names, new_runtime_loader, LoaderGuard, LoaderKind,
    ReplicationGuard,
};
use crate::options::{to_extra_hosts, ExportSpec, Inputs, Options};
use crate::progress::MultiWriter;
use kubuild_client::{ExportEntry, SolveOpt, SolveResult};
use kubuild_driver::{
    boot, BootLog, BuilderClients, Driver, Feature, Platform,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const WORKER_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

const DIGEST_RESPONSE_KEY: &str = "containerimage.digest";

/// One configured driver entering a build, with any init failure
/// carried along instead of aborting everything upfront.
#[derive(Clone)]
pub struct DriverInfo {
    pub driver: Option<Arc<dyn Driver>>,
    pub name: String,
    pub platforms: Vec<Platform>,
    pub err: Option<String>,
}

impl std::fmt::Debug for DriverInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverInfo")
            .field("name", &self.name)
            .field("platforms", &self.platforms)
            .field("err", &self.err)
            .finish()
    }
}

/// Binding of a subset of a target's platforms to the driver index
/// serving them.
#[derive(Debug, Clone)]
struct DriverPair {
    driver_index: usize,
    platforms: Vec<Platform>,
}

fn filter_available_drivers(
    drivers: Vec<DriverInfo>,
) -> Result<Vec<DriverInfo>> {
    let mut last_err = "no drivers found".to_string();
    let mut out = Vec::with_capacity(drivers.len());
    for info in drivers {
        if let Some(err) = &info.err {
            last_err = err.clone();
            continue;
        }
        if info.driver.is_some() {
            out.push(info);
        }
    }
    if out.is_empty() {
        return Err(BuildError::NoValidDrivers(last_err));
    }
    Ok(out)
}

fn split_to_driver_pairs(
    available_platforms: &HashMap<String, usize>,
    opts: &HashMap<String, Options>,
) -> HashMap<String, Vec<DriverPair>> {
    let mut out = HashMap::new();
    for (target, opt) in opts {
        let mut by_driver: HashMap<usize, Vec<Platform>> =
            HashMap::new();
        for platform in &opt.platforms {
            let idx = available_platforms
                .get(&platform.to_string())
                .copied()
                .unwrap_or(0);
            by_driver.entry(idx).or_default().push(platform.clone());
        }
        let mut pairs: Vec<DriverPair> = by_driver
            .into_iter()
            .map(|(driver_index, platforms)| DriverPair {
                driver_index,
                platforms,
            })
            .collect();
        pairs.sort_by_key(|pair| pair.driver_index);
        let _ = out.insert(target.clone(), pairs);
    }
    out
}

async fn ensure_booted(
    drivers: &[DriverInfo],
    idxs: Vec<usize>,
    mw: &MultiWriter,
    cancel: &CancellationToken,
) -> Result<HashMap<String, BuilderClients>> {
    let mut tasks: JoinSet<Result<(String, BuilderClients)>> =
        JoinSet::new();
    for i in idxs {
        let info = drivers[i].clone();
        let driver = info
            .driver
            .clone()
            .ok_or_else(|| BuildError::NoValidDrivers(info.name.clone()))?;
        let pw = mw.with_prefix("internal", true);
        let cancel = cancel.clone();
        let _ = tasks.spawn(async move {
            pw.message("booting buildkit").await;
            let log = BootLog::new(pw.line_channel());
            let clients =
                boot(driver.as_ref(), &log, &cancel).await?;
            Ok((info.name, clients))
        });
    }

    let mut out = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (name, clients) = joined.map_err(|e| {
            BuildError::Other(anyhow::anyhow!("boot task failed: {e}"))
        })??;
        let _ = out.insert(name, clients);
    }
    Ok(out)
}

/// Map every requested platform to a serving driver, booting and
/// introspecting drivers whose platform sets are unknown.
async fn resolve_drivers(
    drivers: &[DriverInfo],
    opts: &HashMap<String, Options>,
    mw: &MultiWriter,
    cancel: &CancellationToken,
) -> Result<(
    HashMap<String, Vec<DriverPair>>,
    HashMap<String, BuilderClients>,
)> {
    let mut available_platforms: HashMap<String, usize> =
        HashMap::new();
    for (i, info) in drivers.iter().enumerate() {
        for platform in &info.platforms {
            let _ = available_platforms
                .insert(platform.to_string(), i);
        }
    }

    let mut undetected = false;
    let mut any_platforms = false;
    for opt in opts.values() {
        for platform in &opt.platforms {
            any_platforms = true;
            if !available_platforms
                .contains_key(&platform.to_string())
            {
                undetected = true;
            }
        }
    }

    // Fast path: a single driver (or no explicit platforms) serves
    // every target.
    if drivers.len() == 1 || !any_platforms {
        let pairs: HashMap<String, Vec<DriverPair>> = opts
            .iter()
            .map(|(target, opt)| {
                (
                    target.clone(),
                    vec![DriverPair {
                        driver_index: 0,
                        platforms: opt.platforms.clone(),
                    }],
                )
            })
            .collect();
        let clients =
            ensure_booted(drivers, vec![0], mw, cancel).await?;
        return Ok((pairs, clients));
    }

    if !undetected {
        let pairs = split_to_driver_pairs(&available_platforms, opts);
        let mut idxs: Vec<usize> = pairs
            .values()
            .flatten()
            .map(|pair| pair.driver_index)
            .collect();
        idxs.sort_unstable();
        idxs.dedup();
        let clients =
            ensure_booted(drivers, idxs, mw, cancel).await?;
        return Ok((pairs, clients));
    }

    // Boot everything and expand platform knowledge from the live
    // workers.
    let clients = ensure_booted(
        drivers,
        (0..drivers.len()).collect(),
        mw,
        cancel,
    )
    .await?;
    for (i, info) in drivers.iter().enumerate() {
        let Some(builder_clients) = clients.get(&info.name) else {
            continue;
        };
        let workers = builder_clients
            .chosen
            .client
            .list_workers(WORKER_DISCOVERY_TIMEOUT)
            .await
            .map_err(|e| {
                BuildError::Other(anyhow::anyhow!(
                    "listing workers: {e}"
                ))
            })?;
        for worker in workers {
            for platform in worker.platforms {
                let platform = Platform {
                    os: platform.os,
                    architecture: platform.architecture,
                    variant: platform.variant,
                }
                .normalize();
                let _ = available_platforms
                    .entry(platform.to_string())
                    .or_insert(i);
            }
        }
    }

    Ok((split_to_driver_pairs(&available_platforms, opts), clients))
}

/// The distinct repositories named by a comma-joined tag list.
fn to_repo_only(names: &str) -> Result<String> {
    let mut repos = Vec::new();
    for name in names.split(',') {
        let parsed: ImageReference = name.parse()?;
        let repo = parsed.repo_only();
        if !repos.contains(&repo) {
            repos.push(repo);
        }
    }
    Ok(repos.join(","))
}

struct PreparedSolve {
    solve_opt: SolveOpt,
    _staging: StagingGuard,
    loader: Option<LoaderGuard>,
    needs_replication: bool,
}

#[allow(clippy::too_many_arguments)]
async fn to_solve_opt(
    driver: Arc<dyn Driver>,
    clients: &BuilderClients,
    multi_driver: bool,
    opt: &Options,
    inputs: Inputs,
    pair_platforms: &[Platform],
    registry_secret: &str,
    mw: &MultiWriter,
) -> Result<PreparedSolve> {
    let driver_name = driver.factory_name();
    let features = driver.features().await;
    let feature =
        |f: Feature| features.get(&f).copied().unwrap_or(false);
    let not_supported = |f: Feature| BuildError::NotSupported {
        feature: f,
        driver: driver_name.clone(),
    };

    if opt.image_id_file.is_some()
        && (multi_driver || !opt.platforms.is_empty())
    {
        return Err(BuildError::ImageIdFileWithMultiPlatform);
    }
    if let Some(path) = &opt.image_id_file {
        // Never leave a stale ID file if the build fails later.
        match std::fs::remove_file(path) {
            Ok(())  => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut cache_exports = opt.cache_to.clone();
    if let Some(value) = opt.build_args.get("BUILDKIT_INLINE_CACHE") {
        if value.parse().unwrap_or(false) {
            cache_exports.push(kubuild_client::CacheEntry {
                kind: "inline".to_string(),
                attrs: HashMap::new(),
            });
        }
    }
    for entry in &cache_exports {
        if entry.kind != "inline" && !feature(Feature::CacheExport) {
            return Err(not_supported(Feature::CacheExport));
        }
    }

    let mut so = SolveOpt {
        frontend: "dockerfile.v0".to_string(),
        cache_exports,
        cache_imports: opt.cache_from.clone(),
        entitlements: opt.allow.clone(),
        ..Default::default()
    };
    if let Some(frontend_image) = &opt.frontend_image {
        so.frontend = "gateway.v0".to_string();
        let _ = so
            .frontend_attrs
            .insert("source".to_string(), frontend_image.clone());
    }
    if multi_driver {
        // Force creation of a manifest list per driver result.
        let _ = so
            .frontend_attrs
            .insert("multi-platform".to_string(), "true".to_string());
    }

    let mut exports = opt.exports.clone();
    match exports.len() {
        1 => {}
        0 => return Err(BuildError::ZeroOutputs),
        _ => return Err(BuildError::MultipleOutputs),
    }

    // Rewrite the generic "runtime" export into whatever this builder
    // can actually load.
    for export in &mut exports {
        if export.kind == "runtime" {
            if feature(Feature::ContainerdExporter) {
                export.kind = "image".to_string();
            } else if feature(Feature::DockerExporter) {
                export.kind = "docker".to_string();
            } else {
                return Err(BuildError::NoRuntimeLoadAvailable);
            }
        }
    }

    // Fill in exporter names from the tag list.
    if !opt.tags.is_empty() {
        let mut tags = Vec::with_capacity(opt.tags.len());
        for tag in &opt.tags {
            let _ = tag.parse::<ImageReference>().map_err(|e| {
                BuildError::InvalidTag {
                    tag: tag.clone(),
                    reason: e.to_string(),
                }
            })?;
            tags.push(tag.clone());
        }
        for export in &mut exports {
            if matches!(
                export.kind.as_str(),
                "image" | "oci" | "docker"
            ) {
                let _ = export
                    .attrs
                    .insert("name".to_string(), tags.join(","));
            }
        }
    } else {
        for export in &exports {
            let pushing = export
                .attrs
                .get("push")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false);
            if export.kind == "image"
                && export
                    .attrs
                    .get("name")
                    .map(String::is_empty)
                    .unwrap_or(true)
                && pushing
            {
                return Err(BuildError::PushWithoutTag);
            }
        }
    }

    let multi_node = !clients.others.is_empty();
    let mut loader_guard = None;
    let mut needs_replication = false;
    let mut client_exports = Vec::with_capacity(exports.len());

    for export in exports {
        let ExportSpec { mut kind, attrs } = export;
        let pushing = attrs
            .get("push")
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);
        let dest = attrs.get("dest").cloned();
        let mut output: Option<
            kubuild_client::session::filesend::ExportSink,
        > = None;

        if matches!(kind.as_str(), "local" | "tar")
            && opt.image_id_file.is_some()
        {
            return Err(BuildError::ImageIdFileWithLocalOutput);
        }

        match kind.as_str() {
            "local" => {
                // The directory exporter needs a file-transfer
                // receiver this driver does not carry.
                return Err(BuildError::LocalExporterUnsupported);
            }
            "tar" => {
                let dest = dest.ok_or_else(|| {
                    BuildError::InvalidOutputSpec {
                        spec: "tar".to_string(),
                        reason: "dest is required".to_string(),
                    }
                })?;
                let file = tokio::fs::File::create(&dest).await?;
                output = Some(Box::new(file) as _);
            }
            "oci" => {
                if !feature(Feature::OciExporter) {
                    return Err(not_supported(Feature::OciExporter));
                }
                if let Some(dest) = dest {
                    let file =
                        tokio::fs::File::create(&dest).await?;
                    output = Some(Box::new(file) as _);
                }
            }
            "docker" => {
                if !feature(Feature::DockerExporter) {
                    return Err(not_supported(
                        Feature::DockerExporter,
                    ));
                }
                if let Some(dest) = dest {
                    let file =
                        tokio::fs::File::create(&dest).await?;
                    output = Some(Box::new(file) as _);
                } else {
                    // The engine socket is mounted in every builder
                    // pod; route the tarball to each node's engine.
                    let nodes = builder_node_names(
                        &driver.list().await?,
                        &driver.name(),
                    )?;
                    let (sink, guard) = new_runtime_loader(
                        LoaderKind::Docker,
                        Arc::clone(&driver),
                        nodes,
                        mw.with_prefix("", false),
                    );
                    output = Some(sink);
                    loader_guard = Some(guard);
                    needs_replication = multi_node;
                }
            }
            "image" if !pushing => {
                if !feature(Feature::ContainerdExporter) {
                    return Err(not_supported(
                        Feature::ContainerdExporter,
                    ));
                }
                if multi_node && dest.is_none() {
                    // The image must exist on every node; switch to
                    // the oci stream and import it through each pod's
                    // runtime socket.
                    kind = "oci".to_string();
                    let nodes = builder_node_names(
                        &driver.list().await?,
                        &driver.name(),
                    )?;
                    let (sink, guard) = new_runtime_loader(
                        LoaderKind::Containerd,
                        Arc::clone(&driver),
                        nodes,
                        mw.with_prefix("", false),
                    );
                    output = Some(sink);
                    loader_guard = Some(guard);
                    needs_replication = true;
                }
            }
            "image" => {}
            "containerd" => {
                return Err(not_supported(
                    Feature::ContainerdExporter,
                ));
            }
            _ => {}
        }

        client_exports.push(ExportEntry { kind, attrs, output });
    }
    so.exports = client_exports;

    for attachable in &opt.session {
        so.session.push(Arc::clone(attachable));
    }
    so.session.push(driver.auth_provider(registry_secret));

    let staging = load_inputs(inputs, &mut so).await?;

    if opt.pull {
        let _ = so.frontend_attrs.insert(
            "image-resolve-mode".to_string(),
            "pull".to_string(),
        );
    }
    if !opt.target.is_empty() {
        let _ = so
            .frontend_attrs
            .insert("target".to_string(), opt.target.clone());
    }
    if opt.no_cache {
        let _ = so
            .frontend_attrs
            .insert("no-cache".to_string(), String::new());
    }
    for (key, value) in &opt.build_args {
        let _ = so
            .frontend_attrs
            .insert(format!("build-arg:{key}"), value.clone());
    }
    for (key, value) in &opt.labels {
        let _ = so
            .frontend_attrs
            .insert(format!("label:{key}"), value.clone());
    }

    if !pair_platforms.is_empty() {
        if pair_platforms.len() > 1
            && !feature(Feature::MultiPlatform)
        {
            return Err(not_supported(Feature::MultiPlatform));
        }
        let joined = pair_platforms
            .iter()
            .map(Platform::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let _ = so
            .frontend_attrs
            .insert("platform".to_string(), joined);
    }

    match opt.network_mode.as_str() {
        "host" | "none" => {
            let _ = so.frontend_attrs.insert(
                "force-network-mode".to_string(),
                opt.network_mode.clone(),
            );
            so.entitlements.push("network.host".to_string());
        }
        "" | "default" => {}
        other => {
            return Err(BuildError::InvalidNetworkMode {
                mode: other.to_string(),
            })
        }
    }

    if !opt.extra_hosts.is_empty() {
        let _ = so.frontend_attrs.insert(
            "add-hosts".to_string(),
            to_extra_hosts(&opt.extra_hosts)?,
        );
    }

    Ok(PreparedSolve {
        solve_opt: so,
        _staging: staging,
        loader: loader_guard,
        needs_replication,
    })
}

/// Run the requested builds. One entry per target in the result; the
/// first failure cancels everything in flight.
pub async fn build(
    drivers: Vec<DriverInfo>,
    opts: HashMap<String, Options>,
    registry_secret_name: &str,
    mw: &MultiWriter,
    cancel: &CancellationToken,
) -> Result<HashMap<String, SolveResult>> {
    if drivers.is_empty() {
        return Err(BuildError::NoDrivers);
    }
    let drivers = filter_available_drivers(drivers)?;
    let (pairs_map, clients_map) =
        resolve_drivers(&drivers, &opts, mw, cancel).await?;

    let auth = drivers[0]
        .driver
        .as_ref()
        .map(|d| d.auth_config(registry_secret_name))
        .ok_or(BuildError::NoDrivers)?;
    let resolver = Arc::new(Resolver::new(auth));

    let multi_target = opts.len() > 1;
    let mut targets: JoinSet<Result<(String, SolveResult)>> =
        JoinSet::new();

    for (target, mut opt) in opts {
        let pairs = pairs_map.get(&target).cloned().unwrap_or_default();
        let multi_driver = pairs.len() > 1;
        let drivers = drivers.clone();
        let clients_map = clients_map.clone();
        let mw = mw.clone();
        let cancel = cancel.clone();
        let resolver = Arc::clone(&resolver);
        let registry_secret = registry_secret_name.to_string();

        let _ = targets.spawn(async move {
            let inputs = opt.inputs.take();
            let (context_path, dockerfile_path) = inputs
                .as_ref()
                .map(|i| {
                    (i.context_path.clone(), i.dockerfile_path.clone())
                })
                .unwrap_or_default();
            let mut inputs = Some(inputs.ok_or(
                BuildError::MissingContext,
            )?);

            // Multi-driver push rewires the image export to push by
            // digest; the per-repo manifest list is combined after
            // the solves.
            let mut push_names: Option<String> = None;
            if multi_driver {
                for export in &mut opt.exports {
                    match export.kind.as_str() {
                        "oci" | "tar" => {
                            return Err(
                                BuildError::OutputUnsupportedMultiNode {
                                    kind: export.kind.clone(),
                                },
                            )
                        }
                        "image" => {
                            let pushing = export
                                .attrs
                                .get("push")
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(false);
                            if pushing && push_names.is_none() {
                                let names = if opt.tags.is_empty() {
                                    export
                                        .attrs
                                        .get("name")
                                        .cloned()
                                        .unwrap_or_default()
                                } else {
                                    opt.tags.join(",")
                                };
                                if names.is_empty() {
                                    return Err(
                                        BuildError::PushWithoutTag,
                                    );
                                }
                                let _ = export.attrs.insert(
                                    "name".to_string(),
                                    to_repo_only(&names)?,
                                );
                                let _ = export.attrs.insert(
                                    "push-by-digest".to_string(),
                                    "true".to_string(),
                                );
                                push_names = Some(names);
                            }
                        }
                        _ => {}
                    }
                }
            }

            let mut solves: JoinSet<Result<(usize, SolveResult)>> =
                JoinSet::new();
            for (i, pair) in pairs.iter().enumerate() {
                let info = &drivers[pair.driver_index];
                let driver = info
                    .driver
                    .clone()
                    .ok_or(BuildError::NoDrivers)?;
                let clients = clients_map
                    .get(&info.name)
                    .cloned()
                    .ok_or_else(|| {
                        BuildError::NoBuilderNodes {
                            builder: info.name.clone(),
                        }
                    })?;

                // Standard input can only feed the first solve; the
                // remaining pairs re-stage from the filesystem paths.
                let pair_inputs = match inputs.take() {
                    Some(inputs) => inputs,
                    None => Inputs {
                        context_path: context_path.clone(),
                        dockerfile_path: dockerfile_path.clone(),
                        in_stream: None,
                    },
                };

                let prepared = to_solve_opt(
                    Arc::clone(&driver),
                    &clients,
                    multi_driver,
                    &opt,
                    pair_inputs,
                    &pair.platforms,
                    &registry_secret,
                    &mw,
                )
                .await?;

                let pw = mw.with_prefix(
                    if multi_target { target.as_str() } else { "" },
                    multi_target,
                );
                let cancel = cancel.clone();
                let _ = solves.spawn(async move {
                    let PreparedSolve {
                        solve_opt,
                        _staging,
                        loader,
                        needs_replication,
                    } = prepared;

                    let replication = if needs_replication {
                        Some(
                            ReplicationGuard::setup(&clients)
                                .await?,
                        )
                    } else {
                        None
                    };

                    let status_tx = pw.status_channel();
                    let solve_result = tokio::select! {
                        res = clients
                            .chosen
                            .client
                            .solve(solve_opt, status_tx) => res,
                        _ = cancel.cancelled() => {
                            Err(kubuild_client::ClientError::Other(
                                anyhow::anyhow!("build cancelled"),
                            ))
                        }
                    };

                    if let Some(replication) = replication {
                        replication.release().await;
                    }

                    let result = match solve_result {
                        Ok(result) => result,
                        Err(e) => {
                            // A 401 usually means the registry secret
                            // is missing or misnamed; surface the
                            // recorded hint alongside.
                            let text = e.to_string().to_lowercase();
                            if text.contains("401 unauthorized") {
                                return Err(BuildError::AuthFailed {
                                    hint: driver.auth_hint(),
                                    source: e,
                                });
                            }
                            return Err(e.into());
                        }
                    };

                    if let Some(loader) = loader {
                        loader.finish().await?;
                    }
                    Ok((i, result))
                });
            }

            let mut results: Vec<Option<SolveResult>> =
                vec![None; pairs.len()];
            while let Some(joined) = solves.join_next().await {
                let (i, result) = joined.map_err(|e| {
                    BuildError::Other(anyhow::anyhow!(
                        "solve task failed: {e}"
                    ))
                })??;
                results[i] = Some(result);
            }
            let results: Vec<SolveResult> =
                results.into_iter().flatten().collect();

            // Multi-driver push: combine the per-platform digests
            // into one index and push it to every named reference.
            if let Some(push_names) = push_names {
                let pw = mw.with_prefix("default", false);
                pw.message(format!(
                    "merging manifest list {push_names}"
                ))
                .await;

                let descs: Vec<Descriptor> = results
                    .iter()
                    .filter_map(|r| r.image_digest())
                    .map(|digest| Descriptor {
                        digest: digest.to_string(),
                        ..Default::default()
                    })
                    .collect();
                if descs.is_empty() {
                    // No solve produced a digest; the error has
                    // already propagated from the failing solve.
                    return Err(BuildError::Registry {
                        reason: format!(
                            "no digests produced for {push_names}"
                        ),
                    });
                }

                let names: Vec<&str> =
                    push_names.split(',').collect();
                let (bytes, desc) = resolver
                    .combine(names[0], descs)
                    .await?;
                if let Some(path) = &opt.image_id_file {
                    tokio::fs::write(path, &desc.digest).await?;
                }
                for name in &names {
                    resolver
                        .push(name, &desc, bytes.clone())
                        .await?;
                }
                return Ok((
                    target,
                    SolveResult {
                        exporter_response: HashMap::from([(
                            DIGEST_RESPONSE_KEY.to_string(),
                            desc.digest,
                        )]),
                    },
                ));
            }

            let first = results
                .into_iter()
                .next()
                .unwrap_or_default();
            if pairs.len() == 1 {
                if let (Some(path), Some(digest)) =
                    (&opt.image_id_file, first.image_digest())
                {
                    tokio::fs::write(path, digest).await?;
                }
            }
            Ok((target, first))
        });
    }

    let mut responses = HashMap::new();
    while let Some(joined) = targets.join_next().await {
        let (target, result) = joined.map_err(|e| {
            BuildError::Other(anyhow::anyhow!(
                "build task failed: {e}"
            ))
        })??;
        debug!("target {target} finished");
        let _ = responses.insert(target, result);
    }
    Ok(responses)
}
