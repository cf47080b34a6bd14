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

//! Idempotent convergence of the builder's cluster objects.
//!
//! Two CLIs may run this concurrently against the same builder name:
//! create/exists races are absorbed by jittered retries, and the
//! deployment update after a runtime flip uses the observed resource
//! version so a concurrent writer loses cleanly and retries.

use super::driver::{is_child_of, DriverInner, KubernetesDriver};
use super::factory::init_driver_inner;
use super::{RUNTIME_CONTAINERD, RUNTIME_DOCKER, WORKER_AUTO};
use crate::error::{DriverError, Result};
use crate::{rand_sleep, BootLog};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{DeleteParams, ListParams, PostParams};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// Pull failures can take a very long time to converge; fail fast.
const PULL_FAILURE_MARKERS: [&str; 2] =
    ["Failed to pull image", "Error: ErrImagePull"];

const MOUNT_MISMATCH_MARKER: &str = "is not a socket file";

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

impl KubernetesDriver {
    /// Idempotently create (or update, when the user supplied new
    /// contents) the daemon configuration object, retrying transient
    /// failures until cancelled.
    pub(super) async fn ensure_config_map(
        &self,
        inner: &DriverInner,
        log: &BootLog,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let name = inner.opt.name.clone();
        let mut last_err: Option<DriverError> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(last_err.unwrap_or_else(|| {
                    DriverError::Other(anyhow::anyhow!(
                        "timeout before first attempt"
                    ))
                }));
            }

            let existing = match self.config_map_api.get_opt(&name).await
            {
                Ok(existing) => existing,
                Err(e) => {
                    debug!("unexpected ConfigMap get failure: {e}");
                    last_err = Some(e.into());
                    rand_sleep(1000).await;
                    continue;
                }
            };

            let (verb, res) = match existing {
                None => (
                    "create",
                    self.config_map_api
                        .create(
                            &PostParams::default(),
                            &inner.config_map,
                        )
                        .await,
                ),
                Some(_) if inner.user_specified_config => (
                    "update",
                    self.config_map_api
                        .replace(
                            &name,
                            &PostParams::default(),
                            &inner.config_map,
                        )
                        .await,
                ),
                Some(_) => return Ok(()),
            };

            match res {
                Ok(_) => return Ok(()),
                Err(e) => {
                    log.log(format!(
                        "Warning \tfailed to {verb} configmap {e} - retrying...",
                    ));
                    last_err = Some(e.into());
                    rand_sleep(1000).await;
                }
            }
        }
    }

    /// Converge the deployment until the ready-replica count reaches the
    /// requested size, diagnosing pod faults along the way.
    pub(super) async fn create_builder(
        &self,
        inner: &mut DriverInner,
        log: &BootLog,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut reported = HashSet::new();
        let mut last_err: Option<DriverError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(DriverError::BootstrapTimeout {
                    source: Box::new(last_err.unwrap_or_else(|| {
                        DriverError::Other(anyhow::anyhow!(
                            "cancelled before converging"
                        ))
                    })),
                });
            }

            let name = inner.opt.name.clone();
            let deployment =
                match self.deployment_api.get_opt(&name).await {
                    Ok(Some(deployment)) => deployment,
                    Ok(None) => {
                        match self
                            .deployment_api
                            .create(
                                &PostParams::default(),
                                &inner.deployment,
                            )
                            .await
                        {
                            Ok(deployment) => deployment,
                            Err(e) => {
                                // Possibly lost a create race with a
                                // concurrent CLI.
                                last_err = Some(e.into());
                                rand_sleep(1000).await;
                                continue;
                            }
                        }
                    }
                    Err(e) => {
                        last_err = Some(e.into());
                        rand_sleep(1000).await;
                        continue;
                    }
                };

            let ready = deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            if ready >= inner.min_replicas {
                log.log(format!(
                    "All {} replicas for {} online",
                    inner.min_replicas, name
                ));
                return Ok(());
            }

            // Not ready yet; inspect events and take corrective action.
            if let Err(e) = self
                .diagnose(inner, &deployment, &mut reported, log)
                .await
            {
                match e {
                    DriverError::Kube(inner_err) => {
                        // Transient API failures keep the loop alive.
                        last_err = Some(inner_err.into());
                        rand_sleep(1000).await;
                        continue;
                    }
                    fatal => return Err(fatal),
                }
            }

            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    async fn diagnose(
        &self,
        inner: &mut DriverInner,
        deployment: &Deployment,
        reported: &mut HashSet<String>,
        log: &BootLog,
    ) -> Result<()> {
        let replicas = self.replica_sets_of(deployment).await?;
        for replica in &replicas {
            let replica_uid =
                replica.metadata.uid.clone().unwrap_or_default();
            let replica_name =
                replica.metadata.name.clone().unwrap_or_default();
            let events = self
                .events_for(&replica_name, &replica_uid)
                .await?;
            let _ = log_events(
                &events,
                &replica_name,
                &replica_uid,
                reported,
                log,
            )?;

            let pods = self
                .pod_api
                .list(&ListParams::default().labels(&format!(
                    "app={}",
                    inner.opt.name
                )))
                .await?;
            let children: Vec<&Pod> = pods
                .items
                .iter()
                .filter(|pod| {
                    is_child_of(&pod.metadata, &replica_uid)
                })
                .collect();

            for pod in &children {
                let pod_name =
                    pod.metadata.name.clone().unwrap_or_default();
                let pod_uid =
                    pod.metadata.uid.clone().unwrap_or_default();
                let events =
                    self.events_for(&pod_name, &pod_uid).await?;
                let warnings = log_events(
                    &events, &pod_name, &pod_uid, reported, log,
                )?;

                for event in warnings {
                    let mismatch = event.reason.as_deref()
                        == Some("FailedMount")
                        && event
                            .message
                            .as_deref()
                            .map(|m| m.contains(MOUNT_MISMATCH_MARKER))
                            .unwrap_or(false);
                    if !mismatch {
                        continue;
                    }
                    if inner.user_specified_runtime {
                        return Err(DriverError::RuntimeMismatch {
                            message: event
                                .message
                                .clone()
                                .unwrap_or_default(),
                        });
                    }
                    self.flip_runtime(
                        inner,
                        deployment,
                        &replica_name,
                        &children,
                        log,
                    )
                    .await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// The deployed runtime guess was wrong: flip it, regenerate the
    /// manifests, update the deployment against the observed resource
    /// version, and clear out the stale replica set and its pods.
    async fn flip_runtime(
        &self,
        inner: &mut DriverInner,
        deployment: &Deployment,
        stale_replica: &str,
        stale_pods: &[&Pod],
        log: &BootLog,
    ) -> Result<()> {
        let attempted = inner.opt.container_runtime.clone();
        let flipped = match attempted.as_str() {
            RUNTIME_CONTAINERD => RUNTIME_DOCKER,
            _ => RUNTIME_CONTAINERD,
        };
        log.log(format!(
            "Warning \tinitial attempt to deploy configured for the {attempted} runtime failed, retrying with {flipped}",
        ));

        let mut cfg = self.init.clone();
        let _ = cfg
            .driver_opts
            .insert("runtime".to_string(), flipped.to_string());
        let _ = cfg
            .driver_opts
            .insert("worker".to_string(), WORKER_AUTO.to_string());
        // Re-init marks the runtime user-pinned to prevent flip cycles.
        // The configuration payload does not depend on the runtime, so
        // only the in-memory objects need regenerating.
        *inner = init_driver_inner(&cfg, true)?;

        // Resource-version CAS so a concurrent CLI's update loses
        // cleanly rather than silently clobbering.
        inner.deployment.metadata.resource_version =
            deployment.metadata.resource_version.clone();
        let name = inner.opt.name.clone();
        let _ = self
            .deployment_api
            .replace(&name, &PostParams::default(), &inner.deployment)
            .await
            .map_err(|e| {
                DriverError::Other(anyhow::anyhow!(
                    "error while updating deployment {name:?} - resourceVersion: {:?}: {e}",
                    inner.deployment.metadata.resource_version
                ))
            })?;

        // Accelerate convergence: the stale replica set would otherwise
        // wait out a long mount timeout, and its pods can wedge in
        // Terminating on the failed mount.
        let zero_grace = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        if let Err(e) = self
            .replicaset_api
            .delete(stale_replica, &zero_grace)
            .await
        {
            if !is_not_found(&e) {
                log.log(format!(
                    "Warning \treplicaset deletion failed {e}"
                ));
            }
        }
        for pod in stale_pods {
            let pod_name =
                pod.metadata.name.clone().unwrap_or_default();
            if let Err(e) =
                self.pod_api.delete(&pod_name, &zero_grace).await
            {
                if !is_not_found(&e) {
                    log.log(format!(
                        "Warning \tpod deletion failed {e}"
                    ));
                }
            }
        }
        rand_sleep(2000).await;
        Ok(())
    }

    async fn replica_sets_of(
        &self,
        deployment: &Deployment,
    ) -> Result<Vec<ReplicaSet>> {
        let deployment_uid =
            deployment.metadata.uid.clone().unwrap_or_default();
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let list = self
            .replicaset_api
            .list(&ListParams::default().labels(&format!("app={name}")))
            .await?;
        Ok(list
            .items
            .into_iter()
            .filter(|replica| {
                is_child_of(&replica.metadata, &deployment_uid)
            })
            .collect())
    }

    async fn events_for(
        &self,
        name: &str,
        uid: &str,
    ) -> Result<Vec<Event>> {
        let mut fields = format!("involvedObject.name={name}");
        if !uid.is_empty() {
            fields.push_str(&format!(",involvedObject.uid={uid}"));
        }
        let list = self
            .event_api
            .list(&ListParams::default().fields(&fields))
            .await?;
        Ok(list.items)
    }
}

/// Report events once each, fail fast on image-pull failures, and hand
/// back the warnings for fault-specific handling.
fn log_events<'a>(
    events: &'a [Event],
    resource: &str,
    origin_uid: &str,
    reported: &mut HashSet<String>,
    log: &BootLog,
) -> Result<Vec<&'a Event>> {
    let mut warnings = Vec::new();
    for event in events {
        if event.involved_object.uid.as_deref()
            != Some(origin_uid)
        {
            continue;
        }
        let type_ = event.type_.as_deref().unwrap_or_default();
        let reason = event.reason.as_deref().unwrap_or_default();
        let message = event.message.as_deref().unwrap_or_default();
        let line =
            format!("{type_} \t{resource} \t{reason} \t{message}");
        if reported.insert(line.clone()) {
            log.log(line);
        }

        if type_ == "Warning" && reason == "Failed" {
            for marker in PULL_FAILURE_MARKERS {
                if message.contains(marker) {
                    return Err(DriverError::WorkloadFailure {
                        message: message.to_string(),
                    });
                }
            }
        }
        if type_ != "Normal" {
            warnings.push(event);
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;
    use tokio::sync::mpsc;

    fn event(
        type_: &str,
        reason: &str,
        message: &str,
        uid: &str,
    ) -> Event {
        Event {
            type_: Some(type_.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: ObjectReference {
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_log_events_deduplicates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log = BootLog::new(tx);
        let mut reported = HashSet::new();
        let events = vec![
            event("Warning", "BackOff", "restarting", "uid-1"),
            event("Warning", "BackOff", "restarting", "uid-1"),
        ];

        let _ = log_events(
            &events,
            "pod-a",
            "uid-1",
            &mut reported,
            &log,
        )
        .expect("log");

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_log_events_fails_fast_on_pull_error() {
        let log = BootLog::sink();
        let mut reported = HashSet::new();
        let events = vec![event(
            "Warning",
            "Failed",
            "Failed to pull image \"nope\"",
            "uid-1",
        )];

        let err = log_events(
            &events,
            "pod-a",
            "uid-1",
            &mut reported,
            &log,
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("Failed to pull image"));
    }

    #[test]
    fn test_log_events_skips_other_objects() {
        let log = BootLog::sink();
        let mut reported = HashSet::new();
        let events = vec![event(
            "Warning",
            "Failed",
            "Error: ErrImagePull",
            "other-uid",
        )];

        let warnings = log_events(
            &events,
            "pod-a",
            "uid-1",
            &mut reported,
            &log,
        )
        .expect("log");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_log_events_returns_warnings_only() {
        let log = BootLog::sink();
        let mut reported = HashSet::new();
        let events = vec![
            event("Normal", "Scheduled", "assigned", "uid-1"),
            event(
                "Warning",
                "FailedMount",
                "/var/run/docker.sock is not a socket file",
                "uid-1",
            ),
        ];

        let warnings = log_events(
            &events,
            "pod-a",
            "uid-1",
            &mut reported,
            &log,
        )
        .expect("log");
        assert_eq!(warnings.len(), 1);
        assert_eq!(
            warnings[0].reason.as_deref(),
            Some("FailedMount")
        );
    }
}
