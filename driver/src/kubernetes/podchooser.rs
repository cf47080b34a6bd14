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

//! Selects which builder pod serves a request.
//!
//! The sticky chooser hashes a request key (the context-path hash) onto
//! a consistent-hash ring of ready pod names, so repeated builds of the
//! same context land on the same pod and keep their cache warm. The
//! random chooser picks uniformly.

use crate::error::{DriverError, Result};
use crate::platforms::Platform;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::Api;
use kubuild_proto::control::WorkerRecord;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error};

const WORKER_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

// Virtual points per pod on the hash ring.
const RING_REPLICAS: u32 = 40;

/// Short-timeout worker introspection for one pod, provided by the
/// driver so choosers can filter on supported platforms.
#[async_trait::async_trait]
pub trait WorkerIntrospect: Send + Sync {
    async fn workers_for_pod(
        &self,
        pod: &Pod,
        timeout: Duration,
    ) -> Result<Vec<WorkerRecord>>;
}

#[async_trait::async_trait]
pub trait PodChooser: Send + Sync {
    /// Pick one eligible pod; the remainder come back as peers.
    async fn choose_pod(
        &self,
        introspect: &dyn WorkerIntrospect,
        platforms: &[Platform],
    ) -> Result<(Pod, Vec<Pod>)>;
}

pub struct StickyPodChooser {
    pub key: String,
    pub pod_api: Api<Pod>,
    pub deployment_name: String,
}

#[async_trait::async_trait]
impl PodChooser for StickyPodChooser {
    async fn choose_pod(
        &self,
        introspect: &dyn WorkerIntrospect,
        platforms: &[Platform],
    ) -> Result<(Pod, Vec<Pod>)> {
        let pods =
            list_running_pods(&self.pod_api, &self.deployment_name)
                .await?;
        if pods.is_empty() {
            return Err(DriverError::NoPodsRunning);
        }
        let pods = filter_pods(introspect, pods, platforms).await?;
        if pods.is_empty() {
            return Err(DriverError::NoPodsRunning);
        }

        let ring = Ring::new(pods.iter().map(pod_name));
        match ring.get(&self.key) {
            Some(chosen) => Ok(split_chosen(pods, &chosen)),
            None => {
                // Not reachable with a non-empty pod set.
                error!("no pod found for key {:?}", self.key);
                let n =
                    rand::thread_rng().gen_range(0..pods.len());
                let name = pod_name(&pods[n]);
                Ok(split_chosen(pods, &name))
            }
        }
    }
}

pub struct RandomPodChooser {
    pub pod_api: Api<Pod>,
    pub deployment_name: String,
}

#[async_trait::async_trait]
impl PodChooser for RandomPodChooser {
    async fn choose_pod(
        &self,
        introspect: &dyn WorkerIntrospect,
        platforms: &[Platform],
    ) -> Result<(Pod, Vec<Pod>)> {
        let pods =
            list_running_pods(&self.pod_api, &self.deployment_name)
                .await?;
        if pods.is_empty() {
            return Err(DriverError::NoPodsRunning);
        }
        let pods = filter_pods(introspect, pods, platforms).await?;
        if pods.is_empty() {
            return Err(DriverError::NoPodsRunning);
        }
        let n = rand::thread_rng().gen_range(0..pods.len());
        debug!("random pod choice: {n} of {}", pods.len());
        let name = pod_name(&pods[n]);
        Ok(split_chosen(pods, &name))
    }
}

fn pod_name(pod: &Pod) -> String {
    pod.metadata.name.clone().unwrap_or_default()
}

fn split_chosen(pods: Vec<Pod>, chosen_name: &str) -> (Pod, Vec<Pod>) {
    let mut chosen = None;
    let mut others = Vec::with_capacity(pods.len().saturating_sub(1));
    for pod in pods {
        if chosen.is_none() && pod_name(&pod) == chosen_name {
            chosen = Some(pod);
        } else {
            others.push(pod);
        }
    }
    (chosen.expect("chosen name came from the pod list"), others)
}

/// Ready pods of one builder, sorted by name.
pub async fn list_running_pods(
    pod_api: &Api<Pod>,
    deployment_name: &str,
) -> Result<Vec<Pod>> {
    let params =
        ListParams::default().labels(&format!("app={deployment_name}"));
    let list = pod_api.list(&params).await?;
    let mut running: Vec<Pod> = list
        .items
        .into_iter()
        .filter(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(|phase| phase == "Running")
                .unwrap_or(false)
        })
        .collect();
    running.sort_by_key(pod_name);
    for pod in &running {
        debug!("pod running: {:?}", pod_name(pod));
    }
    Ok(running)
}

async fn filter_pods(
    introspect: &dyn WorkerIntrospect,
    pods: Vec<Pod>,
    platforms: &[Platform],
) -> Result<Vec<Pod>> {
    if platforms.is_empty() {
        return Ok(pods);
    }
    let mut res = Vec::new();
    for pod in pods {
        let workers = introspect
            .workers_for_pod(&pod, WORKER_QUERY_TIMEOUT)
            .await?;
        match workers.len() {
            1 => {
                let supported: Vec<Platform> = workers[0]
                    .platforms
                    .iter()
                    .map(|p| {
                        Platform {
                            os: p.os.clone(),
                            architecture: p.architecture.clone(),
                            variant: p.variant.clone(),
                        }
                        .normalize()
                    })
                    .collect();
                if platforms
                    .iter()
                    .all(|want| supported.contains(want))
                {
                    res.push(pod);
                }
            }
            _ => return Err(DriverError::MultiWorkerPods),
        }
    }
    Ok(res)
}

/// Consistent-hash ring over pod names. Collisions on a point keep the
/// lexicographically smaller name so selection stays deterministic.
pub struct Ring {
    points: BTreeMap<u64, String>,
}

impl Ring {
    pub fn new(names: impl Iterator<Item = String>) -> Self {
        let mut points = BTreeMap::new();
        for name in names {
            for replica in 0..RING_REPLICAS {
                let point = hash_point(&format!("{name}-{replica}"));
                points
                    .entry(point)
                    .and_modify(|existing: &mut String| {
                        if name < *existing {
                            *existing = name.clone();
                        }
                    })
                    .or_insert_with(|| name.clone());
            }
        }
        Self { points }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if self.points.is_empty() {
            return None;
        }
        let point = hash_point(key);
        self.points
            .range(point..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, name)| name.clone())
    }
}

fn hash_point(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(
        digest[..8].try_into().expect("sha256 yields 32 bytes"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_stable() {
        let names =
            ["builder-a", "builder-b", "builder-c"].map(String::from);
        let ring = Ring::new(names.clone().into_iter());
        let first = ring.get("some-context-hash").expect("choice");
        for _ in 0..10 {
            let ring = Ring::new(names.clone().into_iter());
            assert_eq!(
                ring.get("some-context-hash").expect("choice"),
                first
            );
        }
    }

    #[test]
    fn test_ring_spreads_keys() {
        let names =
            ["builder-a", "builder-b", "builder-c"].map(String::from);
        let ring = Ring::new(names.into_iter());
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let _ = seen.insert(
                ring.get(&format!("key-{i}")).expect("choice"),
            );
        }
        assert!(seen.len() > 1, "all keys landed on one pod");
    }

    #[test]
    fn test_ring_survives_member_removal() {
        let ring = Ring::new(
            ["a", "b", "c"].map(String::from).into_iter(),
        );
        let smaller =
            Ring::new(["a", "b"].map(String::from).into_iter());
        // Keys that chose a surviving pod must keep their choice.
        let mut moved = 0;
        for i in 0..100 {
            let key = format!("key-{i}");
            let before = ring.get(&key).expect("choice");
            let after = smaller.get(&key).expect("choice");
            if before != "c" {
                assert_eq!(before, after);
            } else {
                moved += 1;
            }
        }
        assert!(moved > 0);
    }

    #[test]
    fn test_empty_ring_returns_none() {
        let ring = Ring::new(std::iter::empty());
        assert!(ring.get("anything").is_none());
    }
}
