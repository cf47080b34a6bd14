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

//! An in-memory API-server stand-in the driver converges against: the
//! fake-clientset of this test suite. `fail_mounts` holds readiness and
//! serves a FailedMount pod event until the deployment is updated, which
//! is how the runtime auto-flip is exercised.

// Not every test binary uses every helper.
#![allow(dead_code)]

use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use kube::client::Body;
use kubuild_driver::kubernetes::KubernetesFactory;
use kubuild_driver::{Driver, Factory, InitConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const REPLICASET_NAME: &str = "flip-rs";
pub const REPLICASET_UID: &str = "flip-rs-uid";
pub const POD_NAME: &str = "flip-pod";
pub const POD_UID: &str = "flip-pod-uid";

#[derive(Default)]
pub struct ClusterState {
    pub deployments: HashMap<String, Value>,
    pub config_maps: HashMap<String, Value>,
    pub deployment_creates: u32,
    pub resource_version: u64,
    /// Serve a FailedMount pod event and hold readiness until the
    /// deployment is updated.
    pub fail_mounts: bool,
    pub replicaset_deleted: bool,
    pub pod_deleted: bool,
}

pub type SharedState = Arc<Mutex<ClusterState>>;

fn status_response(code: u16, reason: &str) -> Response<Body> {
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": reason,
        "reason": reason,
        "code": code,
    });
    Response::builder()
        .status(StatusCode::from_u16(code).expect("status code"))
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&body).expect("status body"),
        ))
        .expect("response")
}

fn json_response(value: &Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(value).expect("json body"),
        ))
        .expect("response")
}

fn list_response(
    kind: &str,
    api_version: &str,
    items: Vec<Value>,
) -> Response<Body> {
    json_response(&json!({
        "kind": kind,
        "apiVersion": api_version,
        "metadata": {},
        "items": items,
    }))
}

fn with_status(mut deployment: Value, rv: u64, ready: bool) -> Value {
    let replicas = deployment["spec"]["replicas"].clone();
    let name = deployment["metadata"]["name"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    deployment["metadata"]["uid"] = json!(format!("uid-{name}"));
    deployment["metadata"]["resourceVersion"] =
        json!(rv.to_string());
    deployment["status"] = if ready {
        json!({ "readyReplicas": replicas })
    } else {
        json!({ "readyReplicas": 0 })
    };
    deployment
}

fn deployment_uid(state: &ClusterState) -> String {
    state
        .deployments
        .values()
        .next()
        .and_then(|d| d["metadata"]["uid"].as_str())
        .unwrap_or_default()
        .to_string()
}

fn replica_set(owner_uid: &str) -> Value {
    json!({
        "metadata": {
            "name": REPLICASET_NAME,
            "namespace": "default",
            "uid": REPLICASET_UID,
            "ownerReferences": [{
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "name": "builder",
                "uid": owner_uid,
            }],
        },
        "spec": {},
    })
}

fn pod() -> Value {
    json!({
        "metadata": {
            "name": POD_NAME,
            "namespace": "default",
            "uid": POD_UID,
            "ownerReferences": [{
                "apiVersion": "apps/v1",
                "kind": "ReplicaSet",
                "name": REPLICASET_NAME,
                "uid": REPLICASET_UID,
            }],
        },
        "spec": { "containers": [] },
        "status": { "phase": "Pending" },
    })
}

fn mount_failure_event() -> Value {
    json!({
        "metadata": { "name": "flip-event", "namespace": "default" },
        "involvedObject": {
            "kind": "Pod",
            "name": POD_NAME,
            "uid": POD_UID,
        },
        "type": "Warning",
        "reason": "FailedMount",
        "message": "MountVolume.SetUp failed for volume \"docker-sock\": hostPath type check failed: /var/run/docker.sock is not a socket file",
    })
}

async fn handle(
    state: SharedState,
    req: Request<Body>,
) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let mut state = state.lock().expect("state lock");
    state.resource_version += 1;
    let rv = state.resource_version;

    let segments: Vec<&str> =
        path.trim_start_matches('/').split('/').collect();
    let resource_and_name = match segments.as_slice() {
        ["apis", "apps", "v1", "namespaces", _, resource, rest @ ..] => {
            Some((*resource, rest.first().copied()))
        }
        ["api", "v1", "namespaces", _, resource, rest @ ..] => {
            Some((*resource, rest.first().copied()))
        }
        _ => None,
    };

    match (method, resource_and_name) {
        (Method::GET, Some(("deployments", Some(name)))) => {
            match state.deployments.get(name) {
                Some(deployment) => json_response(deployment),
                None => status_response(404, "NotFound"),
            }
        }
        (Method::GET, Some(("deployments", None))) => {
            let items: Vec<Value> =
                state.deployments.values().cloned().collect();
            list_response("DeploymentList", "apps/v1", items)
        }
        (Method::POST, Some(("deployments", None))) => {
            let deployment: Value =
                serde_json::from_slice(&body).expect("deployment");
            let name = deployment["metadata"]["name"]
                .as_str()
                .expect("name")
                .to_string();
            if state.deployments.contains_key(&name) {
                return status_response(409, "AlreadyExists");
            }
            let ready = !state.fail_mounts;
            let stored = with_status(deployment, rv, ready);
            state.deployment_creates += 1;
            let _ = state.deployments.insert(name, stored.clone());
            json_response(&stored)
        }
        (Method::PUT, Some(("deployments", Some(name)))) => {
            let deployment: Value =
                serde_json::from_slice(&body).expect("deployment");
            // A rewritten deployment unwedges the mount failure.
            state.fail_mounts = false;
            let stored = with_status(deployment, rv, true);
            let _ = state
                .deployments
                .insert(name.to_string(), stored.clone());
            json_response(&stored)
        }
        (Method::DELETE, Some(("deployments", Some(name)))) => {
            match state.deployments.remove(name) {
                Some(deployment) => json_response(&deployment),
                None => status_response(404, "NotFound"),
            }
        }
        (Method::GET, Some(("configmaps", Some(name)))) => {
            match state.config_maps.get(name) {
                Some(cm) => json_response(cm),
                None => status_response(404, "NotFound"),
            }
        }
        (Method::POST, Some(("configmaps", None))) => {
            let mut cm: Value =
                serde_json::from_slice(&body).expect("configmap");
            let name = cm["metadata"]["name"]
                .as_str()
                .expect("name")
                .to_string();
            if state.config_maps.contains_key(&name) {
                return status_response(409, "AlreadyExists");
            }
            cm["metadata"]["resourceVersion"] =
                json!(rv.to_string());
            let _ = state.config_maps.insert(name, cm.clone());
            json_response(&cm)
        }
        (Method::PUT, Some(("configmaps", Some(name)))) => {
            let cm: Value =
                serde_json::from_slice(&body).expect("configmap");
            let _ =
                state.config_maps.insert(name.to_string(), cm.clone());
            json_response(&cm)
        }
        (Method::DELETE, Some(("configmaps", Some(name)))) => {
            match state.config_maps.remove(name) {
                Some(cm) => json_response(&cm),
                None => status_response(404, "NotFound"),
            }
        }
        (Method::GET, Some(("replicasets", None))) => {
            if state.fail_mounts && !state.deployments.is_empty() {
                let owner = deployment_uid(&state);
                list_response(
                    "ReplicaSetList",
                    "apps/v1",
                    vec![replica_set(&owner)],
                )
            } else {
                list_response("ReplicaSetList", "apps/v1", Vec::new())
            }
        }
        (Method::DELETE, Some(("replicasets", Some(_)))) => {
            state.replicaset_deleted = true;
            json_response(&json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Success",
            }))
        }
        (Method::GET, Some(("pods", None))) => {
            if state.fail_mounts {
                list_response("PodList", "v1", vec![pod()])
            } else {
                list_response("PodList", "v1", Vec::new())
            }
        }
        (Method::DELETE, Some(("pods", Some(_)))) => {
            state.pod_deleted = true;
            json_response(&json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Success",
            }))
        }
        (Method::GET, Some(("events", None))) => {
            let pod_events = state.fail_mounts
                && query.contains(&format!(
                    "involvedObject.name={POD_NAME}"
                ));
            if pod_events {
                list_response(
                    "EventList",
                    "v1",
                    vec![mount_failure_event()],
                )
            } else {
                list_response("EventList", "v1", Vec::new())
            }
        }
        (method, _) => {
            panic!("unexpected request {method} {path}")
        }
    }
}

pub fn fake_kube_client(state: SharedState) -> kube::Client {
    let service = tower::service_fn(move |req: Request<Body>| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, std::convert::Infallible>(
                handle(state, req).await,
            )
        }
    });
    kube::Client::new(service, "default")
}

pub async fn new_driver(
    state: SharedState,
    name: &str,
) -> Arc<dyn Driver> {
    new_driver_with_opts(state, name, &[]).await
}

pub async fn new_driver_with_opts(
    state: SharedState,
    name: &str,
    opts: &[(&str, &str)],
) -> Arc<dyn Driver> {
    KubernetesFactory::default()
        .new_driver(InitConfig {
            name: name.to_string(),
            kube_client: fake_kube_client(state),
            namespace: "default".to_string(),
            buildkit_flags: Vec::new(),
            config_file: None,
            driver_opts: opts
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            context_path_hash: "test-hash".to_string(),
        })
        .await
        .expect("driver")
}
