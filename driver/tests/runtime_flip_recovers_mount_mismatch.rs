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

//! A wrong runtime guess shows up as a FailedMount event on the builder
//! pod; convergence must flip the runtime automatically (unless the
//! user pinned it) and still reach Ready.

use kubuild_driver::{BootLog, DriverError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod common;

#[tokio::test]
async fn test_mount_mismatch_flips_runtime_and_converges() {
    let state = common::SharedState::default();
    state.lock().expect("state lock").fail_mounts = true;
    // The default runtime guess is docker; the event will say the
    // docker socket is not a socket file.
    let driver = common::new_driver(Arc::clone(&state), "builder").await;

    driver
        .bootstrap(&BootLog::sink(), &CancellationToken::new())
        .await
        .expect("bootstrap converges after the flip");

    let state = state.lock().expect("state lock");
    assert!(!state.fail_mounts, "deployment was rewritten");
    assert!(state.replicaset_deleted, "stale replica set removed");
    assert!(state.pod_deleted, "wedged pod force-deleted");

    let deployment = state.deployments.get("builder").expect("deployment");
    assert_eq!(
        deployment["metadata"]["labels"]["runtime"], "containerd",
        "runtime label must carry the flipped choice"
    );
    assert_eq!(
        deployment["metadata"]["labels"]["worker"], "containerd",
        "worker wiring must follow the flipped runtime"
    );
}

#[tokio::test]
async fn test_mount_mismatch_with_pinned_runtime_is_fatal() {
    let state = common::SharedState::default();
    state.lock().expect("state lock").fail_mounts = true;
    let driver = common::new_driver_with_opts(
        Arc::clone(&state),
        "builder",
        &[("runtime", "docker")],
    )
    .await;

    let err = driver
        .bootstrap(&BootLog::sink(), &CancellationToken::new())
        .await
        .expect_err("pinned runtime must not flip");
    assert!(matches!(err, DriverError::RuntimeMismatch { .. }));
    assert!(err.to_string().contains("did you pick the correct runtime"));

    let state = state.lock().expect("state lock");
    assert!(state.fail_mounts, "no rewrite may happen");
}
