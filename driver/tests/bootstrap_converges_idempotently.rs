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

//! Convergence against an in-memory API-server stand-in: bootstrap is
//! idempotent, safe under concurrent CLIs, and rm followed by
//! bootstrap lands in the same state as bootstrap alone.

use kubuild_driver::BootLog;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod common;

#[tokio::test]
async fn test_bootstrap_creates_exactly_one_pair() {
    let state = common::SharedState::default();
    let driver = common::new_driver(Arc::clone(&state), "demo").await;

    driver
        .bootstrap(&BootLog::sink(), &CancellationToken::new())
        .await
        .expect("bootstrap");

    let state = state.lock().expect("state lock");
    assert_eq!(state.deployments.len(), 1);
    assert_eq!(state.config_maps.len(), 1);
    assert!(state.deployments.contains_key("demo"));
    assert!(state.config_maps.contains_key("demo"));
}

#[tokio::test]
async fn test_bootstrap_is_idempotent() {
    let state = common::SharedState::default();
    let driver = common::new_driver(Arc::clone(&state), "demo").await;

    let cancel = CancellationToken::new();
    driver
        .bootstrap(&BootLog::sink(), &cancel)
        .await
        .expect("first bootstrap");
    let creates_after_first =
        state.lock().expect("state lock").deployment_creates;

    driver
        .bootstrap(&BootLog::sink(), &cancel)
        .await
        .expect("second bootstrap");

    let state = state.lock().expect("state lock");
    assert_eq!(state.deployment_creates, creates_after_first);
    assert_eq!(state.deployments.len(), 1);
    assert_eq!(state.config_maps.len(), 1);
}

#[tokio::test]
async fn test_concurrent_bootstraps_both_converge() {
    let state = common::SharedState::default();
    let a = common::new_driver(Arc::clone(&state), "shared").await;
    let b = common::new_driver(Arc::clone(&state), "shared").await;

    let cancel = CancellationToken::new();
    let (ra, rb) = tokio::join!(
        a.bootstrap(&BootLog::sink(), &cancel),
        b.bootstrap(&BootLog::sink(), &cancel),
    );
    ra.expect("first CLI converges");
    rb.expect("second CLI converges");

    let state = state.lock().expect("state lock");
    assert_eq!(state.deployments.len(), 1);
    assert_eq!(state.config_maps.len(), 1);
}

#[tokio::test]
async fn test_rm_then_bootstrap_matches_fresh_bootstrap() {
    let state = common::SharedState::default();
    let driver = common::new_driver(Arc::clone(&state), "demo").await;
    let cancel = CancellationToken::new();

    driver
        .bootstrap(&BootLog::sink(), &cancel)
        .await
        .expect("bootstrap");
    let fresh_spec = state.lock().expect("state lock").deployments
        ["demo"]["spec"]
        .clone();

    driver.rm().await.expect("rm");
    {
        let state = state.lock().expect("state lock");
        assert!(state.deployments.is_empty());
        assert!(state.config_maps.is_empty());
    }

    driver
        .bootstrap(&BootLog::sink(), &cancel)
        .await
        .expect("bootstrap after rm");
    let state = state.lock().expect("state lock");
    assert_eq!(
        state.deployments["demo"]["spec"], fresh_spec,
        "recreated deployment must match the original"
    );
}
