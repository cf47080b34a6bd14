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

//! Registry credentials resolved lazily from a cluster secret.
//!
//! The secret is the standard registry pull secret (data key
//! `.dockerconfigjson`). A missing secret is a soft failure: the build
//! proceeds anonymously and a hint is recorded so a later auth failure
//! can explain what to fix.

use super::KubernetesDriverState;
use crate::error::{DriverError, Result};
use crate::RegistryAuth;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use kubuild_client::session::Attachable;
use kubuild_proto::filesync::auth_server::{Auth, AuthServer};
use kubuild_proto::filesync::{
    CredentialsRequest, CredentialsResponse, FetchTokenRequest,
    FetchTokenResponse, GetTokenAuthorityRequest,
    GetTokenAuthorityResponse, VerifyTokenAuthorityRequest,
    VerifyTokenAuthorityResponse,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::transport::server::Router;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

// Credential stores keyed Docker Hub under the legacy v1 endpoint; the
// daemon asks for the v2 hostname.
const DOCKER_HUB_HOST: &str = "registry-1.docker.io";
const DOCKER_HUB_CONFIG_HOST: &str = "https://index.docker.io/v1/";

#[derive(Debug, Clone, Default, Deserialize)]
struct Creds {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    auth: String,
    #[serde(default)]
    identitytoken: String,
}

#[derive(Debug, Default, Deserialize)]
struct CredStore {
    #[serde(default)]
    auths: HashMap<String, Creds>,
}

/// Session attachable and imagetools credential source backed by one
/// named cluster secret.
#[derive(Clone)]
pub struct KubeAuthProvider {
    secret_api: Api<Secret>,
    secret_name: String,
    state: Arc<KubernetesDriverState>,
    cached: Arc<Mutex<Option<Secret>>>,
}

impl KubeAuthProvider {
    pub fn new(
        secret_api: Api<Secret>,
        secret_name: String,
        state: Arc<KubernetesDriverState>,
    ) -> Self {
        Self {
            secret_api,
            secret_name,
            state,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    async fn lookup(
        &self,
        host: &str,
    ) -> Result<CredentialsResponse> {
        let host = if host == DOCKER_HUB_HOST {
            DOCKER_HUB_CONFIG_HOST
        } else {
            host
        };

        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            // Soft failure: record a hint and serve anonymous
            // credentials so public-image builds keep working.
            match self.secret_api.get(&self.secret_name).await {
                Ok(secret) => *cached = Some(secret),
                Err(kube::Error::Api(resp)) if resp.code == 404 => {
                    self.state.set_auth_hint(format!(
                        "unable to find secret \"{}\" - if you used a different name specify with --registry-secret - if you haven't created a secret yet follow these instructions https://kubernetes.io/docs/tasks/configure-pod-container/pull-image-private-registry/",
                        self.secret_name
                    ));
                    return Ok(CredentialsResponse::default());
                }
                Err(e) => {
                    self.state.set_auth_hint(format!(
                        "failed to lookup secret \"{}\": {e}",
                        self.secret_name
                    ));
                    return Ok(CredentialsResponse::default());
                }
            }
        }
        let secret = cached.as_ref().expect("populated above");

        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DOCKER_CONFIG_KEY))
            .ok_or_else(|| DriverError::MalformedRegistrySecret {
                reason: format!(
                    "missing '{DOCKER_CONFIG_KEY}' data key"
                ),
            })?;
        let store: CredStore = serde_json::from_slice(&data.0)
            .map_err(|e| DriverError::MalformedRegistrySecret {
                reason: format!(
                    "'{DOCKER_CONFIG_KEY}' didn't contain a valid cred store: {e}"
                ),
            })?;

        let mut creds = match store.auths.get(host) {
            Some(creds) => creds.clone(),
            None => {
                info!(
                    "no credentials found for registry {host} (proceeding with anonymous auth)"
                );
                Creds::default()
            }
        };
        if (creds.username.is_empty() || creds.password.is_empty())
            && !creds.auth.is_empty()
        {
            let (username, password) = decode_auth(&creds.auth)?;
            creds.username = username;
            creds.password = password;
        }

        let resp = if creds.identitytoken.is_empty() {
            CredentialsResponse {
                username: creds.username,
                secret: creds.password,
            }
        } else {
            CredentialsResponse {
                username: String::new(),
                secret: creds.identitytoken,
            }
        };
        Ok(resp)
    }
}

impl Attachable for KubeAuthProvider {
    fn attach(&self, router: Router) -> Router {
        router.add_service(AuthServer::new(self.clone()))
    }
}

#[tonic::async_trait]
impl Auth for KubeAuthProvider {
    async fn credentials(
        &self,
        request: Request<CredentialsRequest>,
    ) -> std::result::Result<Response<CredentialsResponse>, Status> {
        let host = request.into_inner().host;
        debug!("credentials requested for {host}");
        let resp = self
            .lookup(&host)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(resp))
    }

    async fn fetch_token(
        &self,
        _request: Request<FetchTokenRequest>,
    ) -> std::result::Result<Response<FetchTokenResponse>, Status> {
        Err(Status::unimplemented(
            "token fetch is delegated to the registry exchange",
        ))
    }

    async fn get_token_authority(
        &self,
        _request: Request<GetTokenAuthorityRequest>,
    ) -> std::result::Result<Response<GetTokenAuthorityResponse>, Status>
    {
        Err(Status::unimplemented("no token authority configured"))
    }

    async fn verify_token_authority(
        &self,
        _request: Request<VerifyTokenAuthorityRequest>,
    ) -> std::result::Result<Response<VerifyTokenAuthorityResponse>, Status>
    {
        Err(Status::unimplemented("no token authority configured"))
    }
}

#[async_trait::async_trait]
impl RegistryAuth for KubeAuthProvider {
    async fn credentials(
        &self,
        registry_hostname: &str,
    ) -> Result<(String, String)> {
        let resp = self.lookup(registry_hostname).await?;
        Ok((resp.username, resp.secret))
    }
}

/// Split a base64 `username:password` blob; registry tooling pads the
/// password with trailing NULs which must be stripped.
pub fn decode_auth(auth: &str) -> Result<(String, String)> {
    if auth.is_empty() {
        return Ok((String::new(), String::new()));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth)
        .map_err(|e| DriverError::MalformedRegistrySecret {
            reason: format!("failed to decode auth: {e}"),
        })?;
    let decoded = String::from_utf8_lossy(&decoded);
    let (username, password) = decoded.split_once(':').ok_or_else(|| {
        DriverError::MalformedRegistrySecret {
            reason: "auth is not username:password".to_string(),
        }
    })?;
    Ok((
        username.to_string(),
        password.trim_end_matches('\0').to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_auth_round_trip() {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode("user:pa:ss:word");
        let (user, pass) = decode_auth(&encoded).expect("decode");
        assert_eq!(user, "user");
        assert_eq!(pass, "pa:ss:word");
    }

    #[test]
    fn test_decode_auth_strips_trailing_nuls() {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode("user:secret\0\0");
        let (_, pass) = decode_auth(&encoded).expect("decode");
        assert_eq!(pass, "secret");
    }

    #[test]
    fn test_decode_auth_empty() {
        let (user, pass) = decode_auth("").expect("decode");
        assert!(user.is_empty());
        assert!(pass.is_empty());
    }

    #[test]
    fn test_decode_auth_without_separator_fails() {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode("no-colon");
        assert!(decode_auth(&encoded).is_err());
    }

    #[test]
    fn test_cred_store_parses_registry_secret() {
        let raw = br#"{"auths":{"ghcr.io":{"username":"u","password":"p"}}}"#;
        let store: CredStore =
            serde_json::from_slice(raw).expect("parse");
        let creds = store.auths.get("ghcr.io").expect("entry");
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p");
    }
}
