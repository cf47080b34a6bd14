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

//! A thin registry client: resolve references, fetch content, combine
//! per-platform manifests into an index, push by digest.

use crate::error::{BuildError, Result};
use kubuild_driver::RegistryAuth;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

mod reference;

pub use reference::ImageReference;

pub const MEDIA_TYPE_OCI_INDEX: &str =
    "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

const ACCEPT_MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// A content descriptor as carried in manifests and indexes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    config: Descriptor,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
    #[serde(default)]
    variant: Option<String>,
}

#[derive(Debug, Serialize)]
struct Index {
    #[serde(rename = "schemaVersion")]
    schema_version: i32,
    #[serde(rename = "mediaType")]
    media_type: String,
    manifests: Vec<Descriptor>,
}

/// Registry client carrying one credential source.
pub struct Resolver {
    auth: Arc<dyn RegistryAuth>,
    http: reqwest::Client,
    tokens: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver").finish()
    }
}

impl Resolver {
    pub fn new(auth: Arc<dyn RegistryAuth>) -> Self {
        Self {
            auth,
            http: reqwest::Client::new(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a reference to its canonical form plus descriptor.
    pub async fn resolve(
        &self,
        reference: &str,
    ) -> Result<(ImageReference, Descriptor)> {
        let parsed: ImageReference = reference.parse()?;
        let (bytes, desc) = self.fetch_manifest(&parsed).await?;
        drop(bytes);
        Ok((parsed, desc))
    }

    /// Fetch the manifest bytes a reference points at.
    pub async fn get(
        &self,
        reference: &str,
    ) -> Result<(Vec<u8>, Descriptor)> {
        let parsed: ImageReference = reference.parse()?;
        self.fetch_manifest(&parsed).await
    }

    /// Combine per-platform manifest descriptors into an index for
    /// `reference`'s repository, filling in each entry's platform from
    /// its image config.
    pub async fn combine(
        &self,
        reference: &str,
        descs: Vec<Descriptor>,
    ) -> Result<(Vec<u8>, Descriptor)> {
        let parsed: ImageReference = reference.parse()?;
        let mut manifests = Vec::with_capacity(descs.len());
        for desc in descs {
            let by_digest = parsed.with_digest(&desc.digest);
            let (bytes, mut fetched) =
                self.fetch_manifest(&by_digest).await?;
            let manifest: Manifest = serde_json::from_slice(&bytes)
                .map_err(|e| BuildError::Registry {
                    reason: format!(
                        "invalid manifest {}: {e}",
                        desc.digest
                    ),
                })?;
            let config = self
                .fetch_blob(&parsed, &manifest.config.digest)
                .await?;
            let config: ImageConfig =
                serde_json::from_slice(&config).map_err(|e| {
                    BuildError::Registry {
                        reason: format!(
                            "invalid image config {}: {e}",
                            manifest.config.digest
                        ),
                    }
                })?;
            fetched.platform = Some(Platform {
                architecture: config.architecture,
                os: config.os,
                variant: config.variant,
            });
            manifests.push(fetched);
        }

        let index = Index {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            manifests,
        };
        let bytes = serde_json::to_vec(&index)
            .map_err(|e| BuildError::Registry {
                reason: format!("failed to encode index: {e}"),
            })?;
        let desc = Descriptor {
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            digest: digest_of(&bytes),
            size: bytes.len() as i64,
            platform: None,
        };
        Ok((bytes, desc))
    }

    /// Push manifest content under `reference`'s tag.
    pub async fn push(
        &self,
        reference: &str,
        desc: &Descriptor,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let parsed: ImageReference = reference.parse()?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            parsed.registry_url(),
            parsed.repository,
            parsed.tag
        );
        debug!("pushing {} to {url}", desc.digest);
        let resp = self
            .request(
                &parsed,
                self.http
                    .put(&url)
                    .header("Content-Type", desc.media_type.clone())
                    .body(bytes),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(BuildError::Registry {
                reason: format!(
                    "push of {} failed: {}",
                    reference,
                    resp.status()
                ),
            });
        }
        Ok(())
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<(Vec<u8>, Descriptor)> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            reference.registry_url(),
            reference.repository,
            reference.digest_or_tag()
        );
        let resp = self
            .request(
                reference,
                self.http
                    .get(&url)
                    .header("Accept", ACCEPT_MANIFEST_TYPES),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(BuildError::Registry {
                reason: format!(
                    "failed to resolve {}: {}",
                    reference,
                    resp.status()
                ),
            });
        }

        let media_type = resp
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let header_digest = resp
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BuildError::Registry {
                reason: format!("failed to read manifest: {e}"),
            })?
            .to_vec();
        let digest =
            header_digest.unwrap_or_else(|| digest_of(&bytes));
        let size = bytes.len() as i64;
        Ok((
            bytes,
            Descriptor { media_type, digest, size, platform: None },
        ))
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v2/{}/blobs/{digest}",
            reference.registry_url(),
            reference.repository
        );
        let resp =
            self.request(reference, self.http.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(BuildError::Registry {
                reason: format!(
                    "failed to fetch blob {digest}: {}",
                    resp.status()
                ),
            });
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|e| BuildError::Registry {
                reason: format!("failed to read blob: {e}"),
            })?
            .to_vec())
    }

    /// Issue a request, exchanging credentials for a bearer token on
    /// an auth challenge.
    async fn request(
        &self,
        reference: &ImageReference,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let cached = {
            let tokens = self.tokens.lock().await;
            tokens.get(&reference.host).cloned()
        };
        let attempt = match &cached {
            Some(token) => builder
                .try_clone()
                .ok_or_else(|| BuildError::Registry {
                    reason: "request not retryable".to_string(),
                })?
                .bearer_auth(token),
            None => builder.try_clone().ok_or_else(|| {
                BuildError::Registry {
                    reason: "request not retryable".to_string(),
                }
            })?,
        };

        let resp =
            attempt.send().await.map_err(|e| BuildError::Registry {
                reason: format!("registry request failed: {e}"),
            })?;
        if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get("Www-Authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let token = self.exchange_token(reference, &challenge).await?;
        {
            let mut tokens = self.tokens.lock().await;
            let _ = tokens
                .insert(reference.host.clone(), token.clone());
        }

        builder.bearer_auth(token).send().await.map_err(|e| {
            BuildError::Registry {
                reason: format!("registry request failed: {e}"),
            }
        })
    }

    async fn exchange_token(
        &self,
        reference: &ImageReference,
        challenge: &str,
    ) -> Result<String> {
        let params = parse_challenge(challenge);
        let realm =
            params.get("realm").ok_or_else(|| BuildError::Registry {
                reason: format!(
                    "unsupported auth challenge: {challenge:?}"
                ),
            })?;

        let mut request = self.http.get(realm);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service)]);
        }
        if let Some(scope) = params.get("scope") {
            request = request.query(&[("scope", scope)]);
        } else {
            request = request.query(&[(
                "scope",
                &format!("repository:{}:pull,push", reference.repository),
            )]);
        }

        let (username, secret) =
            self.auth.credentials(&reference.host).await?;
        if !username.is_empty() {
            request = request.basic_auth(username, Some(secret));
        } else if !secret.is_empty() {
            // Identity tokens ride the password slot.
            request = request.bearer_auth(secret);
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: String,
            #[serde(default)]
            access_token: String,
        }
        let resp: TokenResponse = request
            .send()
            .await
            .map_err(|e| BuildError::Registry {
                reason: format!("token exchange failed: {e}"),
            })?
            .json()
            .await
            .map_err(|e| BuildError::Registry {
                reason: format!("invalid token response: {e}"),
            })?;
        let token = if resp.token.is_empty() {
            resp.access_token
        } else {
            resp.token
        };
        if token.is_empty() {
            return Err(BuildError::Registry {
                reason: "token exchange returned no token".to_string(),
            });
        }
        Ok(token)
    }
}

pub fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

fn parse_challenge(header: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let header = header.trim_start_matches("Bearer ");
    for field in header.split(',') {
        if let Some((key, value)) = field.trim().split_once('=') {
            let _ = out.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        let a = digest_of(b"content");
        let b = digest_of(b"content");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn test_parse_challenge() {
        let params = parse_challenge(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\",scope=\"repository:library/alpine:pull\"",
        );
        assert_eq!(
            params.get("realm").map(String::as_str),
            Some("https://auth.docker.io/token")
        );
        assert_eq!(
            params.get("service").map(String::as_str),
            Some("registry.docker.io")
        );
    }

    #[test]
    fn test_index_serialization_shape() {
        let index = Index {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            manifests: vec![Descriptor {
                media_type:
                    "application/vnd.oci.image.manifest.v1+json"
                        .to_string(),
                digest: "sha256:abc".to_string(),
                size: 3,
                platform: Some(Platform {
                    architecture: "amd64".to_string(),
                    os: "linux".to_string(),
                    variant: None,
                }),
            }],
        };
        let value = serde_json::to_value(&index).expect("encode");
        assert_eq!(value["schemaVersion"], 2);
        assert_eq!(value["mediaType"], MEDIA_TYPE_OCI_INDEX);
        assert_eq!(
            value["manifests"][0]["platform"]["architecture"],
            "amd64"
        );
        assert!(value["manifests"][0]["platform"]
            .get("variant")
            .is_none());
    }
}
