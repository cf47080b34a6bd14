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

//! Build secrets served from local files or environment variables
//! (`--secret id=mykey,src=/path/to/file`).

use super::Attachable;
use kubuild_proto::secrets::secrets_server::{Secrets, SecretsServer};
use kubuild_proto::secrets::{GetSecretRequest, GetSecretResponse};
use std::collections::HashMap;
use thiserror::Error;
use tonic::transport::server::Router;
use tonic::{Request, Response, Status};
use tracing::debug;

#[derive(Error, Debug)]
pub enum SecretSpecError {
    #[error("empty secret specification")]
    EmptySpec,
    #[error("unknown secret field '{field}'")]
    UnknownField { field: String },
    #[error("secret specification is missing an id")]
    MissingId,
}

#[derive(Debug, Clone)]
enum SecretSource {
    File(String),
    Env(String),
}

/// Secrets the daemon may look up during a build, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    sources: HashMap<String, SecretSource>,
}

impl SecretStore {
    /// Parse `id=<id>[,src=<path>|,env=<name>]` specs. A bare `id` falls
    /// back to the environment variable of the same name.
    pub fn from_specs(
        specs: &[String],
    ) -> Result<Self, SecretSpecError> {
        let mut sources = HashMap::new();
        for spec in specs {
            let mut id = None;
            let mut source = None;
            for field in spec.split(',') {
                if field.is_empty() {
                    return Err(SecretSpecError::EmptySpec);
                }
                match field.split_once('=') {
                    Some(("id", v)) => id = Some(v.to_string()),
                    Some(("src", v)) | Some(("source", v)) => {
                        source = Some(SecretSource::File(v.to_string()))
                    }
                    Some(("env", v)) => {
                        source = Some(SecretSource::Env(v.to_string()))
                    }
                    Some((k, _)) => {
                        return Err(SecretSpecError::UnknownField {
                            field: k.to_string(),
                        })
                    }
                    None => id = Some(field.to_string()),
                }
            }
            let id = id.ok_or(SecretSpecError::MissingId)?;
            let source =
                source.unwrap_or_else(|| SecretSource::Env(id.clone()));
            let _ = sources.insert(id, source);
        }
        Ok(Self { sources })
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl Attachable for SecretStore {
    fn attach(&self, router: Router) -> Router {
        router.add_service(SecretsServer::new(self.clone()))
    }
}

#[tonic::async_trait]
impl Secrets for SecretStore {
    async fn get_secret(
        &self,
        request: Request<GetSecretRequest>,
    ) -> Result<Response<GetSecretResponse>, Status> {
        let id = request.into_inner().id;
        debug!("secret lookup for id {id}");
        let source = self.sources.get(&id).ok_or_else(|| {
            Status::not_found(format!("no secret with id {id}"))
        })?;
        let data = match source {
            SecretSource::File(path) => {
                tokio::fs::read(path).await.map_err(|e| {
                    Status::internal(format!(
                        "failed to read secret {id} from {path}: {e}"
                    ))
                })?
            }
            SecretSource::Env(name) => std::env::var(name)
                .map_err(|_| {
                    Status::not_found(format!(
                        "secret {id}: environment variable {name} not set"
                    ))
                })?
                .into_bytes(),
        };
        Ok(Response::new(GetSecretResponse { data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_spec() {
        let store = SecretStore::from_specs(&[
            "id=npmrc,src=/home/user/.npmrc".to_string(),
        ])
        .expect("parse");
        assert!(matches!(
            store.sources.get("npmrc"),
            Some(SecretSource::File(p)) if p == "/home/user/.npmrc"
        ));
    }

    #[test]
    fn test_bare_id_defaults_to_env() {
        let store =
            SecretStore::from_specs(&["API_TOKEN".to_string()])
                .expect("parse");
        assert!(matches!(
            store.sources.get("API_TOKEN"),
            Some(SecretSource::Env(n)) if n == "API_TOKEN"
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = SecretStore::from_specs(&[
            "id=x,mode=0400".to_string(),
        ])
        .expect_err("must fail");
        assert!(matches!(
            err,
            SecretSpecError::UnknownField { field } if field == "mode"
        ));
    }

    #[tokio::test]
    async fn test_get_secret_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("token");
        std::fs::write(&path, b"hunter2").expect("write");

        let store = SecretStore::from_specs(&[format!(
            "id=token,src={}",
            path.display()
        )])
        .expect("parse");

        let resp = store
            .get_secret(Request::new(GetSecretRequest {
                id: "token".to_string(),
                annotations: HashMap::new(),
            }))
            .await
            .expect("get_secret");
        assert_eq!(resp.into_inner().data, b"hunter2");
    }

    #[tokio::test]
    async fn test_get_secret_unknown_id() {
        let store = SecretStore::default();
        let status = store
            .get_secret(Request::new(GetSecretRequest {
                id: "nope".to_string(),
                annotations: HashMap::new(),
            }))
            .await
            .expect_err("must fail");
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
