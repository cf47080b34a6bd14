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

//! Image reference parsing and normalization.

use crate::error::{BuildError, Result};
use std::fmt;
use std::str::FromStr;

const DEFAULT_HOST: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

/// A normalized image reference: host, repository, tag, and an
/// optional pinning digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub host: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn registry_url(&self) -> String {
        if self.host.starts_with("localhost")
            || self.host.starts_with("127.")
        {
            format!("http://{}", self.host)
        } else {
            format!("https://{}", self.host)
        }
    }

    pub fn digest_or_tag(&self) -> String {
        self.digest.clone().unwrap_or_else(|| self.tag.clone())
    }

    pub fn with_digest(&self, digest: &str) -> Self {
        Self { digest: Some(digest.to_string()), ..self.clone() }
    }

    /// Repository-qualified name without tag or digest.
    pub fn repo_only(&self) -> String {
        format!("{}/{}", self.host, self.repository)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(BuildError::InvalidTag {
                tag: s.to_string(),
                reason: "empty reference".to_string(),
            });
        }

        let (remainder, digest) = match s.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (s, None),
        };

        // A colon after the last slash is the tag separator; earlier
        // colons belong to a host:port.
        let (name, tag) = match remainder.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => {
                (name, tag.to_string())
            }
            _ => (remainder, DEFAULT_TAG.to_string()),
        };
        if name.is_empty() {
            return Err(BuildError::InvalidTag {
                tag: s.to_string(),
                reason: "missing repository".to_string(),
            });
        }

        let (host, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.')
                    || first.contains(':')
                    || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => {
                let repository = if name.contains('/') {
                    name.to_string()
                } else {
                    format!("library/{name}")
                };
                (DEFAULT_HOST.to_string(), repository)
            }
        };
        if repository.is_empty() {
            return Err(BuildError::InvalidTag {
                tag: s.to_string(),
                reason: "missing repository".to_string(),
            });
        }

        Ok(Self { host, repository, tag, digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_normalizes_to_docker_hub() {
        let parsed: ImageReference =
            "alpine".parse().expect("parse");
        assert_eq!(parsed.host, DEFAULT_HOST);
        assert_eq!(parsed.repository, "library/alpine");
        assert_eq!(parsed.tag, "latest");
    }

    #[test]
    fn test_org_name_keeps_repository() {
        let parsed: ImageReference =
            "myorg/app:v2".parse().expect("parse");
        assert_eq!(parsed.host, DEFAULT_HOST);
        assert_eq!(parsed.repository, "myorg/app");
        assert_eq!(parsed.tag, "v2");
    }

    #[test]
    fn test_registry_with_port() {
        let parsed: ImageReference =
            "localhost:5000/app:dev".parse().expect("parse");
        assert_eq!(parsed.host, "localhost:5000");
        assert_eq!(parsed.repository, "app");
        assert_eq!(parsed.tag, "dev");
        assert!(parsed.registry_url().starts_with("http://"));
    }

    #[test]
    fn test_digest_reference() {
        let parsed: ImageReference =
            "ghcr.io/org/app@sha256:abcd".parse().expect("parse");
        assert_eq!(parsed.host, "ghcr.io");
        assert_eq!(
            parsed.digest.as_deref(),
            Some("sha256:abcd")
        );
        assert_eq!(parsed.digest_or_tag(), "sha256:abcd");
    }

    #[test]
    fn test_empty_reference_rejected() {
        assert!("".parse::<ImageReference>().is_err());
    }

    #[test]
    fn test_repo_only_strips_tag() {
        let parsed: ImageReference =
            "ghcr.io/org/app:v1".parse().expect("parse");
        assert_eq!(parsed.repo_only(), "ghcr.io/org/app");
    }
}
