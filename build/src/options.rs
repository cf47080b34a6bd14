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

//! Build request options and the output-specification parser.

use crate::error::{BuildError, Result};
use kubuild_client::session::Attachable;
use kubuild_client::CacheEntry;
use kubuild_driver::Platform;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Build context and dockerfile sources. `-` selects standard input
/// for either (not both).
pub struct Inputs {
    pub context_path: String,
    pub dockerfile_path: String,
    pub in_stream: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl std::fmt::Debug for Inputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inputs")
            .field("context_path", &self.context_path)
            .field("dockerfile_path", &self.dockerfile_path)
            .finish()
    }
}

/// One requested output, before per-driver rewriting.
#[derive(Debug, Clone, Default)]
pub struct ExportSpec {
    pub kind: String,
    pub attrs: HashMap<String, String>,
}

/// A single target's build request.
#[derive(Default)]
pub struct Options {
    pub inputs: Option<Inputs>,
    pub tags: Vec<String>,
    pub labels: HashMap<String, String>,
    pub build_args: HashMap<String, String>,
    pub pull: bool,
    pub image_id_file: Option<PathBuf>,
    pub extra_hosts: Vec<String>,
    pub network_mode: String,
    pub no_cache: bool,
    pub target: String,
    pub platforms: Vec<Platform>,
    pub exports: Vec<ExportSpec>,
    pub session: Vec<Arc<dyn Attachable>>,
    pub cache_from: Vec<CacheEntry>,
    pub cache_to: Vec<CacheEntry>,
    pub allow: Vec<String>,
    pub frontend_image: Option<String>,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("inputs", &self.inputs)
            .field("tags", &self.tags)
            .field("platforms", &self.platforms)
            .field("exports", &self.exports)
            .finish()
    }
}

/// Parse `--output type=image,name=...,push=true` style specs. A bare
/// value is shorthand: `-` and `tar` aside, it names a local directory.
pub fn parse_outputs(specs: &[String]) -> Result<Vec<ExportSpec>> {
    let mut out = Vec::new();
    for spec in specs {
        if spec.is_empty() {
            continue;
        }
        if !spec.contains('=') {
            // Shorthand: a destination path implies the local exporter.
            out.push(ExportSpec {
                kind: "local".to_string(),
                attrs: HashMap::from([(
                    "dest".to_string(),
                    spec.clone(),
                )]),
            });
            continue;
        }
        let mut export = ExportSpec::default();
        for field in spec.split(',') {
            let (key, value) = field.split_once('=').ok_or_else(|| {
                BuildError::InvalidOutputSpec {
                    spec: spec.clone(),
                    reason: format!("field {field:?} must be key=value"),
                }
            })?;
            match key {
                "type" => export.kind = value.to_string(),
                _ => {
                    let _ = export
                        .attrs
                        .insert(key.to_string(), value.to_string());
                }
            }
        }
        if export.kind.is_empty() {
            return Err(BuildError::InvalidOutputSpec {
                spec: spec.clone(),
                reason: "type is required".to_string(),
            });
        }
        out.push(export);
    }
    Ok(out)
}

/// Render `--add-host` entries into the frontend attribute format,
/// validating `host:ip` shape.
pub fn to_extra_hosts(hosts: &[String]) -> Result<String> {
    let mut out = Vec::with_capacity(hosts.len());
    for host in hosts {
        let Some((name, ip)) = host.split_once(':') else {
            return Err(BuildError::InvalidExtraHost {
                host: host.clone(),
            });
        };
        if name.is_empty() || ip.is_empty() {
            return Err(BuildError::InvalidExtraHost {
                host: host.clone(),
            });
        }
        out.push(format!("{name}={ip}"));
    }
    Ok(out.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_output() {
        let outputs = parse_outputs(&[
            "type=image,name=registry.example.com/app:v1,push=true"
                .to_string(),
        ])
        .expect("parse");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, "image");
        assert_eq!(
            outputs[0].attrs.get("push"),
            Some(&"true".to_string())
        );
    }

    #[test]
    fn test_parse_shorthand_local_dir() {
        let outputs =
            parse_outputs(&["./out".to_string()]).expect("parse");
        assert_eq!(outputs[0].kind, "local");
        assert_eq!(
            outputs[0].attrs.get("dest"),
            Some(&"./out".to_string())
        );
    }

    #[test]
    fn test_parse_missing_type_rejected() {
        let err = parse_outputs(&["dest=out.tar".to_string()])
            .expect_err("must fail");
        assert!(matches!(
            err,
            BuildError::InvalidOutputSpec { .. }
        ));
    }

    #[test]
    fn test_extra_hosts_render() {
        let rendered = to_extra_hosts(&[
            "db:10.0.0.2".to_string(),
            "cache:10.0.0.3".to_string(),
        ])
        .expect("render");
        assert_eq!(rendered, "db=10.0.0.2,cache=10.0.0.3");
    }

    #[test]
    fn test_extra_hosts_invalid() {
        assert!(matches!(
            to_extra_hosts(&["nocolon".to_string()]),
            Err(BuildError::InvalidExtraHost { .. })
        ));
    }
}
