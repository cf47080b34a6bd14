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

//! Staged OCI layout archives.
//!
//! The exporter ships images as an OCI layout tarball: `index.json`
//! naming one or more manifests, blobs under `blobs/<alg>/<hex>`. The
//! archive is staged to a temp dir so blobs can be re-read during
//! content upload and unpack.

use crate::error::{ImageLoadError, Result};
use serde::Deserialize;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;

// Annotations carrying the image name, in preference order.
const ANNOTATION_IMAGE_NAME: &str = "io.containerd.image.name";
const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

const MEDIA_TYPE_INDEX_MARKERS: [&str; 2] =
    ["image.index", "manifest.list"];

#[derive(Debug, Clone, Deserialize)]
pub struct OciDescriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub annotations: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct OciIndex {
    #[serde(default)]
    manifests: Vec<OciDescriptor>,
}

#[derive(Debug, Deserialize)]
struct OciManifest {
    config: OciDescriptor,
    #[serde(default)]
    layers: Vec<OciDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    rootfs: RootFs,
}

#[derive(Debug, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// One image in the archive, resolved down to its layer chain.
#[derive(Debug, Clone)]
pub struct OciImage {
    /// Runtime-visible name, when the exporter recorded one.
    pub name: Option<String>,
    pub manifest: OciDescriptor,
    pub config: OciDescriptor,
    pub layers: Vec<OciDescriptor>,
    pub diff_ids: Vec<String>,
}

/// An OCI layout tarball staged on local disk.
#[derive(Debug)]
pub struct OciArchive {
    dir: TempDir,
}

impl OciArchive {
    /// Drain `input` and unpack the layout into a temp dir.
    pub async fn stage(
        input: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let unpack_to = dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let reader = SyncIoBridge::new(input);
            let mut archive = tar::Archive::new(reader);
            archive.unpack(&unpack_to)
        })
        .await
        .map_err(|e| ImageLoadError::Other(e.into()))??;
        Ok(Self { dir })
    }

    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (alg, hex) = digest.split_once(':').ok_or_else(|| {
            ImageLoadError::MalformedArchive {
                reason: format!("invalid digest {digest:?}"),
            }
        })?;
        let path = self.dir.path().join("blobs").join(alg).join(hex);
        if !path.exists() {
            return Err(ImageLoadError::MissingBlob {
                digest: digest.to_string(),
            });
        }
        Ok(path)
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.blob_path(digest)?)?)
    }

    /// Every image named by the index, nested indexes flattened.
    pub fn images(&self) -> Result<Vec<OciImage>> {
        let index_raw =
            std::fs::read(self.dir.path().join("index.json")).map_err(
                |_| ImageLoadError::MalformedArchive {
                    reason: "missing index.json".to_string(),
                },
            )?;
        let index: OciIndex = serde_json::from_slice(&index_raw)
            .map_err(|e| ImageLoadError::MalformedArchive {
                reason: format!("invalid index.json: {e}"),
            })?;

        let mut manifests = Vec::new();
        self.flatten(&index.manifests, &mut manifests)?;

        let mut images = Vec::with_capacity(manifests.len());
        for desc in manifests {
            let manifest_raw = self.read_blob(&desc.digest)?;
            let manifest: OciManifest =
                serde_json::from_slice(&manifest_raw).map_err(|e| {
                    ImageLoadError::MalformedArchive {
                        reason: format!(
                            "invalid manifest {}: {e}",
                            desc.digest
                        ),
                    }
                })?;
            let config_raw = self.read_blob(&manifest.config.digest)?;
            let config: ImageConfig =
                serde_json::from_slice(&config_raw).map_err(|e| {
                    ImageLoadError::MalformedArchive {
                        reason: format!(
                            "invalid image config {}: {e}",
                            manifest.config.digest
                        ),
                    }
                })?;

            let name = desc
                .annotations
                .get(ANNOTATION_IMAGE_NAME)
                .or_else(|| desc.annotations.get(ANNOTATION_REF_NAME))
                .cloned();
            images.push(OciImage {
                name,
                manifest: desc,
                config: manifest.config,
                layers: manifest.layers,
                diff_ids: config.rootfs.diff_ids,
            });
        }
        Ok(images)
    }

    fn flatten(
        &self,
        descs: &[OciDescriptor],
        out: &mut Vec<OciDescriptor>,
    ) -> Result<()> {
        for desc in descs {
            let is_index = MEDIA_TYPE_INDEX_MARKERS
                .iter()
                .any(|marker| desc.media_type.contains(marker));
            if is_index {
                let raw = self.read_blob(&desc.digest)?;
                let nested: OciIndex = serde_json::from_slice(&raw)
                    .map_err(|e| ImageLoadError::MalformedArchive {
                        reason: format!(
                            "invalid nested index {}: {e}",
                            desc.digest
                        ),
                    })?;
                self.flatten(&nested.manifests, out)?;
            } else {
                out.push(desc.clone());
            }
        }
        Ok(())
    }
}

/// Layer chain IDs per the image-spec: the running digest of
/// `parent + " " + diff_id`.
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    use sha2::{Digest, Sha256};
    let mut out: Vec<String> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let chained = match out.last() {
            None => diff_id.clone(),
            Some(parent) => {
                let digest = Sha256::digest(
                    format!("{parent} {diff_id}").as_bytes(),
                );
                format!("sha256:{}", hex::encode(digest))
            }
        };
        out.push(chained);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_archive() -> Vec<u8> {
        let config = br#"{"rootfs":{"type":"layers","diff_ids":["sha256:aaa"]}}"#.to_vec();
        let layer = b"layer-bytes".to_vec();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:cfg",
                "size": config.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": "sha256:lay",
                "size": layer.len(),
            }],
        });
        let manifest = serde_json::to_vec(&manifest).expect("manifest");
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:man",
                "size": manifest.len(),
                "annotations": {
                    "io.containerd.image.name": "docker.io/library/demo:v1",
                },
            }],
        });
        let index = serde_json::to_vec(&index).expect("index");

        let mut builder = tar::Builder::new(Vec::new());
        let mut add = |path: &str, data: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, data)
                .expect("append");
        };
        add("index.json", &index);
        add("oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#);
        add("blobs/sha256/man", &manifest);
        add("blobs/sha256/cfg", &config);
        add("blobs/sha256/lay", &layer);
        let mut out = builder.into_inner().expect("finish");
        out.flush().expect("flush");
        out
    }

    #[tokio::test]
    async fn test_stage_and_resolve_images() {
        let tar_bytes = build_archive();
        let archive = OciArchive::stage(std::io::Cursor::new(tar_bytes))
            .await
            .expect("stage");

        let images = archive.images().expect("images");
        assert_eq!(images.len(), 1);
        let image = &images[0];
        assert_eq!(
            image.name.as_deref(),
            Some("docker.io/library/demo:v1")
        );
        assert_eq!(image.layers.len(), 1);
        assert_eq!(image.diff_ids, vec!["sha256:aaa"]);
        assert_eq!(
            archive.read_blob("sha256:lay").expect("blob"),
            b"layer-bytes"
        );
    }

    #[tokio::test]
    async fn test_missing_blob_is_reported() {
        let tar_bytes = build_archive();
        let archive = OciArchive::stage(std::io::Cursor::new(tar_bytes))
            .await
            .expect("stage");
        assert!(matches!(
            archive.read_blob("sha256:absent"),
            Err(ImageLoadError::MissingBlob { .. })
        ));
    }

    #[test]
    fn test_chain_ids_first_layer_is_diff_id() {
        let ids = chain_ids(&["sha256:one".to_string()]);
        assert_eq!(ids, vec!["sha256:one"]);
    }

    #[test]
    fn test_chain_ids_accumulate() {
        let ids = chain_ids(&[
            "sha256:one".to_string(),
            "sha256:two".to_string(),
        ]);
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[1], "sha256:two");
        assert!(ids[1].starts_with("sha256:"));
    }
}
