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

//! Imports an OCI layout archive into containerd: blobs into the
//! content store, image records into the image store, layers unpacked
//! through the snapshot and diff services.

use crate::error::{ImageLoadError, Result};
use crate::oci::{chain_ids, OciArchive, OciDescriptor, OciImage};
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    CommitSnapshotRequest, PrepareSnapshotRequest,
};
use containerd_client::services::v1::diff_client::DiffClient;
use containerd_client::services::v1::{
    ApplyRequest, CreateImageRequest, Image, UpdateImageRequest,
    WriteAction, WriteContentRequest,
};
use containerd_client::types::Descriptor;
use containerd_client::with_namespace;
use std::collections::HashMap;
use tokio::io::AsyncRead;
use tonic::transport::Channel;
use tonic::{Code, Request};
use tracing::{debug, info};

const CONTENT_CHUNK_SIZE: usize = 1024 * 1024;

// Unpacks always target the default snapshotter.
const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Importer bound to one containerd endpoint and namespace.
#[derive(Debug, Clone)]
pub struct ContainerdLoader {
    channel: Channel,
    namespace: String,
}

impl ContainerdLoader {
    pub async fn connect_unix(
        socket: impl AsRef<std::path::Path>,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let channel = containerd_client::connect(socket.as_ref())
            .await
            .map_err(|e| ImageLoadError::RuntimeConnect(e.into()))?;
        Ok(Self { channel, namespace: namespace.into() })
    }

    /// For endpoints reached over a tunneled byte stream.
    pub fn from_channel(
        channel: Channel,
        namespace: impl Into<String>,
    ) -> Self {
        Self { channel, namespace: namespace.into() }
    }

    /// Import the archive and unpack every image in it. Returns the
    /// names registered in the image store.
    pub async fn import(
        &self,
        input: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<Vec<String>> {
        let archive = OciArchive::stage(input).await?;
        let images = archive.images()?;
        if images.is_empty() {
            return Err(ImageLoadError::MalformedArchive {
                reason: "archive contains no manifests".to_string(),
            });
        }

        let mut names = Vec::new();
        for image in &images {
            self.push_blobs(&archive, image).await?;
            if let Some(name) = &image.name {
                self.register_image(name, &image.manifest).await?;
                names.push(name.clone());
            }
            self.unpack(&archive, image).await?;
        }
        info!("imported {} image(s) into containerd", images.len());
        Ok(names)
    }

    async fn push_blobs(
        &self,
        archive: &OciArchive,
        image: &OciImage,
    ) -> Result<()> {
        let mut blobs =
            vec![image.manifest.clone(), image.config.clone()];
        blobs.extend(image.layers.iter().cloned());
        for blob in blobs {
            self.write_blob(archive, &blob).await?;
        }
        Ok(())
    }

    async fn write_blob(
        &self,
        archive: &OciArchive,
        desc: &OciDescriptor,
    ) -> Result<()> {
        let data = archive.read_blob(&desc.digest)?;
        let total = data.len() as i64;
        let digest = desc.digest.clone();
        let reference = format!("import-{digest}");

        let mut requests = Vec::new();
        let mut offset = 0i64;
        for chunk in data.chunks(CONTENT_CHUNK_SIZE) {
            requests.push(WriteContentRequest {
                action: WriteAction::Write as i32,
                r#ref: reference.clone(),
                total,
                expected: String::new(),
                offset,
                data: chunk.to_vec(),
                labels: HashMap::new(),
            });
            offset += chunk.len() as i64;
        }
        requests.push(WriteContentRequest {
            action: WriteAction::Commit as i32,
            r#ref: reference.clone(),
            total,
            expected: digest.clone(),
            offset,
            data: Vec::new(),
            labels: HashMap::new(),
        });

        let mut content = ContentClient::new(self.channel.clone());
        let req = tokio_stream::iter(requests);
        let resp = content
            .write(with_namespace!(req, self.namespace.as_str()))
            .await;
        match resp {
            Ok(resp) => {
                let mut stream = resp.into_inner();
                while let Some(_ack) = stream.message().await? {}
                debug!("wrote blob {digest} ({total} bytes)");
                Ok(())
            }
            Err(status) if status.code() == Code::AlreadyExists => {
                debug!("blob {digest} already present");
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    async fn register_image(
        &self,
        name: &str,
        manifest: &OciDescriptor,
    ) -> Result<()> {
        let image = Image {
            name: name.to_string(),
            target: Some(Descriptor {
                media_type: manifest.media_type.clone(),
                digest: manifest.digest.clone(),
                size: manifest.size,
                annotations: HashMap::new(),
            }),
            ..Default::default()
        };

        let mut images = ImagesClient::new(self.channel.clone());
        let req = CreateImageRequest {
            image: Some(image.clone()),
            ..Default::default()
        };
        match images.create(with_namespace!(req, self.namespace.as_str())).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::AlreadyExists => {
                let req = UpdateImageRequest {
                    image: Some(image),
                    ..Default::default()
                };
                let _ = images
                    .update(with_namespace!(req, self.namespace.as_str()))
                    .await?;
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    /// Apply the layer chain through the default snapshotter so the
    /// image is runnable without a pull.
    async fn unpack(
        &self,
        archive: &OciArchive,
        image: &OciImage,
    ) -> Result<()> {
        if image.layers.len() != image.diff_ids.len() {
            return Err(ImageLoadError::MalformedArchive {
                reason: format!(
                    "manifest {} has {} layers but {} diff ids",
                    image.manifest.digest,
                    image.layers.len(),
                    image.diff_ids.len()
                ),
            });
        }

        let chain = chain_ids(&image.diff_ids);
        let mut snapshots = SnapshotsClient::new(self.channel.clone());
        let mut diff = DiffClient::new(self.channel.clone());
        let mut parent = String::new();

        for (i, (layer, chain_id)) in
            image.layers.iter().zip(chain.iter()).enumerate()
        {
            let key = format!("extract-{i} {chain_id}");
            let req = PrepareSnapshotRequest {
                snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
                key: key.clone(),
                parent: parent.clone(),
                ..Default::default()
            };
            let mounts = match snapshots
                .prepare(with_namespace!(req, self.namespace.as_str()))
                .await
            {
                Ok(resp) => resp.into_inner().mounts,
                Err(status)
                    if status.code() == Code::AlreadyExists =>
                {
                    // Layer already unpacked on this node.
                    parent = chain_id.clone();
                    continue;
                }
                Err(status) => return Err(status.into()),
            };

            // Keep the blob bytes out of memory churn; the diff
            // service reads them from the content store.
            let _ = archive.blob_path(&layer.digest)?;
            let req = ApplyRequest {
                diff: Some(Descriptor {
                    media_type: layer.media_type.clone(),
                    digest: layer.digest.clone(),
                    size: layer.size,
                    annotations: HashMap::new(),
                }),
                mounts,
                ..Default::default()
            };
            let _ = diff
                .apply(with_namespace!(req, self.namespace.as_str()))
                .await?;

            let req = CommitSnapshotRequest {
                snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
                name: chain_id.clone(),
                key,
                ..Default::default()
            };
            match snapshots
                .commit(with_namespace!(req, self.namespace.as_str()))
                .await
            {
                Ok(_) => {}
                Err(status)
                    if status.code() == Code::AlreadyExists => {}
                Err(status) => return Err(status.into()),
            }
            parent = chain_id.clone();
        }
        debug!(
            "unpacked {} ({} layers)",
            image.manifest.digest,
            image.layers.len()
        );
        Ok(())
    }
}
