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

//! Serves local directories to the daemon over the file-transfer packet
//! protocol: the build context and, when it lives outside the context,
//! the dockerfile directory.

use super::Attachable;
use kubuild_proto::filesync::file_sync_server::{FileSync, FileSyncServer};
use kubuild_proto::filesync::{Packet, PacketType, Stat};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::Router;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

const DATA_CHUNK_SIZE: usize = 32 * 1024;

// Directory name metadata key set by the daemon when it opens a transfer.
const KEY_DIR_NAME: &str = "dir-name";

// Unix directory / symlink type bits, folded into `Stat.mode`.
const MODE_DIR: u32 = 0o040000;
const MODE_SYMLINK: u32 = 0o120000;

/// A named set of local directories the daemon may sync from.
#[derive(Debug, Clone, Default)]
pub struct LocalDirSource {
    dirs: HashMap<String, PathBuf>,
}

impl LocalDirSource {
    pub fn new(dirs: HashMap<String, PathBuf>) -> Self {
        Self { dirs }
    }
}

impl Attachable for LocalDirSource {
    fn attach(&self, router: Router) -> Router {
        router.add_service(FileSyncServer::new(self.clone()))
    }
}

#[tonic::async_trait]
impl FileSync for LocalDirSource {
    type DiffCopyStream = ReceiverStream<Result<Packet, Status>>;

    async fn diff_copy(
        &self,
        request: Request<Streaming<Packet>>,
    ) -> Result<Response<Self::DiffCopyStream>, Status> {
        let dir_name = request
            .metadata()
            .get(KEY_DIR_NAME)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Status::invalid_argument("missing dir-name metadata")
            })?
            .to_string();
        let root = self.dirs.get(&dir_name).cloned().ok_or_else(|| {
            Status::not_found(format!("no local directory named {dir_name}"))
        })?;

        debug!("file sync requested for {dir_name} ({})", root.display());
        let incoming = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        let _ = tokio::spawn(async move {
            if let Err(status) = serve_dir(&root, incoming, &tx).await {
                let _ = tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type TarStreamStream = ReceiverStream<Result<Packet, Status>>;

    async fn tar_stream(
        &self,
        _request: Request<Streaming<Packet>>,
    ) -> Result<Response<Self::TarStreamStream>, Status> {
        Err(Status::unimplemented(
            "the TarStream transfer protocol is not supported",
        ))
    }
}

async fn serve_dir(
    root: &Path,
    mut incoming: Streaming<Packet>,
    tx: &mpsc::Sender<Result<Packet, Status>>,
) -> Result<(), Status> {
    let entries = {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || walk(&root))
            .await
            .map_err(|e| Status::internal(format!("walk task failed: {e}")))?
            .map_err(|e| {
                Status::internal(format!("failed to walk local dir: {e}"))
            })?
    };

    // Phase one: the full stat list in walk order, closed by an empty
    // stat packet. Packet IDs are implicit indexes into this list.
    for entry in &entries {
        send(
            tx,
            Packet {
                r#type: PacketType::PacketStat as i32,
                stat: Some(entry.stat.clone()),
                id: 0,
                data: Vec::new(),
            },
        )
        .await?;
    }
    send(
        tx,
        Packet {
            r#type: PacketType::PacketStat as i32,
            stat: None,
            id: 0,
            data: Vec::new(),
        },
    )
    .await?;

    // Phase two: answer content requests until the receiver finishes.
    while let Some(packet) = incoming.message().await? {
        match PacketType::try_from(packet.r#type) {
            Ok(PacketType::PacketReq) => {
                let idx = packet.id as usize;
                let Some(entry) = entries.get(idx) else {
                    return Err(Status::invalid_argument(format!(
                        "content requested for unknown id {idx}"
                    )));
                };
                send_file(tx, packet.id, &entry.abs).await?;
            }
            Ok(PacketType::PacketFin) => {
                send(
                    tx,
                    Packet {
                        r#type: PacketType::PacketFin as i32,
                        stat: None,
                        id: 0,
                        data: Vec::new(),
                    },
                )
                .await?;
                return Ok(());
            }
            Ok(PacketType::PacketErr) => {
                return Err(Status::aborted(format!(
                    "receiver aborted transfer: {}",
                    String::from_utf8_lossy(&packet.data)
                )));
            }
            other => {
                warn!("unexpected packet during file sync: {other:?}");
            }
        }
    }
    Ok(())
}

async fn send_file(
    tx: &mpsc::Sender<Result<Packet, Status>>,
    id: u32,
    path: &Path,
) -> Result<(), Status> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        Status::internal(format!("failed to open {}: {e}", path.display()))
    })?;
    let mut buf = vec![0u8; DATA_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| {
            Status::internal(format!("failed to read {}: {e}", path.display()))
        })?;
        send(
            tx,
            Packet {
                r#type: PacketType::PacketData as i32,
                stat: None,
                id,
                data: buf[..n].to_vec(),
            },
        )
        .await?;
        // The empty data packet marks end of file.
        if n == 0 {
            return Ok(());
        }
    }
}

async fn send(
    tx: &mpsc::Sender<Result<Packet, Status>>,
    packet: Packet,
) -> Result<(), Status> {
    tx.send(Ok(packet))
        .await
        .map_err(|_| Status::cancelled("file sync receiver went away"))
}

struct WalkEntry {
    abs: PathBuf,
    stat: Stat,
}

// Depth-first walk in lexicographic order; paths are emitted relative to
// the root with forward slashes, matching the transfer protocol.
fn walk(root: &Path) -> std::io::Result<Vec<WalkEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut children: Vec<_> =
            std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        children.sort_by_key(|e| e.file_name());
        // Reverse so the stack pops in lexicographic order.
        for child in children.into_iter().rev() {
            let abs = child.path();
            let meta = std::fs::symlink_metadata(&abs)?;
            let rel = abs
                .strip_prefix(root)
                .map_err(|_| {
                    std::io::Error::other("walked outside the root")
                })?
                .to_string_lossy()
                .into_owned();

            let mut mode = meta.permissions().mode() & 0o7777;
            let mut linkname = String::new();
            if meta.is_dir() {
                mode |= MODE_DIR;
                stack.push(abs.clone());
            } else if meta.file_type().is_symlink() {
                mode |= MODE_SYMLINK;
                linkname = std::fs::read_link(&abs)?
                    .to_string_lossy()
                    .into_owned();
            }

            let mod_time = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64)
                .unwrap_or_default();

            out.push(WalkEntry {
                abs,
                stat: Stat {
                    path: rel,
                    mode,
                    uid: 0,
                    gid: 0,
                    size: meta.len() as i64,
                    mod_time,
                    linkname,
                    devmajor: 0,
                    devminor: 0,
                    xattrs: HashMap::new(),
                },
            });
        }
    }
    out.sort_by(|a, b| a.stat.path.cmp(&b.stat.path));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_is_sorted_and_relative() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("sub/inner.txt"), b"inner")
            .expect("write");
        std::fs::write(dir.path().join("a.txt"), b"a").expect("write");
        std::fs::write(dir.path().join("z.txt"), b"z").expect("write");

        let entries = walk(dir.path()).expect("walk");
        let paths: Vec<_> =
            entries.iter().map(|e| e.stat.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "sub", "sub/inner.txt", "z.txt"]);
    }

    #[test]
    fn test_walk_marks_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");

        let entries = walk(dir.path()).expect("walk");
        assert_eq!(entries.len(), 1);
        assert_ne!(entries[0].stat.mode & MODE_DIR, 0);
    }

    #[test]
    fn test_walk_records_sizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("data.bin"), vec![0u8; 1024])
            .expect("write");

        let entries = walk(dir.path()).expect("walk");
        assert_eq!(entries[0].stat.size, 1024);
    }
}
