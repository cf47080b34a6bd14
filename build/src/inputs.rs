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

//! Build-input staging: resolves the context and dockerfile sources
//! into frontend attributes, local directories, and session
//! attachables. Staging directories are dropped with the returned
//! guard, on every exit path.

use crate::error::{BuildError, Result};
use crate::options::Inputs;
use kubuild_client::session::upload::UploadSource;
use kubuild_client::SolveOpt;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_DOCKERFILE_NAME: &str = "Dockerfile";

// Enough bytes to recognize compressed and plain tar headers.
const ARCHIVE_PEEK_SIZE: usize = 1024;

/// Holds staging temp dirs for the life of a solve.
#[derive(Debug, Default)]
pub struct StagingGuard {
    _dirs: Vec<TempDir>,
}

/// Wire the resolved inputs into `so`.
pub async fn load_inputs(
    inputs: Inputs,
    so: &mut SolveOpt,
) -> Result<StagingGuard> {
    if inputs.context_path.is_empty() {
        return Err(BuildError::MissingContext);
    }

    let mut guard = StagingGuard::default();
    let mut dockerfile_reader: Option<
        Box<dyn AsyncRead + Send + Unpin>,
    > = None;
    let mut dockerfile_dir: Option<String> = None;
    let mut dockerfile_name = inputs.dockerfile_path.clone();

    if inputs.context_path == "-" {
        if inputs.dockerfile_path == "-" {
            return Err(BuildError::StdinConflict);
        }
        let mut stream = inputs
            .in_stream
            .ok_or(BuildError::MissingContext)?;

        let mut head = vec![0u8; ARCHIVE_PEEK_SIZE];
        let mut filled = 0;
        while filled < head.len() {
            let n = stream.read(&mut head[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        head.truncate(filled);

        let replayed: Box<dyn AsyncRead + Send + Unpin> = Box::new(
            std::io::Cursor::new(head.clone()).chain(stream),
        );

        if is_archive(&head) {
            // Standard input is a context tarball; the daemon pulls it
            // through the upload attachable.
            let upload = UploadSource::new(replayed);
            let _ = so
                .frontend_attrs
                .insert("context".to_string(), upload.url());
            so.session.push(Arc::new(upload));
        } else {
            if !inputs.dockerfile_path.is_empty() {
                return Err(BuildError::DockerfileConflict);
            }
            // Standard input is the dockerfile; the context is an
            // empty staging directory.
            dockerfile_reader = Some(replayed);
            let empty = tempfile::tempdir()?;
            let _ = so.local_dirs.insert(
                "context".to_string(),
                empty.path().to_path_buf(),
            );
            guard._dirs.push(empty);
        }
    } else if is_local_dir(&inputs.context_path) {
        let _ = so.local_dirs.insert(
            "context".to_string(),
            Path::new(&inputs.context_path).to_path_buf(),
        );
        match inputs.dockerfile_path.as_str() {
            "-" => {
                dockerfile_reader = Some(
                    inputs
                        .in_stream
                        .ok_or(BuildError::MissingContext)?,
                );
            }
            "" => dockerfile_dir = Some(inputs.context_path.clone()),
            path => {
                let path = Path::new(path);
                dockerfile_dir = Some(
                    path.parent()
                        .unwrap_or_else(|| Path::new("."))
                        .to_string_lossy()
                        .into_owned(),
                );
                dockerfile_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
            }
        }
    } else if is_remote_url(&inputs.context_path) {
        if inputs.dockerfile_path == "-" {
            return Err(BuildError::StdinWithRemoteContext);
        }
        let _ = so.frontend_attrs.insert(
            "context".to_string(),
            inputs.context_path.clone(),
        );
    } else {
        return Err(BuildError::ContextNotFound {
            path: inputs.context_path.clone(),
        });
    }

    if let Some(mut reader) = dockerfile_reader {
        let staged = tempfile::tempdir()?;
        let path = staged.path().join(DEFAULT_DOCKERFILE_NAME);
        let mut file = tokio::fs::File::create(&path).await?;
        let _ = tokio::io::copy(&mut reader, &mut file).await?;
        dockerfile_dir =
            Some(staged.path().to_string_lossy().into_owned());
        dockerfile_name = DEFAULT_DOCKERFILE_NAME.to_string();
        guard._dirs.push(staged);
    }

    if dockerfile_name.is_empty() {
        dockerfile_name = DEFAULT_DOCKERFILE_NAME.to_string();
    }
    let _ = so
        .frontend_attrs
        .insert("filename".to_string(), dockerfile_name);

    if let Some(dir) = dockerfile_dir {
        let _ = so.local_dirs.insert(
            "dockerfile".to_string(),
            Path::new(&dir).to_path_buf(),
        );
    }

    Ok(guard)
}

fn is_local_dir(path: &str) -> bool {
    Path::new(path).is_dir()
}

fn is_remote_url(path: &str) -> bool {
    const URL_PREFIXES: [&str; 4] =
        ["http://", "https://", "git://", "ssh://"];
    const GIT_HOST_PREFIXES: [&str; 3] =
        ["github.com/", "gitlab.com/", "git@"];
    URL_PREFIXES.iter().any(|p| path.starts_with(p))
        || GIT_HOST_PREFIXES.iter().any(|p| path.starts_with(p))
        || path.ends_with(".git")
}

/// Recognize a context tarball by magic bytes: gzip, bzip2, xz, or a
/// plain tar with the ustar marker at offset 257.
fn is_archive(head: &[u8]) -> bool {
    if head.starts_with(&[0x1f, 0x8b]) {
        return true;
    }
    if head.starts_with(b"BZh") {
        return true;
    }
    if head.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        return true;
    }
    head.len() > 262 && &head[257..262] == b"ustar"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_opt() -> SolveOpt {
        SolveOpt::default()
    }

    fn tar_header() -> Vec<u8> {
        let mut head = vec![0u8; 512];
        head[257..262].copy_from_slice(b"ustar");
        head.resize(1024, 0);
        head
    }

    #[test]
    fn test_is_archive_detects_formats() {
        assert!(is_archive(&[0x1f, 0x8b, 0x08]));
        assert!(is_archive(b"BZh91AY"));
        assert!(is_archive(&[
            0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, 0x00
        ]));
        assert!(is_archive(&tar_header()));
        assert!(!is_archive(b"FROM alpine\n"));
    }

    #[tokio::test]
    async fn test_stdin_conflict_rejected() {
        let inputs = Inputs {
            context_path: "-".to_string(),
            dockerfile_path: "-".to_string(),
            in_stream: Some(Box::new(&b""[..])),
        };
        let mut so = empty_opt();
        assert!(matches!(
            load_inputs(inputs, &mut so).await,
            Err(BuildError::StdinConflict)
        ));
    }

    #[tokio::test]
    async fn test_stdin_dockerfile_gets_empty_context() {
        let inputs = Inputs {
            context_path: "-".to_string(),
            dockerfile_path: String::new(),
            in_stream: Some(Box::new(&b"FROM alpine\n"[..])),
        };
        let mut so = empty_opt();
        let _guard =
            load_inputs(inputs, &mut so).await.expect("load");
        assert!(so.local_dirs.contains_key("context"));
        assert!(so.local_dirs.contains_key("dockerfile"));
        assert_eq!(
            so.frontend_attrs.get("filename"),
            Some(&"Dockerfile".to_string())
        );
        // Never both stdin-as-context and stdin-as-dockerfile.
        assert!(!so.frontend_attrs.contains_key("context"));
    }

    #[tokio::test]
    async fn test_stdin_archive_becomes_upload_context() {
        let inputs = Inputs {
            context_path: "-".to_string(),
            dockerfile_path: String::new(),
            in_stream: Some(Box::new(std::io::Cursor::new(
                tar_header(),
            ))),
        };
        let mut so = empty_opt();
        let _guard =
            load_inputs(inputs, &mut so).await.expect("load");
        assert!(so
            .frontend_attrs
            .get("context")
            .expect("context attr")
            .starts_with("http://buildkit-session/"));
        assert_eq!(so.session.len(), 1);
        assert!(so.local_dirs.is_empty());
    }

    #[tokio::test]
    async fn test_local_dir_with_named_dockerfile() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("Dockerfile.release"),
            b"FROM scratch",
        )
        .expect("write");

        let inputs = Inputs {
            context_path: dir.path().to_string_lossy().into_owned(),
            dockerfile_path: dir
                .path()
                .join("Dockerfile.release")
                .to_string_lossy()
                .into_owned(),
            in_stream: None,
        };
        let mut so = empty_opt();
        let _guard =
            load_inputs(inputs, &mut so).await.expect("load");
        assert_eq!(
            so.frontend_attrs.get("filename"),
            Some(&"Dockerfile.release".to_string())
        );
        assert!(so.local_dirs.contains_key("dockerfile"));
    }

    #[tokio::test]
    async fn test_remote_context_passes_through() {
        let inputs = Inputs {
            context_path: "https://github.com/org/repo.git"
                .to_string(),
            dockerfile_path: String::new(),
            in_stream: None,
        };
        let mut so = empty_opt();
        let _guard =
            load_inputs(inputs, &mut so).await.expect("load");
        assert_eq!(
            so.frontend_attrs.get("context"),
            Some(&"https://github.com/org/repo.git".to_string())
        );
    }

    #[tokio::test]
    async fn test_remote_context_rejects_stdin_dockerfile() {
        let inputs = Inputs {
            context_path: "git://example.com/repo".to_string(),
            dockerfile_path: "-".to_string(),
            in_stream: Some(Box::new(&b""[..])),
        };
        let mut so = empty_opt();
        assert!(matches!(
            load_inputs(inputs, &mut so).await,
            Err(BuildError::StdinWithRemoteContext)
        ));
    }

    #[tokio::test]
    async fn test_missing_path_reported() {
        let inputs = Inputs {
            context_path: "/definitely/not/a/path".to_string(),
            dockerfile_path: String::new(),
            in_stream: None,
        };
        let mut so = empty_opt();
        assert!(matches!(
            load_inputs(inputs, &mut so).await,
            Err(BuildError::ContextNotFound { .. })
        ));
    }
}
