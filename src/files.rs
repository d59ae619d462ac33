//! File transfer between the host and running instances.
//!
//! Payloads come from inline content or a local source file, are pushed
//! with their ownership and octal mode, and may create missing parent
//! directories first.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::daemon::{DaemonError, FileKind, FilePush, WriteMode};
use crate::remote::SessionHandle;
use crate::wait::{WaitError, Waiter};

/// Mode applied when a payload does not declare one.
pub const DEFAULT_FILE_MODE: &str = "0755";

const DIRECTORY_MODE: u32 = 0o755;
const READY: &str = "Ready";
const PENDING: &str = "Pending";

fn default_mode() -> String {
    DEFAULT_FILE_MODE.to_owned()
}

/// A file declared inside an instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FilePayload {
    /// Inline body; takes precedence over `source` when non-empty.
    #[serde(default)]
    pub content: String,
    /// Local file to upload instead of inline content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Utf8PathBuf>,
    /// Absolute destination inside the instance.
    pub target_file: String,
    /// Owner uid.
    #[serde(default)]
    pub uid: u32,
    /// Owner gid.
    #[serde(default)]
    pub gid: u32,
    /// Octal permission string such as `0644`.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Create missing parent directories before pushing.
    #[serde(default)]
    pub create_directories: bool,
    /// Append to an existing file instead of replacing it.
    #[serde(default)]
    pub append: bool,
}

impl Default for FilePayload {
    fn default() -> Self {
        Self {
            content: String::new(),
            source: None,
            target_file: String::new(),
            uid: 0,
            gid: 0,
            mode: default_mode(),
            create_directories: false,
            append: false,
        }
    }
}

impl FilePayload {
    /// Checks the payload before any daemon call.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Invalid`] when both or neither of `content` and
    /// `source` are set, when `target_file` is not absolute, or when `mode`
    /// is not an octal permission string.
    pub fn validate(&self) -> Result<(), FileError> {
        let has_content = !self.content.is_empty();
        let has_source = self.source.is_some();
        if has_content && has_source {
            return Err(self.invalid("content and source are mutually exclusive"));
        }
        if !has_content && !has_source {
            return Err(self.invalid("set either content or source"));
        }
        if !self.target_file.starts_with('/') {
            return Err(self.invalid("target_file must be an absolute path"));
        }
        self.parsed_mode().map(|_| ())
    }

    /// Parses `mode` as octal permission bits.
    ///
    /// # Errors
    ///
    /// Returns [`FileError::Invalid`] for non-octal or out-of-range modes.
    pub fn parsed_mode(&self) -> Result<u32, FileError> {
        let trimmed = self.mode.trim();
        let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
        match u32::from_str_radix(digits, 8) {
            Ok(bits) if !digits.is_empty() && bits <= 0o7777 => Ok(bits),
            _ => Err(self.invalid(&format!("mode '{}' is not an octal permission", self.mode))),
        }
    }

    fn invalid(&self, reason: &str) -> FileError {
        FileError::Invalid {
            target: self.target_file.clone(),
            reason: reason.to_owned(),
        }
    }

    fn resolve_content(&self) -> Result<Vec<u8>, FileError> {
        if !self.content.is_empty() {
            return Ok(self.content.clone().into_bytes());
        }
        let Some(source) = self.source.as_deref() else {
            return Ok(Vec::new());
        };
        read_source(source).map_err(|message| FileError::SourceMissing {
            path: source.to_path_buf(),
            target: self.target_file.clone(),
            message,
        })
    }
}

fn read_source(path: &Utf8Path) -> Result<Vec<u8>, String> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| String::from("path has no file name"))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read(name).map_err(|err| err.to_string())
}

/// File read back from an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileContents {
    /// File body.
    pub content: Vec<u8>,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Four-digit octal mode, for example `0644`.
    pub mode: String,
}

/// Composite identity of a file inside an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileResourceId {
    /// Remote hosting the instance.
    pub remote: String,
    /// Instance name.
    pub instance: String,
    /// Absolute path inside the instance.
    pub path: String,
}

impl fmt::Display for FileResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.remote, self.instance, self.path)
    }
}

/// Renders `<remote>:<instance>:<path>`.
#[must_use]
pub fn file_resource_id(remote: &str, instance: &str, path: &str) -> String {
    format!("{remote}:{instance}:{path}")
}

/// Parses an identifier produced by [`file_resource_id`].
///
/// # Errors
///
/// Returns [`FileError::InvalidId`] when a component is missing or the path
/// is not absolute.
pub fn parse_file_resource_id(id: &str) -> Result<FileResourceId, FileError> {
    let mut parts = id.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(remote), Some(instance), Some(path))
            if !remote.is_empty() && !instance.is_empty() && path.starts_with('/') =>
        {
            Ok(FileResourceId {
                remote: remote.to_owned(),
                instance: instance.to_owned(),
                path: path.to_owned(),
            })
        }
        _ => Err(FileError::InvalidId(id.to_owned())),
    }
}

/// Uploads `payload` into `instance`.
///
/// # Errors
///
/// Returns [`FileError::Invalid`] for malformed payloads,
/// [`FileError::SourceMissing`] when the local source cannot be read and
/// [`FileError::Transfer`] when the daemon rejects the push.
pub async fn upload(
    session: &SessionHandle,
    instance: &str,
    payload: &FilePayload,
) -> Result<(), FileError> {
    payload.validate()?;
    let mode = payload.parsed_mode()?;
    let content = payload.resolve_content()?;

    if payload.create_directories {
        ensure_parents(session, instance, payload).await?;
    }

    let push = FilePush {
        uid: payload.uid,
        gid: payload.gid,
        mode,
        kind: FileKind::File,
        write: if payload.append {
            WriteMode::Append
        } else {
            WriteMode::Overwrite
        },
        content,
    };
    debug!(instance, path = %payload.target_file, bytes = push.content.len(), "pushing file");
    session
        .server()
        .push_file(session.scope(), instance, &payload.target_file, &push)
        .await
        .map_err(|source| transfer(instance, &payload.target_file, source))
}

async fn ensure_parents(
    session: &SessionHandle,
    instance: &str,
    payload: &FilePayload,
) -> Result<(), FileError> {
    let target = Utf8Path::new(&payload.target_file);
    let mut missing: Vec<&Utf8Path> = target
        .ancestors()
        .skip(1)
        .filter(|dir| !dir.as_str().is_empty() && dir.as_str() != "/")
        .collect();
    missing.reverse();

    for dir in missing {
        match session.server().file(session.scope(), instance, dir.as_str()).await {
            Ok(existing) if existing.kind == FileKind::Directory => {}
            Ok(_) => {
                return Err(payload.invalid(&format!("parent {dir} exists and is not a directory")));
            }
            Err(err) if err.is_not_found() => {
                debug!(instance, path = %dir, "creating parent directory");
                let push = FilePush {
                    uid: payload.uid,
                    gid: payload.gid,
                    mode: DIRECTORY_MODE,
                    kind: FileKind::Directory,
                    write: WriteMode::Overwrite,
                    content: Vec::new(),
                };
                session
                    .server()
                    .push_file(session.scope(), instance, dir.as_str(), &push)
                    .await
                    .map_err(|source| transfer(instance, dir.as_str(), source))?;
            }
            Err(source) => return Err(transfer(instance, dir.as_str(), source)),
        }
    }
    Ok(())
}

/// Removes `path` from `instance`; a missing file counts as removed.
///
/// # Errors
///
/// Returns [`FileError::Transfer`] for any other daemon failure.
pub async fn delete(session: &SessionHandle, instance: &str, path: &str) -> Result<(), FileError> {
    debug!(instance, path, "deleting file");
    match session
        .server()
        .delete_file(session.scope(), instance, path)
        .await
    {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(source) => Err(transfer(instance, path, source)),
    }
}

/// Reads `path` from `instance`.
///
/// # Errors
///
/// Returns [`FileError::Transfer`] when the daemon fails, including when the
/// file does not exist.
pub async fn read(
    session: &SessionHandle,
    instance: &str,
    path: &str,
) -> Result<FileContents, FileError> {
    fetch(session, instance, path)
        .await
        .map_err(|source| transfer(instance, path, source))
}

/// Reads `path` once the instance has created it, polling while the daemon
/// reports it missing.
///
/// # Errors
///
/// Returns [`FileError::NotReady`] when the wait times out, is cancelled or
/// hits a daemon error other than absence.
pub async fn read_when_ready(
    session: &SessionHandle,
    waiter: &Waiter,
    instance: &str,
    path: &str,
) -> Result<FileContents, FileError> {
    waiter
        .wait_for("file readiness", &[READY], || async {
            match fetch(session, instance, path).await {
                Ok(contents) => Ok((contents, READY.to_owned())),
                Err(err) if err.is_not_found() => Ok((FileContents::default(), PENDING.to_owned())),
                Err(err) => Err(err),
            }
        })
        .await
        .map_err(|source| FileError::NotReady {
            instance: instance.to_owned(),
            path: path.to_owned(),
            source: Box::new(source),
        })
}

async fn fetch(
    session: &SessionHandle,
    instance: &str,
    path: &str,
) -> Result<FileContents, DaemonError> {
    let file = session.server().file(session.scope(), instance, path).await?;
    Ok(FileContents {
        content: file.content,
        uid: file.uid,
        gid: file.gid,
        mode: format!("{:04o}", file.mode & 0o7777),
    })
}

fn transfer(instance: &str, path: &str, source: DaemonError) -> FileError {
    FileError::Transfer {
        instance: instance.to_owned(),
        path: path.to_owned(),
        source,
    }
}

/// Errors raised by file transfers.
#[derive(Debug, Error)]
pub enum FileError {
    /// The payload is malformed.
    #[error("invalid file payload for {target}: {reason}")]
    Invalid {
        /// Target path of the payload.
        target: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The local source file could not be read.
    #[error("cannot read source {path} for {target}: {message}")]
    SourceMissing {
        /// Local source path.
        path: Utf8PathBuf,
        /// Target path of the payload.
        target: String,
        /// Underlying I/O message.
        message: String,
    },
    /// The daemon rejected a file operation.
    #[error("file transfer for {path} in instance {instance} failed: {source}")]
    Transfer {
        /// Instance name.
        instance: String,
        /// Path inside the instance.
        path: String,
        /// Daemon failure.
        #[source]
        source: DaemonError,
    },
    /// The file never appeared.
    #[error("file {path} in instance {instance} is not ready: {source}")]
    NotReady {
        /// Instance name.
        instance: String,
        /// Path inside the instance.
        path: String,
        /// Wait failure.
        #[source]
        source: Box<WaitError<DaemonError>>,
    },
    /// A composite identifier could not be parsed.
    #[error("invalid file id '{0}': expected <remote>:<instance>:<absolute path>")]
    InvalidId(String),
}
