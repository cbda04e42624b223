use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::EndpointStream;

/// Directory used for local pipes when none is configured.
pub fn default_pipe_dir() -> PathBuf {
    std::env::temp_dir().join("portmux-pipes")
}

/// Map a pipe name to its socket path inside `dir`.
///
/// Names must be a single path component: non-empty, no separators, and not
/// `.` or `..`.
pub fn pipe_path(dir: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(TransportError::InvalidPipeName(name.to_string()));
    }
    Ok(dir.as_ref().join(name))
}

/// Local pipe listener.
///
/// A pipe named `name` is a Unix domain socket at `<dir>/<name>`. The socket
/// file is created with mode `0600` and removed on drop, unless the path was
/// replaced by something else in the meantime.
pub struct PipeListener {
    listener: UnixListener,
    name: String,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl PipeListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Unix `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind the pipe `name` inside `dir`, creating `dir` if needed.
    pub fn bind(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        Self::bind_with_mode(dir, name, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind with an explicit socket file mode.
    pub fn bind_with_mode(dir: impl AsRef<Path>, name: &str, mode: u32) -> Result<Self> {
        let path = pipe_path(&dir, name)?;
        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        let address = path.display().to_string();
        let bind_err = |source: std::io::Error| TransportError::Bind {
            address: address.clone(),
            source,
        };

        std::fs::create_dir_all(dir.as_ref()).map_err(bind_err)?;

        // Remove a stale socket, but never anything that is not a socket.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale pipe socket");
                std::fs::remove_file(&path).map_err(bind_err)?;
            } else {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(pipe = name, ?path, "listening on local pipe");

        Ok(Self {
            listener,
            name: name.to_string(),
            path,
            created_inode: Some((created.dev(), created.ino())),
        })
    }

    /// Accept an incoming connection.
    ///
    /// The accepted stream is always blocking, even when the listener is not.
    pub fn accept(&self) -> Result<EndpointStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nonblocking(false)?;
        debug!(pipe = %self.name, "accepted pipe connection");
        Ok(EndpointStream::from_pipe(stream))
    }

    /// Switch the listener between blocking and nonblocking accepts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Connect to the pipe `name` inside `dir`.
    pub fn connect(dir: impl AsRef<Path>, name: &str) -> Result<EndpointStream> {
        let path = pipe_path(dir, name)?;
        Self::connect_path(path)
    }

    /// Connect to a pipe socket by path.
    pub fn connect_path(path: impl AsRef<Path>) -> Result<EndpointStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            address: path.display().to_string(),
            source: e,
        })?;
        debug!(?path, "connected to local pipe");
        Ok(EndpointStream::from_pipe(stream))
    }

    /// The socket path this pipe is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pipe name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up pipe socket");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "pipe path identity changed; skipping cleanup");
            }
        }
    }
}
