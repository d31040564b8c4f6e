//! Locating and dialing the daemon's socket or named pipe.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::error::ClientError;

/// File name of the socket inside a runtime directory, and the prefix of the
/// Windows pipe name.
pub const SOCKET_NAME: &str = "org.keepassxc.KeePassXC.BrowserServer";

/// Overrides discovery with an explicit socket or pipe path.
pub const SOCKET_ENV: &str = "KPXC_SOCKET";

/// Turns platform lookup rules into a concrete endpoint path.
pub trait ResolveEndpoint: Send + Sync {
    fn resolve(&self) -> Result<PathBuf, ClientError>;
}

/// A fixed path.
impl ResolveEndpoint for PathBuf {
    fn resolve(&self) -> Result<PathBuf, ClientError> {
        Ok(self.clone())
    }
}

/// `KPXC_SOCKET`, then the platform's well-known locations.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl ResolveEndpoint for DefaultResolver {
    fn resolve(&self) -> Result<PathBuf, ClientError> {
        if let Some(path) = std::env::var_os(SOCKET_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(path));
        }

        #[cfg(windows)]
        {
            let user = std::env::var("USERNAME")
                .map_err(|e| ClientError::Endpoint(format!("USERNAME: {e}")))?;
            Ok(pipe_name(&user))
        }

        #[cfg(not(windows))]
        {
            find_socket(&candidate_dirs())
        }
    }
}

pub fn pipe_name(user: &str) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{SOCKET_NAME}_{user}"))
}

/// Directories searched for the socket, in order.
pub fn candidate_dirs() -> Vec<PathBuf> {
    let env_dir = |name: &str| {
        std::env::var_os(name)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    };
    candidate_dirs_from(env_dir("XDG_RUNTIME_DIR"), env_dir("TMPDIR"))
}

fn candidate_dirs_from(xdg_runtime: Option<PathBuf>, tmpdir: Option<PathBuf>) -> Vec<PathBuf> {
    let mut dirs = Vec::with_capacity(4);
    if let Some(runtime) = xdg_runtime {
        // Flatpak builds put the socket under the app directory.
        dirs.push(runtime.join("app").join("org.keepassxc.KeePassXC"));
        dirs.insert(0, runtime);
    }
    if let Some(tmp) = tmpdir {
        dirs.push(tmp);
    }
    dirs.push(PathBuf::from("/tmp"));
    dirs
}

/// First `SOCKET_NAME` that exists in `dirs`. Any stat error other than
/// not-found stops the scan.
pub fn find_socket(dirs: &[PathBuf]) -> Result<PathBuf, ClientError> {
    for dir in dirs {
        let path = dir.join(SOCKET_NAME);
        match std::fs::metadata(&path) {
            Ok(_) => {
                debug!(path = %path.display(), "found daemon socket");
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(ClientError::Endpoint(format!(
                    "socket lookup {}: {e}",
                    path.display()
                )))
            }
        }
    }
    Err(ClientError::Endpoint(format!(
        "{SOCKET_NAME} not found in {} directories",
        dirs.len()
    )))
}

/// Any ordered, reliable byte stream the engine can drive.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

pub async fn dial(path: &Path) -> Result<BoxedStream, ClientError> {
    #[cfg(unix)]
    let stream = UnixStream::connect(path).await?;

    #[cfg(windows)]
    let stream = ClientOptions::new().open(path)?;

    debug!(path = %path.display(), "connected to daemon");
    Ok(Box::new(stream))
}
