//! The socket a created container blocks on until `start` connects to it.
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::unistd;

pub const START_FILE: &str = "start.sock";
const START_MESSAGE: &[u8] = b"start container";

#[derive(Debug, thiserror::Error)]
pub enum StartSocketError {
    #[error("failed to chdir to {path} around the start socket")]
    Chdir {
        #[source]
        source: nix::Error,
        path: PathBuf,
    },
    #[error("invalid start socket path: {0}")]
    InvalidPath(PathBuf),
    #[error("failed to bind start socket {path}")]
    Bind {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to connect to start socket {path}")]
    Connect {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to get cwd")]
    GetCwd(#[source] std::io::Error),
    #[error("failed to accept on the start socket")]
    Accept(#[source] std::io::Error),
    #[error("failed to read the start message")]
    Read(#[source] std::io::Error),
    #[error("unexpected start message {0:?}")]
    Unexpected(String),
    #[error("failed to send the start message")]
    Send(#[source] std::io::Error),
}

type Result<T> = std::result::Result<T, StartSocketError>;

/// Runs `f` with the socket's directory as working directory. A unix socket
/// path is limited to 108 bytes and container roots easily exceed that, the
/// bare file name never does.
fn in_socket_dir<T>(
    socket_path: &Path,
    f: impl FnOnce(&Path) -> std::result::Result<T, StartSocketError>,
) -> Result<T> {
    let workdir = socket_path
        .parent()
        .ok_or_else(|| StartSocketError::InvalidPath(socket_path.to_owned()))?;
    let name = socket_path
        .file_name()
        .ok_or_else(|| StartSocketError::InvalidPath(socket_path.to_owned()))?;
    let cwd = env::current_dir().map_err(StartSocketError::GetCwd)?;
    unistd::chdir(workdir).map_err(|source| StartSocketError::Chdir {
        source,
        path: workdir.to_owned(),
    })?;
    let result = f(Path::new(name));
    unistd::chdir(&cwd).map_err(|source| StartSocketError::Chdir { source, path: cwd })?;
    result
}

/// Binds a listener at `socket_path` whatever the length of its directory.
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    in_socket_dir(socket_path, |name| {
        UnixListener::bind(name).map_err(|source| StartSocketError::Bind {
            source,
            path: socket_path.to_owned(),
        })
    })
}

pub fn connect(socket_path: &Path) -> Result<UnixStream> {
    in_socket_dir(socket_path, |name| {
        UnixStream::connect(name).map_err(|source| StartSocketError::Connect {
            source,
            path: socket_path.to_owned(),
        })
    })
}

#[derive(Debug)]
pub struct StartListener {
    socket: UnixListener,
}

impl StartListener {
    pub fn new(socket_path: &Path) -> Result<Self> {
        Ok(Self {
            socket: bind(socket_path)?,
        })
    }

    /// Blocks until `start` sends its message. Only the file descriptor is
    /// used, so this works after the caller changed its root.
    pub fn wait_for_start(&self) -> Result<()> {
        let (mut stream, _) = self.socket.accept().map_err(StartSocketError::Accept)?;
        let mut buf = [0u8; 64];
        let mut len = 0;
        loop {
            match stream.read(&mut buf[len..]).map_err(StartSocketError::Read)? {
                0 => break,
                n => len += n,
            }
            if len == buf.len() {
                break;
            }
        }
        if &buf[..len] != START_MESSAGE {
            return Err(StartSocketError::Unexpected(
                String::from_utf8_lossy(&buf[..len]).into_owned(),
            ));
        }
        Ok(())
    }
}

pub struct StartSocket {
    path: PathBuf,
}

impl StartSocket {
    pub fn new<P: Into<PathBuf>>(socket_path: P) -> Self {
        Self {
            path: socket_path.into(),
        }
    }

    pub fn notify_container_start(&self) -> Result<()> {
        tracing::debug!(path = ?self.path, "notify container start");
        let mut stream = connect(&self.path)?;
        stream.write_all(START_MESSAGE).map_err(StartSocketError::Send)?;
        Ok(())
    }
}
