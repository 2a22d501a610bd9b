//! # strata-ipc
//!
//! Request/response protocol spoken on the daemon's Unix socket.
//!
//! Each message is a frame: `len (u32 LE) | bincode payload`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_core::{CacheStatus, CoreError, Representation, RootSummary, SliceData, SliceSpec};
use strata_meta::DatasetMeta;

/// Largest accepted frame payload (a full download travels in one frame)
pub const MAX_FRAME_LEN: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StrataRequest {
    Handshake {
        client_version: String,
    },
    Status,
    ListRoots,
    Subscribe {
        root: String,
    },
    Unsubscribe {
        root: String,
    },
    ListDatasets {
        root: String,
    },
    Notify {
        root: String,
    },
    Info {
        root: String,
        path: String,
    },
    Slice {
        root: String,
        path: String,
        spec: SliceSpec,
        repr: Representation,
    },
    Download {
        root: String,
        path: String,
    },
    PurgeDeleted {
        root: String,
    },
}

/// Category of a failed request, mirroring the core error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    OutOfRange,
    Unreachable,
    Timeout,
    PartialFetchFailure,
    Internal,
}

impl From<&CoreError> for ErrorKind {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::OutOfRange(_) => ErrorKind::OutOfRange,
            CoreError::Unreachable(_) => ErrorKind::Unreachable,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::PartialFetchFailure { .. } => ErrorKind::PartialFetchFailure,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StrataResponse {
    HandshakeAck { server_version: String },
    Status(CacheStatus),
    Roots(Vec<RootSummary>),
    Ack,
    /// Whether the addressed root existed
    Flag(bool),
    Datasets(Vec<String>),
    Info(Box<DatasetMeta>),
    Slice(SliceData),
    Data(Vec<u8>),
    Purged(Vec<String>),
    Error { kind: ErrorKind, message: String },
}

impl StrataResponse {
    pub fn error(err: &CoreError) -> Self {
        StrataResponse::Error {
            kind: err.into(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Serialize a message into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Async frame I/O over any stream
#[cfg(feature = "tokio")]
pub mod frame {
    use super::*;
    use serde::de::DeserializeOwned;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Read one frame. Returns None on a clean EOF before the length prefix.
    pub async fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>, FrameError>
    where
        T: DeserializeOwned,
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(bincode::deserialize(&payload)?))
    }

    pub async fn write_frame<T, W>(writer: &mut W, msg: &T) -> Result<(), FrameError>
    where
        T: Serialize,
        W: AsyncWrite + Unpin,
    {
        let frame = encode_frame(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// IPC Client for communicating with the strata daemon
#[cfg(feature = "tokio")]
pub mod client {
    use super::*;
    use std::path::Path;
    use tokio::net::UnixStream;

    pub struct DaemonClient {
        stream: UnixStream,
    }

    impl DaemonClient {
        /// Connect to the daemon socket
        pub async fn connect_to(socket_path: &Path) -> anyhow::Result<Self> {
            let stream = UnixStream::connect(socket_path).await?;
            Ok(Self { stream })
        }

        /// Send a request and receive response
        pub async fn send(&mut self, request: &StrataRequest) -> anyhow::Result<StrataResponse> {
            frame::write_frame(&mut self.stream, request).await?;
            match frame::read_frame(&mut self.stream).await? {
                Some(response) => Ok(response),
                None => anyhow::bail!("Daemon closed the connection"),
            }
        }

        /// Handshake with daemon
        pub async fn handshake(&mut self) -> anyhow::Result<String> {
            let request = StrataRequest::Handshake {
                client_version: env!("CARGO_PKG_VERSION").to_string(),
            };
            match self.send(&request).await? {
                StrataResponse::HandshakeAck { server_version } => Ok(server_version),
                other => Err(unexpected("Handshake", other)),
            }
        }

        pub async fn status(&mut self) -> anyhow::Result<CacheStatus> {
            match self.send(&StrataRequest::Status).await? {
                StrataResponse::Status(status) => Ok(status),
                other => Err(unexpected("Status", other)),
            }
        }

        pub async fn list_roots(&mut self) -> anyhow::Result<Vec<RootSummary>> {
            match self.send(&StrataRequest::ListRoots).await? {
                StrataResponse::Roots(roots) => Ok(roots),
                other => Err(unexpected("ListRoots", other)),
            }
        }

        pub async fn subscribe(&mut self, root: &str) -> anyhow::Result<()> {
            let request = StrataRequest::Subscribe {
                root: root.to_string(),
            };
            match self.send(&request).await? {
                StrataResponse::Ack => Ok(()),
                other => Err(unexpected("Subscribe", other)),
            }
        }

        pub async fn unsubscribe(&mut self, root: &str) -> anyhow::Result<bool> {
            let request = StrataRequest::Unsubscribe {
                root: root.to_string(),
            };
            match self.send(&request).await? {
                StrataResponse::Flag(existed) => Ok(existed),
                other => Err(unexpected("Unsubscribe", other)),
            }
        }

        pub async fn list_datasets(&mut self, root: &str) -> anyhow::Result<Vec<String>> {
            let request = StrataRequest::ListDatasets {
                root: root.to_string(),
            };
            match self.send(&request).await? {
                StrataResponse::Datasets(paths) => Ok(paths),
                other => Err(unexpected("ListDatasets", other)),
            }
        }

        pub async fn notify(&mut self, root: &str) -> anyhow::Result<bool> {
            let request = StrataRequest::Notify {
                root: root.to_string(),
            };
            match self.send(&request).await? {
                StrataResponse::Flag(known) => Ok(known),
                other => Err(unexpected("Notify", other)),
            }
        }

        pub async fn info(&mut self, root: &str, path: &str) -> anyhow::Result<DatasetMeta> {
            let request = StrataRequest::Info {
                root: root.to_string(),
                path: path.to_string(),
            };
            match self.send(&request).await? {
                StrataResponse::Info(meta) => Ok(*meta),
                other => Err(unexpected("Info", other)),
            }
        }

        pub async fn slice(
            &mut self,
            root: &str,
            path: &str,
            spec: SliceSpec,
            repr: Representation,
        ) -> anyhow::Result<SliceData> {
            let request = StrataRequest::Slice {
                root: root.to_string(),
                path: path.to_string(),
                spec,
                repr,
            };
            match self.send(&request).await? {
                StrataResponse::Slice(data) => Ok(data),
                other => Err(unexpected("Slice", other)),
            }
        }

        pub async fn download(&mut self, root: &str, path: &str) -> anyhow::Result<Vec<u8>> {
            let request = StrataRequest::Download {
                root: root.to_string(),
                path: path.to_string(),
            };
            match self.send(&request).await? {
                StrataResponse::Data(bytes) => Ok(bytes),
                other => Err(unexpected("Download", other)),
            }
        }

        pub async fn purge_deleted(&mut self, root: &str) -> anyhow::Result<Vec<String>> {
            let request = StrataRequest::PurgeDeleted {
                root: root.to_string(),
            };
            match self.send(&request).await? {
                StrataResponse::Purged(paths) => Ok(paths),
                other => Err(unexpected("PurgeDeleted", other)),
            }
        }
    }

    fn unexpected(op: &str, response: StrataResponse) -> anyhow::Error {
        match response {
            StrataResponse::Error { kind, message } => {
                anyhow::anyhow!("{} failed ({:?}): {}", op, kind, message)
            }
            other => anyhow::anyhow!("{}: unexpected response {:?}", op, other),
        }
    }
}
