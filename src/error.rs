use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Iperf3Error {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("access denied by the server")]
    AccessDenied,
    #[error("server reported an error")]
    ServerError,
    #[error("unable to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("control connection closed unexpectedly")]
    ControlClosed,
    #[error("failed to create stream {id}: {source}")]
    StreamCreate { id: u32, source: std::io::Error },
    #[error("{context}: {source}")]
    FileIo {
        context: &'static str,
        source: std::io::Error,
    },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("serialize/deserialize error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Iperf3Error {
    pub(crate) fn file(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Iperf3Error::FileIo { context, source }
    }
}

pub type Result<T> = std::result::Result<T, Iperf3Error>;
