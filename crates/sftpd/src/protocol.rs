//! Protocol handler boundary.
//!
//! Once a channel is dispatched, its byte stream is handed to a
//! [`ProtocolHandler`] and the SSH layer stops looking at it. The handler
//! owns the stream until the session ends; the caller closes the channel
//! when [`ProtocolHandler::serve`] returns.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::local_fs::LocalFs;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

/// Serves a protocol over a dispatched channel stream.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Run a session over `stream` until the peer goes away or the
    /// protocol gives up.
    fn serve<S>(&self, stream: S) -> impl Future<Output = Result<(), ProtocolError>> + Send
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

/// SFTP over the local filesystem.
#[derive(Debug, Clone)]
pub struct SftpProtocol {
    base_dir: PathBuf,
}

impl SftpProtocol {
    /// `base_dir` anchors relative paths sent by clients.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl ProtocolHandler for SftpProtocol {
    async fn serve<S>(&self, stream: S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (stream, released) = Tracked::new(stream);
        log::info!("SFTP session started");

        // russh-sftp drives the session on its own task; we learn that it is
        // over when it drops the stream.
        russh_sftp::server::run(stream, LocalFs::new(self.base_dir.clone())).await;
        let _ = released.await;
        Ok(())
    }
}

/// Stream wrapper that signals when it is dropped.
struct Tracked<S> {
    inner: S,
    _release: oneshot::Sender<()>,
}

impl<S> Tracked<S> {
    fn new(inner: S) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner,
                _release: tx,
            },
            rx,
        )
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
