//! Channel over any async byte stream (plain TCP or a TLS session).

use super::{ChannelError, ChannelTrust, DataChannel, PeerSession};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Bound on the orderly shutdown performed by `close`
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Read and write halves are locked separately so one task can read while
/// another writes. The `closed` flag wakes any blocked operation. Both halves
/// are dropped on close, which releases the underlying stream.
pub struct StreamChannel<S> {
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    closed: watch::Sender<bool>,
    trust: ChannelTrust,
    peer_addr: Option<SocketAddr>,
    session: Option<PeerSession>,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        trust: ChannelTrust,
        peer_addr: Option<SocketAddr>,
        session: Option<PeerSession>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
            trust,
            peer_addr,
            session,
        }
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Resolves once the channel is marked closed.
async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl<S> DataChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let closed = self.closed_signal();
        tokio::select! {
            result = async {
                let mut reader = self.reader.lock().await;
                let reader = reader.as_mut().ok_or(ChannelError::Closed)?;
                Ok::<_, ChannelError>(reader.read(buf).await?)
            } => result,
            _ = wait_closed(closed) => Err(ChannelError::Closed),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let closed = self.closed_signal();
        tokio::select! {
            result = async {
                let mut writer = self.writer.lock().await;
                let writer = writer.as_mut().ok_or(ChannelError::Closed)?;
                Ok::<_, ChannelError>(writer.write(buf).await?)
            } => result,
            _ = wait_closed(closed) => Err(ChannelError::Closed),
        }
    }

    async fn flush(&self) -> Result<bool, ChannelError> {
        if !self.is_open() {
            return Ok(false);
        }
        let closed = self.closed_signal();
        tokio::select! {
            result = async {
                let mut writer = self.writer.lock().await;
                match writer.as_mut() {
                    Some(writer) => writer.flush().await.map(|_| true),
                    None => Ok(false),
                }
            } => Ok(result?),
            _ = wait_closed(closed) => Ok(false),
        }
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        // blocked writers see the flag and release the lock
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.shutdown().await,
                None => Ok(()),
            }
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("shutdown of channel to {:?} failed: {}", self.peer_addr, e),
            Err(_) => debug!("shutdown of channel to {:?} timed out", self.peer_addr),
        }

        // the stream is freed once both halves are gone
        let release = async {
            drop(self.writer.lock().await.take());
            drop(self.reader.lock().await.take());
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, release).await.is_err() {
            debug!("release of channel to {:?} timed out", self.peer_addr);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    fn trust(&self) -> ChannelTrust {
        self.trust
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn peer_session(&self) -> Option<&PeerSession> {
        self.session.as_ref()
    }
}
