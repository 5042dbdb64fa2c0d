//! TCP line ingest.
//!
//! One listener task accepts connections; each connection gets a reader
//! task that pulls newline-delimited lines into a reused byte buffer and
//! runs them through the line processor. Matched points go into the
//! bounded pipeline channel with a blocking send, so sink latency
//! propagates back to producers instead of dropping data.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::filter::{LineProcessor, MatchedPoint};

/// TCP listener feeding the pipeline channel.
pub struct LineListener {
    listener: TcpListener,
    processor: Arc<LineProcessor>,
    tx: mpsc::Sender<MatchedPoint>,
    cancel: CancellationToken,
}

impl LineListener {
    /// Bind the ingest socket. Failing to bind is a startup error.
    pub async fn bind(
        addr: &str,
        processor: Arc<LineProcessor>,
        tx: mpsc::Sender<MatchedPoint>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding ingest listener on {addr}"))?;

        info!(
            addr = %listener.local_addr().context("getting local address")?,
            "ingest listener bound",
        );

        Ok(Self {
            listener,
            processor,
            tx,
            cancel,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("getting local address")
    }

    /// Accept connections until cancelled, then wait for the readers.
    ///
    /// Dropping `self` afterwards drops the channel sender; once every
    /// reader has exited, the channel closes and the batcher drains.
    pub async fn run(self) {
        let mut readers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("ingest listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        let processor = Arc::clone(&self.processor);
                        let tx = self.tx.clone();
                        let cancel = self.cancel.clone();
                        readers.spawn(read_lines(stream, peer, processor, tx, cancel));
                    }
                    Err(e) => {
                        // Transient accept failures keep the loop alive.
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        // Stop accepting before waiting out in-flight readers.
        drop(self.listener);
        while readers.join_next().await.is_some() {}
    }
}

/// Per-connection reader. Lines are processed in arrival order; the
/// buffer is reused across lines.
async fn read_lines(
    stream: TcpStream,
    peer: SocketAddr,
    processor: Arc<LineProcessor>,
    tx: mpsc::Sender<MatchedPoint>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(256);

    loop {
        line.clear();

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(peer = %peer, "reader shutting down");
                return;
            }
            read = reader.read_until(b'\n', &mut line) => match read {
                Ok(0) => {
                    debug!(peer = %peer, "connection closed");
                    return;
                }
                Ok(_) => {
                    if line.last() == Some(&b'\n') {
                        line.pop();
                    }
                    if let Some(point) = processor.process(&line) {
                        // Blocking send: the bounded channel is the
                        // backpressure mechanism.
                        if tx.send(point).await.is_err() {
                            debug!(peer = %peer, "pipeline closed, dropping connection");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "read failed, closing connection");
                    return;
                }
            },
        }
    }
}
