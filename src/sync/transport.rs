use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to collector at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("collector at {addr} did not accept within {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("write to collector failed: {0}")]
    Write(#[source] io::Error),
    #[error("read from collector failed: {0}")]
    Read(#[source] io::Error),
}

/// What came back from the collector after one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Reply line without its terminator. Its content is not interpreted.
    Received(String),
    TimedOut,
    /// The collector closed its side of the connection.
    Closed,
}

/// One TCP connection to the collector, opened for a single draining pass.
pub struct CollectorSession {
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    /// Bytes of a reply line that arrived before an ack wait timed out.
    partial_ack: Vec<u8>,
}

impl CollectorSession {
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => return Err(TransportError::ConnectTimeout { addr, timeout }),
        };

        let peer = stream
            .peer_addr()
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;
        // Records are small and flushed one at a time.
        if let Err(err) = stream.set_nodelay(true) {
            log::debug!("Could not disable Nagle on {peer}: {err}");
        }

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            peer,
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            partial_ack: Vec::new(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes `line` plus a newline and flushes, so the collector sees the
    /// complete record immediately.
    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(TransportError::Write)?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(TransportError::Write)?;
        self.writer.flush().await.map_err(TransportError::Write)
    }

    /// Waits up to `timeout` for one reply line. Bytes of a line still
    /// incomplete at the deadline are kept for the next call.
    pub async fn await_ack(&mut self, timeout: Duration) -> Result<Ack, TransportError> {
        let read = self.reader.read_until(b'\n', &mut self.partial_ack);
        match tokio::time::timeout(timeout, read).await {
            Err(_) => Ok(Ack::TimedOut),
            Ok(Err(err)) => Err(TransportError::Read(err)),
            Ok(Ok(0)) if self.partial_ack.is_empty() => Ok(Ack::Closed),
            Ok(Ok(_)) => {
                let line = std::mem::take(&mut self.partial_ack);
                let line = String::from_utf8_lossy(&line);
                Ok(Ack::Received(
                    line.trim_end_matches(['\r', '\n']).to_string(),
                ))
            }
        }
    }

    /// Flushes and shuts down the write side. The socket is released when
    /// the session is dropped either way.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await.map_err(TransportError::Write)
    }
}
