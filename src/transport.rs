// Copyright (c) 2025 - Cowboy AI, Inc.
//! TCP Command Server
//!
//! Newline-delimited JSON over TCP. Each inbound line is one command; each
//! result is written back as one line. Commands on a connection may be
//! pipelined, and results are written in completion order, so clients
//! correlate them through `intent`.
//!
//! ```text
//! client ──line──→ reader ──→ JsonProcessor ──→ workers
//!    ↑                                             │
//!    └──line── writer task ←── unbounded channel ←─┘
//! ```
//!
//! Shutdown is signalled through a `watch` channel: the listener stops
//! accepting, connections stop reading, and results for commands already
//! submitted are still written before each connection closes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::Aggregate;
use crate::protocol::JsonProcessor;

/// Configuration for the TCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_address: String,
    /// Longest accepted line in bytes, excluding the line terminator
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7070".to_string(),
            max_frame_length: 500_000,
        }
    }
}

/// Serves a [`JsonProcessor`] over TCP
pub struct TcpCommandServer<A: Aggregate> {
    processor: Arc<JsonProcessor<A>>,
    config: ServerConfig,
}

impl<A> TcpCommandServer<A>
where
    A: Aggregate + Serialize,
{
    pub fn new(processor: Arc<JsonProcessor<A>>, config: ServerConfig) -> Self {
        Self { processor, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` turns true
    ///
    /// Dropping the sender side of `shutdown` also stops the server.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        info!(address = %listener.local_addr()?, "Command server listening");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(
                            self.processor.clone(),
                            stream,
                            peer,
                            self.config.max_frame_length,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!("Command server stopped accepting connections");
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// A complete line is in the buffer
    Line,
    /// A line exceeded the limit and was discarded
    TooLong,
    /// The peer closed the connection
    Eof,
}

/// Read the next line into `frame`, without its terminator
///
/// Lines longer than `max_frame_length` are consumed up to and including
/// their newline without being buffered. A final line without a newline
/// still counts as a line.
async fn read_frame<R>(
    reader: &mut R,
    frame: &mut Vec<u8>,
    max_frame_length: usize,
) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    frame.clear();
    let mut discarding = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if discarding {
                Frame::TooLong
            } else if frame.is_empty() {
                Frame::Eof
            } else {
                finish_frame(frame, max_frame_length)
            });
        }

        let newline = available.iter().position(|b| *b == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];
        let used = newline.map_or(available.len(), |i| i + 1);

        // One extra byte leaves room for a '\r' before the newline
        if !discarding {
            if frame.len() + chunk.len() > max_frame_length + 1 {
                discarding = true;
                frame.clear();
            } else {
                frame.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if newline.is_some() {
            return Ok(if discarding {
                Frame::TooLong
            } else {
                finish_frame(frame, max_frame_length)
            });
        }
    }
}

fn finish_frame(frame: &mut Vec<u8>, max_frame_length: usize) -> Frame {
    if frame.last() == Some(&b'\r') {
        frame.pop();
    }
    if frame.len() > max_frame_length {
        frame.clear();
        Frame::TooLong
    } else {
        Frame::Line
    }
}

async fn handle_connection<A>(
    processor: Arc<JsonProcessor<A>>,
    stream: TcpStream,
    peer: SocketAddr,
    max_frame_length: usize,
    mut shutdown: watch::Receiver<bool>,
) where
    A: Aggregate + Serialize,
{
    let connection = Uuid::now_v7();
    debug!(%connection, %peer, "Accepted connection");

    let (read_half, mut write_half) = stream.into_split();
    let (responses, mut outbox) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(mut response) = outbox.recv().await {
            response.push('\n');
            if let Err(e) = write_half.write_all(response.as_bytes()).await {
                debug!(%connection, error = %e, "Peer stopped reading responses");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut reader = BufReader::new(read_half);
    let mut frame = Vec::new();
    let mut commands: u64 = 0;

    loop {
        let read = tokio::select! {
            read = read_frame(&mut reader, &mut frame, max_frame_length) => read,
            _ = shutdown.changed() => break,
        };

        match read {
            Ok(Frame::Eof) => break,
            Ok(Frame::TooLong) => {
                warn!(%connection, max_frame_length, "Discarded oversized frame");
                let tx = responses.clone();
                processor.reject_invalid_json(move |failure| {
                    let _ = tx.send(failure);
                });
            }
            Ok(Frame::Line) => {
                if frame.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                commands += 1;

                let on_success = responses.clone();
                let on_error = responses.clone();
                match std::str::from_utf8(&frame) {
                    Ok(text) => processor.submit_str(
                        text,
                        move |success| {
                            let _ = on_success.send(success);
                        },
                        move |failure| {
                            let _ = on_error.send(failure);
                        },
                    ),
                    Err(_) => processor.reject_invalid_json(move |failure| {
                        let _ = on_error.send(failure);
                    }),
                }
            }
            Err(e) => {
                debug!(%connection, error = %e, "Read failed");
                break;
            }
        }
    }

    // The writer drains until every outstanding callback has fired
    drop(responses);
    let _ = writer.await;
    debug!(%connection, commands, "Closed connection");
}
