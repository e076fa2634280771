//! # Command Ingress
//!
//! The TCP listener that turns a [`CommandRequest`]/[`CommandResponse`]
//! envelope (spec §6) into bytes on the wire. Grounded in the teacher's
//! `server.rs` accept loop (bind once, spawn a task per connection,
//! process lines until the client disconnects or errors), but replacing
//! its hand-rolled Redis-like text protocol with one JSON value per line,
//! matching the structured envelope `command::envelope` already defines.

use crate::command::{CommandProcessor, CommandRequest};
use crate::storage::StorageEngine;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// A line longer than this is refused outright rather than buffered
/// without bound.
const MAX_REQUEST_LINE_BYTES: usize = 1024 * 1024;

/// Bind `addr` and serve command requests against `processor` until the
/// process exits. Each connection gets its own task; the processor itself
/// is shared and already internally synchronized via Storage's locks.
pub async fn run<S: StorageEngine + 'static>(addr: &str, processor: Arc<CommandProcessor<S>>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("command ingress listening on {addr}");

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let processor = processor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, processor).await {
                warn!("command ingress connection from {peer_addr} ended with error: {e}");
            }
        });
    }
}

async fn handle_connection<S: StorageEngine>(socket: TcpStream, processor: Arc<CommandProcessor<S>>) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(());
        }
        if bytes_read > MAX_REQUEST_LINE_BYTES {
            write_half.write_all(b"{\"error\":\"request line too long\"}\n").await?;
            return Ok(());
        }

        let request: CommandRequest = match serde_json::from_str(line.trim_end()) {
            Ok(request) => request,
            Err(e) => {
                let msg = format!("{{\"error\":\"malformed request: {e}\"}}\n");
                write_half.write_all(msg.as_bytes()).await?;
                continue;
            }
        };

        let response = processor.execute(request);
        let mut encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("failed to encode command response: {e}");
                continue;
            }
        };
        encoded.push('\n');
        write_half.write_all(encoded.as_bytes()).await?;
    }
}
