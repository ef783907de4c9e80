//! Stdio transport.
//!
//! One JSON-RPC message (or batch) per LF-terminated line on stdin; one
//! response per line on stdout. Requests are handled concurrently; a writer
//! task serializes output so responses are always complete lines. Logging
//! goes to stderr, never stdout.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::protocol::{self, IncomingBody, JsonRpcResponse};
use crate::tools::{Caller, Dispatcher};

/// Implicit session id for the process lifetime.
const STDIO_SESSION: &str = "stdio";

/// Run the stdio transport until stdin closes.
pub async fn run_stdio(dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    // Single writer: responses from concurrent handlers never interleave.
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            if stdout.write_all(response.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    tracing::info!("MCP stdio server ready, waiting for requests...");

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            tracing::info!("Stdin closed, shutting down");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let tx = tx.clone();
        let dispatcher = Arc::clone(&dispatcher);
        let payload = trimmed.to_owned();
        tokio::spawn(async move {
            if let Some(response) = handle_line(&dispatcher, &payload).await {
                let _ = tx.send(response).await;
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// Process one input line into at most one output line.
async fn handle_line(dispatcher: &Dispatcher, payload: &str) -> Option<String> {
    let caller = Caller { session_id: Some(STDIO_SESSION.to_owned()), ..Default::default() };

    let body = match protocol::parse_text(payload) {
        Ok(body) => body,
        Err(e) => {
            return serde_json::to_string(&e.to_response()).ok();
        }
    };

    match body {
        IncomingBody::Single(request) => {
            let response = super::handle_request(dispatcher, &request, &caller).await?;
            serde_json::to_string(&response).ok()
        }
        IncomingBody::Batch(requests) => {
            let futures = requests.iter().map(|req| super::handle_request(dispatcher, req, &caller));
            let responses: Vec<JsonRpcResponse> =
                futures::future::join_all(futures).await.into_iter().flatten().collect();

            // A batch of only notifications produces no output at all.
            if responses.is_empty() {
                None
            } else {
                serde_json::to_string(&responses).ok()
            }
        }
    }
}
