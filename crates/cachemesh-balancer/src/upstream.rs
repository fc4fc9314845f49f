//! Outbound loopback HTTP: the control-API pull and request
//! forwarding. One short-lived HTTP/1 connection per call, with the
//! deadline spanning connect through body read.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use thiserror::Error;
use tracing::debug;

use cachemesh_core::{ServerEntry, ServerId};

/// Failures talking to the manager or a backend. For a forwarded
/// client request, any of these becomes a 502.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid body: {0}")]
    Body(String),

    #[error("upstream request timed out")]
    Timeout,
}

async fn send(
    port: u16,
    method: Method,
    path_and_query: &str,
    body: Bytes,
    deadline: Duration,
) -> Result<(StatusCode, Bytes), UpstreamError> {
    let address = format!("127.0.0.1:{port}");

    let result = tokio::time::timeout(deadline, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| UpstreamError::Http(e.to_string()))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(method)
            .uri(path_and_query)
            .header("host", &address)
            .body(Full::new(body))
            .map_err(|e| UpstreamError::Http(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| UpstreamError::Http(e.to_string()))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| UpstreamError::Body(e.to_string()))?
            .to_bytes();
        Ok((status, bytes))
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => {
            debug!(port, path_and_query, "upstream call timed out");
            Err(UpstreamError::Timeout)
        }
    }
}

/// Pull the manager's `GET /cache-servers` table.
pub async fn fetch_server_table(
    manager_port: u16,
    deadline: Duration,
) -> Result<HashMap<ServerId, ServerEntry>, UpstreamError> {
    let (status, bytes) = send(
        manager_port,
        Method::GET,
        "/cache-servers",
        Bytes::new(),
        deadline,
    )
    .await?;
    if !status.is_success() {
        return Err(UpstreamError::Http(format!(
            "control API returned {status}"
        )));
    }

    let raw: HashMap<String, ServerEntry> =
        serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Body(e.to_string()))?;

    let mut table = HashMap::with_capacity(raw.len());
    for (id, entry) in raw {
        let id: ServerId = id
            .parse()
            .map_err(|_| UpstreamError::Body(format!("non-numeric server id '{id}'")))?;
        table.insert(id, entry);
    }
    Ok(table)
}

/// Forward a client request to a backend, propagating status and body.
pub async fn forward_request(
    port: u16,
    method: Method,
    path_and_query: &str,
    body: Bytes,
    deadline: Duration,
) -> Result<(StatusCode, Bytes), UpstreamError> {
    send(port, method, path_and_query, body, deadline).await
}
