//! The outbound telemetry call.
//!
//! A single short-lived HTTP/1 connection per poll, with the deadline
//! applied to the whole connect-request-read sequence.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use thiserror::Error;
use tracing::debug;

/// Why a telemetry poll failed. Per-poll errors are dropped for that
/// tick and never mutate the stored capacity factor.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("invalid telemetry body: {0}")]
    Body(String),

    #[error("telemetry request timed out")]
    Timeout,
}

/// `GET /capacity-factor` against a worker on the loopback interface.
pub async fn fetch_capacity_factor(port: u16, deadline: Duration) -> Result<f64, TelemetryError> {
    let address = format!("127.0.0.1:{port}");

    let result = tokio::time::timeout(deadline, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| TelemetryError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| TelemetryError::Http(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri("/capacity-factor")
            .header("host", &address)
            .body(Empty::<Bytes>::new())
            .expect("static telemetry request");

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| TelemetryError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(TelemetryError::Status(resp.status().as_u16()));
        }

        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| TelemetryError::Body(e.to_string()))?
            .to_bytes();

        let json: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| TelemetryError::Body(e.to_string()))?;
        json.get("capacity_factor")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| TelemetryError::Body("missing capacity_factor field".to_string()))
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => {
            debug!(port, "telemetry poll timed out");
            Err(TelemetryError::Timeout)
        }
    }
}
