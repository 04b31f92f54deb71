//! ==============================================================================
//! transport.rs - http transport to the remote readings table
//! ==============================================================================
//!
//! purpose:
//!     posts one batch of canonical readings as a json array.
//!
//! request:
//!     POST {api_url}{readings_path}
//!     apikey: <key>
//!     Authorization: Bearer <key>
//!     Content-Type: application/json
//!     Prefer: return=minimal
//!
//!     any 2xx status is success. everything else, including timeouts, is a
//!     failed batch; the sync engine decides what that means.
//!
//! ==============================================================================

use crate::domain::CanonicalReading;
use crate::sync::Transport;
use std::time::Duration;
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(api_url: &str, readings_path: &str, api_key: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()?;

        let path = readings_path.trim_start_matches('/');
        let url = format!("{}/{}", api_url.trim_end_matches('/'), path);

        Ok(Self { client, url, api_key: api_key.to_string() })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for HttpTransport {
    async fn send_batch(&self, batch: &[CanonicalReading]) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=minimal")
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(records = batch.len(), status = status.as_u16(), "batch accepted");
            return Ok(());
        }

        // the body is only for the log line; losing it is fine
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status { status: status.as_u16(), body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Captured {
        request_line: String,
        headers: Vec<(String, String)>,
        body: serde_json::Value,
    }

    impl Captured {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    /// accept one request, answer with `response`, hand back what was sent
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let header_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let head = String::from_utf8(buf[..header_end].to_vec()).unwrap();
            let mut lines = head.split("\r\n").filter(|l| !l.is_empty());
            let request_line = lines.next().unwrap().to_string();
            let headers: Vec<(String, String)> = lines
                .filter_map(|l| l.split_once(':'))
                .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
                .collect();
            let length: usize = headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
                .map(|(_, v)| v.parse().unwrap())
                .unwrap_or(0);

            while buf.len() < header_end + length {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending the body");
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = serde_json::from_slice(&buf[header_end..header_end + length]).unwrap();

            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            Captured { request_line, headers, body }
        });
        (format!("http://{}", addr), handle)
    }

    fn sample_batch() -> Vec<CanonicalReading> {
        vec![
            CanonicalReading {
                sensor_id: "hum-1".to_string(),
                value: 51.0,
                unit: "percent".to_string(),
                timestamp: 1_700_000_000,
                metadata: Some(serde_json::json!({"device_id": "pi-1"})),
            },
            CanonicalReading {
                sensor_id: "temp-1".to_string(),
                value: 23.0,
                unit: "celsius".to_string(),
                timestamp: 1_700_000_000,
                metadata: Some(serde_json::json!({"device_id": "pi-1"})),
            },
        ]
    }

    #[tokio::test]
    async fn test_posts_batch_with_auth_headers() {
        let (base, server) =
            serve_once("HTTP/1.1 201 Created\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let transport = HttpTransport::new(&format!("{}/", base), "/rest/v1/readings", "anon-key", Duration::from_secs(5)).unwrap();
        assert_eq!(transport.url(), format!("{}/rest/v1/readings", base));

        transport.send_batch(&sample_batch()).await.unwrap();

        let captured = server.await.unwrap();
        assert_eq!(captured.request_line, "POST /rest/v1/readings HTTP/1.1");
        assert_eq!(captured.header("apikey"), Some("anon-key"));
        assert_eq!(captured.header("authorization"), Some("Bearer anon-key"));
        assert_eq!(captured.header("content-type"), Some("application/json"));
        assert_eq!(captured.header("prefer"), Some("return=minimal"));
        assert_eq!(
            captured.body,
            serde_json::json!([
                {"sensor_id": "hum-1", "value": 51.0, "ts": "2023-11-14T22:13:20Z", "metadata": {"device_id": "pi-1"}},
                {"sensor_id": "temp-1", "value": 23.0, "ts": "2023-11-14T22:13:20Z", "metadata": {"device_id": "pi-1"}},
            ])
        );
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_status_error() {
        let (base, server) = serve_once(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\nconnection: close\r\n\r\nboom",
        )
        .await;
        let transport = HttpTransport::new(&base, "rest/v1/readings", "k", Duration::from_secs(5)).unwrap();

        match transport.send_batch(&sample_batch()).await {
            Err(TransportError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected a status error, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // hold the connection open without answering
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let transport =
            HttpTransport::new(&format!("http://{}", addr), "/rest/v1/readings", "k", Duration::from_millis(200)).unwrap();
        match transport.send_batch(&sample_batch()).await {
            Err(TransportError::Http(e)) => assert!(e.is_timeout()),
            other => panic!("expected a timeout, got {:?}", other),
        }
    }
}
