use crate::types::WorkerRequest;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Webhook dispatch failures. Display strings are part of the engine's
/// contract — they are written verbatim into the failed node state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Invalid webhook URL")]
    InvalidUrl,
    #[error("Worker webhook unreachable")]
    Unreachable,
    #[error("Worker webhook timeout exceeded")]
    Timeout,
    #[error("Worker webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Bounded-deadline HTTP client for worker dispatch. The deadline covers
/// the whole request; reqwest aborts the in-flight call when it expires.
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// POST the Worker Protocol body. Any non-2xx, transport error, or
    /// timeout is a dispatch failure; a 2xx response means the worker
    /// accepted the work and will call back later.
    pub async fn dispatch(
        &self,
        webhook_url: &str,
        request: &WorkerRequest,
    ) -> Result<(), DispatchError> {
        let url = Url::parse(webhook_url).map_err(|_| DispatchError::InvalidUrl)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DispatchError::InvalidUrl);
        }

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DispatchError::Timeout
                } else {
                    DispatchError::Unreachable
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn request() -> WorkerRequest {
        WorkerRequest {
            run_id: Uuid::now_v7(),
            node_id: "W".to_string(),
            config: json!({}),
            input: json!({"prompt": "hi"}),
            callback_url: "http://localhost:4000/api/stitch/callback/r/W".to_string(),
        }
    }

    /// One-shot HTTP responder on an ephemeral port. Reads the full
    /// request (headers + content-length body) before answering so the
    /// client never sees a mid-request hangup.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    request.extend_from_slice(&buf[..n]);
                    if request_complete(&request) {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/hook")
    }

    fn request_complete(raw: &[u8]) -> bool {
        let Some(header_end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&raw[..header_end]).to_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        raw.len() >= header_end + 4 + content_length
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_any_io() {
        let dispatcher = WebhookDispatcher::new(Duration::from_secs(1)).unwrap();
        let err = dispatcher.dispatch("not a url", &request()).await.unwrap_err();
        assert_eq!(err, DispatchError::InvalidUrl);
        assert_eq!(err.to_string(), "Invalid webhook URL");

        let err = dispatcher
            .dispatch("ftp://example.com/hook", &request())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::InvalidUrl);
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let dispatcher = WebhookDispatcher::new(Duration::from_secs(1)).unwrap();
        // Port 1 is never listening.
        let err = dispatcher
            .dispatch("http://127.0.0.1:1/hook", &request())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Unreachable);
        assert_eq!(err.to_string(), "Worker webhook unreachable");
    }

    #[tokio::test]
    async fn silent_server_trips_the_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the socket open without responding.
            if let Ok((socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(socket);
            }
        });

        let dispatcher = WebhookDispatcher::new(Duration::from_millis(200)).unwrap();
        let err = dispatcher
            .dispatch(&format!("http://{addr}/hook"), &request())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Timeout);
        assert_eq!(err.to_string(), "Worker webhook timeout exceeded");
    }

    #[tokio::test]
    async fn non_2xx_carries_status_and_body() {
        let url = serve_once("500 Internal Server Error", "boom").await;
        let dispatcher = WebhookDispatcher::new(Duration::from_secs(1)).unwrap();
        let err = dispatcher.dispatch(&url, &request()).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::Status {
                status: 500,
                body: "boom".to_string()
            }
        );
        assert_eq!(err.to_string(), "Worker webhook returned 500: boom");
    }

    #[tokio::test]
    async fn accepted_dispatch_is_ok() {
        let url = serve_once("200 OK", "").await;
        let dispatcher = WebhookDispatcher::new(Duration::from_secs(1)).unwrap();
        assert!(dispatcher.dispatch(&url, &request()).await.is_ok());
    }
}
