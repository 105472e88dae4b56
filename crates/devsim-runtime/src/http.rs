//! HTTP control surface
//!
//! | route           | body                                                  |
//! |-----------------|-------------------------------------------------------|
//! | `GET /status`   | `{pod, status: "online"}`                             |
//! | `POST /publish` | `{message?}` -> `{published, topic, message, error?}` |
//! | `GET /metrics`  | `{sent, received, avg_latency, latency_samples}`      |
//! | `GET /link`     | `{pod, state, paused, outages, dropped}`              |
//!
//! `POST /publish` answers 400 with `{error}` when the body is not a JSON
//! object with an optional string `message`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use devsim_core::DeviceResult;

use crate::device::{DeviceRuntime, DeviceStatus, LinkStatus};
use crate::scheduler::PublishResult;

/// Message published when the request names none
pub const DEFAULT_MESSAGE: &str = "hello";

#[derive(Clone)]
struct AppState {
    device: Arc<DeviceRuntime>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a rejected request
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub sent: u64,
    pub received: u64,
    /// Seconds, `null` before the first sample
    pub avg_latency: Option<f64>,
    /// Seconds, at most the ten most recent
    pub latency_samples: Vec<f64>,
}

pub fn router(device: Arc<DeviceRuntime>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/publish", post(publish))
        .route("/metrics", get(metrics))
        .route("/link", get(link))
        .with_state(AppState { device })
}

/// Bind `addr` and serve until `shutdown` resolves
pub async fn serve(
    device: Arc<DeviceRuntime>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> DeviceResult<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(device, listener, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve_on(
    device: Arc<DeviceRuntime>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> DeviceResult<()> {
    let addr = listener.local_addr()?;
    info!(pod = %device.identity(), ?addr, "Control surface listening");
    axum::serve(listener, router(device))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn status(State(state): State<AppState>) -> Json<DeviceStatus> {
    Json(state.device.status())
}

/// Message text requested by a `/publish` body.
///
/// The body is read as JSON whatever its content type. An empty body or a
/// missing `message` selects [`DEFAULT_MESSAGE`]; anything unreadable is an
/// error.
pub fn requested_message(body: &[u8]) -> DeviceResult<String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DEFAULT_MESSAGE.to_string());
    }
    let request: PublishRequest = serde_json::from_slice(body)?;
    Ok(request.message.unwrap_or_else(|| DEFAULT_MESSAGE.to_string()))
}

async fn publish(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PublishResult>, (StatusCode, Json<ErrorResponse>)> {
    let text = requested_message(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;
    Ok(Json(state.device.publish(&text).await))
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    let snapshot = state.device.metrics();
    Json(MetricsResponse {
        sent: snapshot.sent,
        received: snapshot.received,
        avg_latency: snapshot.average_latency,
        latency_samples: snapshot
            .recent_latencies
            .iter()
            .map(|d| d.as_secs_f64())
            .collect(),
    })
}

async fn link(State(state): State<AppState>) -> Json<LinkStatus> {
    Json(state.device.link_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use devsim_core::{DeviceIdentity, FailureProfile, NetworkProfile};
    use devsim_transport::MemoryBroker;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn spawn_server(loss: f64) -> (String, Arc<DeviceRuntime>, oneshot::Sender<()>) {
        let network = NetworkProfile::new(Duration::ZERO, Duration::from_millis(2), loss).unwrap();
        let config = DeviceConfig::new(DeviceIdentity::new("dev-http").unwrap())
            .with_network(network)
            .with_failure(FailureProfile::never())
            .with_seed(3);
        let device = Arc::new(DeviceRuntime::new(config, Arc::new(MemoryBroker::new())).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(serve_on(device.clone(), listener, async move {
            let _ = rx.await;
        }));
        (base, device, tx)
    }

    #[tokio::test]
    async fn test_status_route() {
        let (base, _device, _stop) = spawn_server(0.0).await;

        let body: Value = reqwest::get(format!("{base}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!({"pod": "dev-http", "status": "online"}));
    }

    #[tokio::test]
    async fn test_publish_defaults_to_hello() {
        let (base, device, _stop) = spawn_server(0.0).await;
        let handle = device.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = reqwest::Client::new();
        let body: PublishResult = client
            .post(format!("{base}/publish"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body.published);
        assert_eq!(body.message, "hello");
        assert_eq!(body.topic, "mqtt/dev-http");
        assert_eq!(body.error, None);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_reports_loss() {
        let (base, _device, _stop) = spawn_server(1.0).await;

        let body: Value = reqwest::Client::new()
            .post(format!("{base}/publish"))
            .json(&serde_json::json!({"message": "x"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["published"], false);
        assert_eq!(body["message"], "x");
        assert_eq!(body["error"], "Simulated packet loss");
    }

    #[tokio::test]
    async fn test_metrics_shape() {
        let (base, _device, _stop) = spawn_server(0.0).await;

        let body: Value = reqwest::get(format!("{base}/metrics"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "sent": 0,
                "received": 0,
                "avg_latency": null,
                "latency_samples": []
            })
        );
    }

    #[tokio::test]
    async fn test_link_route() {
        let (base, _device, _stop) = spawn_server(0.0).await;

        let body: Value = reqwest::get(format!("{base}/link"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["pod"], "dev-http");
        assert_eq!(body["state"], "disconnected");
        assert_eq!(body["paused"], false);
        assert_eq!(body["outages"], 0);
    }

    #[test]
    fn test_requested_message() {
        assert_eq!(requested_message(b"").unwrap(), "hello");
        assert_eq!(requested_message(b" \n").unwrap(), "hello");
        assert_eq!(requested_message(b"{}").unwrap(), "hello");
        assert_eq!(requested_message(br#"{"message":null}"#).unwrap(), "hello");
        assert_eq!(requested_message(br#"{"message":"x"}"#).unwrap(), "x");

        assert!(requested_message(br#"{"message":"#).is_err());
        assert!(requested_message(br#"{"message":42}"#).is_err());
        assert!(requested_message(b"message=x").is_err());
    }

    #[tokio::test]
    async fn test_publish_reads_body_whatever_the_content_type() {
        let (base, _device, _stop) = spawn_server(1.0).await;

        let body: PublishResult = reqwest::Client::new()
            .post(format!("{base}/publish"))
            .header("content-type", "text/plain")
            .body(r#"{"message":"x"}"#)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.message, "x");
    }

    #[tokio::test]
    async fn test_publish_rejects_unreadable_body() {
        let (base, device, _stop) = spawn_server(0.0).await;
        let client = reqwest::Client::new();

        for raw in [r#"{"message":"#, r#"{"message":42}"#] {
            let response = client
                .post(format!("{base}/publish"))
                .header("content-type", "application/json")
                .body(raw)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
            let body: ErrorResponse = response.json().await.unwrap();
            assert!(!body.error.is_empty());
        }
        // Rejected before anything is sent
        assert_eq!(device.network().attempts(), 0);
    }
}
