//! Typed client for the HTTP control surface

use serde::Deserialize;

use devsim_core::{DeviceError, DeviceResult};
use devsim_runtime::http::MetricsResponse;
use devsim_runtime::PublishResult;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct StatusBody {
    pub pod: String,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LinkBody {
    pub pod: String,
    pub state: String,
    pub paused: bool,
    pub outages: u64,
    pub dropped: u64,
}

#[derive(Clone, Debug)]
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        ControlClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn status(&self) -> DeviceResult<StatusBody> {
        self.get("/status").await
    }

    pub async fn metrics(&self) -> DeviceResult<MetricsResponse> {
        self.get("/metrics").await
    }

    pub async fn link(&self) -> DeviceResult<LinkBody> {
        self.get("/link").await
    }

    /// `POST /publish`; `None` sends no body at all
    pub async fn publish(&self, message: Option<&str>) -> DeviceResult<PublishResult> {
        let mut request = self.http.post(format!("{}/publish", self.base_url));
        if let Some(message) = message {
            request = request.json(&serde_json::json!({ "message": message }));
        }
        let response = request.send().await.map_err(DeviceError::transport)?;
        response.json().await.map_err(DeviceError::transport)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> DeviceResult<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(DeviceError::transport)?;
        response.json().await.map_err(DeviceError::transport)
    }
}
