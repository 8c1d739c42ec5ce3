//! reqwest-backed cloud gateway
//!
//! Talks to the device cloud's JSON:API v5 endpoints. The endpoint base is
//! read from the project settings on every call so that a change made by
//! the prerequisite chain takes effect immediately.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use impcloud_core::settings::SettingsStore;
use impcloud_core::transport::pump_to_channel;
use impcloud_core::{
    AccessToken, ApiError, ApiResult, ChannelStream, CloudGateway, CompileDiagnostic, Deployment,
    Device, DeviceGroup, LogStream, LogStreamInfo, Product, SourceKind,
};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

const JSON_API: &str = "application/vnd.api+json";

/// Chunks buffered between the HTTP body and the session
const STREAM_BUFFER: usize = 64;

/// Token lifetime assumed when the server does not state one
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct Document<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Resource<A> {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    attributes: A,
    #[serde(default)]
    relationships: Value,
}

#[derive(Debug, Default, Deserialize)]
struct NamedAttributes {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceAttributes {
    #[serde(default)]
    agent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CodeAttributes {
    #[serde(default)]
    agent_code: String,
    #[serde(default)]
    device_code: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self, now: DateTime<Utc>) -> AccessToken {
        let expires_at = self.expires_at.unwrap_or_else(|| {
            now + ChronoDuration::seconds(self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS))
        });
        let token = AccessToken::new(self.access_token, expires_at);
        match self.refresh_token {
            Some(refresh) => token.with_refresh_token(refresh),
            None => token,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDocument {
    #[serde(default)]
    errors: Vec<ErrorObject>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorObject {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    meta: Value,
}

/// Map a failed response to the gateway error taxonomy
fn classify(status: StatusCode, body: &str) -> ApiError {
    if status == StatusCode::UNAUTHORIZED {
        return ApiError::InvalidCredentials;
    }

    let document: ErrorDocument = serde_json::from_str(body).unwrap_or_default();
    if let Some(compile) = document
        .errors
        .iter()
        .find(|e| e.code.as_deref() == Some("CompileFailed"))
    {
        return ApiError::CompileFailure(compile_diagnostics(&compile.meta));
    }

    let message = document
        .errors
        .first()
        .and_then(|e| e.detail.clone().or_else(|| e.title.clone()))
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    if status.is_client_error() {
        ApiError::WrongInput(message)
    } else {
        ApiError::Failure(message)
    }
}

/// Diagnostics listed in a `CompileFailed` error's `meta`
fn compile_diagnostics(meta: &Value) -> Vec<CompileDiagnostic> {
    let Some(entries) = meta.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .map(|entry| {
            let file = entry.get("file").and_then(Value::as_str).unwrap_or_default();
            let number = |key: &str| entry.get(key).and_then(Value::as_u64).unwrap_or(0) as usize;
            let message = entry
                .get("text")
                .or_else(|| entry.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("compile error");
            CompileDiagnostic {
                source: if file.contains("agent") {
                    SourceKind::Agent
                } else {
                    SourceKind::Device
                },
                row: number("row"),
                column: number("column"),
                message: message.to_string(),
            }
        })
        .collect()
}

fn transport(err: reqwest::Error) -> ApiError {
    ApiError::Failure(err.to_string())
}

/// Cloud gateway over HTTPS
pub struct HttpGateway {
    client: Client,
    /// Same client without an overall timeout, for the long-lived log stream
    stream_client: Client,
    store: SettingsStore,
}

impl HttpGateway {
    pub fn new(store: SettingsStore) -> anyhow::Result<Self> {
        let user_agent = concat!("impcloud/", env!("CARGO_PKG_VERSION"));
        Ok(Self {
            client: Client::builder()
                .user_agent(user_agent)
                .timeout(Duration::from_secs(30))
                .build()?,
            stream_client: Client::builder()
                .user_agent(user_agent)
                .connect_timeout(Duration::from_secs(30))
                .build()?,
            store,
        })
    }

    fn url(&self, path: &str) -> ApiResult<Url> {
        let settings = self
            .store
            .load()
            .map_err(|e| ApiError::Failure(format!("cannot read settings: {e}")))?;
        let mut base = settings.cloud_url().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base)
            .and_then(|base| base.join(path))
            .map_err(|e| ApiError::WrongInput(format!("invalid cloud endpoint {base}: {e}")))
    }

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .bearer_auth(token)
            .header(header::ACCEPT, JSON_API)
    }

    async fn send(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = request.send().await.map_err(transport)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::debug!("Cloud request failed (HTTP {}): {}", status.as_u16(), body);
        Err(classify(status, &body))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ApiResult<T> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Failure(format!("unexpected response: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, token: &str, url: Url) -> ApiResult<T> {
        self.json(self.authorized(self.client.get(url), token)).await
    }

    async fn device_group(&self, token: &str, group_id: &str) -> ApiResult<Resource<NamedAttributes>> {
        let url = self.url(&format!("devicegroups/{group_id}"))?;
        let document: Document<Resource<NamedAttributes>> = self.get(token, url).await?;
        Ok(document.data)
    }
}

#[async_trait]
impl CloudGateway for HttpGateway {
    async fn login(&self, id: &str, password: &str) -> ApiResult<AccessToken> {
        let request = self
            .client
            .post(self.url("auth")?)
            .json(&json!({ "id": id, "password": password }));
        let response: TokenResponse = self.json(request).await?;
        Ok(response.into_token(Utc::now()))
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> ApiResult<AccessToken> {
        let request = self
            .client
            .post(self.url("auth/token")?)
            .json(&json!({ "token": refresh_token }));
        let response: TokenResponse = self.json(request).await?;
        Ok(response.into_token(Utc::now()))
    }

    async fn list_products(&self, token: &str) -> ApiResult<Vec<Product>> {
        let document: Document<Vec<Resource<NamedAttributes>>> =
            self.get(token, self.url("products")?).await?;
        Ok(document
            .data
            .into_iter()
            .map(|r| Product {
                name: r.attributes.name.unwrap_or_else(|| r.id.clone()),
                id: r.id,
            })
            .collect())
    }

    async fn list_device_groups(&self, token: &str, product_id: &str) -> ApiResult<Vec<DeviceGroup>> {
        let mut url = self.url("devicegroups")?;
        url.query_pairs_mut().append_pair("filter[product.id]", product_id);
        let document: Document<Vec<Resource<NamedAttributes>>> = self.get(token, url).await?;
        Ok(document
            .data
            .into_iter()
            .map(|r| DeviceGroup {
                name: r.attributes.name.unwrap_or_else(|| r.id.clone()),
                id: r.id,
            })
            .collect())
    }

    async fn list_devices(
        &self,
        token: &str,
        owner_id: Option<&str>,
        group_id: Option<&str>,
    ) -> ApiResult<Vec<Device>> {
        let mut url = self.url("devices")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(owner) = owner_id {
                query.append_pair("filter[owner.id]", owner);
            }
            if let Some(group) = group_id {
                query.append_pair("filter[devicegroup.id]", group);
            }
        }
        let document: Document<Vec<Resource<NamedAttributes>>> = self.get(token, url).await?;
        Ok(document
            .data
            .into_iter()
            .map(|r| Device {
                id: r.id,
                name: r.attributes.name,
            })
            .collect())
    }

    async fn create_log_stream(&self, token: &str) -> ApiResult<LogStreamInfo> {
        let request = self.authorized(self.client.post(self.url("logstream")?), token);
        let document: Document<Resource<Value>> = self.json(request).await?;
        Ok(LogStreamInfo {
            id: document.data.id,
        })
    }

    async fn open_log_stream(
        &self,
        token: &str,
        stream_id: &str,
    ) -> ApiResult<Option<Box<dyn LogStream>>> {
        let request = self
            .stream_client
            .get(self.url(&format!("logstream/{stream_id}"))?)
            .bearer_auth(token)
            .header(header::ACCEPT, "text/event-stream");

        let response = request.send().await.map_err(transport)?;
        match response.status() {
            StatusCode::UNAUTHORIZED => return Err(ApiError::InvalidCredentials),
            status if !status.is_success() => {
                tracing::warn!("Log stream {} refused (HTTP {})", stream_id, status.as_u16());
                return Ok(None);
            }
            _ => {}
        }

        let (feeder, stream) = ChannelStream::new(STREAM_BUFFER);
        let id = stream_id.to_string();
        tokio::spawn(async move {
            let body = Box::pin(response.bytes_stream());
            if let Err(e) = pump_to_channel(body, feeder).await {
                tracing::debug!("Log stream {} connection ended: {}", id, e);
            }
        });
        Ok(Some(Box::new(stream)))
    }

    async fn attach_device(&self, token: &str, stream_id: &str, device_id: &str) -> ApiResult<()> {
        let url = self.url(&format!("logstream/{stream_id}/{device_id}"))?;
        self.send(self.authorized(self.client.put(url), token)).await?;
        tracing::debug!("Attached device {} to log stream {}", device_id, stream_id);
        Ok(())
    }

    async fn create_deployment(
        &self,
        token: &str,
        group_id: &str,
        agent_code: &str,
        device_code: &str,
    ) -> ApiResult<Deployment> {
        let group = self.device_group(token, group_id).await?;
        let body = json!({
            "data": {
                "type": "deployment",
                "attributes": {
                    "agent_code": agent_code,
                    "device_code": device_code,
                },
                "relationships": {
                    "devicegroup": { "type": group.kind, "id": group_id }
                }
            }
        });
        let request = self
            .authorized(self.client.post(self.url("deployments")?), token)
            .header(header::CONTENT_TYPE, JSON_API)
            .body(body.to_string());
        let document: Document<Resource<CodeAttributes>> = self.json(request).await?;
        Ok(Deployment {
            id: document.data.id,
            agent_code: document.data.attributes.agent_code,
            device_code: document.data.attributes.device_code,
        })
    }

    async fn conditional_restart(&self, token: &str, group_id: &str) -> ApiResult<()> {
        let url = self.url(&format!("devicegroups/{group_id}/conditional_restart"))?;
        self.send(self.authorized(self.client.post(url), token)).await?;
        Ok(())
    }

    async fn latest_deployment(&self, token: &str, group_id: &str) -> ApiResult<Option<Deployment>> {
        let group = self.device_group(token, group_id).await?;
        let Some(deployment_id) = group
            .relationships
            .pointer("/current_deployment/id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(None);
        };

        let url = self.url(&format!("deployments/{deployment_id}"))?;
        let document: Document<Resource<CodeAttributes>> = self.get(token, url).await?;
        Ok(Some(Deployment {
            id: document.data.id,
            agent_code: document.data.attributes.agent_code,
            device_code: document.data.attributes.device_code,
        }))
    }

    async fn device_agent_id(&self, token: &str, device_id: &str) -> ApiResult<Option<String>> {
        let url = self.url(&format!("devices/{device_id}"))?;
        let document: Document<Resource<DeviceAttributes>> = self.get(token, url).await?;
        Ok(document.data.attributes.agent_id.filter(|id| !id.is_empty()))
    }
}
