use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::types::{ApiErrorBody, GatewayResponse, Method, RequestOptions};
use super::RemoteGateway;

/// Gateway talking HTTP/JSON to the notes server.
#[derive(Clone)]
pub struct HttpGateway {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpGateway {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let mut base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid server url '{}': {}", base_url, e))?;
    // Endpoints resolve below the base path, so `https://host/notes` keeps `/notes`.
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  async fn send(&self, endpoint: &str, options: RequestOptions) -> GatewayResponse {
    let url = match self.base_url.join(endpoint.trim_start_matches('/')) {
      Ok(url) => url,
      Err(e) => return GatewayResponse::failed(400, format!("Invalid endpoint {}: {}", endpoint, e)),
    };

    let mut builder = self.client.request(to_reqwest(options.method), url);
    if let Some(token) = &options.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &options.body {
      builder = builder.json(body);
    }

    let response = match builder.send().await {
      Ok(response) => response,
      Err(e) => {
        debug!(method = %options.method, endpoint, error = %e, "request did not reach server");
        return GatewayResponse::network_error(e.to_string());
      }
    };

    let status = response.status();
    let text = match response.text().await {
      Ok(text) => text,
      Err(e) => return GatewayResponse::network_error(format!("Failed to read response: {}", e)),
    };
    let body: Option<Value> = if text.trim().is_empty() {
      None
    } else {
      serde_json::from_str(&text).ok()
    };

    debug!(method = %options.method, endpoint, status = status.as_u16(), "request finished");

    if status.is_success() {
      GatewayResponse::ok(status.as_u16(), body)
    } else {
      let message = body
        .and_then(|b| serde_json::from_value::<ApiErrorBody>(b).ok())
        .and_then(ApiErrorBody::into_message)
        .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()))
        .or_else(|| status.canonical_reason().map(String::from))
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
      GatewayResponse::failed(status.as_u16(), message)
    }
  }
}

impl RemoteGateway for HttpGateway {
  fn request<'a>(
    &'a self,
    endpoint: &'a str,
    options: RequestOptions,
  ) -> BoxFuture<'a, GatewayResponse> {
    self.send(endpoint, options).boxed()
  }
}

fn to_reqwest(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}
