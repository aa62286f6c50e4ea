use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::ApiConfig;
use crate::queue::{QueuedAction, RemoteMethod};

/// Failure talking to the campaign API.
#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("remote unreachable: {0}")]
  Unreachable(String),
  #[error("remote request timed out")]
  Timeout,
  #[error("remote rejected request ({status}): {body}")]
  Rejected { status: u16, body: String },
  #[error("remote server error ({status})")]
  Server { status: u16 },
  #[error("remote is throttling requests")]
  Throttled,
  /// The session's credentials were refused; the item itself may be fine
  #[error("remote refused credentials ({status})")]
  Unauthorized { status: u16 },
  #[error("unexpected response: {0}")]
  Decode(String),
}

impl RemoteError {
  /// The remote answered and refused the request; resending the same payload
  /// will not help.
  pub fn is_rejection(&self) -> bool {
    matches!(self, RemoteError::Rejected { .. })
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      RemoteError::Timeout
    } else if err.is_decode() {
      RemoteError::Decode(err.to_string())
    } else {
      RemoteError::Unreachable(err.to_string())
    }
  }
}

/// The CRUD backend as seen by the sync engine.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// GET a tenant-scoped collection. Items are returned as raw JSON.
  async fn fetch_collection(&self, endpoint: &str) -> Result<Vec<Value>, RemoteError>;

  /// Send the single remote call a queued action maps to.
  async fn replay(&self, item: &QueuedAction) -> Result<(), RemoteError>;

  /// Cheap reachability check.
  async fn ping(&self) -> Result<(), RemoteError>;
}

/// Campaign API client over HTTP/JSON.
#[derive(Clone)]
pub struct HttpApi {
  client: Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpApi {
  pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn url(&self, path: &str) -> Result<Url, RemoteError> {
    let joined = format!(
      "{}/{}",
      self.base_url.as_str().trim_end_matches('/'),
      path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| RemoteError::Decode(format!("bad endpoint {}: {}", path, e)))
  }

  fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  fn replay_request(&self, item: &QueuedAction) -> Result<reqwest::RequestBuilder, RemoteError> {
    let request = item.action.request();
    let method = match request.method {
      RemoteMethod::Patch => Method::PATCH,
    };
    let url = self.url(&request.path)?;
    debug!(seq = item.seq, url = %url, "replaying queued action");

    Ok(
      self
        .request(method, url)
        .header("Idempotency-Key", item.idempotency_key())
        .json(&request.body),
    )
  }
}

/// Map non-success statuses onto the error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let body = response.text().await.unwrap_or_default();
  Err(classify(status, body))
}

/// Only statuses that blame the request itself count as rejections.
fn classify(status: StatusCode, body: String) -> RemoteError {
  match status {
    StatusCode::TOO_MANY_REQUESTS => RemoteError::Throttled,
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized {
      status: status.as_u16(),
    },
    StatusCode::REQUEST_TIMEOUT => RemoteError::Server {
      status: status.as_u16(),
    },
    s if s.is_server_error() => RemoteError::Server {
      status: s.as_u16(),
    },
    s => RemoteError::Rejected {
      status: s.as_u16(),
      body,
    },
  }
}

#[async_trait]
impl RemoteApi for HttpApi {
  async fn fetch_collection(&self, endpoint: &str) -> Result<Vec<Value>, RemoteError> {
    let url = self.url(endpoint)?;
    debug!(url = %url, "fetching collection");

    let response = self.request(Method::GET, url).send().await?;
    let response = check_status(response).await?;
    let items: Vec<Value> = response.json().await?;
    Ok(items)
  }

  async fn replay(&self, item: &QueuedAction) -> Result<(), RemoteError> {
    let response = self.replay_request(item)?.send().await?;
    check_status(response).await?;
    Ok(())
  }

  async fn ping(&self) -> Result<(), RemoteError> {
    // Any HTTP answer means the API is reachable, whatever the status
    self
      .request(Method::HEAD, self.base_url.clone())
      .send()
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::{PendingAction, SupportLevel};
  use chrono::Utc;
  use serde_json::json;

  fn api(base: &str) -> HttpApi {
    let config = ApiConfig {
      base_url: base.to_string(),
      ..ApiConfig::default()
    };
    HttpApi::new(&config, None).unwrap()
  }

  #[test]
  fn test_replay_request_shape() {
    let config = ApiConfig {
      base_url: "https://crm.example.org/api".to_string(),
      ..ApiConfig::default()
    };
    let api = HttpApi::new(&config, Some("secret".to_string())).unwrap();
    let item = QueuedAction {
      seq: 9,
      action: PendingAction::UpdateVoterStatus {
        voter_id: 1,
        status: SupportLevel::Favorable,
      },
      created_at: Utc::now(),
    };

    let request = api.replay_request(&item).unwrap().build().unwrap();
    assert_eq!(request.method(), Method::PATCH);
    assert_eq!(
      request.url().as_str(),
      "https://crm.example.org/api/worker/voters/1/status"
    );

    let headers = request.headers();
    assert_eq!(
      headers.get("Idempotency-Key").and_then(|v| v.to_str().ok()),
      Some(item.idempotency_key().as_str())
    );
    assert_eq!(
      headers.get(reqwest::header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
      Some("Bearer secret")
    );
    assert_eq!(
      headers.get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
      Some("application/json")
    );

    let body = request.body().and_then(|b| b.as_bytes()).unwrap();
    let body: Value = serde_json::from_slice(body).unwrap();
    assert_eq!(body, json!({ "status": "FAVORABLE" }));
  }

  #[test]
  fn test_status_classification() {
    let class = |code: u16| classify(StatusCode::from_u16(code).unwrap(), "nope".to_string());

    assert!(matches!(class(429), RemoteError::Throttled));
    assert!(matches!(class(401), RemoteError::Unauthorized { status: 401 }));
    assert!(matches!(class(403), RemoteError::Unauthorized { status: 403 }));
    assert!(matches!(class(408), RemoteError::Server { status: 408 }));
    assert!(matches!(class(500), RemoteError::Server { status: 500 }));
    assert!(matches!(class(503), RemoteError::Server { status: 503 }));
    assert!(matches!(class(404), RemoteError::Rejected { status: 404, .. }));
    assert!(matches!(class(422), RemoteError::Rejected { status: 422, .. }));

    for code in [429, 401, 403, 408, 500] {
      assert!(!class(code).is_rejection(), "{} counted as a rejection", code);
    }
    assert!(class(400).is_rejection());
    assert!(class(409).is_rejection());
  }

  #[test]
  fn test_url_joining_keeps_base_path() {
    let api = api("https://crm.example.org/api/");
    assert_eq!(
      api.url("/voters").unwrap().as_str(),
      "https://crm.example.org/api/voters"
    );
    assert_eq!(
      api.url("worker/voters/3/status").unwrap().as_str(),
      "https://crm.example.org/api/worker/voters/3/status"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    let config = ApiConfig {
      base_url: "not a url".to_string(),
      ..ApiConfig::default()
    };
    assert!(HttpApi::new(&config, None).is_err());
  }

  #[tokio::test]
  async fn test_unreachable_host_is_not_a_rejection() {
    // Port 9 on localhost is almost never listening
    let api = api("http://127.0.0.1:9/api");
    let err = api.fetch_collection("/voters").await.unwrap_err();
    assert!(!err.is_rejection(), "got {:?}", err);
  }

  #[test]
  fn test_rejection_classification() {
    assert!(RemoteError::Rejected {
      status: 422,
      body: String::new()
    }
    .is_rejection());
    assert!(!RemoteError::Server { status: 503 }.is_rejection());
    assert!(!RemoteError::Timeout.is_rejection());
  }
}
