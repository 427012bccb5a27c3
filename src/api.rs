use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::CheckError;

/// Client of the engine's RESTful control API.
#[derive(Clone)]
pub struct ControlApi {
  client: Client,
  base: String,
  secret: Option<String>,
}

#[derive(Deserialize)]
struct Delay {
  delay: u64,
}

#[derive(Deserialize)]
struct Version {
  #[serde(default)]
  version: String,
}

impl std::fmt::Debug for ControlApi {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ControlApi").field("base", &self.base).finish()
  }
}

impl ControlApi {
  pub fn new(client: Client, base: impl Into<String>, secret: Option<String>) -> Self {
    ControlApi {
      client,
      base: base.into().trim_end_matches('/').to_string(),
      secret: secret.filter(|s| !s.is_empty()),
    }
  }

  /// Tries every port in order; the first one answering `/version` wins.
  pub async fn discover(
    client: Client,
    host: &str,
    ports: &[u16],
    secret: Option<String>,
  ) -> Result<Self, CheckError> {
    for port in ports {
      let api = ControlApi::new(client.clone(), format!("http://{host}:{port}"), secret.clone());
      match api.version().await {
        Ok(v) => {
          tracing::info!("control API at {} (version {v})", api.base);
          return Ok(api);
        }
        Err(e) => tracing::debug!("no control API on port {port}: {e}"),
      }
    }
    Err(CheckError::ApiUnreachable {
      host: host.to_string(),
      ports: ports.to_vec(),
    })
  }

  pub fn base(&self) -> &str {
    &self.base
  }

  fn request(&self, method: Method, path: &str) -> RequestBuilder {
    let req = self.client.request(method, format!("{}{path}", self.base));
    match &self.secret {
      Some(s) => req.bearer_auth(s),
      None => req,
    }
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str, timeout: Option<Duration>) -> Result<T, CheckError> {
    let mut req = self.request(Method::GET, path);
    if let Some(t) = timeout {
      req = req.timeout(t);
    }
    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
      return Err(CheckError::ApiStatus {
        path: path.to_string(),
        status: status.as_u16(),
      });
    }
    Ok(resp.json().await?)
  }

  pub async fn version(&self) -> Result<String, CheckError> {
    let v: Version = self.get_json("/version", None).await?;
    Ok(v.version)
  }

  /// True once the engine has loaded its config and serves `/configs`.
  pub async fn configs_ok(&self) -> bool {
    self.get_json::<JsonValue>("/configs", None).await.is_ok()
  }

  pub async fn proxies(&self) -> Result<JsonValue, CheckError> {
    self.get_json("/proxies", None).await
  }

  /// Delay of one proxy in ms as measured by the engine against `test_url`.
  pub async fn delay(&self, name: &str, test_url: &str, timeout_ms: u64) -> Result<u64, CheckError> {
    let path = format!(
      "/proxies/{}/delay?url={}&timeout={timeout_ms}",
      utf8_percent_encode(name, NON_ALPHANUMERIC),
      utf8_percent_encode(test_url, NON_ALPHANUMERIC),
    );
    // the engine replies by `timeout` at the latest
    let d: Delay = self.get_json(&path, Some(Duration::from_millis(timeout_ms + 1_000))).await?;
    Ok(d.delay)
  }

  /// Points selector `group` at `target`.
  pub async fn select(&self, group: &str, target: &str) -> Result<(), CheckError> {
    let path = format!("/proxies/{}", utf8_percent_encode(group, NON_ALPHANUMERIC));
    let resp = self
      .request(Method::PUT, &path)
      .json(&serde_json::json!({ "name": target }))
      .send()
      .await?;
    let status = resp.status();
    if !status.is_success() {
      return Err(CheckError::ApiStatus {
        path,
        status: status.as_u16(),
      });
    }
    Ok(())
  }
}
