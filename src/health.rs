use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::{Client, Proxy};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::api::ControlApi;
use crate::config::is_sentinel;

const CACHE_TTL: Duration = Duration::from_secs(60);

/// Outcome of one delay probe; `delay == None` marks the node invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
  pub name: String,
  pub delay: Option<u64>,
}

impl ProbeResult {
  pub fn is_valid(&self) -> bool {
    self.delay.is_some()
  }
}

/// Runs delay probes through the engine's control API.
#[derive(Clone)]
pub struct HealthChecker {
  api: ControlApi,
  test_url: String,
  timeout_ms: u64,
  permits: Arc<Semaphore>,
  cache: Arc<Mutex<HashMap<String, (Instant, Option<u64>)>>>,
}

impl HealthChecker {
  pub fn new(api: ControlApi, test_url: impl Into<String>, timeout_ms: u64, concurrency: usize) -> Self {
    HealthChecker {
      api,
      test_url: test_url.into(),
      timeout_ms,
      permits: Arc::new(Semaphore::new(concurrency.clamp(1, Semaphore::MAX_PERMITS))),
      cache: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub async fn test_proxy(&self, name: &str) -> ProbeResult {
    if let Some((at, delay)) = self.cache.lock().await.get(name) {
      if at.elapsed() < CACHE_TTL {
        return ProbeResult {
          name: name.to_string(),
          delay: *delay,
        };
      }
    }

    let delay = match self.permits.acquire().await {
      Ok(_permit) => match self.api.delay(name, &self.test_url, self.timeout_ms).await {
        Ok(d) => Some(d),
        Err(e) => {
          tracing::debug!("probe {name}: {e}");
          None
        }
      },
      Err(_) => None,
    };
    self
      .cache
      .lock()
      .await
      .insert(name.to_string(), (Instant::now(), delay));
    ProbeResult {
      name: name.to_string(),
      delay,
    }
  }

  /// Probes every name except the sentinels. Results arrive in completion order.
  pub async fn test_group(&self, names: &[String]) -> Vec<ProbeResult> {
    let targets: Vec<&String> = names.iter().filter(|n| !is_sentinel(n)).collect();
    tracing::info!(
      "testing {} nodes (concurrency {})",
      targets.len(),
      self.permits.available_permits()
    );

    let mut set = JoinSet::new();
    for name in targets {
      let this = self.clone();
      let name = name.clone();
      set.spawn(async move { this.test_proxy(&name).await });
    }

    let total = set.len();
    let mut out = Vec::with_capacity(total);
    while let Some(joined) = set.join_next().await {
      match joined {
        Ok(r) => out.push(r),
        Err(e) => tracing::warn!("probe task failed: {e}"),
      }
      if out.len() % 50 == 0 || out.len() == total {
        tracing::debug!("progress {}/{}", out.len(), total);
      }
    }
    out
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
  pub total: usize,
  pub valid: usize,
  pub invalid: usize,
  pub average_ms: Option<f64>,
}

pub fn summarize(results: &[ProbeResult]) -> Summary {
  let delays: Vec<u64> = results.iter().filter_map(|r| r.delay).collect();
  let average_ms = if delays.is_empty() {
    None
  } else {
    Some(delays.iter().sum::<u64>() as f64 / delays.len() as f64)
  };
  Summary {
    total: results.len(),
    valid: delays.len(),
    invalid: results.len() - delays.len(),
    average_ms,
  }
}

pub fn log_summary(group: &str, results: &[ProbeResult], limit: usize) {
  let s = summarize(results);
  tracing::info!(
    "group '{group}': {} nodes, {} valid, {} invalid",
    s.total,
    s.valid,
    s.invalid
  );
  if let Some(avg) = s.average_ms {
    tracing::info!("average delay {avg:.2}ms");
  }
  let mut valid: Vec<&ProbeResult> = results.iter().filter(|r| r.is_valid()).collect();
  valid.sort_by_key(|r| r.delay);
  for (i, r) in valid.iter().take(limit).enumerate() {
    tracing::info!("{}. {}: {}ms", i + 1, r.name, r.delay.unwrap_or_default());
  }
}

/// Download speed test through the engine's mixed port.
#[derive(Debug, Clone)]
pub struct SpeedTest {
  pub url: String,
  pub proxy: Option<String>,
  pub duration: Duration,
  pub count: usize,
  pub min_mbps: f64,
}

impl SpeedTest {
  pub const DEFAULT_URL: &'static str = "http://speedtest.tele2.net/100MB.zip";

  pub fn via_mixed_port(port: u16, count: usize, min_mbps: f64) -> Self {
    SpeedTest {
      url: Self::DEFAULT_URL.to_string(),
      proxy: Some(format!("http://127.0.0.1:{port}")),
      duration: Duration::from_secs(5),
      count,
      min_mbps,
    }
  }

  fn client(&self) -> Result<Client> {
    let mut builder = Client::builder().timeout(self.duration + Duration::from_secs(5));
    if let Some(p) = &self.proxy {
      builder = builder.proxy(Proxy::all(p).context("invalid proxy url")?);
    }
    builder.build().context("build speed-test client")
  }

  /// MB/s downloaded from `url` within `duration`, requesting again if the
  /// body ends early.
  pub async fn measure(&self) -> Result<f64> {
    let client = self.client()?;
    let started = Instant::now();
    let mut total: u64 = 0;
    'outer: while started.elapsed() < self.duration {
      let mut resp = client
        .get(&self.url)
        .header("cache-control", "no-cache")
        .send()
        .await
        .context("speed test request")?;
      while let Some(chunk) = resp.chunk().await.context("speed test body")? {
        total += chunk.len() as u64;
        if started.elapsed() >= self.duration {
          break 'outer;
        }
      }
    }
    let secs = started.elapsed().as_secs_f64();
    Ok(if secs > 0.0 { total as f64 / secs / 1024.0 / 1024.0 } else { 0.0 })
  }

  /// Pins each of the first `count` names in `manual`, routes `top` through
  /// it and measures. Failed measurements count as 0 MB/s.
  pub async fn run(&self, api: &ControlApi, top: &str, manual: &str, names: &[String]) -> Vec<(String, f64)> {
    if let Err(e) = api.select(top, manual).await {
      tracing::warn!("cannot route {top} through {manual}: {e}");
      return vec![];
    }
    let mut speeds = Vec::new();
    for name in names.iter().take(self.count) {
      if let Err(e) = api.select(manual, name).await {
        tracing::warn!("select {name}: {e}");
        speeds.push((name.clone(), 0.0));
        continue;
      }
      let mbps = match self.measure().await {
        Ok(v) => v,
        Err(e) => {
          tracing::debug!("speed test {name}: {e:#}");
          0.0
        }
      };
      tracing::info!("{name}: {mbps:.2}MB/s");
      speeds.push((name.clone(), mbps));
    }
    speeds
  }
}

/// Fastest tested names at or above `min_mbps` first, then every untested
/// name in its current order. Tested names below the minimum are dropped.
pub fn speed_order(names: &[String], speeds: &[(String, f64)], min_mbps: f64) -> Vec<String> {
  let mut fast: Vec<&(String, f64)> = speeds.iter().filter(|(_, v)| *v >= min_mbps).collect();
  fast.sort_by(|a, b| b.1.total_cmp(&a.1));
  let mut out: Vec<String> = fast.iter().map(|(n, _)| n.clone()).collect();
  for n in names {
    if !speeds.iter().any(|(t, _)| t == n) {
      out.push(n.clone());
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ClashConfig;
  use crate::link::parse_link;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  async fn delay_mock(server: &MockServer, name: &str, status: u16, body: &str) {
    Mock::given(method("GET"))
      .and(path(format!("/proxies/{name}/delay")))
      .respond_with(ResponseTemplate::new(status).set_body_string(body.to_string()))
      .mount(server)
      .await;
  }

  fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
  }

  #[tokio::test]
  async fn failing_node_is_dropped_and_rest_ordered() {
    let server = MockServer::start().await;
    delay_mock(&server, "A", 200, r#"{"delay":120}"#).await;
    delay_mock(&server, "B", 504, r#"{"message":"Timeout"}"#).await;
    delay_mock(&server, "C", 200, r#"{"delay":80}"#).await;

    let api = ControlApi::new(Client::new(), server.uri(), None);
    let checker = HealthChecker::new(api, "http://www.gstatic.com/generate_204", 3000, 2);
    let results = checker.test_group(&names(&["A", "B", "C", "DIRECT"])).await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().any(|r| r.name == "B" && !r.is_valid()));

    let nodes = ["A", "B", "C"]
      .iter()
      .enumerate()
      .map(|(i, n)| parse_link(&format!("trojan://p@10.0.0.{i}:443#{n}")).unwrap())
      .collect();
    let mut cfg = ClashConfig::bundled().unwrap().with_nodes(nodes);
    assert_eq!(cfg.apply_probe_results(&results, 10), vec!["C", "A"]);
    assert_eq!(cfg.apply_probe_results(&results, 1), vec!["C"]);

    let s = summarize(&results);
    assert_eq!((s.total, s.valid, s.invalid), (3, 2, 1));
    assert_eq!(s.average_ms, Some(100.0));
  }

  #[tokio::test]
  async fn results_are_cached_per_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/proxies/A/delay"))
      .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"delay":42}"#))
      .expect(1)
      .mount(&server)
      .await;
    let api = ControlApi::new(Client::new(), server.uri(), None);
    let checker = HealthChecker::new(api, "http://t", 3000, 1);
    assert_eq!(checker.test_proxy("A").await.delay, Some(42));
    assert_eq!(checker.test_proxy("A").await.delay, Some(42));
  }

  #[tokio::test]
  async fn unreachable_api_marks_every_node_invalid() {
    let api = ControlApi::new(Client::new(), "http://127.0.0.1:1", None);
    let checker = HealthChecker::new(api, "http://t", 500, 0);
    let results = checker.test_group(&names(&["A", "B"])).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.is_valid()));
  }

  #[test]
  fn concurrency_is_bounded_by_semaphore_limits() {
    let api = ControlApi::new(Client::new(), "http://127.0.0.1:1", None);
    let huge = HealthChecker::new(api.clone(), "http://t", 500, usize::MAX);
    assert_eq!(huge.permits.available_permits(), Semaphore::MAX_PERMITS);
    let none = HealthChecker::new(api, "http://t", 500, 0);
    assert_eq!(none.permits.available_permits(), 1);
  }

  #[test]
  fn speed_order_keeps_untested_after_fast_ones() {
    let all = names(&["A", "B", "C", "D"]);
    let speeds = vec![("A".to_string(), 0.5), ("B".to_string(), 3.0), ("C".to_string(), 0.01)];
    assert_eq!(speed_order(&all, &speeds, 0.1), names(&["B", "A", "D"]));
    assert_eq!(speed_order(&all, &[], 0.1), all);
  }

  #[tokio::test]
  async fn measure_reports_throughput() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/file.bin"))
      .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 256 * 1024]))
      .mount(&server)
      .await;
    let st = SpeedTest {
      url: format!("{}/file.bin", server.uri()),
      proxy: None,
      duration: Duration::from_millis(300),
      count: 1,
      min_mbps: 0.1,
    };
    assert!(st.measure().await.unwrap() > 0.0);
  }

  #[tokio::test]
  async fn speed_run_pins_each_node() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .respond_with(ResponseTemplate::new(204))
      .expect(3)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/file.bin"))
      .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64 * 1024]))
      .mount(&server)
      .await;
    let api = ControlApi::new(Client::new(), server.uri(), None);
    let st = SpeedTest {
      url: format!("{}/file.bin", server.uri()),
      proxy: None,
      duration: Duration::from_millis(200),
      count: 2,
      min_mbps: 0.1,
    };
    let speeds = st.run(&api, "top", "manual", &names(&["A", "B", "C"])).await;
    let tested: Vec<_> = speeds.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(tested, vec!["A", "B"]);
  }
}
