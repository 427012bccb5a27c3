use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;

use crate::link::{decode_base64_to_utf8, is_proxy_link, json_port, looks_like_base64, percent_decode_to_string};
use crate::node::{nodes_from_clash_yaml, Node, Protocol, Shadowsocks};
use crate::template::{self, DEFAULT_GITHUB_API};

pub const USER_AGENT: &str = "Clash Verge/1.7.7";

static MD_LINK: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"(?:vless|vmess|trojan|hysteria2|hy2|ss)://[^#\s]*(?:#[^\s]*)?").unwrap());
static FLOW_NODE: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r#"\{[^}]*name\s*:\s*['"][^'"]+['"][^}]*server\s*:\s*[^,]+[^}]*\}"#).unwrap()
});
static BASE64_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_+/\-]+={0,2}").unwrap());

const PRE_OPEN: &str = r#"<pre style="word-wrap: break-word; white-space: pre-wrap;">"#;
const PRE_CLOSE: &str = "</pre>";

/// One item produced by a source: either a raw link still to be parsed or a
/// node taken from a structured config.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
  Link(String),
  Node(Node),
}

pub fn http_client(timeout: Duration) -> Result<Client> {
  Client::builder()
    .user_agent(USER_AGENT)
    .timeout(timeout)
    .danger_accept_invalid_certs(true)
    .build()
    .context("build http client")
}

#[derive(Clone)]
pub struct Collector {
  client: Client,
  github_api: String,
  render_endpoint: Option<String>,
}

impl Collector {
  pub fn new(client: Client) -> Self {
    Collector {
      client,
      github_api: DEFAULT_GITHUB_API.to_string(),
      render_endpoint: None,
    }
  }

  pub fn with_github_api(mut self, base: impl Into<String>) -> Self {
    self.github_api = base.into();
    self
  }

  pub fn with_render_endpoint(mut self, endpoint: Option<String>) -> Self {
    self.render_endpoint = endpoint;
    self
  }

  /// Resolves every spec concurrently; the output keeps the order of `specs`.
  pub async fn collect(&self, specs: &[String]) -> Vec<Candidate> {
    let mut handles = Vec::with_capacity(specs.len());
    for spec in specs {
      let this = self.clone();
      let spec = spec.clone();
      handles.push(tokio::spawn(async move { this.resolve(&spec).await }));
    }

    let mut out = Vec::new();
    for h in handles {
      match h.await {
        Ok(items) => out.extend(items),
        Err(e) => tracing::warn!("source task failed: {e}"),
      }
    }
    out
  }

  pub async fn resolve(&self, spec: &str) -> Vec<Candidate> {
    let spec = spec.trim();
    if spec.is_empty() {
      return vec![];
    }
    if is_proxy_link(spec) {
      return vec![Candidate::Link(spec.to_string())];
    }
    if spec.contains("|links") || spec.ends_with(".md") {
      return self.markdown_links(&spec.replace("|links", "")).await;
    }
    if spec.contains("|ss") {
      return self.ss_server_list(&spec.replace("|ss", "")).await;
    }

    let url = if spec.contains('{') {
      let now = chrono::Local::now().naive_local();
      match template::resolve_template_url(&self.client, &self.github_api, spec, now).await {
        Ok(u) => u,
        Err(e) => {
          tracing::warn!("template {spec}: {e:#}");
          return vec![];
        }
      }
    } else {
      spec.to_string()
    };
    self.subscription(&url).await
  }

  async fn fetch_text(&self, url: &str) -> Result<String> {
    let resp = self
      .client
      .get(url)
      .send()
      .await
      .with_context(|| format!("GET {url}"))?;
    let status = resp.status();
    if !status.is_success() {
      return Err(anyhow!("GET {url} returned {status}"));
    }
    resp.text().await.with_context(|| format!("read body of {url}"))
  }

  async fn markdown_links(&self, url: &str) -> Vec<Candidate> {
    match self.fetch_text(url).await {
      Ok(body) => links_in_text(&percent_decode_to_string(&body)),
      Err(e) => {
        tracing::warn!("{e:#}");
        vec![]
      }
    }
  }

  async fn ss_server_list(&self, url: &str) -> Vec<Candidate> {
    let body = match self.fetch_text(url).await {
      Ok(b) => b,
      Err(e) => {
        tracing::warn!("{e:#}");
        return vec![];
      }
    };
    let entries: Vec<JsonValue> = match serde_json::from_str(&body) {
      Ok(s) => s,
      Err(e) => {
        tracing::warn!("ss server list {url}: {e}");
        return vec![];
      }
    };
    entries
      .iter()
      .filter_map(|e| {
        let node = ss_server(e);
        if node.is_none() {
          tracing::debug!("ss server entry skipped: {e}");
        }
        node
      })
      .map(Candidate::Node)
      .collect()
  }

  async fn subscription(&self, url: &str) -> Vec<Candidate> {
    tracing::info!("processing {url}");
    let body = match self.fetch_text(url).await {
      Ok(b) => b,
      Err(e) => {
        tracing::warn!("{e:#}");
        return vec![];
      }
    };
    if let Some(items) = candidates_from_body(&body) {
      return items;
    }

    match self.render(url).await {
      Ok(Some(text)) => candidates_from_rendered(&text),
      Ok(None) => {
        tracing::debug!("{url}: body is neither config nor links and no renderer is configured");
        vec![]
      }
      Err(e) => {
        tracing::warn!("render {url}: {e:#}");
        vec![]
      }
    }
  }

  async fn render(&self, url: &str) -> Result<Option<String>> {
    let endpoint = match &self.render_endpoint {
      Some(e) => e,
      None => return Ok(None),
    };
    let resp = self
      .client
      .get(endpoint)
      .query(&[("url", url)])
      .send()
      .await
      .with_context(|| format!("GET {endpoint}"))?;
    let status = resp.status();
    if !status.is_success() {
      return Err(anyhow!("renderer returned {status}"));
    }
    Ok(Some(resp.text().await.context("read rendered page")?))
  }
}

/// One entry of a `|ss` server list; the port may be a number or a string.
fn ss_server(v: &JsonValue) -> Option<Node> {
  let text = |k: &str| {
    v.get(k)
      .and_then(|x| x.as_str())
      .map(|s| s.trim().to_string())
      .filter(|s| !s.is_empty())
  };
  let server = text("server")?;
  let port = json_port(v, "server_port")?;
  Some(Node {
    name: text("remarks").unwrap_or_else(|| format!("ss:{server}:{port}")),
    server,
    port,
    proto: Protocol::Shadowsocks(Shadowsocks {
      cipher: text("method")?,
      password: text("password")?,
      udp: Some(true),
      ..Default::default()
    }),
  })
}

pub fn links_in_text(text: &str) -> Vec<Candidate> {
  MD_LINK
    .find_iter(text)
    .map(|m| Candidate::Link(m.as_str().to_string()))
    .collect()
}

fn link_lines(text: &str) -> Vec<Candidate> {
  text
    .lines()
    .map(|l| l.trim())
    .filter(|l| !l.is_empty())
    .map(|l| Candidate::Link(l.to_string()))
    .collect()
}

fn nodes_from_text(text: &str) -> Option<Vec<Candidate>> {
  let doc: YamlValue = serde_yaml::from_str(text).ok()?;
  doc.get("proxies")?;
  Some(nodes_from_clash_yaml(&doc).into_iter().map(Candidate::Node).collect())
}

/// Interprets a fetched subscription body. `None` means the body is neither a
/// structured config nor a link list.
pub fn candidates_from_body(body: &str) -> Option<Vec<Candidate>> {
  if body.contains("proxies:") {
    let cleaned = body.replace(PRE_OPEN, "").replace(PRE_CLOSE, "");
    return Some(nodes_from_text(&cleaned).unwrap_or_default());
  }
  if looks_like_base64(body) {
    if let Some(decoded) = decode_base64_to_utf8(body) {
      return Some(link_lines(&percent_decode_to_string(&decoded)));
    }
  }
  if body.lines().any(|l| is_proxy_link(l.trim())) {
    return Some(link_lines(&percent_decode_to_string(body)));
  }
  None
}

/// Text returned by the rendering service.
pub fn candidates_from_rendered(text: &str) -> Vec<Candidate> {
  if text.contains("external-controller") {
    if let Some(items) = nodes_from_text(text) {
      return items;
    }
    return FLOW_NODE
      .find_iter(text)
      .filter_map(|m| serde_yaml::from_str::<YamlValue>(m.as_str()).ok())
      .filter_map(|v| Node::from_yaml(&v))
      .map(Candidate::Node)
      .collect();
  }
  let token = match BASE64_TOKEN.find_iter(text).last() {
    Some(m) => m.as_str(),
    None => return vec![],
  };
  match decode_base64_to_utf8(token) {
    Some(decoded) => link_lines(&decoded),
    None => vec![],
  }
}

/// Local input folder: `proxies` of every YAML file first, then one link per
/// non-empty line of every `.txt` file. Files are visited in name order.
pub fn scan_input_dir(dir: &Path) -> Result<Vec<Candidate>> {
  if !dir.is_dir() {
    return Ok(vec![]);
  }
  let mut files: Vec<_> = std::fs::read_dir(dir)
    .with_context(|| format!("read {}", dir.display()))?
    .filter_map(|e| e.ok())
    .map(|e| e.path())
    .filter(|p| p.is_file())
    .collect();
  files.sort();

  let ext = |p: &Path| {
    p.extension()
      .and_then(|e| e.to_str())
      .map(|e| e.to_lowercase())
      .unwrap_or_default()
  };

  let mut nodes = Vec::new();
  let mut links = Vec::new();
  for path in &files {
    match ext(path).as_str() {
      "yaml" | "yml" => {
        let text = match std::fs::read_to_string(path) {
          Ok(t) => t,
          Err(e) => {
            tracing::warn!("read {}: {e}", path.display());
            continue;
          }
        };
        match serde_yaml::from_str::<YamlValue>(&text) {
          Ok(doc) => nodes.extend(nodes_from_clash_yaml(&doc).into_iter().map(Candidate::Node)),
          Err(e) => tracing::warn!("parse {}: {e}", path.display()),
        }
      }
      "txt" => match std::fs::read_to_string(path) {
        Ok(text) => links.extend(link_lines(&text)),
        Err(e) => tracing::warn!("read {}: {e}", path.display()),
      },
      _ => {}
    }
  }
  nodes.extend(links);
  Ok(nodes)
}

#[cfg(test)]
mod tests {
  use super::*;
  use base64::engine::general_purpose;
  use base64::Engine;
  use wiremock::matchers::{method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  const SS: &str = "ss://YWVzLTI1Ni1nY206cGFzcw==@1.2.3.4:8388#TestNode";
  const TROJAN: &str = "trojan://pw@t.example:443#T";

  fn collector(server: &MockServer) -> Collector {
    Collector::new(http_client(Duration::from_secs(5)).unwrap())
      .with_github_api(server.uri())
      .with_render_endpoint(Some(format!("{}/render", server.uri())))
  }

  async fn serve(server: &MockServer, at: &str, body: &str) {
    Mock::given(method("GET"))
      .and(path(at))
      .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
      .mount(server)
      .await;
  }

  fn links(items: &[Candidate]) -> Vec<&str> {
    items
      .iter()
      .filter_map(|c| match c {
        Candidate::Link(l) => Some(l.as_str()),
        Candidate::Node(_) => None,
      })
      .collect()
  }

  #[tokio::test]
  async fn proxy_links_pass_through() {
    let c = Collector::new(Client::new());
    assert_eq!(c.resolve(SS).await, vec![Candidate::Link(SS.to_string())]);
  }

  #[tokio::test]
  async fn markdown_page_is_scanned_for_links() {
    let server = MockServer::start().await;
    serve(
      &server,
      "/list",
      &format!("# Nodes\n\n- {SS}\n- {TROJAN} and text\nvless%3A%2F%2Fu%40v.example%3A443%23V\n"),
    )
    .await;
    let items = collector(&server).resolve(&format!("{}/list|links", server.uri())).await;
    assert_eq!(links(&items), vec![SS, TROJAN, "vless://u@v.example:443#V"]);
  }

  #[tokio::test]
  async fn ss_server_list_becomes_nodes() {
    let server = MockServer::start().await;
    serve(
      &server,
      "/ss.json",
      r#"[{"remarks":"JP","server":"9.9.9.9","server_port":8388,"method":"aes-128-gcm","password":"x"},
          {"remarks":"bad","server":"8.8.8.8","server_port":"none","method":"aes-128-gcm","password":"x"},
          {"remarks":"US","server":"7.7.7.7","server_port":"443","method":"chacha20-ietf-poly1305","password":"y"}]"#,
    )
    .await;
    let items = collector(&server).resolve(&format!("{}/ss.json|ss", server.uri())).await;
    assert_eq!(items.len(), 2);
    match &items[1] {
      Candidate::Node(n) => assert_eq!((n.name.as_str(), n.port), ("US", 443)),
      other => panic!("unexpected {other:?}"),
    }
    match &items[0] {
      Candidate::Node(n) => {
        assert_eq!(n.name, "JP");
        assert_eq!(n.port, 8388);
        assert_eq!(n.password(), Some("x"));
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[tokio::test]
  async fn base64_subscription_is_split_into_links() {
    let server = MockServer::start().await;
    let body = general_purpose::STANDARD.encode(format!("{SS}\n{TROJAN}\n"));
    serve(&server, "/sub", &body).await;
    let items = collector(&server).resolve(&format!("{}/sub", server.uri())).await;
    assert_eq!(links(&items), vec![SS, TROJAN]);
  }

  #[tokio::test]
  async fn wrapped_yaml_subscription_yields_nodes() {
    let server = MockServer::start().await;
    let body = format!(
      "{PRE_OPEN}proxies:\n  - {{name: a, type: trojan, server: 1.1.1.1, port: 443, password: p}}\n  - {{name: b, type: socks5, server: 2.2.2.2, port: 1080}}\n{PRE_CLOSE}"
    );
    serve(&server, "/clash", &body).await;
    let items = collector(&server).resolve(&format!("{}/clash", server.uri())).await;
    assert_eq!(items.len(), 1);
    assert!(matches!(&items[0], Candidate::Node(n) if n.name == "a"));
  }

  #[tokio::test]
  async fn failing_source_contributes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/gone"))
      .respond_with(ResponseTemplate::new(404))
      .mount(&server)
      .await;
    let c = collector(&server);
    assert!(c.resolve(&format!("{}/gone", server.uri())).await.is_empty());
    assert!(c.resolve(&format!("{}/gone|ss", server.uri())).await.is_empty());
    assert!(c.resolve(&format!("{}/gone.md", server.uri())).await.is_empty());
  }

  #[tokio::test]
  async fn renderer_fallback_decodes_last_token() {
    let server = MockServer::start().await;
    serve(&server, "/page", "<html><body>loading...</body></html>").await;
    let encoded = general_purpose::STANDARD.encode(format!("{TROJAN}\n"));
    Mock::given(method("GET"))
      .and(path("/render"))
      .and(query_param("url", format!("{}/page", server.uri())))
      .respond_with(ResponseTemplate::new(200).set_body_string(format!("Subscription\n{encoded}")))
      .mount(&server)
      .await;
    let items = collector(&server).resolve(&format!("{}/page", server.uri())).await;
    assert_eq!(links(&items), vec![TROJAN]);
  }

  #[test]
  fn rendered_config_without_indentation_uses_flow_literals() {
    let text = "port: 7890 external-controller: 127.0.0.1:9090 proxies: \
      - {name: 'n1', server: 1.1.1.1, port: 443, type: trojan, password: p} \
      - {name: \"n2\", server: 2.2.2.2, port: 8388, type: ss, cipher: aes-128-gcm, password: q}";
    let items = candidates_from_rendered(text);
    let names: Vec<_> = items
      .iter()
      .filter_map(|c| match c {
        Candidate::Node(n) => Some(n.name.as_str()),
        Candidate::Link(_) => None,
      })
      .collect();
    assert_eq!(names, vec!["n1", "n2"]);
  }

  #[test]
  fn plain_link_lines_are_accepted() {
    let items = candidates_from_body(&format!("{SS}\n\n{TROJAN}\n")).unwrap();
    assert_eq!(links(&items), vec![SS, TROJAN]);
    assert!(candidates_from_body("<html>nothing here</html>").is_none());
  }

  #[test]
  fn input_dir_yields_yaml_nodes_before_txt_links() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), format!("{SS}\n\n{TROJAN}\n")).unwrap();
    std::fs::write(
      dir.path().join("b.yaml"),
      "proxies:\n  - {name: y, type: vless, server: v.example, port: 443, uuid: u}\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

    let items = scan_input_dir(dir.path()).unwrap();
    assert_eq!(items.len(), 3);
    assert!(matches!(&items[0], Candidate::Node(n) if n.name == "y"));
    assert_eq!(links(&items), vec![SS, TROJAN]);
    assert!(scan_input_dir(&dir.path().join("missing")).unwrap().is_empty());
  }
}
