use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use reqwest::Client;
use tokio::io::{AsyncReadExt, BufReader};

use crate::api::ControlApi;
use crate::config::{ClashConfig, ConfigPaths, Emitted};
use crate::dedup::{self, NameResolver, DEFAULT_BAN};
use crate::engine::{self, Engine, EngineOptions, DEFAULT_MIRROR};
use crate::error::CheckError;
use crate::health::{self, HealthChecker, SpeedTest};
use crate::link::parse_link;
use crate::node::{normalize_kind, Node};
use crate::sources::{self, Candidate, Collector};
use crate::template::DEFAULT_GITHUB_API;

#[derive(ClapArgs, Debug, Clone)]
pub struct CheckOpts {
  /// Engine binary; fetched from the latest mihomo release when omitted.
  #[arg(long)]
  pub engine: Option<PathBuf>,

  /// Prefix prepended to the release download URL ("" for a direct download).
  #[arg(long, default_value = DEFAULT_MIRROR)]
  pub engine_mirror: String,

  #[arg(long, default_value = "127.0.0.1")]
  pub api_host: String,

  /// Candidate control API ports, comma separated.
  #[arg(long, value_delimiter = ',', default_value = "9090")]
  pub api_ports: Vec<u16>,

  #[arg(long)]
  pub api_secret: Option<String>,

  #[arg(long, default_value = "http://www.gstatic.com/generate_204")]
  pub test_url: String,

  #[arg(long, default_value_t = 3_000)]
  pub timeout_ms: u64,

  #[arg(long, default_value_t = 100)]
  pub concurrency: usize,

  /// Keep at most this many of the fastest nodes.
  #[arg(long, default_value_t = 10_000)]
  pub limit: usize,

  #[arg(long, default_value_t = 3_000)]
  pub startup_timeout_ms: u64,

  #[arg(long, default_value_t = 5)]
  pub engine_attempts: u32,

  /// Also rank the best nodes by download speed.
  #[arg(long, default_value_t = false)]
  pub speed_test: bool,

  #[arg(long, default_value_t = 5)]
  pub speed_test_count: usize,

  #[arg(long, default_value_t = 0.1)]
  pub speed_min_mbps: f64,

  #[arg(long, default_value_t = 7890)]
  pub mixed_port: u16,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ForgeArgs {
  /// Proxy links or subscription specs (URL, URL|links, URL|ss, templated URL).
  pub links: Vec<String>,

  /// File with one link or subscription spec per line.
  #[arg(long)]
  pub links_file: Option<PathBuf>,

  #[arg(long, default_value = "input")]
  pub input: PathBuf,

  #[arg(long, default_value = "clash_config.yaml")]
  pub config: PathBuf,

  /// Config template replacing the bundled one.
  #[arg(long)]
  pub template: Option<PathBuf>,

  /// Keep only these node types (ss, vmess, vless, trojan, hysteria2).
  #[arg(long, value_delimiter = ',')]
  pub types: Vec<String>,

  /// Drop nodes whose name contains any of these keywords.
  #[arg(long, value_delimiter = ',', default_values = DEFAULT_BAN)]
  pub ban: Vec<String>,

  /// Rendering service used for pages that only show links after scripts run.
  #[arg(long)]
  pub render_endpoint: Option<String>,

  #[arg(long, default_value = DEFAULT_GITHUB_API)]
  pub github_api: String,

  #[arg(long, default_value_t = 10_000)]
  pub fetch_timeout_ms: u64,

  /// Health-check the written config right away.
  #[arg(long, default_value_t = false)]
  pub check: bool,

  #[command(flatten)]
  pub check_opts: CheckOpts,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CheckArgs {
  #[arg(long, default_value = "clash_config.yaml")]
  pub config: PathBuf,

  #[command(flatten)]
  pub opts: CheckOpts,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ParseArgs {
  /// Read subscription text from stdin.
  #[arg(long, default_value_t = false)]
  pub stdin: bool,

  /// Subscription text passed inline.
  #[arg(long)]
  pub text: Option<String>,
}

/// Everything one run shares: the HTTP client, the config pair location and
/// the health-check settings.
pub struct Session {
  client: Client,
  paths: ConfigPaths,
  settings: CheckOpts,
}

impl Session {
  pub fn new(config: &Path, fetch_timeout: Duration, settings: CheckOpts) -> Result<Self> {
    Ok(Session {
      client: sources::http_client(fetch_timeout)?,
      paths: ConfigPaths::new(config),
      settings,
    })
  }

  /// Gathers candidates from the input folder and `specs`, in that order.
  pub async fn gather(&self, args: &ForgeArgs, specs: Vec<String>) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    let mut all_specs = Vec::new();
    for c in sources::scan_input_dir(&args.input)? {
      match c {
        Candidate::Link(spec) => all_specs.push(spec),
        node => out.push(node),
      }
    }
    all_specs.extend(specs);

    let collector = Collector::new(self.client.clone())
      .with_github_api(args.github_api.clone())
      .with_render_endpoint(args.render_endpoint.clone());
    out.extend(collector.collect(&all_specs).await);
    Ok(out)
  }

  /// Collect, parse, dedupe and write the config pair.
  pub async fn forge(&self, args: &ForgeArgs) -> Result<Emitted> {
    let mut specs = args.links.clone();
    if let Some(f) = &args.links_file {
      let text = std::fs::read_to_string(f).with_context(|| format!("read {}", f.display()))?;
      specs.extend(text.lines().map(|l| l.trim()).filter(|l| !l.is_empty()).map(String::from));
    }

    let candidates = self.gather(args, specs).await?;
    tracing::info!("{} candidates collected", candidates.len());

    let types: Vec<&'static str> = args.types.iter().filter_map(|t| normalize_kind(t)).collect();
    let mut resolver = NameResolver::new(args.ban.clone());
    for node in candidates.into_iter().filter_map(into_node) {
      if !types.is_empty() && !types.contains(&node.kind()) {
        continue;
      }
      resolver.offer(node);
    }
    let accepted = resolver.len();
    let nodes = resolver.finish();
    tracing::info!("{accepted} nodes accepted, {} after dedup", nodes.len());

    let cfg = ClashConfig::template(args.template.as_deref())?.with_nodes(nodes);
    let emitted = cfg.emit(&self.paths)?;
    match emitted {
      Emitted::Written { nodes } => tracing::info!("wrote {nodes} nodes to {}", self.paths.yaml.display()),
      Emitted::Skipped => tracing::warn!("no usable nodes; {} left untouched", self.paths.yaml.display()),
    }
    Ok(emitted)
  }

  fn engine_options(opts: &CheckOpts) -> EngineOptions {
    EngineOptions {
      binary: opts.engine.clone(),
      mirror: Some(opts.engine_mirror.clone()).filter(|m| !m.is_empty()),
      startup_timeout: Duration::from_millis(opts.startup_timeout_ms),
      attempts: opts.engine_attempts.max(1),
      ..Default::default()
    }
  }

  /// Starts the engine on the config pair, probes every node and rewrites
  /// the pair with the reachable ones. The engine is stopped on every path.
  pub async fn check(&self) -> Result<(), CheckError> {
    let opts = &self.settings;
    let cfg = ClashConfig::load(&self.paths).map_err(CheckError::Config)?;
    if !self.paths.json.is_file() {
      cfg.emit(&self.paths).map_err(CheckError::Config)?;
    }

    let engine_opts = Self::engine_options(opts);
    let binary = engine::ensure_binary(&self.client, &engine_opts).await?;
    let apis: Vec<ControlApi> = opts
      .api_ports
      .iter()
      .map(|p| {
        ControlApi::new(
          self.client.clone(),
          format!("http://{}:{p}", opts.api_host),
          opts.api_secret.clone(),
        )
      })
      .collect();

    let engine = Engine::start(&binary, &self.paths, &apis, &engine_opts).await?;
    let outcome = match ControlApi::discover(
      self.client.clone(),
      &opts.api_host,
      &opts.api_ports,
      opts.api_secret.clone(),
    )
    .await
    {
      Ok(api) => self.check_with(&api, opts).await,
      Err(e) => Err(e),
    };
    engine.stop().await;
    outcome
  }

  async fn check_with(&self, api: &ControlApi, opts: &CheckOpts) -> Result<(), CheckError> {
    let loaded = api.proxies().await?;
    let count = loaded
      .get("proxies")
      .and_then(|p| p.as_object())
      .map_or(0, |m| m.len());
    tracing::debug!("engine lists {count} proxies and groups");

    // the engine may have dropped entries while starting
    let mut cfg = ClashConfig::load(&self.paths).map_err(CheckError::Config)?;
    let top = cfg.top_group().unwrap_or_default().to_string();
    if let Err(e) = api.select(&top, "DIRECT").await {
      tracing::warn!("cannot switch {top} to DIRECT: {e}");
    }

    let group = cfg
      .node_groups()
      .first()
      .map(|g| g.name.clone())
      .unwrap_or_default();
    let checker = HealthChecker::new(api.clone(), opts.test_url.clone(), opts.timeout_ms, opts.concurrency);
    let results = checker.test_group(&cfg.auto_group_members()).await;
    health::log_summary(&group, &results, opts.limit);

    let survivors = cfg.apply_probe_results(&results, opts.limit);
    if survivors.is_empty() {
      tracing::warn!("no node answered; {} left untouched", self.paths.yaml.display());
      return Ok(());
    }
    cfg.emit(&self.paths).map_err(CheckError::Config)?;
    tracing::info!("kept {} nodes ordered by delay", survivors.len());

    if opts.speed_test {
      let manual = match cfg.manual_group() {
        Some(m) => m.to_string(),
        None => {
          tracing::warn!("no select group to pin nodes in; skipping speed test");
          return Ok(());
        }
      };
      let st = SpeedTest::via_mixed_port(opts.mixed_port, opts.speed_test_count, opts.speed_min_mbps);
      let speeds = st.run(api, &top, &manual, &survivors).await;
      let ordered = health::speed_order(&survivors, &speeds, st.min_mbps);
      cfg.rank_nodes(&ordered);
      cfg.emit(&self.paths).map_err(CheckError::Config)?;
      tracing::info!("reordered {} nodes by download speed", ordered.len());
    }
    Ok(())
  }
}

fn into_node(c: Candidate) -> Option<Node> {
  match c {
    Candidate::Node(n) => Some(n),
    Candidate::Link(l) => {
      let parsed = parse_link(&l);
      if parsed.is_none() {
        tracing::debug!("unparseable link skipped: {l}");
      }
      parsed
    }
  }
}

/// Structured config, base64 or plain link lines; anything else yields nothing.
pub fn parse_subscription_text(txt: &str) -> Vec<Node> {
  let raw = txt.trim();
  if raw.is_empty() {
    return vec![];
  }
  let nodes = sources::candidates_from_body(raw)
    .unwrap_or_default()
    .into_iter()
    .filter_map(into_node)
    .collect();
  dedup::resolve(nodes, &[])
}

pub async fn run_forge(args: ForgeArgs) -> Result<()> {
  let session = Session::new(
    &args.config,
    Duration::from_millis(args.fetch_timeout_ms),
    args.check_opts.clone(),
  )?;
  let emitted = session.forge(&args).await?;
  if args.check && emitted != Emitted::Skipped {
    session.check().await.context("health check")?;
  }
  Ok(())
}

pub async fn run_check(args: CheckArgs) -> Result<()> {
  let session = Session::new(&args.config, Duration::from_secs(30), args.opts)?;
  session.check().await.context("health check")?;
  Ok(())
}

pub async fn run_parse(args: ParseArgs) -> Result<()> {
  let input = if args.stdin || args.text.is_none() {
    let mut buf = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    stdin.read_to_string(&mut buf).await?;
    buf
  } else {
    args.text.unwrap_or_default()
  };

  for n in parse_subscription_text(&input) {
    if let Ok(line) = serde_json::to_string(&n) {
      println!("{line}");
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use base64::engine::general_purpose;
  use base64::Engine as _;
  use clap::Parser;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[derive(Parser)]
  struct Cli {
    #[command(flatten)]
    forge: ForgeArgs,
  }

  fn forge_args(argv: &[&str]) -> ForgeArgs {
    let mut full = vec!["clashforge"];
    full.extend_from_slice(argv);
    Cli::parse_from(full).forge
  }

  #[test]
  fn defaults_follow_the_documented_values() {
    let a = forge_args(&[]);
    assert_eq!(a.ban, DEFAULT_BAN.to_vec());
    assert_eq!(a.config, PathBuf::from("clash_config.yaml"));
    assert_eq!(a.check_opts.api_ports, vec![9090]);
    assert_eq!(a.check_opts.timeout_ms, 3_000);
    assert_eq!(a.check_opts.concurrency, 100);
    assert_eq!(a.check_opts.limit, 10_000);
    assert_eq!(a.check_opts.engine_attempts, 5);
    assert!(!a.check);

    let a = forge_args(&["--types", "ss,hy2", "--ban", "HK", "--api-ports", "9090,9097", "x"]);
    assert_eq!(a.types, vec!["ss", "hy2"]);
    assert_eq!(a.ban, vec!["HK"]);
    assert_eq!(a.check_opts.api_ports, vec![9090, 9097]);
    assert_eq!(a.links, vec!["x"]);
  }

  #[test]
  fn subscription_text_forms() {
    let links = "ss://YWVzLTI1Ni1nY206cGFzcw==@1.2.3.4:8388#TestNode\ntrojan://p@t.example:443#T\nnot a link\n";
    assert_eq!(parse_subscription_text(links).len(), 2);
    let b64 = general_purpose::STANDARD.encode(links);
    assert_eq!(parse_subscription_text(&b64).len(), 2);
    let yaml = "proxies:\n  - {name: a, type: ss, server: 1.1.1.1, port: 1, cipher: c, password: p}\n  - {name: b, type: ss, server: 1.1.1.1, port: 1, cipher: c, password: p}\n";
    let nodes = parse_subscription_text(yaml);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name, "a");
    assert!(parse_subscription_text("   ").is_empty());
  }

  #[tokio::test]
  async fn forge_writes_deduped_filtered_config() {
    let server = MockServer::start().await;
    let sub = general_purpose::STANDARD.encode(
      "trojan://p@1.1.1.1:443#NodeA\ntrojan://p@2.2.2.2:443#NodeA\nss://YWVzLTI1Ni1nY206cGFzcw==@1.2.3.4:8388#CN-1\nvless://u@3.3.3.3:443#V\n",
    );
    Mock::given(method("GET"))
      .and(path("/sub"))
      .respond_with(ResponseTemplate::new(200).set_body_string(sub))
      .mount(&server)
      .await;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    std::fs::create_dir_all(&input).unwrap();
    std::fs::write(input.join("extra.txt"), "trojan://p@1.1.1.1:443#dup-of-first\n").unwrap();
    let config = dir.path().join("clash_config.yaml");

    let sub_url = format!("{}/sub", server.uri());
    let args = forge_args(&[
      "--input",
      input.to_str().unwrap(),
      "--config",
      config.to_str().unwrap(),
      "--types",
      "trojan,ss",
      &sub_url,
      "hysteria2://broken",
    ]);
    let session = Session::new(&args.config, Duration::from_secs(5), args.check_opts.clone()).unwrap();
    let emitted = session.forge(&args).await.unwrap();
    assert_eq!(emitted, Emitted::Written { nodes: 2 });

    let cfg = ClashConfig::load(&session.paths).unwrap();
    let names: Vec<_> = cfg.proxies.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names[0], "dup-of-first");
    assert!(names[1].starts_with("NodeA"));
    assert_eq!(cfg.node_groups()[0].proxies.len(), 2);
    assert!(session.paths.json.is_file());
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn check_keeps_reachable_nodes_by_delay() {
    let server = MockServer::start().await;
    for (p, body) in [
      ("/configs", r#"{"mode":"rule"}"#),
      ("/version", r#"{"version":"v1.19.0"}"#),
      ("/proxies", r#"{"proxies":{}}"#),
      ("/proxies/A/delay", r#"{"delay":120}"#),
      ("/proxies/C/delay", r#"{"delay":40}"#),
    ] {
      Mock::given(method("GET"))
        .and(path(p))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    }
    Mock::given(method("GET"))
      .and(path("/proxies/B/delay"))
      .respond_with(ResponseTemplate::new(504))
      .mount(&server)
      .await;
    Mock::given(method("PUT"))
      .and(path("/proxies/%E8%8A%82%E7%82%B9%E9%80%89%E6%8B%A9"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;

    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("clash_config.yaml");
    let nodes = ["A", "B", "C"]
      .iter()
      .enumerate()
      .map(|(i, n)| parse_link(&format!("trojan://p@10.0.0.{i}:443#{n}")).unwrap())
      .collect();
    let port = server.address().port().to_string();
    let args = forge_args(&[
      "--config",
      config.to_str().unwrap(),
      "--engine",
      "/bin/sh",
      "--api-ports",
      &port,
    ]);
    let session = Session::new(&args.config, Duration::from_secs(5), args.check_opts.clone()).unwrap();
    ClashConfig::bundled()
      .unwrap()
      .with_nodes(nodes)
      .emit(&session.paths)
      .unwrap();

    session.check().await.unwrap();

    let cfg = ClashConfig::load(&session.paths).unwrap();
    let names: Vec<_> = cfg.proxies.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["C", "A"]);
    assert_eq!(cfg.node_groups()[0].proxies, vec!["C", "A"]);
    assert_eq!(cfg.top_group(), Some("节点选择"));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn failed_check_leaves_the_written_pair_alone() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("clash_config.yaml");
    let nodes = ["A", "B"]
      .iter()
      .enumerate()
      .map(|(i, n)| parse_link(&format!("trojan://p@10.0.0.{i}:443#{n}")).unwrap())
      .collect();
    ClashConfig::bundled()
      .unwrap()
      .with_nodes(nodes)
      .emit(&ConfigPaths::new(&config))
      .unwrap();
    let paths = ConfigPaths::new(&config);
    let yaml_before = std::fs::read(&paths.yaml).unwrap();
    let json_before = std::fs::read(&paths.json).unwrap();

    // nothing listens on port 1, so the engine never becomes ready
    let args = forge_args(&[
      "--config",
      config.to_str().unwrap(),
      "--engine",
      "/bin/sh",
      "--api-ports",
      "1",
      "--engine-attempts",
      "1",
      "--startup-timeout-ms",
      "600",
    ]);
    let session = Session::new(&args.config, Duration::from_secs(2), args.check_opts.clone()).unwrap();
    let err = session.check().await.err().unwrap();
    assert!(matches!(err, CheckError::EngineStartup { attempts: 1 }));
    assert_eq!(std::fs::read(&paths.yaml).unwrap(), yaml_before);
    assert_eq!(std::fs::read(&paths.json).unwrap(), json_before);

    // the engine comes up but its control API never answers /version
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/configs"))
      .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
      .mount(&server)
      .await;
    let port = server.address().port().to_string();
    let args = forge_args(&[
      "--config",
      config.to_str().unwrap(),
      "--engine",
      "/bin/sh",
      "--api-ports",
      &port,
      "--engine-attempts",
      "1",
    ]);
    let session = Session::new(&args.config, Duration::from_secs(2), args.check_opts.clone()).unwrap();
    let err = session.check().await.err().unwrap();
    assert!(matches!(err, CheckError::ApiUnreachable { .. }));
    assert_eq!(std::fs::read(&paths.yaml).unwrap(), yaml_before);
    assert_eq!(std::fs::read(&paths.json).unwrap(), json_before);
  }

  #[tokio::test]
  async fn forge_with_nothing_usable_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("c.yaml");
    let args = forge_args(&[
      "--input",
      dir.path().join("none").to_str().unwrap(),
      "--config",
      config.to_str().unwrap(),
      "vless://broken",
    ]);
    let session = Session::new(&args.config, Duration::from_secs(1), args.check_opts.clone()).unwrap();
    assert_eq!(session.forge(&args).await.unwrap(), Emitted::Skipped);
    assert!(!config.exists());
  }
}
