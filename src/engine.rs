use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use zip::read::ZipArchive;

use crate::api::ControlApi;
use crate::config::{remove_written_proxy, ConfigPaths};
use crate::error::CheckError;

pub const RELEASE_API: &str = "https://api.github.com/repos/MetaCubeX/mihomo/releases/latest";
pub const DEFAULT_MIRROR: &str = "https://slink.ltd/";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

static PROXY_INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"proxy (\d+):").unwrap());

#[derive(Debug, Clone)]
pub struct EngineOptions {
  pub binary: Option<PathBuf>,
  pub cache_dir: PathBuf,
  pub mirror: Option<String>,
  pub release_api: String,
  pub startup_timeout: Duration,
  pub geoip_grace: Duration,
  pub attempts: u32,
}

impl Default for EngineOptions {
  fn default() -> Self {
    EngineOptions {
      binary: None,
      cache_dir: PathBuf::from("."),
      mirror: Some(DEFAULT_MIRROR.to_string()),
      release_api: RELEASE_API.to_string(),
      startup_timeout: Duration::from_secs(3),
      geoip_grace: Duration::from_secs(5),
      attempts: 5,
    }
  }
}

/// A running engine process whose control API answered.
pub struct Engine {
  child: Child,
}

#[derive(Debug)]
enum Probe {
  Ready(ControlApi),
  Repaired,
  TimedOut,
}

#[derive(Deserialize)]
struct Release {
  #[serde(default)]
  assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
  pub name: String,
  pub browser_download_url: String,
}

/// Index named by an engine line like `Parse config error: proxy 3: ...`.
pub fn parse_error_index(line: &str) -> Option<usize> {
  if !line.contains("Parse config error") {
    return None;
  }
  PROXY_INDEX.captures(line)?.get(1)?.as_str().parse().ok()
}

/// OS name as used in release asset names.
fn release_os(os: &str) -> &str {
  match os {
    "macos" => "darwin",
    other => other,
  }
}

pub fn cached_binary_name(os: &str) -> String {
  if os == "windows" {
    "clash.exe".to_string()
  } else {
    format!("clash-{os}")
  }
}

fn arch_tag(arch: &str) -> &str {
  match arch {
    "x86_64" => "amd64-compatible",
    "aarch64" => "arm64",
    "x86" => "386",
    other => other,
  }
}

/// Release asset for `os`/`arch`: `.zip` on Windows, `.gz` elsewhere. Among
/// several matches the shortest name wins (plain build over go-version variants).
pub fn pick_asset<'a>(assets: &'a [Asset], os: &str, arch: &str) -> Option<&'a Asset> {
  let target = format!("mihomo-{os}-{}", arch_tag(arch));
  let ext = if os == "windows" { ".zip" } else { ".gz" };
  assets
    .iter()
    .filter(|a| a.name.starts_with(&target) && a.name.ends_with(ext))
    .min_by_key(|a| a.name.len())
}

fn extract(name: &str, bytes: &[u8]) -> Result<Vec<u8>, CheckError> {
  let mut out = Vec::new();
  if name.ends_with(".gz") {
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    return Ok(out);
  }
  if name.ends_with(".zip") {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| CheckError::EngineBinary(e.to_string()))?;
    for i in 0..archive.len() {
      let mut file = archive
        .by_index(i)
        .map_err(|e| CheckError::EngineBinary(e.to_string()))?;
      if file.is_file() {
        file.read_to_end(&mut out)?;
        return Ok(out);
      }
    }
    return Err(CheckError::EngineBinary(format!("{name} holds no file")));
  }
  Err(CheckError::EngineBinary(format!("unsupported archive {name}")))
}

fn ensure_executable(path: &Path) -> Result<(), CheckError> {
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
  }
  #[cfg(not(unix))]
  let _ = path;
  Ok(())
}

/// Returns the engine binary, downloading the latest release once if needed.
pub async fn ensure_binary(client: &Client, opts: &EngineOptions) -> Result<PathBuf, CheckError> {
  if let Some(p) = &opts.binary {
    if !p.is_file() {
      return Err(CheckError::EngineBinary(format!("{} not found", p.display())));
    }
    return Ok(p.clone());
  }

  let os = release_os(std::env::consts::OS);
  let cached = opts.cache_dir.join(cached_binary_name(os));
  if cached.is_file() {
    ensure_executable(&cached)?;
    return Ok(cached);
  }

  let release: Release = client
    .get(&opts.release_api)
    .header("accept", "application/vnd.github+json")
    .send()
    .await?
    .error_for_status()?
    .json()
    .await?;
  let asset = pick_asset(&release.assets, os, std::env::consts::ARCH)
    .ok_or_else(|| CheckError::EngineBinary(format!("no release asset for {os}/{}", std::env::consts::ARCH)))?;

  let url = format!("{}{}", opts.mirror.as_deref().unwrap_or(""), asset.browser_download_url);
  tracing::info!("downloading engine from {url}");
  let bytes = client.get(&url).send().await?.error_for_status()?.bytes().await?;
  let binary = extract(&asset.name, &bytes)?;

  std::fs::create_dir_all(&opts.cache_dir)?;
  std::fs::write(&cached, binary)?;
  ensure_executable(&cached)?;
  Ok(cached)
}

fn forward_lines<R>(reader: R, tx: UnboundedSender<String>)
where
  R: AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      if tx.send(line).is_err() {
        break;
      }
    }
  });
}

fn spawn(binary: &Path, config: &Path) -> Result<(Child, UnboundedReceiver<String>), CheckError> {
  let mut child = Command::new(binary)
    .arg("-f")
    .arg(config)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .map_err(CheckError::Spawn)?;

  let (tx, rx) = unbounded_channel();
  if let Some(out) = child.stdout.take() {
    forward_lines(out, tx.clone());
  }
  if let Some(err) = child.stderr.take() {
    forward_lines(err, tx);
  }
  Ok((child, rx))
}

/// Removes the entry the engine rejected from both config files. The engine
/// counts every entry it read, so the index applies to the file as written.
fn repair(paths: &ConfigPaths, index: usize) -> Result<bool, CheckError> {
  match remove_written_proxy(paths, index).map_err(CheckError::Config)? {
    Some((name, left)) => {
      tracing::warn!("engine rejected proxy {index} ({name}); removed it, {left} left");
      Ok(true)
    }
    None => Ok(false),
  }
}

async fn await_startup(
  lines: &mut UnboundedReceiver<String>,
  apis: &[ControlApi],
  paths: &ConfigPaths,
  opts: &EngineOptions,
) -> Result<Probe, CheckError> {
  let mut deadline = Instant::now() + opts.startup_timeout;
  let mut grace_used = false;
  let mut last: Option<String> = None;

  while Instant::now() < deadline {
    tokio::time::sleep(POLL_INTERVAL).await;
    while let Ok(line) = lines.try_recv() {
      tracing::debug!(target: "engine", "{line}");
      last = Some(line);
    }

    if let Some(line) = &last {
      if let Some(index) = parse_error_index(line) {
        if repair(paths, index)? {
          return Ok(Probe::Repaired);
        }
      }
      if !grace_used && line.contains("GeoIP.dat") {
        tracing::info!("engine is fetching geodata, waiting {:?} more", opts.geoip_grace);
        deadline += opts.geoip_grace;
        grace_used = true;
      }
    }

    for api in apis {
      if api.configs_ok().await {
        return Ok(Probe::Ready(api.clone()));
      }
    }
  }
  Ok(Probe::TimedOut)
}

impl Engine {
  /// Spawns the engine on `paths.json` until one of `apis` serves `/configs`.
  /// Rejected proxies are removed and the engine restarted; plain timeouts
  /// count against `opts.attempts`.
  pub async fn start(
    binary: &Path,
    paths: &ConfigPaths,
    apis: &[ControlApi],
    opts: &EngineOptions,
  ) -> Result<Engine, CheckError> {
    let mut failures = 0;
    let mut backoff = INITIAL_BACKOFF;
    loop {
      let (mut child, mut lines) = spawn(binary, &paths.json)?;
      let outcome = await_startup(&mut lines, apis, paths, opts).await;
      match outcome {
        Ok(Probe::Ready(api)) => {
          tracing::info!("engine ready, control API at {}", api.base());
          return Ok(Engine { child });
        }
        Ok(Probe::Repaired) => {
          let _ = child.kill().await;
        }
        Ok(Probe::TimedOut) => {
          let _ = child.kill().await;
          failures += 1;
          if failures >= opts.attempts {
            return Err(CheckError::EngineStartup { attempts: failures });
          }
          tracing::warn!("engine not ready (attempt {failures}/{}), retrying in {backoff:?}", opts.attempts);
          tokio::time::sleep(backoff).await;
          backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        Err(e) => {
          let _ = child.kill().await;
          return Err(e);
        }
      }
    }
  }

  pub async fn stop(mut self) {
    let _ = self.child.kill().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), self.child.wait()).await;
  }
}
