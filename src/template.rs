use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, NaiveDateTime, Timelike};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use reqwest::Client;
use serde::Deserialize;

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";

static PROXY_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://[^/]+/https://").unwrap());
static BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^}]+)\}").unwrap());
static WILDCARD_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{x\}(\.[A-Za-z0-9]+)(?:/|$)").unwrap());
static RAW_GITHUB: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^https://raw\.githubusercontent\.com/([^/]+)/([^/]+)/(.+)$").unwrap());

/// Splits `https://mirror.example/https://real/...` into the real URL and the
/// mirror prefix (`https://mirror.example/`).
pub fn strip_proxy_prefix(url: &str) -> (String, Option<String>) {
  match PROXY_PREFIX.find(url) {
    Some(m) => {
      let prefix_end = m.end() - "https://".len();
      (url[prefix_end..].to_string(), Some(url[..prefix_end].to_string()))
    }
    None => (url.to_string(), None),
  }
}

/// Expands every `{...}` block: `Y m d H M S` become date/time components,
/// any other character is kept as a separator. `{x}` is left untouched.
pub fn expand_datetime(template: &str, now: NaiveDateTime) -> String {
  BLOCK
    .replace_all(template, |caps: &Captures| {
      let content = &caps[1];
      if content == "x" {
        return "{x}".to_string();
      }
      let mut out = String::new();
      for c in content.chars() {
        match c {
          'Y' => out.push_str(&format!("{:04}", now.year())),
          'm' => out.push_str(&format!("{:02}", now.month())),
          'd' => out.push_str(&format!("{:02}", now.day())),
          'H' => out.push_str(&format!("{:02}", now.hour())),
          'M' => out.push_str(&format!("{:02}", now.minute())),
          'S' => out.push_str(&format!("{:02}", now.second())),
          other => out.push(other),
        }
      }
      out
    })
    .into_owned()
}

pub fn wildcard_suffix(url: &str) -> Option<String> {
  WILDCARD_SUFFIX.captures(url).map(|c| c[1].to_string())
}

/// Contents-API URL listing the directory that holds the `{x}<suffix>` file.
pub fn listing_url(api_base: &str, raw_url: &str, suffix: &str) -> Option<String> {
  let caps = RAW_GITHUB.captures(raw_url)?;
  let owner = &caps[1];
  let repo = &caps[2];
  let rest = &caps[3];
  let (branch, path) = match rest.strip_prefix("refs/heads/") {
    Some(r) => r.split_once('/')?,
    None => rest.split_once('/')?,
  };
  let dir = path
    .replace(&format!("{{x}}{suffix}"), "")
    .trim_end_matches('/')
    .to_string();
  Some(format!(
    "{}/repos/{owner}/{repo}/contents/{dir}?ref={branch}",
    api_base.trim_end_matches('/')
  ))
}

#[derive(Deserialize)]
struct ContentEntry {
  name: String,
}

async fn first_matching_file(client: &Client, api_url: &str, suffix: &str) -> Result<String> {
  let resp = client
    .get(api_url)
    .header("accept", "application/vnd.github+json")
    .send()
    .await
    .with_context(|| format!("list {api_url}"))?;
  let status = resp.status();
  if !status.is_success() {
    return Err(anyhow!("listing {api_url} returned {status}"));
  }
  let entries: Vec<ContentEntry> = resp.json().await.context("decode directory listing")?;
  entries
    .into_iter()
    .map(|e| e.name)
    .find(|n| n.ends_with(suffix))
    .ok_or_else(|| anyhow!("no {suffix} file under {api_url}"))
}

/// Resolves date placeholders and the `{x}` wildcard of a templated source URL.
pub async fn resolve_template_url(
  client: &Client,
  api_base: &str,
  template: &str,
  now: NaiveDateTime,
) -> Result<String> {
  let (url, prefix) = strip_proxy_prefix(template);
  let mut resolved = expand_datetime(&url, now);

  if resolved.contains("raw.githubusercontent.com") && resolved.contains("{x}") {
    if let Some(suffix) = wildcard_suffix(&resolved) {
      let api_url = listing_url(api_base, &resolved, &suffix)
        .ok_or_else(|| anyhow!("cannot derive owner/repo from {resolved}"))?;
      let file = first_matching_file(client, &api_url, &suffix).await?;
      resolved = resolved.replacen(&format!("{{x}}{suffix}"), &file, 1);
    }
  }

  Ok(match prefix {
    Some(p) => format!("{p}{resolved}"),
    None => resolved,
  })
}
