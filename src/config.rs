use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value as YamlValue};

use crate::health::ProbeResult;
use crate::node::{y_str, Node};

const BUNDLED_TEMPLATE: &str = include_str!("../assets/template.yaml");

/// Built-in policy targets that are never nodes.
pub const SENTINELS: [&str; 2] = ["DIRECT", "REJECT"];

pub fn is_sentinel(name: &str) -> bool {
  SENTINELS.contains(&name)
}

/// `<path>` (YAML) and `<path>.json`, always written together.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPaths {
  pub yaml: PathBuf,
  pub json: PathBuf,
}

impl ConfigPaths {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    let mut yaml: PathBuf = path.into();
    if yaml.extension().and_then(|e| e.to_str()) == Some("json") {
      yaml.set_extension("");
    }
    let mut json = yaml.clone().into_os_string();
    json.push(".json");
    ConfigPaths {
      yaml,
      json: PathBuf::from(json),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyGroup {
  pub name: String,
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default)]
  pub proxies: Vec<String>,
  #[serde(flatten)]
  pub extra: Mapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClashConfig {
  #[serde(flatten)]
  pub settings: Mapping,
  #[serde(default, deserialize_with = "supported_nodes")]
  pub proxies: Vec<Node>,
  #[serde(rename = "proxy-groups", default)]
  pub proxy_groups: Vec<ProxyGroup>,
  #[serde(default)]
  pub rules: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
  Written { nodes: usize },
  Skipped,
}

fn supported_nodes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Node>, D::Error> {
  let raw = Option::<Vec<YamlValue>>::deserialize(deserializer)?.unwrap_or_default();
  Ok(raw.iter().filter_map(Node::from_yaml).collect())
}

impl ClashConfig {
  pub fn bundled() -> Result<Self> {
    Self::from_yaml_str(BUNDLED_TEMPLATE).context("parse bundled template")
  }

  /// Entries of unsupported type are dropped together with every group
  /// reference to them.
  pub fn from_yaml_str(text: &str) -> Result<Self> {
    let doc: YamlValue = serde_yaml::from_str(text)?;
    let listed = entry_names(&doc);
    let mut cfg: ClashConfig = serde_yaml::from_value(doc)?;
    if cfg.proxy_groups.len() < 2 {
      return Err(anyhow!("a template needs a top selector and at least one node group"));
    }

    let kept: HashSet<&str> = cfg.proxies.iter().map(|n| n.name.as_str()).collect();
    let dropped: HashSet<String> = listed.into_iter().filter(|n| !kept.contains(n.as_str())).collect();
    if !dropped.is_empty() {
      tracing::warn!("{} proxies of unsupported type left out", dropped.len());
      for g in &mut cfg.proxy_groups {
        g.proxies.retain(|p| !dropped.contains(p));
      }
    }
    Ok(cfg)
  }

  /// Template from `path`, or the bundled one.
  pub fn template(path: Option<&Path>) -> Result<Self> {
    match path {
      Some(p) => {
        let text = std::fs::read_to_string(p).with_context(|| format!("read template {}", p.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parse template {}", p.display()))
      }
      None => Self::bundled(),
    }
  }

  pub fn load(paths: &ConfigPaths) -> Result<Self> {
    let text =
      std::fs::read_to_string(&paths.yaml).with_context(|| format!("read {}", paths.yaml.display()))?;
    Self::from_yaml_str(&text).with_context(|| format!("parse {}", paths.yaml.display()))
  }

  /// The first group, which selects among the other groups.
  pub fn top_group(&self) -> Option<&str> {
    self.proxy_groups.first().map(|g| g.name.as_str())
  }

  /// Every group that lists nodes, i.e. all but the top selector.
  pub fn node_groups(&self) -> &[ProxyGroup] {
    let start = self.proxy_groups.len().min(1);
    &self.proxy_groups[start..]
  }

  fn node_groups_mut(&mut self) -> &mut [ProxyGroup] {
    let start = self.proxy_groups.len().min(1);
    &mut self.proxy_groups[start..]
  }

  /// Members of the first node group, the auto-select group of the template.
  pub fn auto_group_members(&self) -> Vec<String> {
    self.node_groups().first().map(|g| g.proxies.clone()).unwrap_or_default()
  }

  /// First node group of type `select`, used to pin a single node.
  pub fn manual_group(&self) -> Option<&str> {
    self
      .node_groups()
      .iter()
      .find(|g| g.kind == "select")
      .map(|g| g.name.as_str())
  }

  pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
    let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
    self.proxies = nodes;
    for g in self.node_groups_mut() {
      g.proxies = names.clone();
    }
    self
  }

  /// Writes the YAML/JSON pair. Nothing is written when there are no nodes.
  pub fn emit(&self, paths: &ConfigPaths) -> Result<Emitted> {
    if self.proxies.is_empty() {
      return Ok(Emitted::Skipped);
    }
    if let Some(dir) = paths.yaml.parent().filter(|d| !d.as_os_str().is_empty()) {
      std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    write_pair(paths, self)?;
    Ok(Emitted::Written {
      nodes: self.proxies.len(),
    })
  }

  /// Installs `ranked` as the member list of every node group and keeps only
  /// those nodes, in that order. Sentinels already in a group stay at its end.
  pub fn rank_nodes(&mut self, ranked: &[String]) {
    for g in self.node_groups_mut() {
      let sentinels: Vec<String> = g.proxies.iter().filter(|p| is_sentinel(p)).cloned().collect();
      g.proxies = ranked.to_vec();
      g.proxies.extend(sentinels);
    }

    let mut by_name: HashMap<String, Node> =
      std::mem::take(&mut self.proxies).into_iter().map(|n| (n.name.clone(), n)).collect();
    self.proxies = ranked.iter().filter_map(|name| by_name.remove(name)).collect();
  }

  /// Drops invalid results, orders the rest by ascending delay, truncates to
  /// `limit` and ranks the config accordingly. Returns the surviving names.
  pub fn apply_probe_results(&mut self, results: &[ProbeResult], limit: usize) -> Vec<String> {
    let mut valid: Vec<(&str, u64)> = results
      .iter()
      .filter_map(|r| r.delay.map(|d| (r.name.as_str(), d)))
      .collect();
    valid.sort_by_key(|(_, d)| *d);

    let mut names: Vec<String> = Vec::with_capacity(valid.len());
    for (name, _) in valid {
      if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
      }
    }
    names.truncate(limit);
    self.rank_nodes(&names);
    names
  }
}

fn entry_names(doc: &YamlValue) -> Vec<String> {
  doc
    .get("proxies")
    .and_then(|p| p.as_sequence())
    .map(|seq| seq.iter().map(|e| y_str(e.get("name"))).collect())
    .unwrap_or_default()
}

fn write_pair<T: Serialize>(paths: &ConfigPaths, doc: &T) -> Result<()> {
  let yaml = serde_yaml::to_string(doc).context("serialize yaml")?;
  std::fs::write(&paths.yaml, yaml).with_context(|| format!("write {}", paths.yaml.display()))?;
  let json = serde_json::to_string_pretty(doc).context("serialize json")?;
  std::fs::write(&paths.json, json).with_context(|| format!("write {}", paths.json.display()))?;
  Ok(())
}

/// Removes `proxies[index]` as written on disk, counting entries of every
/// type, and every group reference to its name. Returns the removed name and
/// the number of entries left, or `None` when `index` is out of range. Fails
/// without writing when the entry is the last one.
pub fn remove_written_proxy(paths: &ConfigPaths, index: usize) -> Result<Option<(String, usize)>> {
  let text =
    std::fs::read_to_string(&paths.yaml).with_context(|| format!("read {}", paths.yaml.display()))?;
  let mut doc: YamlValue = serde_yaml::from_str(&text).with_context(|| format!("parse {}", paths.yaml.display()))?;

  let (name, left) = match doc.get_mut("proxies").and_then(|p| p.as_sequence_mut()) {
    Some(seq) if index < seq.len() => {
      if seq.len() == 1 {
        return Err(anyhow!("refusing to remove the only proxy"));
      }
      let removed = seq.remove(index);
      (y_str(removed.get("name")), seq.len())
    }
    _ => return Ok(None),
  };
  if let Some(groups) = doc.get_mut("proxy-groups").and_then(|g| g.as_sequence_mut()) {
    for g in groups.iter_mut() {
      if let Some(members) = g.get_mut("proxies").and_then(|m| m.as_sequence_mut()) {
        members.retain(|m| m.as_str() != Some(name.as_str()));
      }
    }
  }
  write_pair(paths, &doc)?;
  Ok(Some((name, left)))
}
