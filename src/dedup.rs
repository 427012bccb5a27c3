use std::collections::HashSet;

use crate::node::Node;

pub const DEFAULT_BAN: [&str; 6] = ["中国", "China", "CN", "电信", "移动", "联通"];

const SUFFIX_LEN: usize = 4;

/// Accepts nodes in encounter order, renaming display-name collisions, then
/// drops content duplicates (first seen wins) in [`NameResolver::finish`].
pub struct NameResolver {
  ban: Vec<String>,
  names: HashSet<String>,
  accepted: Vec<Node>,
  rng: fastrand::Rng,
}

impl NameResolver {
  pub fn new(ban: Vec<String>) -> Self {
    Self::with_rng(ban, fastrand::Rng::new())
  }

  pub fn with_rng(ban: Vec<String>, rng: fastrand::Rng) -> Self {
    NameResolver {
      ban,
      names: HashSet::new(),
      accepted: Vec::new(),
      rng,
    }
  }

  pub fn is_banned(&self, name: &str) -> bool {
    self.ban.iter().any(|k| !k.is_empty() && name.contains(k.as_str()))
  }

  /// Returns false when the node was rejected.
  pub fn offer(&mut self, mut node: Node) -> bool {
    if node.server.trim().is_empty() {
      return false;
    }
    if self.is_banned(&node.name) {
      tracing::debug!("banned node dropped: {}", node.name);
      return false;
    }
    if self.names.contains(&node.name) {
      node.name = self.suffixed(&node.name);
    }
    self.names.insert(node.name.clone());
    self.accepted.push(node);
    true
  }

  fn suffixed(&mut self, name: &str) -> String {
    loop {
      let suffix: String = (0..SUFFIX_LEN).map(|_| self.rng.alphanumeric()).collect();
      let candidate = format!("{name}-{suffix}");
      if !self.names.contains(&candidate) {
        return candidate;
      }
    }
  }

  pub fn len(&self) -> usize {
    self.accepted.len()
  }

  pub fn finish(self) -> Vec<Node> {
    dedupe_nodes(self.accepted)
  }
}

pub fn dedupe_nodes(nodes: Vec<Node>) -> Vec<Node> {
  let mut seen = HashSet::new();
  let mut out = Vec::new();
  for n in nodes {
    if seen.insert(n.dedup_key()) {
      out.push(n);
    }
  }
  out
}

/// Runs the full resolver over `nodes`.
pub fn resolve(nodes: Vec<Node>, ban: &[String]) -> Vec<Node> {
  let mut r = NameResolver::new(ban.to_vec());
  for n in nodes {
    r.offer(n);
  }
  r.finish()
}
