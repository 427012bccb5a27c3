use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::{Mapping, Value as YamlValue};

/// A proxy endpoint as it appears in the `proxies` list of a Clash config.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
  pub name: String,
  pub server: String,
  pub port: u16,
  pub proto: Protocol,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Protocol {
  Shadowsocks(Shadowsocks),
  Vmess(Vmess),
  Vless(Vless),
  Trojan(Trojan),
  Hysteria2(Hysteria2),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Shadowsocks {
  pub cipher: String,
  pub password: String,
  pub udp: Option<bool>,
  pub extra: Mapping,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vmess {
  pub uuid: String,
  pub alter_id: u32,
  pub cipher: String,
  pub network: String,
  pub tls: bool,
  pub servername: String,
  pub ws: Option<WsOpts>,
  pub extra: Mapping,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vless {
  pub uuid: String,
  pub security: Option<String>,
  pub tls: bool,
  pub servername: String,
  pub skip_cert_verify: bool,
  pub network: String,
  pub ws: Option<WsOpts>,
  pub extra: Mapping,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trojan {
  pub password: String,
  pub sni: String,
  pub skip_cert_verify: bool,
  pub extra: Mapping,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Hysteria2 {
  pub password: String,
  pub sni: String,
  pub skip_cert_verify: bool,
  pub extra: Mapping,
}

/// `ws-opts` of vmess/vless. Keys other than `path` and the `Host` header
/// ride along in `rest`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WsOpts {
  pub path: String,
  pub host: String,
  pub rest: Mapping,
}

/// Content identity of a node: two nodes with equal keys are the same endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
  pub server: String,
  pub port: u16,
  pub kind: &'static str,
  pub password: Option<String>,
}

impl Protocol {
  pub fn kind(&self) -> &'static str {
    match self {
      Protocol::Shadowsocks(_) => "ss",
      Protocol::Vmess(_) => "vmess",
      Protocol::Vless(_) => "vless",
      Protocol::Trojan(_) => "trojan",
      Protocol::Hysteria2(_) => "hysteria2",
    }
  }
}

pub fn normalize_kind(raw: &str) -> Option<&'static str> {
  match raw.trim().to_lowercase().as_str() {
    "ss" | "shadowsocks" => Some("ss"),
    "vmess" => Some("vmess"),
    "vless" => Some("vless"),
    "trojan" => Some("trojan"),
    "hysteria2" | "hy2" => Some("hysteria2"),
    _ => None,
  }
}

impl Node {
  pub fn kind(&self) -> &'static str {
    self.proto.kind()
  }

  /// Password of password-authenticated protocols; empty counts as absent.
  pub fn password(&self) -> Option<&str> {
    let p = match &self.proto {
      Protocol::Shadowsocks(ss) => ss.password.as_str(),
      Protocol::Trojan(t) => t.password.as_str(),
      Protocol::Hysteria2(h) => h.password.as_str(),
      Protocol::Vmess(_) | Protocol::Vless(_) => return None,
    };
    if p.is_empty() {
      None
    } else {
      Some(p)
    }
  }

  pub fn dedup_key(&self) -> DedupKey {
    DedupKey {
      server: self.server.clone(),
      port: self.port,
      kind: self.kind(),
      password: self.password().map(|s| s.to_string()),
    }
  }

  /// Builds a node from one entry of a structured config's `proxies` list.
  /// Entries of unsupported types or without a usable port yield `None`.
  pub fn from_yaml(v: &YamlValue) -> Option<Node> {
    let mut map = v.as_mapping()?.clone();
    let kind = normalize_kind(&y_str(map.shift_remove("type").as_ref()))?;
    let name = y_str(map.shift_remove("name").as_ref());
    let server = y_str(map.shift_remove("server").as_ref());
    let port = y_u16(map.shift_remove("port").as_ref())?;

    let proto = match kind {
      "ss" => {
        let cipher = take_str(&mut map, &["cipher", "method"]);
        let password = take_str(&mut map, &["password"]);
        let udp = y_bool(map.shift_remove("udp").as_ref());
        Protocol::Shadowsocks(Shadowsocks {
          cipher,
          password,
          udp,
          extra: map,
        })
      }
      "vmess" => {
        let uuid = take_str(&mut map, &["uuid"]);
        let alter_id = y_str(map.shift_remove("alterId").as_ref()).parse::<u32>().unwrap_or(0);
        let cipher = or_default(take_str(&mut map, &["cipher"]), "auto");
        let network = or_default(take_str(&mut map, &["network"]), "tcp");
        let tls = y_bool(map.shift_remove("tls").as_ref()).unwrap_or(false);
        let servername = take_str(&mut map, &["servername", "sni"]);
        let ws = take_ws_opts(&mut map);
        Protocol::Vmess(Vmess {
          uuid,
          alter_id,
          cipher,
          network,
          tls,
          servername,
          ws,
          extra: map,
        })
      }
      "vless" => {
        let uuid = take_str(&mut map, &["uuid"]);
        let security = map.shift_remove("security").map(|v| y_str(Some(&v)));
        let tls = y_bool(map.shift_remove("tls").as_ref()).unwrap_or(false);
        let servername = take_str(&mut map, &["servername", "sni"]);
        let skip_cert_verify = y_bool(map.shift_remove("skip-cert-verify").as_ref()).unwrap_or(false);
        let network = or_default(take_str(&mut map, &["network"]), "tcp");
        let ws = take_ws_opts(&mut map);
        Protocol::Vless(Vless {
          uuid,
          security,
          tls,
          servername,
          skip_cert_verify,
          network,
          ws,
          extra: map,
        })
      }
      "trojan" => {
        let password = take_str(&mut map, &["password"]);
        let sni = take_str(&mut map, &["sni", "servername"]);
        let skip_cert_verify = y_bool(map.shift_remove("skip-cert-verify").as_ref()).unwrap_or(false);
        Protocol::Trojan(Trojan {
          password,
          sni,
          skip_cert_verify,
          extra: map,
        })
      }
      _ => {
        let mut password = take_str(&mut map, &["password"]);
        if password.is_empty() {
          password = y_str(map.get("auth").or_else(|| map.get("auth-str")));
        }
        let sni = take_str(&mut map, &["sni", "servername"]);
        let skip_cert_verify = y_bool(map.shift_remove("skip-cert-verify").as_ref()).unwrap_or(false);
        Protocol::Hysteria2(Hysteria2 {
          password,
          sni,
          skip_cert_verify,
          extra: map,
        })
      }
    };

    Some(Node {
      name,
      server,
      port,
      proto,
    })
  }

  pub fn to_yaml(&self) -> YamlValue {
    let mut m = Mapping::new();
    put(&mut m, "name", self.name.clone());
    put(&mut m, "type", self.kind());
    put(&mut m, "server", self.server.clone());
    put(&mut m, "port", self.port);

    let extra = match &self.proto {
      Protocol::Shadowsocks(ss) => {
        put(&mut m, "cipher", ss.cipher.clone());
        put(&mut m, "password", ss.password.clone());
        if let Some(udp) = ss.udp {
          put(&mut m, "udp", udp);
        }
        &ss.extra
      }
      Protocol::Vmess(v) => {
        put(&mut m, "uuid", v.uuid.clone());
        put(&mut m, "alterId", v.alter_id);
        put(&mut m, "cipher", v.cipher.clone());
        put(&mut m, "network", v.network.clone());
        put(&mut m, "tls", v.tls);
        put_non_empty(&mut m, "servername", &v.servername);
        if let Some(ws) = &v.ws {
          m.insert("ws-opts".into(), ws.to_yaml());
        }
        &v.extra
      }
      Protocol::Vless(v) => {
        put(&mut m, "uuid", v.uuid.clone());
        if let Some(sec) = &v.security {
          put(&mut m, "security", sec.clone());
        }
        put(&mut m, "tls", v.tls);
        put_non_empty(&mut m, "servername", &v.servername);
        put(&mut m, "skip-cert-verify", v.skip_cert_verify);
        put(&mut m, "network", v.network.clone());
        if let Some(ws) = &v.ws {
          m.insert("ws-opts".into(), ws.to_yaml());
        }
        &v.extra
      }
      Protocol::Trojan(t) => {
        put(&mut m, "password", t.password.clone());
        put_non_empty(&mut m, "sni", &t.sni);
        put(&mut m, "skip-cert-verify", t.skip_cert_verify);
        &t.extra
      }
      Protocol::Hysteria2(h) => {
        put(&mut m, "password", h.password.clone());
        put_non_empty(&mut m, "sni", &h.sni);
        put(&mut m, "skip-cert-verify", h.skip_cert_verify);
        &h.extra
      }
    };
    for (k, v) in extra {
      if !m.contains_key(k) {
        m.insert(k.clone(), v.clone());
      }
    }
    YamlValue::Mapping(m)
  }
}

impl WsOpts {
  fn to_yaml(&self) -> YamlValue {
    let mut m = Mapping::new();
    put(&mut m, "path", self.path.clone());
    let mut headers = match self.rest.get("headers").and_then(|v| v.as_mapping()) {
      Some(h) => h.clone(),
      None => Mapping::new(),
    };
    if !self.host.is_empty() {
      put(&mut headers, "Host", self.host.clone());
    }
    m.insert("headers".into(), YamlValue::Mapping(headers));
    for (k, v) in &self.rest {
      if !m.contains_key(k) {
        m.insert(k.clone(), v.clone());
      }
    }
    YamlValue::Mapping(m)
  }
}

impl Serialize for Node {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.to_yaml().serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for Node {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let v = YamlValue::deserialize(deserializer)?;
    Node::from_yaml(&v).ok_or_else(|| serde::de::Error::custom("unsupported proxy entry"))
  }
}

fn put<V: Into<YamlValue>>(m: &mut Mapping, key: &str, v: V) {
  m.insert(YamlValue::String(key.to_string()), v.into());
}

fn put_non_empty(m: &mut Mapping, key: &str, v: &str) {
  if !v.is_empty() {
    put(m, key, v.to_string());
  }
}

fn or_default(s: String, default: &str) -> String {
  if s.is_empty() {
    default.to_string()
  } else {
    s
  }
}

/// Removes every alias in `keys`, returning the first non-empty value.
fn take_str(m: &mut Mapping, keys: &[&str]) -> String {
  let mut out = String::new();
  for k in keys {
    let s = y_str(m.shift_remove(*k).as_ref());
    if out.is_empty() && !s.is_empty() {
      out = s;
    }
  }
  out
}

fn take_ws_opts(m: &mut Mapping) -> Option<WsOpts> {
  let mut opts = match m.shift_remove("ws-opts") {
    Some(YamlValue::Mapping(o)) => o,
    _ => return None,
  };
  let path = y_str(opts.shift_remove("path").as_ref());
  let mut host = String::new();
  if let Some(YamlValue::Mapping(mut headers)) = opts.shift_remove("headers") {
    host = y_str(headers.shift_remove("Host").or_else(|| headers.shift_remove("host")).as_ref());
    if !headers.is_empty() {
      opts.insert("headers".into(), YamlValue::Mapping(headers));
    }
  }
  Some(WsOpts {
    path,
    host,
    rest: opts,
  })
}

fn to_bool(v: &str) -> bool {
  matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
}

/// Port in `1..=65535` from its text form.
pub fn parse_port(s: &str) -> Option<u16> {
  s.trim().parse::<u16>().ok().filter(|p| *p != 0)
}

/// Scalar as text: strings trimmed, numbers and booleans formatted.
pub fn y_str(v: Option<&YamlValue>) -> String {
  match v {
    Some(YamlValue::String(s)) => s.trim().to_string(),
    Some(YamlValue::Number(n)) => n.to_string(),
    Some(YamlValue::Bool(b)) => b.to_string(),
    _ => String::new(),
  }
}

pub fn y_u16(v: Option<&YamlValue>) -> Option<u16> {
  parse_port(&y_str(v))
}

pub fn y_bool(v: Option<&YamlValue>) -> Option<bool> {
  match v? {
    YamlValue::Bool(b) => Some(*b),
    YamlValue::Number(n) => n.as_i64().map(|n| n != 0),
    YamlValue::String(s) if !s.trim().is_empty() => Some(to_bool(s)),
    _ => None,
  }
}

/// `proxies` of a structured config document, skipping entries that are not nodes.
pub fn nodes_from_clash_yaml(doc: &YamlValue) -> Vec<Node> {
  let proxies = match doc.get("proxies").and_then(|v| v.as_sequence()) {
    Some(seq) => seq,
    None => return vec![],
  };
  let mut out = Vec::new();
  for p in proxies {
    match Node::from_yaml(p) {
      Some(n) => out.push(n),
      None => tracing::debug!("skipping unsupported proxy entry: {:?}", p.get("name")),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalars_accept_numbers_and_strings() {
    let y = |t: &str| serde_yaml::from_str::<YamlValue>(t).unwrap();
    assert_eq!(y_u16(Some(&y("443"))), Some(443));
    assert_eq!(y_u16(Some(&y("' 8443 '"))), Some(8443));
    assert_eq!(y_u16(Some(&y("0"))), None);
    assert_eq!(y_u16(Some(&y("70000"))), None);
    assert_eq!(y_u16(Some(&y("-1"))), None);
    assert_eq!(y_u16(None), None);
    assert_eq!(y_str(Some(&y("true"))), "true");
    assert_eq!(y_str(Some(&y("12"))), "12");
    assert_eq!(y_bool(Some(&y("'on'"))), Some(true));
    assert_eq!(y_bool(Some(&y("0"))), Some(false));
    assert_eq!(y_bool(Some(&y("''"))), None);
    assert_eq!(parse_port("65535/"), None);
    assert_eq!(parse_port(" 80 "), Some(80));
  }

  #[test]
  fn yaml_entry_keeps_unknown_fields() {
    let v: YamlValue = serde_yaml::from_str(
      "{name: a, type: ss, server: 1.1.1.1, port: '443', cipher: aes-128-gcm, password: p, plugin: obfs}",
    )
    .unwrap();
    let n = Node::from_yaml(&v).unwrap();
    assert_eq!(n.port, 443);
    assert_eq!(n.kind(), "ss");
    let back = n.to_yaml();
    assert_eq!(back.get("plugin").and_then(|v| v.as_str()), Some("obfs"));
    assert_eq!(back.get("cipher").and_then(|v| v.as_str()), Some("aes-128-gcm"));
    assert!(back.get("method").is_none());
  }

  #[test]
  fn unsupported_types_are_not_nodes() {
    let v: YamlValue = serde_yaml::from_str("{name: a, type: socks5, server: h, port: 1080}").unwrap();
    assert!(Node::from_yaml(&v).is_none());
    let v: YamlValue = serde_yaml::from_str("{name: a, type: hy2, server: h, port: 443, auth: x}").unwrap();
    let n = Node::from_yaml(&v).unwrap();
    assert_eq!(n.kind(), "hysteria2");
    assert_eq!(n.password(), Some("x"));
  }

  #[test]
  fn empty_password_is_absent_in_key() {
    let v: YamlValue =
      serde_yaml::from_str("{name: a, type: trojan, server: h, port: 443, password: ''}").unwrap();
    let n = Node::from_yaml(&v).unwrap();
    assert_eq!(n.dedup_key().password, None);
  }

  #[test]
  fn vmess_ws_opts_survive_json_round() {
    let v: YamlValue = serde_yaml::from_str(
      "{name: v, type: vmess, server: h, port: 80, uuid: u, network: ws, ws-opts: {path: /p, headers: {Host: example.com}}}",
    )
    .unwrap();
    let n = Node::from_yaml(&v).unwrap();
    let json = serde_json::to_string(&n).unwrap();
    let back: Node = serde_json::from_str(&json).unwrap();
    assert_eq!(back, n);
    match back.proto {
      Protocol::Vmess(vm) => {
        let ws = vm.ws.unwrap();
        assert_eq!(ws.path, "/p");
        assert_eq!(ws.host, "example.com");
      }
      _ => panic!("expected vmess"),
    }
  }
}
