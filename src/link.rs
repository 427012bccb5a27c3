use base64::engine::general_purpose;
use base64::Engine;
use percent_encoding::percent_decode_str;
use serde_json::Value as JsonValue;
use serde_yaml::Mapping;
use std::collections::HashMap;

use crate::node::{parse_port, Hysteria2, Node, Protocol, Shadowsocks, Trojan, Vless, Vmess, WsOpts};

pub const SCHEMES: [&str; 6] = ["hysteria2://", "hy2://", "trojan://", "ss://", "vless://", "vmess://"];

pub fn is_proxy_link(s: &str) -> bool {
  SCHEMES.iter().any(|p| s.starts_with(p))
}

pub fn percent_decode_to_string(s: &str) -> String {
  percent_decode_str(s)
    .decode_utf8()
    .map(|c| c.into_owned())
    .unwrap_or_else(|_| s.to_string())
}

pub fn looks_like_base64(text: &str) -> bool {
  let s = text.trim();
  let lower = s.to_ascii_lowercase();
  !s.is_empty()
    && !lower.starts_with("http://")
    && !lower.starts_with("https://")
    && s
      .chars()
      .all(|c| c.is_whitespace() || c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_'))
}

/// Standard or url-safe alphabet, padding optional; `None` unless the result
/// is non-blank UTF-8.
pub fn decode_base64_to_utf8(s: &str) -> Option<String> {
  let cleaned: String = s.split_whitespace().collect();
  if cleaned.is_empty() {
    return None;
  }
  let padded = match cleaned.len() % 4 {
    0 => cleaned.clone(),
    r => format!("{cleaned}{}", "=".repeat(4 - r)),
  };
  let found = [&cleaned, &padded]
    .into_iter()
    .flat_map(|c| [general_purpose::STANDARD.decode(c), general_purpose::URL_SAFE.decode(c)])
    .filter_map(|r| r.ok())
    .filter_map(|b| String::from_utf8(b).ok())
    .find(|t| !t.trim().is_empty());
  found
}

fn json_text(obj: &JsonValue, key: &str) -> String {
  match obj.get(key) {
    Some(JsonValue::String(s)) => s.trim().to_string(),
    Some(JsonValue::Number(n)) => n.to_string(),
    Some(JsonValue::Bool(b)) => b.to_string(),
    _ => String::new(),
  }
}

/// Port given either as a number or as a numeric string.
pub fn json_port(obj: &JsonValue, key: &str) -> Option<u16> {
  parse_port(&json_text(obj, key))
}

fn parse_query(q: &str) -> HashMap<String, String> {
  let mut params = HashMap::new();
  for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
    params.entry(k.to_string()).or_insert_with(|| v.to_string());
  }
  params
}

fn param<'a>(params: &'a HashMap<String, String>, key: &str, default: &'a str) -> &'a str {
  params.get(key).map(|s| s.as_str()).unwrap_or(default)
}

/// `host:port` with an optional trailing `/`; IPv6 hosts may be bracketed.
fn split_host_port(s: &str) -> Option<(String, u16)> {
  let (host, port) = s.trim().rsplit_once(':')?;
  let port = parse_port(port.trim().trim_end_matches('/'))?;
  let host = host.trim().trim_start_matches('[').trim_end_matches(']').to_string();
  Some((host, port))
}

fn display_name(raw: &str, kind: &str, server: &str, port: u16) -> String {
  let name = percent_decode_to_string(raw).trim().to_string();
  if name.is_empty() {
    format!("{kind}:{server}:{port}")
  } else {
    name
  }
}

fn ws_opts(params: &HashMap<String, String>) -> Option<WsOpts> {
  if param(params, "type", "tcp") != "ws" {
    return None;
  }
  Some(WsOpts {
    path: param(params, "path", "").to_string(),
    host: param(params, "host", "").to_string(),
    rest: Mapping::new(),
  })
}

pub fn parse_ss(link: &str) -> Option<Node> {
  let body = link.strip_prefix("ss://")?;
  let (config, name) = body.split_once('#').unwrap_or((body, ""));
  let config = config.split('?').next().unwrap_or("").trim().trim_end_matches('/');

  let (creds, host_info) = match config.rsplit_once('@') {
    Some((c, h)) => (c.to_string(), h.to_string()),
    None => {
      let decoded = decode_base64_to_utf8(config)?;
      let (c, h) = decoded.rsplit_once('@')?;
      (c.to_string(), h.to_string())
    }
  };

  let decoded = match decode_base64_to_utf8(&creds) {
    Some(d) => d,
    None if creds.contains(':') => percent_decode_to_string(&creds),
    None => return None,
  };
  let parts: Vec<&str> = decoded.split(':').collect();
  let (cipher, password) = if parts.len() == 2 {
    (parts[0].to_string(), parts[1].to_string())
  } else {
    (decoded.clone(), String::new())
  };

  let (server, port) = split_host_port(&host_info)?;
  Some(Node {
    name: display_name(name, "ss", &server, port),
    server,
    port,
    proto: Protocol::Shadowsocks(Shadowsocks {
      cipher,
      password,
      udp: Some(true),
      extra: Mapping::new(),
    }),
  })
}

pub fn parse_vmess(link: &str) -> Option<Node> {
  let b64 = link.strip_prefix("vmess://")?.trim();
  let decoded = decode_base64_to_utf8(b64)?;
  let obj: JsonValue = serde_json::from_str(&decoded).ok()?;

  let server = json_text(&obj, "add");
  let port = json_port(&obj, "port")?;
  let uuid = json_text(&obj, "id");
  let alter_id = json_text(&obj, "aid").parse::<u32>().unwrap_or(0);
  let network = {
    let n = json_text(&obj, "net");
    if n.is_empty() {
      "tcp".to_string()
    } else {
      n
    }
  };
  let ws = if network == "ws" {
    Some(WsOpts {
      path: json_text(&obj, "path"),
      host: json_text(&obj, "host"),
      rest: Mapping::new(),
    })
  } else {
    None
  };
  let name = {
    let ps = json_text(&obj, "ps");
    percent_decode_to_string(if ps.is_empty() { "vmess" } else { &ps })
  };

  Some(Node {
    name,
    server,
    port,
    proto: Protocol::Vmess(Vmess {
      uuid,
      alter_id,
      cipher: "auto".to_string(),
      tls: json_text(&obj, "tls") == "tls",
      servername: json_text(&obj, "sni"),
      network,
      ws,
      extra: Mapping::new(),
    }),
  })
}

pub fn parse_vless(link: &str) -> Option<Node> {
  let body = link.strip_prefix("vless://")?;
  let (config, name) = body.split_once('#').unwrap_or((body, ""));
  let (uuid, host_info) = config.split_once('@')?;
  let (host_port, query) = host_info.split_once('?').unwrap_or((host_info, ""));
  let (server, port) = split_host_port(host_port)?;
  let params = parse_query(query);

  let security = param(&params, "security", "none").to_string();
  let mut extra = Mapping::new();
  if let Some(flow) = params.get("flow").filter(|s| !s.is_empty()) {
    extra.insert("flow".into(), flow.clone().into());
  }

  Some(Node {
    name: display_name(name, "vless", &server, port),
    server,
    port,
    proto: Protocol::Vless(Vless {
      uuid: percent_decode_to_string(uuid),
      tls: security == "tls",
      security: Some(security),
      servername: param(&params, "sni", "").to_string(),
      skip_cert_verify: param(&params, "skip-cert-verify", "false") == "true",
      network: param(&params, "type", "tcp").to_string(),
      ws: ws_opts(&params),
      extra,
    }),
  })
}

pub fn parse_trojan(link: &str) -> Option<Node> {
  let body = link.strip_prefix("trojan://")?;
  let (config, name) = body.split_once('#').unwrap_or((body, ""));
  let (user_info, host_info) = config.rsplit_once('@')?;
  let password = match user_info.split_once(':') {
    Some((_user, pass)) => pass,
    None => user_info,
  };
  let (host_port, query) = host_info.split_once('?').unwrap_or((host_info, ""));
  let (server, port) = split_host_port(host_port)?;
  let params = parse_query(query);

  Some(Node {
    name: display_name(name, "trojan", &server, port),
    server,
    port,
    proto: Protocol::Trojan(Trojan {
      password: percent_decode_to_string(password),
      sni: param(&params, "sni", "").to_string(),
      skip_cert_verify: param(&params, "skip-cert-verify", "false") == "true",
      extra: Mapping::new(),
    }),
  })
}

pub fn parse_hysteria2(link: &str) -> Option<Node> {
  let body = link
    .strip_prefix("hysteria2://")
    .or_else(|| link.strip_prefix("hy2://"))?;
  let (config, name) = match body.rsplit_once('#') {
    Some((c, n)) => (c, n.trim()),
    None => (body, ""),
  };
  let (auth, rest) = config.rsplit_once('@')?;
  let (host_port, query) = rest.split_once('?').unwrap_or((rest, ""));
  let (server, port) = split_host_port(host_port)?;
  let params = parse_query(query);
  let auth = percent_decode_to_string(auth);

  let mut extra = Mapping::new();
  extra.insert("auth".into(), auth.clone().into());
  extra.insert("client-fingerprint".into(), "chrome".into());

  Some(Node {
    name: display_name(name, "hysteria2", &server, port),
    server,
    port,
    proto: Protocol::Hysteria2(Hysteria2 {
      password: auth,
      sni: param(&params, "sni", "").to_string(),
      skip_cert_verify: param(&params, "insecure", "0") == "1",
      extra,
    }),
  })
}

/// Parses one proxy URI. `None` means the scheme is unknown or the link is malformed.
pub fn parse_link(link: &str) -> Option<Node> {
  let s = link.trim();
  if s.starts_with("hysteria2://") || s.starts_with("hy2://") {
    parse_hysteria2(s)
  } else if s.starts_with("trojan://") {
    parse_trojan(s)
  } else if s.starts_with("ss://") {
    parse_ss(s)
  } else if s.starts_with("vless://") {
    parse_vless(s)
  } else if s.starts_with("vmess://") {
    parse_vmess(s)
  } else {
    None
  }
}
