//! VLESS/VMess configuration model and URI codec.
//!
//! Only the fields the pipeline consumes are modeled. Key material is
//! opaque: the UUID is carried as bytes for the tunnel header, the REALITY
//! public key as an untouched string. IPv6 endpoints are rejected here; the
//! probe path is IPv4-only.

use std::net::Ipv4Addr;

use base64::Engine;
use uuid::Uuid;

use crate::core::types::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Vless,
    Vmess,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Vless => write!(f, "vless"),
            Protocol::Vmess => write!(f, "vmess"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Ws,
    Xhttp,
    Grpc,
    /// h2 / "http" transport.
    H2,
}

impl Transport {
    pub fn parse(s: &str) -> Self {
        match s {
            "ws" | "websocket" => Transport::Ws,
            "xhttp" | "splithttp" => Transport::Xhttp,
            "grpc" | "gun" => Transport::Grpc,
            "h2" | "http" => Transport::H2,
            _ => Transport::Tcp,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws => "ws",
            Transport::Xhttp => "xhttp",
            Transport::Grpc => "grpc",
            Transport::H2 => "h2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn parse(s: &str) -> Self {
        match s {
            "tls" => Security::Tls,
            "reality" => Security::Reality,
            _ => Security::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }
}

/// One proxy configuration, as consumed by the pipeline.
///
/// Under REALITY the SNI is cryptographically bound to `public_key`; the
/// orchestrator must never rotate it. Under `Security::None` the SNI is
/// semantically meaningless.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedConfig {
    pub protocol: Protocol,
    pub uuid: Uuid,
    pub address: String,
    pub port: u16,
    pub transport: Transport,
    pub security: Security,
    pub sni: String,
    pub host: String,
    pub path: String,
    pub flow: String,
    pub fingerprint: String,
    pub alpn: String,
    pub service_name: String,
    pub mode: String,
    // REALITY extras
    pub public_key: String,
    pub short_id: String,
    pub spider_x: String,
    // VMess extras
    pub alter_id: u32,
    pub cipher: String,
    pub name: String,
}

impl ParsedConfig {
    fn empty(protocol: Protocol) -> Self {
        Self {
            protocol,
            uuid: Uuid::nil(),
            address: String::new(),
            port: 443,
            transport: Transport::Tcp,
            security: Security::None,
            sni: String::new(),
            host: String::new(),
            path: String::new(),
            flow: String::new(),
            fingerprint: String::new(),
            alpn: String::new(),
            service_name: String::new(),
            mode: String::new(),
            public_key: String::new(),
            short_id: String::new(),
            spider_x: String::new(),
            alter_id: 0,
            cipher: String::new(),
            name: String::new(),
        }
    }

    /// Parse a `vless://` or `vmess://` URI.
    pub fn parse(uri: &str) -> Result<Self, ErrorKind> {
        let uri = uri.trim();
        if uri.starts_with("vless://") {
            Self::parse_vless(uri)
        } else if uri.starts_with("vmess://") {
            Self::parse_vmess(uri)
        } else {
            Err(ErrorKind::ConfigParse("unknown scheme".to_string()))
        }
    }

    fn parse_vless(uri: &str) -> Result<Self, ErrorKind> {
        let url = url::Url::parse(uri)
            .map_err(|e| ErrorKind::ConfigParse(format!("vless uri: {}", e)))?;

        let address = match url.host() {
            Some(url::Host::Domain(d)) => d.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(_)) => {
                return Err(ErrorKind::ConfigParse("ipv6 endpoint".to_string()))
            }
            None => return Err(ErrorKind::ConfigParse("missing address".to_string())),
        };
        let uuid = Uuid::parse_str(url.username())
            .map_err(|_| ErrorKind::ConfigParse("bad uuid".to_string()))?;

        let mut cfg = Self::empty(Protocol::Vless);
        cfg.uuid = uuid;
        cfg.address = address;
        cfg.port = url.port().unwrap_or(443);
        for (key, value) in url.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                "type" => cfg.transport = Transport::parse(&value),
                "security" => cfg.security = Security::parse(&value),
                "sni" => cfg.sni = value,
                "host" => cfg.host = value,
                "path" => cfg.path = value,
                "flow" => cfg.flow = value,
                "fp" => cfg.fingerprint = value,
                "alpn" => cfg.alpn = value,
                "serviceName" => cfg.service_name = value,
                "mode" => cfg.mode = value,
                "pbk" => cfg.public_key = value,
                "sid" => cfg.short_id = value,
                "spx" => cfg.spider_x = value,
                _ => {}
            }
        }
        if let Some(fragment) = url.fragment() {
            cfg.name = percent_decode(fragment);
        }
        if cfg.security == Security::Reality && cfg.sni.is_empty() {
            return Err(ErrorKind::ConfigParse("reality without sni".to_string()));
        }
        Ok(cfg)
    }

    fn parse_vmess(uri: &str) -> Result<Self, ErrorKind> {
        let b64 = uri.trim_start_matches("vmess://");
        let b64 = b64.split('#').next().unwrap_or(b64);
        let raw = decode_base64_lenient(b64)
            .ok_or_else(|| ErrorKind::ConfigParse("vmess base64".to_string()))?;
        let obj: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|_| ErrorKind::ConfigParse("vmess json".to_string()))?;

        let address = obj
            .get("add")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if address.is_empty() {
            return Err(ErrorKind::ConfigParse("vmess missing address".to_string()));
        }
        if address.contains(':') {
            return Err(ErrorKind::ConfigParse("ipv6 endpoint".to_string()));
        }
        let uuid_str = obj.get("id").and_then(|v| v.as_str()).unwrap_or("");
        let uuid = Uuid::parse_str(uuid_str)
            .map_err(|_| ErrorKind::ConfigParse("bad uuid".to_string()))?;

        let mut cfg = Self::empty(Protocol::Vmess);
        cfg.uuid = uuid;
        cfg.address = address;
        cfg.port = json_u16(&obj, "port").unwrap_or(443);
        cfg.alter_id = json_u32(&obj, "aid").unwrap_or(0);
        cfg.cipher = json_str(&obj, "scy").unwrap_or_else(|| "auto".to_string());
        cfg.transport = Transport::parse(&json_str(&obj, "net").unwrap_or_default());
        cfg.security = if json_str(&obj, "tls").as_deref() == Some("tls") {
            Security::Tls
        } else {
            Security::None
        };
        cfg.sni = json_str(&obj, "sni").unwrap_or_default();
        cfg.host = json_str(&obj, "host").unwrap_or_default();
        cfg.path = json_str(&obj, "path").unwrap_or_default();
        cfg.alpn = json_str(&obj, "alpn").unwrap_or_default();
        cfg.fingerprint = json_str(&obj, "fp").unwrap_or_default();
        cfg.name = json_str(&obj, "ps").unwrap_or_default();
        Ok(cfg)
    }

    /// The SNI a base test should use when none was rotated in: explicit
    /// SNI first, then the Host header domain, then the address itself.
    pub fn infer_sni(&self) -> String {
        if !self.sni.is_empty() {
            self.sni.clone()
        } else if !self.host.is_empty() {
            self.host.clone()
        } else {
            self.address.clone()
        }
    }

    /// Whether the address is already a literal IPv4.
    pub fn address_ip(&self) -> Option<Ipv4Addr> {
        self.address.parse().ok()
    }

    /// Re-emit the configuration as a shareable URI.
    pub fn to_uri(&self) -> String {
        match self.protocol {
            Protocol::Vless => self.to_vless_uri(),
            Protocol::Vmess => self.to_vmess_uri(),
        }
    }

    fn to_vless_uri(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("encryption", "none");
        query.append_pair("security", self.security.as_str());
        query.append_pair("type", self.transport.as_str());
        if !self.sni.is_empty() {
            query.append_pair("sni", &self.sni);
        }
        if !self.host.is_empty() {
            query.append_pair("host", &self.host);
        }
        if !self.path.is_empty() {
            query.append_pair("path", &self.path);
        }
        if !self.flow.is_empty() {
            query.append_pair("flow", &self.flow);
        }
        if !self.fingerprint.is_empty() {
            query.append_pair("fp", &self.fingerprint);
        }
        if !self.alpn.is_empty() {
            query.append_pair("alpn", &self.alpn);
        }
        if !self.service_name.is_empty() {
            query.append_pair("serviceName", &self.service_name);
        }
        if !self.mode.is_empty() {
            query.append_pair("mode", &self.mode);
        }
        if !self.public_key.is_empty() {
            query.append_pair("pbk", &self.public_key);
        }
        if !self.short_id.is_empty() {
            query.append_pair("sid", &self.short_id);
        }
        if !self.spider_x.is_empty() {
            query.append_pair("spx", &self.spider_x);
        }
        let name = if self.name.is_empty() {
            String::new()
        } else {
            format!("#{}", percent_encode(&self.name))
        };
        format!(
            "vless://{}@{}:{}?{}{}",
            self.uuid,
            self.address,
            self.port,
            query.finish(),
            name
        )
    }

    fn to_vmess_uri(&self) -> String {
        let obj = serde_json::json!({
            "v": "2",
            "ps": self.name,
            "add": self.address,
            "port": self.port.to_string(),
            "id": self.uuid.to_string(),
            "aid": self.alter_id.to_string(),
            "scy": self.cipher,
            "net": self.transport.as_str(),
            "type": "none",
            "host": self.host,
            "path": self.path,
            "tls": if self.security == Security::Tls { "tls" } else { "" },
            "sni": self.sni,
            "alpn": self.alpn,
            "fp": self.fingerprint,
        });
        format!(
            "vmess://{}",
            base64::engine::general_purpose::STANDARD.encode(obj.to_string())
        )
    }
}

fn json_str(obj: &serde_json::Value, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn json_u16(obj: &serde_json::Value, key: &str) -> Option<u16> {
    json_str(obj, key).and_then(|s| s.parse().ok())
}

fn json_u32(obj: &serde_json::Value, key: &str) -> Option<u32> {
    json_str(obj, key).and_then(|s| s.parse().ok())
}

fn decode_base64_lenient(b64: &str) -> Option<Vec<u8>> {
    let padded = format!("{}{}", b64, "=".repeat((4 - b64.len() % 4) % 4));
    base64::engine::general_purpose::STANDARD
        .decode(&padded)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(&padded))
        .ok()
}

fn percent_decode(s: &str) -> String {
    url::form_urlencoded::parse(format!("x={}", s.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| s.to_string())
}

fn percent_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
