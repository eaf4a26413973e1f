use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use ipnet::{IpNet, Ipv4Net};
use regex::Regex;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub decoy: DecoySettings,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// 网卡巡检间隔（毫秒），缺省 2000。
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// 抓包读超时（毫秒），保证停止信号能被及时观察到。
    #[serde(default = "default_capture_read_timeout_ms")]
    pub capture_read_timeout_ms: u64,
    /// 伪造响应发送超时（毫秒），缺省 30 秒。
    #[serde(default = "default_spoof_dial_timeout_ms")]
    pub spoof_dial_timeout_ms: u64,
    /// 域名被判定为污染前需要的独立证据数。
    #[serde(default = "default_promote_threshold")]
    pub promote_threshold: u32,
    /// 已确认污染域名的 AAAA 查询返回空应答。
    #[serde(default)]
    pub empty_aaaa_for_blacklisted: bool,
    /// 固定网卡列表；为空则自动探测默认路由网卡。
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// 停止时刷新本地 DNS 缓存的命令；缺省按平台选择。
    #[serde(default)]
    pub flush_command: Option<Vec<String>>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            capture_read_timeout_ms: default_capture_read_timeout_ms(),
            spoof_dial_timeout_ms: default_spoof_dial_timeout_ms(),
            promote_threshold: default_promote_threshold(),
            empty_aaaa_for_blacklisted: false,
            interfaces: Vec::new(),
            flush_command: None,
        }
    }
}

impl GlobalSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn capture_read_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_read_timeout_ms)
    }

    pub fn spoof_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.spoof_dial_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoySettings {
    /// 诱饵地址段，缺省 240.0.0.0/4（保留地址）。
    #[serde(default = "default_decoy_range")]
    pub range: String,
    /// 视为污染证据的应答地址段，诱饵地址段总是包含在内。
    #[serde(default = "default_poisoned_ranges")]
    pub poisoned_ranges: Vec<String>,
}

impl Default for DecoySettings {
    fn default() -> Self {
        Self {
            range: default_decoy_range(),
            poisoned_ranges: default_poisoned_ranges(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistConfig {
    /// 受信任的 DNS 服务器（CIDR 或单个 IP），其流量不做检查。
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default = "default_whitelist_domains")]
    pub domains: Vec<DomainRule>,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            dns_servers: Vec::new(),
            domains: default_whitelist_domains(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainRule {
    /// 完整域名匹配。
    Full { value: String },
    /// 域名及其子域名。
    Domain { value: String },
    /// 正则匹配（Rust 正则语法）。
    Regex { value: String },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BlacklistConfig {
    /// 启动时直接标记为已污染的域名。
    #[serde(default)]
    pub preload: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: EngineConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    validate(&cfg).with_context(|| format!("validate config file: {}", path.display()))?;
    Ok(cfg)
}

/// 提前解析 CIDR 与正则，错误在加载阶段暴露。
pub fn validate(cfg: &EngineConfig) -> Result<()> {
    if cfg.settings.promote_threshold == 0 {
        anyhow::bail!("settings.promote_threshold must be at least 1");
    }
    if cfg.settings.scan_interval_ms == 0 {
        anyhow::bail!("settings.scan_interval_ms must be positive");
    }
    let _range: Ipv4Net = cfg
        .decoy
        .range
        .parse()
        .with_context(|| format!("decoy.range: {}", cfg.decoy.range))?;
    for r in &cfg.decoy.poisoned_ranges {
        let _parsed: Ipv4Net = r.parse().with_context(|| format!("decoy.poisoned_ranges: {r}"))?;
    }
    for s in &cfg.whitelist.dns_servers {
        parse_net(s)?;
    }
    for rule in &cfg.whitelist.domains {
        match rule {
            DomainRule::Full { value } | DomainRule::Domain { value } => {
                if value.trim_end_matches('.').is_empty() {
                    anyhow::bail!("whitelist domain rule has empty value");
                }
            }
            DomainRule::Regex { value } => {
                let _re = Regex::new(value).with_context(|| format!("whitelist regex: {value}"))?;
            }
        }
    }
    Ok(())
}

/// 单个 IP 视为 /32（或 /128）。
pub fn parse_net(s: &str) -> Result<IpNet> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    let ip: std::net::IpAddr = s
        .parse()
        .with_context(|| format!("invalid cidr or ip: {s}"))?;
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    Ok(IpNet::new(ip, prefix)?)
}

fn default_scan_interval_ms() -> u64 {
    2000
}

fn default_capture_read_timeout_ms() -> u64 {
    500
}

fn default_spoof_dial_timeout_ms() -> u64 {
    30_000
}

fn default_promote_threshold() -> u32 {
    3
}

fn default_decoy_range() -> String {
    "240.0.0.0/4".to_string()
}

fn default_poisoned_ranges() -> Vec<String> {
    vec!["0.0.0.0/8".to_string(), "127.0.0.0/8".to_string()]
}

fn default_whitelist_domains() -> Vec<DomainRule> {
    vec![
        DomainRule::Domain {
            value: "github.com".to_string(),
        },
        DomainRule::Domain {
            value: "1password.com".to_string(),
        },
        DomainRule::Regex {
            value: r"^dns\.".to_string(),
        },
        DomainRule::Regex {
            value: r"^doh\.".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_value(json!({})).expect("parse config");
        assert_eq!(cfg.settings.scan_interval(), Duration::from_secs(2));
        assert_eq!(cfg.settings.spoof_dial_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.settings.promote_threshold, 3);
        assert!(!cfg.settings.empty_aaaa_for_blacklisted);
        assert_eq!(cfg.decoy.range, "240.0.0.0/4");
        assert_eq!(cfg.whitelist.domains.len(), 4);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn domain_rules_are_tagged_by_type() {
        let raw = json!({
            "whitelist": {
                "dns_servers": ["119.29.29.29", "223.5.5.0/24"],
                "domains": [
                    { "type": "full", "value": "api.example.com" },
                    { "type": "domain", "value": "github.com" },
                    { "type": "regex", "value": "^doh\\." }
                ]
            }
        });
        let cfg: EngineConfig = serde_json::from_value(raw).expect("parse config");
        assert_eq!(
            cfg.whitelist.domains[1],
            DomainRule::Domain {
                value: "github.com".into()
            }
        );
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn validate_rejects_bad_entries() {
        let raw = json!({ "whitelist": { "dns_servers": ["not-an-ip"] } });
        let cfg: EngineConfig = serde_json::from_value(raw).expect("parse config");
        assert!(validate(&cfg).is_err());

        let raw = json!({ "whitelist": { "domains": [ { "type": "regex", "value": "(" } ] } });
        let cfg: EngineConfig = serde_json::from_value(raw).expect("parse config");
        assert!(validate(&cfg).is_err());

        let raw = json!({ "settings": { "promote_threshold": 0 } });
        let cfg: EngineConfig = serde_json::from_value(raw).expect("parse config");
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn parse_net_accepts_plain_ip() {
        let net = parse_net("8.8.8.8").expect("plain ip");
        assert_eq!(net.prefix_len(), 32);
        assert!(net.contains(&"8.8.8.8".parse::<std::net::IpAddr>().unwrap()));
    }
}
