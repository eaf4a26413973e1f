use std::net::IpAddr;

use anyhow::Context;
use ipnet::IpNet;
use regex::Regex;
use rustc_hash::FxHashSet;

use crate::blacklist::normalize_domain;
use crate::config::{self, DomainRule, WhitelistConfig};

/// 白名单快照：每次重建后整体替换，抓包线程只读。
#[derive(Debug, Clone, Default)]
pub struct WhitelistSet {
    pub dns_servers: IpMatcher,
    pub domains: DomainMatcher,
}

impl WhitelistSet {
    pub fn from_config(cfg: &WhitelistConfig) -> anyhow::Result<Self> {
        let mut nets = Vec::with_capacity(cfg.dns_servers.len());
        for s in &cfg.dns_servers {
            nets.push(config::parse_net(s)?);
        }

        let mut domains = DomainMatcher::default();
        for rule in &cfg.domains {
            domains.push(rule)?;
        }

        Ok(Self {
            dns_servers: IpMatcher { nets },
            domains,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
    nets: Vec<IpNet>,
}

impl IpMatcher {
    #[inline]
    pub fn matches(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }
}

#[derive(Debug, Clone)]
pub enum RuntimeDomainMatcher {
    /// 域名本身或其任意子域名
    Suffix { value: String },
    Regex { regex: Regex },
}

impl RuntimeDomainMatcher {
    #[inline]
    pub fn matches(&self, qname: &str) -> bool {
        match self {
            RuntimeDomainMatcher::Suffix { value } => is_subdomain_of(qname, value),
            RuntimeDomainMatcher::Regex { regex } => regex.is_match(qname),
        }
    }
}

/// Full-name rules go into a hash set; suffix and regex rules are scanned in order.
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    full: FxHashSet<String>,
    rules: Vec<RuntimeDomainMatcher>,
}

impl DomainMatcher {
    fn push(&mut self, rule: &DomainRule) -> anyhow::Result<()> {
        match rule {
            DomainRule::Full { value } => {
                self.full.insert(normalize_domain(value));
            }
            DomainRule::Domain { value } => self.rules.push(RuntimeDomainMatcher::Suffix {
                value: normalize_domain(value),
            }),
            DomainRule::Regex { value } => self.rules.push(RuntimeDomainMatcher::Regex {
                regex: Regex::new(value).with_context(|| format!("compile regex {value}"))?,
            }),
        }
        Ok(())
    }

    /// `qname` 须已归一化（小写、无结尾点）。
    pub fn matches(&self, qname: &str) -> bool {
        if qname.is_empty() {
            return false;
        }
        self.full.contains(qname) || self.rules.iter().any(|m| m.matches(qname))
    }

    pub fn len(&self) -> usize {
        self.full.len() + self.rules.len()
    }
}

#[inline]
fn is_subdomain_of(qname: &str, suffix: &str) -> bool {
    if qname.len() == suffix.len() {
        return qname == suffix;
    }
    qname.len() > suffix.len()
        && qname.ends_with(suffix)
        && qname.as_bytes()[qname.len() - suffix.len() - 1] == b'.'
}
