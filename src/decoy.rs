use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;

use anyhow::Context;
use ipnet::Ipv4Net;
use rustc_hash::FxHasher;

use crate::blacklist::normalize_domain;
use crate::config::DecoySettings;

/// 诱饵地址池：域名 -> 保留地址段内的确定性地址，无内部状态。
#[derive(Debug, Clone)]
pub struct DecoyPool {
    range: Ipv4Net,
    poisoned: Vec<Ipv4Net>,
}

impl DecoyPool {
    pub fn new(range: Ipv4Net, poisoned: Vec<Ipv4Net>) -> Self {
        Self {
            range: range.trunc(),
            poisoned,
        }
    }

    pub fn from_settings(settings: &DecoySettings) -> anyhow::Result<Self> {
        let range: Ipv4Net = settings
            .range
            .parse()
            .with_context(|| format!("parse decoy range {}", settings.range))?;
        let mut poisoned = Vec::with_capacity(settings.poisoned_ranges.len());
        for r in &settings.poisoned_ranges {
            poisoned.push(
                r.parse::<Ipv4Net>()
                    .with_context(|| format!("parse poisoned range {r}"))?,
            );
        }
        Ok(Self::new(range, poisoned))
    }

    pub fn range(&self) -> Ipv4Net {
        self.range
    }

    /// Same name (case and trailing dot ignored) always yields the same address.
    pub fn lookup(&self, domain: &str) -> Ipv4Addr {
        let name = normalize_domain(domain);
        let mut h = FxHasher::default();
        name.hash(&mut h);
        let hash = h.finish();

        let base = u32::from(self.range.network()) as u64;
        let size = 1u64 << (32 - self.range.prefix_len());
        if size <= 2 {
            return self.range.network();
        }
        // 跳过网络地址与广播地址
        let offset = 1 + hash % (size - 2);
        Ipv4Addr::from((base + offset) as u32)
    }

    #[inline]
    pub fn is_decoy(&self, ip: Ipv4Addr) -> bool {
        self.range.contains(&ip)
    }

    /// 应答中出现该地址即视为被污染的证据
    #[inline]
    pub fn is_poisoned(&self, ip: Ipv4Addr) -> bool {
        self.is_decoy(ip) || self.poisoned.iter().any(|net| net.contains(&ip))
    }
}
