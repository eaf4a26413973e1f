use std::time::Duration;

use dashmap::DashMap;
use moka::sync::Cache;
use rustc_hash::FxBuildHasher;

/// 归一化域名：去掉结尾的点并转小写
#[inline]
pub fn normalize_domain(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// 一次独立观察的标识：同一事务 ID + 本地端口只计一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObservationKey {
    pub txid: u16,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainEntry {
    pub confidence: u32,
    /// 已收到过污染证据
    pub observed: bool,
    /// 已确认污染，查询路径开始伪造应答；终态
    pub active: bool,
}

/// 域名置信度黑名单：unknown -> observed -> active。
///
/// Shared by every capture pipeline; all operations are internally synchronized.
pub struct DomainBlacklist {
    entries: DashMap<String, DomainEntry, FxBuildHasher>,
    // 最近的观察，用于去重
    recent: Cache<(String, ObservationKey), ()>,
    threshold: u32,
}

impl DomainBlacklist {
    pub fn new(threshold: u32) -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher::default()),
            recent: Cache::builder()
                .max_capacity(65_536)
                .time_to_live(Duration::from_secs(60))
                .build(),
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// 预置为 active 的域名（未计入 observed）。
    pub fn preload<I, S>(&self, domains: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut n = 0;
        for d in domains {
            let name = normalize_domain(d.as_ref());
            if name.is_empty() {
                continue;
            }
            let mut entry = self.entries.entry(name).or_default();
            entry.active = true;
            entry.confidence = entry.confidence.max(self.threshold);
            n += 1;
        }
        n
    }

    /// Membership in the observation set.
    pub fn is_observed(&self, domain: &str) -> bool {
        self.entries
            .get(&normalize_domain(domain))
            .is_some_and(|e| e.observed)
    }

    pub fn is_active(&self, domain: &str) -> bool {
        self.entries
            .get(&normalize_domain(domain))
            .is_some_and(|e| e.active)
    }

    #[cfg(test)]
    pub fn entry(&self, domain: &str) -> Option<DomainEntry> {
        self.entries.get(&normalize_domain(domain)).map(|e| *e)
    }

    /// 记录一次污染证据。仅当本次调用使域名越过阈值时返回 true。
    /// A repeated `key` for the same domain is ignored.
    pub fn accumulate(&self, domain: &str, key: ObservationKey) -> bool {
        let name = normalize_domain(domain);
        if name.is_empty() {
            return false;
        }
        let fresh = self.recent.entry((name.clone(), key)).or_insert(()).is_fresh();

        let mut entry = self.entries.entry(name).or_default();
        entry.observed = true;
        if !fresh || entry.active {
            return false;
        }
        entry.confidence = entry.confidence.saturating_add(1);
        if entry.confidence >= self.threshold {
            entry.active = true;
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }
}
