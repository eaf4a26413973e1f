use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

/// 一个本地端口在收到应答后被记录 5 秒
pub const PORT_REUSE_TTL: Duration = Duration::from_secs(5);

// 超过该条目数时在写入前清理过期端口
const PURGE_THRESHOLD: usize = 4096;

/// 本地端口去重缓存，由单个抓包管线独占，无需加锁。
#[derive(Debug, Default)]
pub struct PortCache {
    entries: FxHashMap<u16, Instant>,
}

impl PortCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expired entries are removed on access and treated as absent.
    pub fn exists_at(&mut self, port: u16, now: Instant) -> bool {
        match self.entries.get(&port) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                self.entries.remove(&port);
                false
            }
            None => false,
        }
    }

    pub fn set_at(&mut self, port: u16, ttl: Duration, now: Instant) {
        if self.entries.len() >= PURGE_THRESHOLD {
            self.purge_expired(now);
        }
        self.entries.insert(port, now + ttl);
    }

    /// 返回本次清理的条目数
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
