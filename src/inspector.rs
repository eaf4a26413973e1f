use std::net::Ipv4Addr;

use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, RData, RecordType};

use crate::blacklist::{DomainBlacklist, ObservationKey, normalize_domain};
use crate::decoy::DecoyPool;
use crate::engine::EngineContext;
use crate::filter::DnsExchange;
use crate::matcher::DomainMatcher;
use crate::spoofer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// 首次发现污染证据
    Propose,
    /// 越过阈值，开始对该域名伪造应答
    AddBlacklist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    pub domain: String,
    pub result: HandleResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseVerdict {
    pub events: Vec<DomainEvent>,
    /// 形如 `[CNAME:a.example.com, A:1.2.3.4]`
    pub evidence: String,
}

/// 检查出站查询。返回使用的诱饵地址；`0.0.0.0` 表示放行。
///
/// Only A queries for domains already active in the blacklist are answered.
pub fn inspect_query(ctx: &EngineContext, ex: &DnsExchange, whitelist: &DomainMatcher) -> Ipv4Addr {
    let Some(q) = ex.query() else {
        return Ipv4Addr::UNSPECIFIED;
    };
    if q.query_class() != DNSClass::IN || !matches!(q.query_type(), RecordType::A | RecordType::AAAA) {
        return Ipv4Addr::UNSPECIFIED;
    }
    let name = normalize_domain(&q.name().to_ascii());
    if name.is_empty() || whitelist.matches(&name) || !name.contains('.') {
        return Ipv4Addr::UNSPECIFIED;
    }

    match q.query_type() {
        RecordType::A => {
            if !ctx.blacklist.is_active(&name) {
                return Ipv4Addr::UNSPECIFIED;
            }
            let decoy = ctx.decoy.lookup(&name);
            if spoofer::spoof(ctx, ex, Some(decoy)) {
                decoy
            } else {
                Ipv4Addr::UNSPECIFIED
            }
        }
        RecordType::AAAA => {
            if ctx.settings.empty_aaaa_for_blacklisted && ctx.blacklist.is_active(&name) {
                spoofer::spoof(ctx, ex, None);
            }
            Ipv4Addr::UNSPECIFIED
        }
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

/// 检查入站应答，判断是否被污染。应答中没有 A 记录时返回 None：
/// 空应答既不能证明污染也不能证明正常。
pub fn inspect_response(
    blacklist: &DomainBlacklist,
    decoy: &DecoyPool,
    message: &Message,
    key: ObservationKey,
) -> Option<ResponseVerdict> {
    let q = message.queries().first()?;
    let mut domains = vec![normalize_domain(&q.name().to_ascii())];
    let mut msgs = Vec::new();
    let mut spoofed = false;
    let mut has_address = false;

    // CNAME 链上的名字与原查询等价
    for record in message.answers() {
        match record.data() {
            Some(RData::CNAME(cname)) => {
                let target = normalize_domain(&cname.0.to_ascii());
                msgs.push(format!("CNAME:{target}"));
                if !target.is_empty() && !domains.contains(&target) {
                    domains.push(target);
                }
            }
            Some(RData::A(a)) => {
                msgs.push(format!("A:{}", a.0));
                if decoy.is_poisoned(a.0) {
                    spoofed = true;
                }
                has_address = true;
            }
            _ => {}
        }
    }
    if !has_address {
        return None;
    }

    let mut events = Vec::new();
    if spoofed {
        for d in domains {
            if !blacklist.is_observed(&d) {
                events.push(DomainEvent {
                    domain: d.clone(),
                    result: HandleResult::Propose,
                });
            }
            if blacklist.accumulate(&d, key) {
                events.push(DomainEvent {
                    domain: d,
                    result: HandleResult::AddBlacklist,
                });
            }
        }
    }

    Some(ResponseVerdict {
        events,
        evidence: format!("[{}]", msgs.join(", ")),
    })
}
