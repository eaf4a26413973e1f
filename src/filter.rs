use std::net::{IpAddr, SocketAddrV4};
use std::time::Instant;

use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::RecordType;
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;

use crate::blacklist::normalize_domain;
use crate::matcher::IpMatcher;
use crate::port_cache::{PORT_REUSE_TTL, PortCache};

pub const DNS_PORT: u16 = 53;

/// 网卡链路层类型：以太网帧或无二层头的裸 IP（tun/ppp 等点对点接口）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    RawIp,
}

/// 通过过滤的一次 DNS 交互：解码后的报文与四元组。
#[derive(Debug, Clone)]
pub struct DnsExchange {
    pub message: Message,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl DnsExchange {
    pub fn query(&self) -> Option<&Query> {
        self.message.queries().first()
    }

    pub fn is_response(&self) -> bool {
        self.message.message_type() == MessageType::Response
    }

    /// 归一化后的查询域名
    pub fn qname(&self) -> String {
        self.query()
            .map(|q| normalize_domain(&q.name().to_ascii()))
            .unwrap_or_default()
    }
}

/// 从原始帧中筛选出需要检查的 DNS 报文，不符合条件时返回 None。
///
/// Rules, in order: UDP over IPv4 only; one side on port 53; neither side a
/// whitelisted resolver; decodable DNS; first question A/AAAA with a dotted name;
/// responses to a local port already handled within the reuse window are dropped.
pub fn packet_filter(
    frame: &[u8],
    link: LinkKind,
    whitelist_dns: &IpMatcher,
    port_cache: &mut PortCache,
    now: Instant,
) -> Option<DnsExchange> {
    let ip_bytes = match link {
        LinkKind::Ethernet => ipv4_payload_of_ethernet(frame)?,
        LinkKind::RawIp => frame,
    };
    let ipv4 = Ipv4Packet::new(ip_bytes)?;
    if ipv4.get_version() != 4 || ipv4.get_header_length() < 5 {
        return None;
    }
    // 非首片分片不含 UDP 头
    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp
        || ipv4.get_fragment_offset() != 0
    {
        return None;
    }
    let udp = UdpPacket::new(ipv4.payload())?;
    let (sport, dport) = (udp.get_source(), udp.get_destination());
    if sport != DNS_PORT && dport != DNS_PORT {
        return None;
    }

    let (saddr, daddr) = (ipv4.get_source(), ipv4.get_destination());
    if whitelist_dns.matches(IpAddr::V4(saddr)) || whitelist_dns.matches(IpAddr::V4(daddr)) {
        return None;
    }

    let message = Message::from_vec(udp.payload()).ok()?;

    let query = message.queries().first()?;
    if !matches!(query.query_type(), RecordType::A | RecordType::AAAA) {
        return None;
    }
    if !normalize_domain(&query.name().to_ascii()).contains('.') {
        return None;
    }

    // 跳过已处理过 DNS 响应的本地端口，避免重复处理重传
    if message.message_type() == MessageType::Response && dport != DNS_PORT {
        if port_cache.exists_at(dport, now) {
            return None;
        }
        port_cache.set_at(dport, PORT_REUSE_TTL, now);
    }

    Some(DnsExchange {
        message,
        src: SocketAddrV4::new(saddr, sport),
        dst: SocketAddrV4::new(daddr, dport),
    })
}

fn ipv4_payload_of_ethernet(frame: &[u8]) -> Option<&[u8]> {
    let eth = EthernetPacket::new(frame)?;
    let mut offset = EthernetPacket::minimum_packet_size();
    let mut ethertype = eth.get_ethertype();
    // 仅剥离一层 802.1Q 标签
    if ethertype == EtherTypes::Vlan {
        let vlan = VlanPacket::new(frame.get(offset..)?)?;
        ethertype = vlan.get_ethertype();
        offset += VlanPacket::minimum_packet_size();
    }
    if ethertype != EtherTypes::Ipv4 {
        return None;
    }
    frame.get(offset..)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::WhitelistSet;
    use crate::test_support::{a_response, build_raw_ipv4, build_udp_frame, query_bytes};
    use pnet::packet::ethernet::{EtherType, MutableEthernetPacket};
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::packet::vlan::MutableVlanPacket;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn client() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 40000)
    }

    fn resolver() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53)
    }

    fn no_whitelist() -> IpMatcher {
        WhitelistSet::default().dns_servers
    }

    #[test]
    fn non_dns_ports_are_dropped() {
        let mut cache = PortCache::new();
        let payload = query_bytes(1, "example.com", RecordType::A);
        for (sport, dport) in [(40000, 5353), (443, 40000), (54, 52), (0, 0)] {
            let frame = build_udp_frame(
                SocketAddrV4::new(*client().ip(), sport),
                SocketAddrV4::new(*resolver().ip(), dport),
                &payload,
            );
            assert!(
                packet_filter(&frame, LinkKind::Ethernet, &no_whitelist(), &mut cache, Instant::now())
                    .is_none()
            );
        }
    }

    #[test]
    fn query_passes_and_carries_endpoints() {
        let mut cache = PortCache::new();
        let frame = build_udp_frame(client(), resolver(), &query_bytes(7, "Example.com.", RecordType::A));
        let ex = packet_filter(&frame, LinkKind::Ethernet, &no_whitelist(), &mut cache, Instant::now())
            .expect("query should pass");
        assert!(!ex.is_response());
        assert_eq!(ex.src, client());
        assert_eq!(ex.dst, resolver());
        assert_eq!(ex.qname(), "example.com");
        assert_eq!(ex.message.id(), 7);
    }

    #[test]
    fn raw_ip_link_is_supported() {
        let mut cache = PortCache::new();
        let frame = build_raw_ipv4(client(), resolver(), &query_bytes(1, "example.com", RecordType::AAAA));
        assert!(
            packet_filter(&frame, LinkKind::RawIp, &no_whitelist(), &mut cache, Instant::now()).is_some()
        );
        // 以太网解析同一段字节应失败
        assert!(
            packet_filter(&frame, LinkKind::Ethernet, &no_whitelist(), &mut cache, Instant::now()).is_none()
        );
    }

    #[test]
    fn whitelisted_resolvers_are_never_inspected() {
        let cfg: crate::config::WhitelistConfig =
            serde_json::from_value(serde_json::json!({ "dns_servers": ["8.8.8.0/24"] })).unwrap();
        let wl = WhitelistSet::from_config(&cfg).unwrap();
        let mut cache = PortCache::new();

        let q = build_udp_frame(client(), resolver(), &query_bytes(1, "example.com", RecordType::A));
        assert!(packet_filter(&q, LinkKind::Ethernet, &wl.dns_servers, &mut cache, Instant::now()).is_none());

        let r = build_udp_frame(
            resolver(),
            client(),
            &a_response(1, "example.com", &[Ipv4Addr::new(1, 2, 3, 4)]),
        );
        assert!(packet_filter(&r, LinkKind::Ethernet, &wl.dns_servers, &mut cache, Instant::now()).is_none());
    }

    #[test]
    fn garbage_and_out_of_scope_questions_are_dropped() {
        let mut cache = PortCache::new();
        let now = Instant::now();

        let garbage = build_udp_frame(client(), resolver(), &[0xde, 0xad, 0xbe, 0xef]);
        assert!(packet_filter(&garbage, LinkKind::Ethernet, &no_whitelist(), &mut cache, now).is_none());

        let mx = build_udp_frame(client(), resolver(), &query_bytes(1, "example.com", RecordType::MX));
        assert!(packet_filter(&mx, LinkKind::Ethernet, &no_whitelist(), &mut cache, now).is_none());

        // 裸顶级域名探测
        let tld = build_udp_frame(client(), resolver(), &query_bytes(1, "localdomain.", RecordType::A));
        assert!(packet_filter(&tld, LinkKind::Ethernet, &no_whitelist(), &mut cache, now).is_none());
    }

    #[test]
    fn repeated_response_on_same_local_port_is_dropped_within_window() {
        let mut cache = PortCache::new();
        let t = Instant::now();
        let payload = a_response(9, "example.com", &[Ipv4Addr::new(1, 2, 3, 4)]);
        let frame = build_udp_frame(resolver(), client(), &payload);

        assert!(packet_filter(&frame, LinkKind::Ethernet, &no_whitelist(), &mut cache, t).is_some());
        assert!(
            packet_filter(&frame, LinkKind::Ethernet, &no_whitelist(), &mut cache, t + Duration::from_millis(4900))
                .is_none()
        );
        assert!(
            packet_filter(&frame, LinkKind::Ethernet, &no_whitelist(), &mut cache, t + Duration::from_millis(5100))
                .is_some()
        );

        // 查询方向不受端口缓存影响
        let q = build_udp_frame(client(), resolver(), &query_bytes(9, "example.com", RecordType::A));
        assert!(packet_filter(&q, LinkKind::Ethernet, &no_whitelist(), &mut cache, t).is_some());
        assert!(packet_filter(&q, LinkKind::Ethernet, &no_whitelist(), &mut cache, t).is_some());
    }

    fn ethernet_frame(ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; EthernetPacket::minimum_packet_size() + payload.len()];
        let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
        eth.set_ethertype(ethertype);
        eth.set_payload(payload);
        buf
    }

    fn rewrite_ipv4(ip: &mut [u8], edit: impl FnOnce(&mut MutableIpv4Packet)) {
        let mut pkt = MutableIpv4Packet::new(ip).unwrap();
        edit(&mut pkt);
    }

    #[test]
    fn tcp_on_port_53_is_dropped() {
        let mut cache = PortCache::new();
        // 同样的端口与载荷，仅协议号改为 TCP
        let mut ip = build_raw_ipv4(client(), resolver(), &query_bytes(1, "example.com", RecordType::A));
        rewrite_ipv4(&mut ip, |p| p.set_next_level_protocol(IpNextHeaderProtocols::Tcp));
        assert!(packet_filter(&ip, LinkKind::RawIp, &no_whitelist(), &mut cache, Instant::now()).is_none());

        let mut ip = build_raw_ipv4(
            resolver(),
            client(),
            &a_response(1, "example.com", &[Ipv4Addr::new(127, 0, 0, 1)]),
        );
        rewrite_ipv4(&mut ip, |p| p.set_next_level_protocol(IpNextHeaderProtocols::Tcp));
        let frame = ethernet_frame(EtherTypes::Ipv4, &ip);
        assert!(packet_filter(&frame, LinkKind::Ethernet, &no_whitelist(), &mut cache, Instant::now()).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn non_ipv4_ethertypes_are_dropped() {
        let mut cache = PortCache::new();
        let ip = build_raw_ipv4(client(), resolver(), &query_bytes(1, "example.com", RecordType::A));
        for ethertype in [EtherTypes::Ipv6, EtherTypes::Arp] {
            let frame = ethernet_frame(ethertype, &ip);
            assert!(
                packet_filter(&frame, LinkKind::Ethernet, &no_whitelist(), &mut cache, Instant::now()).is_none(),
                "{ethertype} should be dropped"
            );
        }
        // 同样的字节以 IPv4 类型封装则通过
        let frame = ethernet_frame(EtherTypes::Ipv4, &ip);
        assert!(packet_filter(&frame, LinkKind::Ethernet, &no_whitelist(), &mut cache, Instant::now()).is_some());
    }

    #[test]
    fn non_first_fragment_is_dropped() {
        let mut cache = PortCache::new();
        let mut ip = build_raw_ipv4(client(), resolver(), &query_bytes(1, "example.com", RecordType::A));
        rewrite_ipv4(&mut ip, |p| p.set_fragment_offset(185));
        assert!(packet_filter(&ip, LinkKind::RawIp, &no_whitelist(), &mut cache, Instant::now()).is_none());

        // 首片（偏移为 0）仍按普通报文处理
        let mut ip = build_raw_ipv4(client(), resolver(), &query_bytes(1, "example.com", RecordType::A));
        rewrite_ipv4(&mut ip, |p| p.set_fragment_offset(0));
        assert!(packet_filter(&ip, LinkKind::RawIp, &no_whitelist(), &mut cache, Instant::now()).is_some());
    }

    #[test]
    fn vlan_tagged_frame_is_unwrapped() {
        let mut cache = PortCache::new();
        let ip = build_raw_ipv4(client(), resolver(), &query_bytes(3, "example.com", RecordType::A));

        let tagged = |inner: EtherType| {
            let mut tag = vec![0u8; VlanPacket::minimum_packet_size() + ip.len()];
            let mut vlan = MutableVlanPacket::new(&mut tag).unwrap();
            vlan.set_vlan_identifier(100);
            vlan.set_ethertype(inner);
            vlan.set_payload(&ip);
            ethernet_frame(EtherTypes::Vlan, &tag)
        };

        let ex = packet_filter(&tagged(EtherTypes::Ipv4), LinkKind::Ethernet, &no_whitelist(), &mut cache, Instant::now())
            .expect("tagged query should pass");
        assert_eq!(ex.message.id(), 3);
        assert_eq!(ex.src, client());
        assert_eq!(ex.dst, resolver());

        assert!(
            packet_filter(&tagged(EtherTypes::Ipv6), LinkKind::Ethernet, &no_whitelist(), &mut cache, Instant::now())
                .is_none()
        );

        // 标签被截断
        let truncated = ethernet_frame(EtherTypes::Vlan, &[0x00, 0x64]);
        assert!(packet_filter(&truncated, LinkKind::Ethernet, &no_whitelist(), &mut cache, Instant::now()).is_none());
    }
}
