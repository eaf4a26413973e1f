use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::udp::MutableUdpPacket;

pub fn query_message(id: u16, name: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
    msg
}

pub fn query_bytes(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    query_message(id, name, qtype).to_vec().unwrap()
}

/// 构造应答：`cnames` 依次串联，最后一个名字带 A 记录
pub fn response_message(id: u16, name: &str, cnames: &[&str], ips: &[Ipv4Addr]) -> Message {
    let mut msg = query_message(id, name, RecordType::A);
    msg.set_message_type(MessageType::Response);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NoError);

    let mut owner = Name::from_str(name).unwrap();
    for c in cnames {
        let target = Name::from_str(c).unwrap();
        msg.add_answer(Record::from_rdata(owner.clone(), 60, RData::CNAME(CNAME(target.clone()))));
        owner = target;
    }
    for ip in ips {
        msg.add_answer(Record::from_rdata(owner.clone(), 60, RData::A(A(*ip))));
    }
    msg
}

pub fn a_response(id: u16, name: &str, ips: &[Ipv4Addr]) -> Vec<u8> {
    response_message(id, name, &[], ips).to_vec().unwrap()
}

pub fn build_raw_ipv4(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let ip_len = 20 + udp_len;
    let mut buf = vec![0u8; ip_len];
    {
        let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(ip_len as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(*src.ip());
        ip.set_destination(*dst.ip());
    }
    {
        let mut udp = MutableUdpPacket::new(&mut buf[20..]).unwrap();
        udp.set_source(src.port());
        udp.set_destination(dst.port());
        udp.set_length(udp_len as u16);
        udp.set_payload(payload);
    }
    buf
}

pub fn build_udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let ip = build_raw_ipv4(src, dst, payload);
    let mut buf = vec![0u8; 14 + ip.len()];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
        eth.set_ethertype(EtherTypes::Ipv4);
    }
    buf[14..].copy_from_slice(&ip);
    buf
}
