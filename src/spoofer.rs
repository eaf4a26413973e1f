use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::debug;

use crate::engine::EngineContext;
use crate::filter::DnsExchange;

/// 伪造应答的发送端。生产实现为 [`UdpSpoofTransport`]。
pub trait SpoofTransport: Send + Sync {
    /// Best-effort and non-blocking: `packet` goes to `remote`, claiming to come from `local`.
    fn send(&self, packet: Bytes, local: SocketAddrV4, remote: SocketAddrV4);
}

/// 根据查询构造伪造应答：QR=1、RA=1、NOERROR，A 记录 TTL 为 0 以免被下游缓存。
/// `answer` 为 None 时返回空应答。
pub fn build_spoofed_response(query: &Message, answer: Option<Ipv4Addr>) -> anyhow::Result<Bytes> {
    let q = query
        .queries()
        .first()
        .context("query without question")?
        .clone();

    let mut msg = query.clone();
    msg.set_message_type(MessageType::Response);
    msg.set_authoritative(false);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NoError);
    msg.take_answers();
    if let Some(ip) = answer {
        msg.add_answer(Record::from_rdata(q.name().clone(), 0, RData::A(A(ip))));
    }

    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}

/// 构造并交给传输层发送；返回是否已发出
pub fn spoof(ctx: &EngineContext, ex: &DnsExchange, answer: Option<Ipv4Addr>) -> bool {
    match build_spoofed_response(&ex.message, answer) {
        Ok(packet) => {
            // 冒充原目的地址（解析器）回给原查询方
            ctx.transport.send(packet, ex.dst, ex.src);
            true
        }
        Err(err) => {
            debug!(target = "poison", error = %err, "build spoofed response failed");
            false
        }
    }
}

/// 每个伪造应答一个独立任务，整体受拨号超时约束
pub struct UdpSpoofTransport {
    runtime: Handle,
    dial_timeout: Duration,
}

impl UdpSpoofTransport {
    pub fn new(runtime: Handle, dial_timeout: Duration) -> Self {
        Self {
            runtime,
            dial_timeout,
        }
    }
}

impl SpoofTransport for UdpSpoofTransport {
    fn send(&self, packet: Bytes, local: SocketAddrV4, remote: SocketAddrV4) {
        let dial_timeout = self.dial_timeout;
        self.runtime.spawn(async move {
            match timeout(dial_timeout, send_from(&packet, local, remote)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(target = "poison", local = %local, remote = %remote, error = %err, "spoofed response not sent");
                }
                Err(_) => {
                    debug!(target = "poison", local = %local, remote = %remote, "spoofed response timed out");
                }
            }
        });
    }
}

async fn send_from(packet: &[u8], local: SocketAddrV4, remote: SocketAddrV4) -> anyhow::Result<()> {
    let std_socket = bind_spoof_socket(local).with_context(|| format!("bind {local}"))?;
    let socket = UdpSocket::from_std(std_socket).context("from_std")?;
    socket
        .connect(SocketAddr::V4(remote))
        .await
        .with_context(|| format!("connect {remote}"))?;
    socket.send(packet).await.context("send")?;
    Ok(())
}

// 绑定到非本机地址（解析器地址）需要 IP_TRANSPARENT；端口 53 可能已被占用，需要地址/端口复用
fn bind_spoof_socket(local: SocketAddrV4) -> anyhow::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        #[allow(unused_imports)]
        use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
        let val: c_int = 1;
        let fd = socket.as_raw_fd();
        // non-fatal: continue without reuseport
        let _ = unsafe {
            setsockopt(
                fd,
                SOL_SOCKET,
                SO_REUSEPORT,
                &val as *const _ as *const c_void,
                std::mem::size_of_val(&val) as socklen_t,
            )
        };
        #[cfg(target_os = "linux")]
        {
            use libc::{IP_TRANSPARENT, SOL_IP};
            // 需要 CAP_NET_ADMIN；失败时若原目的地址为本机地址仍可绑定
            let _ = unsafe {
                setsockopt(
                    fd,
                    SOL_IP,
                    IP_TRANSPARENT,
                    &val as *const _ as *const c_void,
                    std::mem::size_of_val(&val) as socklen_t,
                )
            };
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(local).into())?;
    Ok(socket.into())
}
