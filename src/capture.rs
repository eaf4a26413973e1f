use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, NetworkInterface};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::blacklist::ObservationKey;
use crate::engine::EngineContext;
use crate::filter::{LinkKind, packet_filter};
use crate::inspector::{HandleResult, ResponseVerdict, inspect_query, inspect_response};
use crate::interfaces;
use crate::port_cache::PortCache;

/// 抓包后端：网卡枚举与打开。生产实现为 [`PnetBackend`]。
pub trait CaptureBackend: Send + Sync {
    fn interfaces(&self) -> anyhow::Result<Vec<String>>;
    fn open(&self, ifname: &str) -> anyhow::Result<CaptureHandle>;
}

pub struct CaptureHandle {
    pub link: LinkKind,
    /// 读取必须带超时，否则空闲网卡上无法及时响应停止信号
    pub rx: Box<dyn DataLinkReceiver>,
}

pub struct PnetBackend {
    read_timeout: Duration,
    fixed: Vec<String>,
}

impl PnetBackend {
    /// `fixed` 非空时不做自动探测
    pub fn new(read_timeout: Duration, fixed: Vec<String>) -> Self {
        Self { read_timeout, fixed }
    }
}

impl CaptureBackend for PnetBackend {
    fn interfaces(&self) -> anyhow::Result<Vec<String>> {
        if !self.fixed.is_empty() {
            return Ok(self.fixed.clone());
        }
        interfaces::default_route_interfaces()
    }

    fn open(&self, ifname: &str) -> anyhow::Result<CaptureHandle> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == ifname)
            .with_context(|| format!("interface {ifname} not found"))?;
        let config = Config {
            read_timeout: Some(self.read_timeout),
            promiscuous: false,
            ..Config::default()
        };
        match datalink::channel(&iface, config).with_context(|| format!("open capture on {ifname}"))? {
            Channel::Ethernet(_tx, rx) => Ok(CaptureHandle {
                link: link_kind(&iface),
                rx,
            }),
            _ => anyhow::bail!("unsupported channel type on {ifname}"),
        }
    }
}

fn link_kind(iface: &NetworkInterface) -> LinkKind {
    if iface.is_point_to_point() || iface.mac.is_none() {
        LinkKind::RawIp
    } else {
        LinkKind::Ethernet
    }
}

/// 单帧处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Dropped,
    Passed,
    Spoofed(Ipv4Addr),
    Response(ResponseVerdict),
}

/// Per-interface frame handler. Owns the port cache; shares everything else via the context.
pub struct PacketHandler {
    ifname: Arc<str>,
    link: LinkKind,
    port_cache: PortCache,
    ctx: Arc<EngineContext>,
}

impl PacketHandler {
    pub fn new(ifname: Arc<str>, link: LinkKind, ctx: Arc<EngineContext>) -> Self {
        Self {
            ifname,
            link,
            port_cache: PortCache::new(),
            ctx,
        }
    }

    pub fn handle_frame(&mut self, frame: &[u8], now: Instant) -> FrameOutcome {
        let whitelist = self.ctx.whitelist.load();
        let Some(ex) = packet_filter(frame, self.link, &whitelist.dns_servers, &mut self.port_cache, now)
        else {
            return FrameOutcome::Dropped;
        };
        let qname = ex.qname();

        if !ex.is_response() {
            let decoy = inspect_query(&self.ctx, &ex, &whitelist.domains);
            if decoy.is_unspecified() {
                trace!(target = "poison", iface = %self.ifname, src = %ex.src, dst = %ex.dst, domain = %qname, "pass");
                return FrameOutcome::Passed;
            }
            info!(
                target = "poison",
                iface = %self.ifname,
                src = %ex.src,
                dst = %ex.dst,
                domain = %qname,
                decoy = %decoy,
                "spoof"
            );
            return FrameOutcome::Spoofed(decoy);
        }

        let key = ObservationKey {
            txid: ex.message.id(),
            port: ex.dst.port(),
        };
        let Some(verdict) = inspect_response(&self.ctx.blacklist, &self.ctx.decoy, &ex.message, key) else {
            return FrameOutcome::Passed;
        };
        if verdict.events.is_empty() {
            trace!(target = "poison", iface = %self.ifname, domain = %qname, evidence = %verdict.evidence, "response");
            return FrameOutcome::Response(verdict);
        }

        info!(
            target = "poison",
            iface = %self.ifname,
            client = %ex.dst,
            resolver = %ex.src,
            domain = %qname,
            evidence = %verdict.evidence,
            "poisoned response"
        );
        for ev in &verdict.events {
            match ev.result {
                HandleResult::Propose => {
                    info!(target = "poison", iface = %self.ifname, domain = %ev.domain, query = %qname, evidence = %verdict.evidence, "propose");
                }
                HandleResult::AddBlacklist => {
                    warn!(target = "poison", iface = %self.ifname, domain = %ev.domain, threshold = self.ctx.blacklist.threshold(), "add_blacklist");
                }
            }
        }
        FrameOutcome::Response(verdict)
    }
}

/// 一个网卡一条抓包管线，在阻塞线程中运行
pub struct CapturePipeline {
    handler: PacketHandler,
    rx: Box<dyn DataLinkReceiver>,
}

impl CapturePipeline {
    pub fn new(ifname: Arc<str>, handle: CaptureHandle, ctx: Arc<EngineContext>) -> Self {
        Self {
            handler: PacketHandler::new(ifname, handle.link, ctx),
            rx: handle.rx,
        }
    }

    /// Runs until `cancel` turns true or a non-timeout read error occurs.
    pub fn run(mut self, cancel: watch::Receiver<bool>) {
        let ifname = Arc::clone(&self.handler.ifname);
        info!(target = "poison", iface = %ifname, link = ?self.handler.link, "capture pipeline started");
        loop {
            // 关闭句柄可能与读取竞争，依靠定期检查取消信号退出
            if *cancel.borrow() {
                break;
            }
            match self.rx.next() {
                Ok(frame) => {
                    self.handler.handle_frame(frame, Instant::now());
                }
                Err(err) if is_idle(&err) => continue,
                Err(err) => {
                    warn!(target = "poison", iface = %ifname, error = %err, "capture read failed");
                    break;
                }
            }
        }
        debug!(target = "poison", iface = %ifname, cached_ports = self.handler.port_cache.len(), "capture pipeline stopped");
    }
}

fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
