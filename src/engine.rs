use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::blacklist::DomainBlacklist;
use crate::capture::{CaptureBackend, CapturePipeline};
use crate::config::{EngineConfig, GlobalSettings};
use crate::decoy::DecoyPool;
use crate::error::EngineError;
use crate::matcher::WhitelistSet;
use crate::spoofer::SpoofTransport;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// 进程级单许可准入：任意时刻至多一个引擎实例在运行
static ENGINE_GATE: LazyLock<Arc<Semaphore>> = LazyLock::new(|| Arc::new(Semaphore::new(1)));

/// 所有抓包管线共享的只读上下文；黑名单为唯一的跨管线可变结构。
pub struct EngineContext {
    pub settings: GlobalSettings,
    pub blacklist: Arc<DomainBlacklist>,
    pub decoy: DecoyPool,
    // 巡检时整体替换
    pub whitelist: ArcSwap<WhitelistSet>,
    pub transport: Arc<dyn SpoofTransport>,
}

struct RunState {
    cancel: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

/// 网卡生命周期管理：stopped -> starting -> running -> stopping -> stopped
pub struct Engine {
    config: Arc<ArcSwap<EngineConfig>>,
    ctx: Arc<EngineContext>,
    backend: Arc<dyn CaptureBackend>,
    // 与同一进程内的其他实例共享
    gate: Arc<Semaphore>,
    running: AtomicBool,
    run: Mutex<Option<RunState>>,
}

impl Engine {
    /// 使用进程级准入闸门
    pub fn new(
        config: Arc<ArcSwap<EngineConfig>>,
        backend: Arc<dyn CaptureBackend>,
        transport: Arc<dyn SpoofTransport>,
    ) -> anyhow::Result<Self> {
        Self::with_gate(config, backend, transport, Arc::clone(&ENGINE_GATE))
    }

    /// `gate` must hold exactly one permit and be shared by every engine it should exclude.
    pub fn with_gate(
        config: Arc<ArcSwap<EngineConfig>>,
        backend: Arc<dyn CaptureBackend>,
        transport: Arc<dyn SpoofTransport>,
        gate: Arc<Semaphore>,
    ) -> anyhow::Result<Self> {
        let cfg = config.load_full();
        let decoy = DecoyPool::from_settings(&cfg.decoy)?;
        let whitelist = WhitelistSet::from_config(&cfg.whitelist).context("build whitelist")?;
        let blacklist = Arc::new(DomainBlacklist::new(cfg.settings.promote_threshold));
        let preloaded = blacklist.preload(&cfg.blacklist.preload);
        info!(
            target = "engine",
            decoy_range = %decoy.range(),
            threshold = blacklist.threshold(),
            preloaded,
            "engine initialized"
        );

        let ctx = Arc::new(EngineContext {
            settings: cfg.settings.clone(),
            blacklist,
            decoy,
            whitelist: ArcSwap::from_pointee(whitelist),
            transport,
        });
        Ok(Self {
            config,
            ctx,
            backend,
            gate,
            running: AtomicBool::new(false),
            run: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// 本实例是否持有准入许可
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 启动巡检任务。重复启动返回 [`EngineError::AlreadyRunning`]。
    pub async fn start(&self) -> Result<(), EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let mut run = self.run.lock().await;
        let permit = Arc::clone(&self.gate)
            .try_acquire_owned()
            .map_err(|_| EngineError::AlreadyRunning)?;

        let (cancel, cancel_rx) = watch::channel(false);
        let supervisor = Supervisor {
            config: Arc::clone(&self.config),
            ctx: Arc::clone(&self.ctx),
            backend: Arc::clone(&self.backend),
            pipelines: HashMap::new(),
            applied: None,
        };
        let handle = runtime.spawn(async move {
            // 许可随巡检任务结束而释放
            let _permit = permit;
            supervisor.run(cancel_rx).await;
        });
        *run = Some(RunState {
            cancel,
            supervisor: handle,
        });
        self.running.store(true, Ordering::Release);
        info!(target = "engine", "engine started");
        Ok(())
    }

    /// 停止并等待所有管线退出，然后尽力刷新系统 DNS 缓存。未运行时直接返回。
    pub async fn stop(&self) {
        let Some(state) = self.run.lock().await.take() else {
            return;
        };
        let _ = state.cancel.send(true);
        if let Err(err) = state.supervisor.await {
            warn!(target = "engine", error = %err, "supervisor task failed");
        }
        self.running.store(false, Ordering::Release);
        let flush = self.config.load().settings.flush_command.clone();
        flush_dns_cache(flush.as_deref()).await;
        info!(
            target = "engine",
            tracked = self.ctx.blacklist.len(),
            active = self.ctx.blacklist.active_count(),
            "engine stopped"
        );
    }
}

struct PipelineHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Supervisor {
    config: Arc<ArcSwap<EngineConfig>>,
    ctx: Arc<EngineContext>,
    backend: Arc<dyn CaptureBackend>,
    pipelines: HashMap<String, PipelineHandle>,
    // 上次重建白名单时使用的配置
    applied: Option<Arc<EngineConfig>>,
}

impl Supervisor {
    async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        let interval = self.ctx.settings.scan_interval();
        loop {
            if *cancel.borrow() {
                break;
            }
            self.tick().await;
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                _ = sleep(interval) => {}
            }
        }
        self.shutdown().await;
    }

    async fn tick(&mut self) {
        self.pipelines.retain(|name, p| {
            if p.task.is_finished() {
                debug!(target = "engine", iface = %name, "capture pipeline exited, will reopen");
                false
            } else {
                true
            }
        });

        let current = match self.backend.interfaces() {
            Ok(list) => list,
            Err(err) => {
                warn!(target = "engine", error = %err, "list interfaces failed");
                return;
            }
        };

        let vanished: Vec<String> = self
            .pipelines
            .keys()
            .filter(|name| !current.contains(name))
            .cloned()
            .collect();
        for name in vanished {
            if let Some(p) = self.pipelines.remove(&name) {
                let _ = p.cancel.send(true);
                let _ = p.task.await;
                info!(target = "engine", iface = %name, "interface gone, capture pipeline stopped");
            }
        }

        let missing: Vec<String> = current
            .into_iter()
            .filter(|name| !self.pipelines.contains_key(name))
            .collect();
        let cfg = self.config.load_full();
        let changed = self
            .applied
            .as_ref()
            .is_none_or(|prev| !Arc::ptr_eq(prev, &cfg));
        if missing.is_empty() && !changed {
            return;
        }

        if let Err(err) = self.rebuild(&cfg) {
            warn!(target = "engine", error = %err, "whitelist rebuild failed, retry next tick");
            return;
        }
        self.applied = Some(cfg);

        for name in missing {
            self.spawn_pipeline(name);
        }
    }

    fn rebuild(&self, cfg: &EngineConfig) -> anyhow::Result<()> {
        let whitelist = WhitelistSet::from_config(&cfg.whitelist).context("build whitelist")?;
        let preloaded = self.ctx.blacklist.preload(&cfg.blacklist.preload);
        debug!(
            target = "engine",
            whitelist_domains = whitelist.domains.len(),
            preloaded,
            "whitelist rebuilt"
        );
        self.ctx.whitelist.store(Arc::new(whitelist));
        Ok(())
    }

    fn spawn_pipeline(&mut self, name: String) {
        let handle = match self.backend.open(&name) {
            Ok(h) => h,
            Err(err) => {
                warn!(target = "engine", iface = %name, error = %err, "open capture failed, retry next tick");
                return;
            }
        };
        let (cancel, cancel_rx) = watch::channel(false);
        let pipeline = CapturePipeline::new(Arc::from(name.as_str()), handle, Arc::clone(&self.ctx));
        let task = tokio::task::spawn_blocking(move || pipeline.run(cancel_rx));
        self.pipelines.insert(name, PipelineHandle { cancel, task });
    }

    async fn shutdown(&mut self) {
        for p in self.pipelines.values() {
            let _ = p.cancel.send(true);
        }
        let count = self.pipelines.len();
        for (name, p) in self.pipelines.drain() {
            if let Err(err) = p.task.await {
                warn!(target = "engine", iface = %name, error = %err, "capture pipeline panicked");
            }
        }
        debug!(target = "engine", pipelines = count, "all capture pipelines joined");
    }
}

/// 尽力刷新系统 DNS 缓存，失败只记录日志。`Some(&[])` 表示禁用。
pub async fn flush_dns_cache(command: Option<&[String]>) {
    let cmd = match command {
        Some(c) => c.to_vec(),
        None => default_flush_command(),
    };
    let Some((program, args)) = cmd.split_first() else {
        return;
    };
    let mut child = Command::new(program);
    child
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match timeout(FLUSH_TIMEOUT, child.status()).await {
        Ok(Ok(status)) if status.success() => {
            debug!(target = "engine", program = %program, "dns cache flushed");
        }
        Ok(Ok(status)) => {
            debug!(target = "engine", program = %program, status = %status, "dns cache flush exited non-zero");
        }
        Ok(Err(err)) => {
            debug!(target = "engine", program = %program, error = %err, "dns cache flush failed");
        }
        Err(_) => {
            debug!(target = "engine", program = %program, "dns cache flush timed out");
        }
    }
}

fn default_flush_command() -> Vec<String> {
    let cmd: &[&str] = if cfg!(target_os = "linux") {
        &["resolvectl", "flush-caches"]
    } else if cfg!(target_os = "macos") {
        &["dscacheutil", "-flushcache"]
    } else if cfg!(windows) {
        &["ipconfig", "/flushdns"]
    } else {
        &[]
    };
    cmd.iter().map(|s| s.to_string()).collect()
}
