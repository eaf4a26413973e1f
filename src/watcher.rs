use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::{self, EngineConfig};

pub fn spawn(path: PathBuf, config: Arc<ArcSwap<EngineConfig>>) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, config) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, config: Arc<ArcSwap<EngineConfig>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => reload(&path, &config),
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// 重新加载配置；白名单与预置黑名单在下一次巡检时生效。
fn reload(path: &Path, config: &ArcSwap<EngineConfig>) {
    // 写文件可能是 truncate+write，短暂重试
    let mut retries = 3;
    while retries > 0 {
        match config::load_config(path) {
            Ok(new_cfg) => {
                config.store(Arc::new(new_cfg));
                info!(target = "watcher", path = %path.display(), "config reloaded");
                return;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                } else {
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}
