use thiserror::Error;

/// 引擎生命周期错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("anti-pollution engine is already running")]
    AlreadyRunning,

    #[error("no tokio runtime available to drive the engine")]
    NoRuntime,
}
