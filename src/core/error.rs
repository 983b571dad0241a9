//! 顶层错误类型：汇总各模块错误，供装配与启动阶段统一传播

use thiserror::Error;

use crate::conversation::RegistryError;
use crate::llm::LlmError;
use crate::pairing::QrRenderError;
use crate::session::StoreError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("QR render error: {0}")]
    Qr(#[from] QrRenderError),

    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    #[error("Invalid bind address: {0}")]
    BindAddr(String),
}

/// 库内统一 Result
pub type Result<T> = std::result::Result<T, BridgeError>;
