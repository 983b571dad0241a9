//! chatbridge - 个人助理消息桥
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **connection**: 连接状态机、断开原因分类、重连退避与监管循环
//! - **conversation**: 会话标识、有界上下文与注册表（每会话单轮次在途）
//! - **core**: 顶层错误、桥接构建器、优雅关闭
//! - **llm**: AI 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **pairing**: 配对码渲染与运维状态广播
//! - **router**: 入站消息过滤、命令分派与 AI 转发
//! - **server**: 运维页面与状态 WebSocket
//! - **session**: 传输凭据持久化
//! - **transport**: 消息网络客户端接口（控制台实现 + Mock）

pub mod config;
pub mod connection;
pub mod conversation;
pub mod core;
pub mod llm;
pub mod observability;
pub mod pairing;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

pub use crate::core::{Bridge, BridgeBuilder, BridgeError};
