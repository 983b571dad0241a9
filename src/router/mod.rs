//! 消息路由：白名单、回复格式化与 MessageRouter

mod access;
mod format;
mod handler;

pub use access::{AccessDecision, AccessPolicy};
pub use format::{chunk_reply, format_reply};
pub use handler::{MessageRouter, RouteOutcome, RouterConfig};
