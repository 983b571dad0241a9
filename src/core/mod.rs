//! 核心装配层：顶层错误、桥接构建器与优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{create_bridge_builder, Bridge, BridgeBuilder};
pub use error::{BridgeError, Result};
pub use shutdown::{ShutdownManager, ShutdownReason};
