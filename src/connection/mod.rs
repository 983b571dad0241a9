//! 连接生命周期：状态机、断开原因分类、重连退避与监管循环

mod backoff;
mod state;
mod supervisor;

pub use backoff::Backoff;
pub use state::{CloseClass, CloseReason, ConnectionState};
pub use supervisor::{ConnectionSupervisor, InboundHandler, SupervisorExit};
