//! 会话恢复：传输凭据的持久化与加载

mod credentials;
mod store;

pub use credentials::SessionCredentials;
pub use store::{create_session_store, FileSessionStore, MemorySessionStore, SessionStore, StoreError};
