//! 传输层：消息网络客户端接口、控制台开发实现与测试用 Mock

pub mod console;
pub mod mock;
pub mod traits;

pub use console::ConsoleTransport;
pub use mock::{group_envelope, text_envelope, MockSession, MockTransport, SentText};
pub use traits::{
    ConnectionUpdate, Envelope, LinkState, MessageRef, Presence, Transport, TransportConnection,
    TransportError, TransportEvent, TransportSession,
};
