//! 会话层：标识、轮次、有界上下文与注册表

pub mod context;
pub mod identity;
pub mod registry;
pub mod turn;

pub use context::{ConversationContext, SEED_LEN};
pub use identity::ConversationId;
pub use registry::{ConversationRegistry, RegistryError, SeedPolicy, TurnPermit, TurnTicket};
pub use turn::{Role, Turn};
