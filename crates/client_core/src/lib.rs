pub mod api;
pub mod auth;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod identity;
pub mod moderation;
pub mod profile;
pub mod session;
pub mod transport;

pub use api::{AuthApi, ChatApi, HttpAuthApi, HttpChatApi, TokenStatus};
pub use auth::{AuthGate, AuthOptions, AuthState, LogoutReason};
pub use conversation::{
    ConversationController, ConversationPhase, ConversationView, HistoryOutcome, Notice,
    RenderedMessage, SendOutcome, ViewEntry,
};
pub use directory::DirectoryController;
pub use identity::{Identity, IdentityError};
pub use moderation::ModerationController;
pub use session::{ChatSession, ClientEvent, CloseReason, SessionContext, SessionOptions};
pub use transport::{
    ConnectionState, Delivery, DeliveryError, ReconnectPolicy, RelayEvent, RelayOptions,
    RelayTransport, WsRelay,
};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
