use shared::domain::UserId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("conversation with blocked peer {0} is unavailable")]
    PeerBlocked(UserId),
    #[error("cannot open a conversation with yourself")]
    SelfConversation,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModerationError {
    #[error("cannot block your own account")]
    SelfBlock,
    #[error("backend refused to block peer {0}")]
    Rejected(UserId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("please enter a username")]
    MissingUsername,
    #[error("please enter both username and password")]
    MissingPassword,
    #[error("issued token does not carry a usable identity")]
    UnusableToken,
}
