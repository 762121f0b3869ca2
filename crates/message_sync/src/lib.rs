//! Realtime message synchronization for the chat client: one ordered,
//! deduplicated log per active conversation, fed by an initial load, a live
//! change feed and optimistic sends.

pub mod backend;
pub mod chat_list;
mod loader;
pub mod log;
pub mod memory;
pub mod pending;
pub mod profiles;
pub mod remote;
pub mod repository;
pub mod seed;
mod sender;
pub mod session;
mod subscriber;
pub mod sync;
pub mod types;

pub use backend::{Backend, Credentials, Session};
pub use chat_list::{ChatListSync, ChatSummary};
pub use loader::InitialLoader;
pub use memory::MemoryBackend;
pub use session::SessionManager;
pub use sync::{ActivationToken, MessageSync, SyncSettings};
pub use types::{
    LiveStatus, LoadStatus, Message, MessageKey, SendOutcome, SenderProfile, SyncEvent, SyncView,
};
