pub mod client;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod history;
pub mod protocol;
pub mod session;
pub mod summary;
pub mod throttle;

pub use client::{ClientConfig, DivinationClient, Fields, ProviderOverride};
pub use context::AppContext;
pub use controller::{DivinationController, ViewState, user_facing_message};
pub use error::{ConfigError, StorageError, StreamError};
pub use history::{FileStore, HistoryRecord, HistoryStore, KeyValueStore, MemoryStore, NewRecord};
pub use protocol::StreamFrame;
pub use session::{
    SessionObserver, SessionOptions, SessionPhase, SessionRequest, SessionState, StreamSession,
};
pub use throttle::ThrottledRenderBuffer;
