use crate::client::DivinationClient;
use crate::history::HistoryStore;
use crate::session::SessionOptions;
use std::sync::Arc;

/// Application state shared by every controller, built once at startup and
/// handed to each controller explicitly.
#[derive(Clone)]
pub struct AppContext {
    pub client: Arc<DivinationClient>,
    pub history: Arc<HistoryStore>,
    pub session: SessionOptions,
}

impl AppContext {
    pub fn new(client: DivinationClient, history: HistoryStore) -> Self {
        Self {
            client: Arc::new(client),
            history: Arc::new(history),
            session: SessionOptions::default(),
        }
    }

    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.session = options;
        self
    }
}
