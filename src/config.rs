use crate::client::{self, ClientConfig, DEFAULT_BASE_URL, DivinationClient, ProviderOverride};
use crate::context::AppContext;
use crate::error::ConfigError;
use crate::history::{FileStore, HistoryStore};
use crate::session::{DEFAULT_MAX_ACCUMULATED_BYTES, SessionOptions};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Base URL of the divination backend
    #[arg(long, env = "TIANJI_API_URL", default_value = DEFAULT_BASE_URL)]
    pub api_url: String,

    /// Bearer token; falls back to ~/.tianji/token, then anonymous
    #[arg(long, env = "TIANJI_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// API key for an alternate AI provider
    #[arg(long, env = "TIANJI_PROVIDER_API_KEY", hide_env_values = true)]
    pub provider_api_key: Option<String>,

    /// Base URL for an alternate AI provider
    #[arg(long, env = "TIANJI_PROVIDER_BASE_URL")]
    pub provider_base_url: Option<String>,

    /// Model name for an alternate AI provider
    #[arg(long, env = "TIANJI_PROVIDER_MODEL")]
    pub provider_model: Option<String>,

    /// Directory holding saved readings
    #[arg(long, env = "TIANJI_HISTORY_DIR")]
    pub history_dir: Option<PathBuf>,

    /// Minimum milliseconds between screen updates while streaming
    #[arg(long, env = "TIANJI_THROTTLE_MS", default_value_t = 16)]
    pub throttle_ms: u64,

    /// Maximum bytes of reading text kept per request
    #[arg(long, env = "TIANJI_MAX_RESULT_BYTES", default_value_t = DEFAULT_MAX_ACCUMULATED_BYTES)]
    pub max_result_bytes: usize,
}

impl Settings {
    pub fn client_config(&self) -> ClientConfig {
        let provider = ProviderOverride {
            api_key: self.provider_api_key.clone(),
            base_url: self.provider_base_url.clone(),
            model: self.provider_model.clone(),
        };

        ClientConfig {
            base_url: self.api_url.clone(),
            token: client::resolve_token(self.token.clone()),
            provider: (!provider.is_empty()).then_some(provider),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            throttle_delay: Duration::from_millis(self.throttle_ms),
            max_accumulated_bytes: self.max_result_bytes,
        }
    }

    pub fn history_dir(&self) -> PathBuf {
        self.history_dir
            .clone()
            .unwrap_or_else(|| client::data_dir().join("history"))
    }

    pub fn history_store(&self) -> HistoryStore {
        HistoryStore::new(FileStore::new(self.history_dir()))
    }

    pub fn build_context(&self) -> Result<AppContext, ConfigError> {
        let client = DivinationClient::new(self.client_config())?;
        Ok(AppContext::new(client, self.history_store()).with_session_options(self.session_options()))
    }
}
