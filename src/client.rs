use crate::error::ConfigError;
use crate::session::SessionRequest;
use reqwest::Client as HttpClient;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use std::path::PathBuf;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3001";

pub const DIVINATION_PATH: &str = "/api/divination";

pub const PROMPT_TYPE_FIELD: &str = "prompt_type";

const CUSTOM_API_KEY: &str = "x-custom-api-key";
const CUSTOM_BASE_URL: &str = "x-custom-base-url";
const CUSTOM_MODEL: &str = "x-custom-model";

/// Caller-supplied request fields. Open-ended on purpose: each divination
/// type carries its own set.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct ProviderOverride {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl ProviderOverride {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.base_url.is_none() && self.model.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: String,
    pub provider: Option<ProviderOverride>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: String::new(),
            provider: None,
        }
    }
}

#[derive(Clone)]
pub struct DivinationClient {
    base_url: String,
    headers: HeaderMap,
    http: HttpClient,
}

impl DivinationClient {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        Self::with_http(config, HttpClient::new())
    }

    pub fn with_http(config: ClientConfig, http: HttpClient) -> Result<Self, ConfigError> {
        let headers = build_headers(&config)?;
        Ok(Self {
            base_url: normalize_base_url(&config.base_url),
            headers,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, DIVINATION_PATH)
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn build_request(&self, kind: &str, fields: &Fields) -> SessionRequest {
        SessionRequest {
            url: self.endpoint(),
            headers: self.headers.clone(),
            body: request_body(kind, fields),
        }
    }
}

/// Merge the caller's fields with the type discriminator, which wins on
/// collision.
pub fn request_body(kind: &str, fields: &Fields) -> Value {
    let mut body = fields.clone();
    body.insert(PROMPT_TYPE_FIELD.to_string(), Value::String(kind.to_string()));
    Value::Object(body)
}

/// Explicit token first, then the token file, then anonymous.
pub fn resolve_token(explicit: Option<String>) -> String {
    if let Some(token) = explicit {
        return token;
    }

    read_token_file().unwrap_or_default()
}

fn build_headers(config: &ClientConfig) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/event-stream, application/json"),
    );
    headers.insert(
        AUTHORIZATION,
        header_value("authorization", &format!("Bearer {}", config.token))?,
    );

    if let Some(provider) = config.provider.as_ref().filter(|p| !p.is_empty()) {
        let overrides = [
            (CUSTOM_API_KEY, &provider.api_key),
            (CUSTOM_BASE_URL, &provider.base_url),
            (CUSTOM_MODEL, &provider.model),
        ];
        for (name, value) in overrides {
            if let Some(value) = value {
                headers.insert(HeaderName::from_static(name), header_value(name, value)?);
            }
        }
    }

    Ok(headers)
}

fn header_value(header: &'static str, value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|err| ConfigError::InvalidHeader {
        header,
        reason: err.to_string(),
    })
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

fn read_token_file() -> Option<String> {
    let token = std::fs::read_to_string(token_path()).ok()?;
    Some(token.trim().to_string())
}

pub fn data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".tianji");
    }

    PathBuf::from(".tianji")
}

fn token_path() -> PathBuf {
    data_dir().join("token")
}
