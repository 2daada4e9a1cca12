use reqwest::StatusCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("transport error: {message}")]
    Transport {
        message: String,
    },

    #[error("{message} ({code})")]
    Server {
        code: String,
        message: String,
    },

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
    },
}

impl StreamError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }

    /// Build an [`StreamError::Http`] from a status and the raw response body.
    pub fn http(status: StatusCode, body: &str) -> Self {
        let detail = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|value| {
                ["error", "message"]
                    .iter()
                    .find_map(|key| value.get(key).and_then(|v| v.as_str()).map(str::to_owned))
            })
            .unwrap_or_else(|| body.trim().chars().take(200).collect());

        let message = if detail.is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            detail
        };

        Self::Http {
            status: status.as_u16(),
            message,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Server { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Transport { .. } => false,
            Self::Http { status, message } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || mentions_rate_limit(message)
            }
            Self::Server { code, message } => {
                let code = code.to_ascii_uppercase();
                code.contains("RATE_LIMIT")
                    || code.contains("TOO_MANY_REQUESTS")
                    || mentions_rate_limit(message)
            }
        }
    }

    /// True when the failure points at API credentials or provider settings.
    pub fn is_configuration_problem(&self) -> bool {
        match self {
            Self::Transport { .. } => false,
            Self::Http { status, message } => {
                *status == StatusCode::UNAUTHORIZED.as_u16()
                    || *status == StatusCode::FORBIDDEN.as_u16()
                    || mentions_configuration(message)
            }
            Self::Server { code, message } => {
                let code = code.to_ascii_uppercase();
                code.contains("AUTH")
                    || code.contains("API_KEY")
                    || code.contains("CONFIG")
                    || mentions_configuration(message)
            }
        }
    }
}

fn mentions_rate_limit(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("rate limit") || message.contains("too many requests")
}

fn mentions_configuration(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("api key")
        || message.contains("api_key")
        || message.contains("unauthorized")
        || message.contains("api配置")
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize history: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for header {header}: {reason}")]
    InvalidHeader {
        header: &'static str,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_prefers_json_error_field() {
        let err = StreamError::http(StatusCode::BAD_REQUEST, r#"{"error":"missing birth date"}"#);
        assert_eq!(
            err,
            StreamError::Http {
                status: 400,
                message: "missing birth date".to_string()
            }
        );
    }

    #[test]
    fn http_error_falls_back_to_reason_for_empty_body() {
        let err = StreamError::http(StatusCode::BAD_GATEWAY, "  ");
        assert_eq!(err.to_string(), "HTTP 502: Bad Gateway");
    }

    #[test]
    fn rate_limit_detection_covers_status_code_and_message() {
        assert!(StreamError::http(StatusCode::TOO_MANY_REQUESTS, "").is_rate_limited());
        assert!(
            StreamError::Server {
                code: "RATE_LIMIT".to_string(),
                message: "slow down".to_string()
            }
            .is_rate_limited()
        );
        assert!(
            StreamError::Server {
                code: "UPSTREAM".to_string(),
                message: "Too Many Requests from upstream".to_string()
            }
            .is_rate_limited()
        );
        assert!(!StreamError::transport("429 bytes read").is_rate_limited());
    }

    #[test]
    fn status_digits_in_message_are_not_a_rate_limit() {
        let err = StreamError::http(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error":"request 84291 failed"}"#,
        );
        assert!(!err.is_rate_limited());
        assert!(
            !StreamError::Server {
                code: "UPSTREAM".to_string(),
                message: "order 429 rejected".to_string()
            }
            .is_rate_limited()
        );
    }

    #[test]
    fn configuration_detection() {
        assert!(StreamError::http(StatusCode::UNAUTHORIZED, "").is_configuration_problem());
        assert!(
            StreamError::Server {
                code: "INVALID_API_KEY".to_string(),
                message: "bad key".to_string()
            }
            .is_configuration_problem()
        );
        assert!(
            !StreamError::Server {
                code: "LEGACY_ERROR".to_string(),
                message: "model overloaded".to_string()
            }
            .is_configuration_problem()
        );
    }
}
