use thiserror::Error;

/// Failures of a single send against the remote model.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no API key configured; set GEMINI_API_KEY or pass --api-key")]
    MissingCredential,

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("model error: {0}")]
    Remote(String),

    #[error("malformed stream payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

impl ChatError {
    /// Whether the session that produced this error must be replaced before
    /// the next send.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, ChatError::Http(_) | ChatError::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::ChatError;

    #[test]
    fn only_transport_failures_invalidate_the_session() {
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(ChatError::Decode(decode).invalidates_session());

        assert!(!ChatError::MissingCredential.invalidates_session());
        assert!(!ChatError::Cancelled.invalidates_session());
        assert!(!ChatError::Remote("quota".to_string()).invalidates_session());
        assert!(
            !ChatError::Api {
                status: 429,
                body: "slow down".to_string()
            }
            .invalidates_session()
        );
    }

    #[test]
    fn api_error_message_carries_status_and_body() {
        let err = ChatError::Api {
            status: 403,
            body: "forbidden".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 403 - forbidden");
    }
}
