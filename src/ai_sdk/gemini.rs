use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;
use crate::error::ChatError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    pub(crate) contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) system_instruction: Option<SystemInstruction>,
    pub(crate) generation_config: GenerationConfig,
}

impl GenerateContentRequest {
    pub(crate) fn new(config: &ChatConfig, contents: Vec<Content>) -> Self {
        let system_instruction = if config.system_instruction.trim().is_empty() {
            None
        } else {
            Some(SystemInstruction {
                parts: vec![Part::text(config.system_instruction.clone())],
            })
        };

        Self {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: config.temperature,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SystemInstruction {
    pub(crate) parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GenerationConfig {
    pub(crate) temperature: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ContentRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Content {
    pub(crate) role: ContentRole,
    pub(crate) parts: Vec<Part>,
}

impl Content {
    pub(crate) fn user(text: impl Into<String>) -> Self {
        Self {
            role: ContentRole::User,
            parts: vec![Part::text(text)],
        }
    }

    pub(crate) fn model(text: impl Into<String>) -> Self {
        Self {
            role: ContentRole::Model,
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) thought: Option<bool>,
}

impl Part {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            thought: None,
        }
    }
}

/// One `data:` payload of a `streamGenerateContent?alt=sse` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    pub(crate) candidates: Vec<Candidate>,
    #[serde(default)]
    pub(crate) error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    #[serde(default)]
    pub(crate) content: Option<CandidateContent>,
    #[serde(default)]
    pub(crate) finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CandidateContent {
    #[serde(default)]
    pub(crate) parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub(crate) code: Option<u16>,
    #[serde(default)]
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) status: Option<String>,
}

impl GenerateContentResponse {
    /// Visible text carried by the first candidate, skipping thought parts.
    pub(crate) fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter(|part| part.thought != Some(true))
                    .filter_map(|part| part.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Decodes one stream payload into its text fragment. Empty fragments come
/// back as `None`; an embedded error object fails the stream.
pub(crate) fn fragment_from_payload(payload: &str) -> Result<Option<String>, ChatError> {
    let response: GenerateContentResponse = serde_json::from_str(payload)?;

    if let Some(error) = response.error {
        let label = match (error.code, error.status) {
            (Some(code), Some(status)) => format!("{} {}: ", code, status),
            (Some(code), None) => format!("{}: ", code),
            (None, Some(status)) => format!("{}: ", status),
            (None, None) => String::new(),
        };
        return Err(ChatError::Remote(format!("{}{}", label, error.message)));
    }

    if let Some(reason) = response
        .candidates
        .first()
        .and_then(|candidate| candidate.finish_reason.as_deref())
    {
        tracing::debug!(finish_reason = reason, "candidate finished");
    }

    let text = response.text();
    Ok(if text.is_empty() { None } else { Some(text) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_in_gemini_shape() {
        let config = ChatConfig {
            model: "gemini-2.5-flash".to_string(),
            system_instruction: "be calm".to_string(),
            temperature: 0.5,
        };
        let request = GenerateContentRequest::new(
            &config,
            vec![Content::user("hi"), Content::model("hello"), Content::user("next")],
        );

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "hi"}]},
                    {"role": "model", "parts": [{"text": "hello"}]},
                    {"role": "user", "parts": [{"text": "next"}]}
                ],
                "systemInstruction": {"parts": [{"text": "be calm"}]},
                "generationConfig": {"temperature": 0.5}
            })
        );
    }

    #[test]
    fn blank_system_instruction_is_omitted() {
        let config = ChatConfig {
            system_instruction: "  ".to_string(),
            ..ChatConfig::default()
        };
        let request = GenerateContentRequest::new(&config, vec![Content::user("hi")]);
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("systemInstruction").is_none());
    }

    #[test]
    fn fragment_concatenates_visible_parts() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "thinking...", "thought": true},
                        {"text": "при"},
                        {"text": "вет"}
                    ]
                }
            }]
        })
        .to_string();

        let fragment = fragment_from_payload(&payload).unwrap();
        assert_eq!(fragment.as_deref(), Some("привет"));
    }

    #[test]
    fn fragment_without_text_is_none() {
        let payload = json!({
            "candidates": [{"content": {"parts": []}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 3}
        })
        .to_string();

        assert!(fragment_from_payload(&payload).unwrap().is_none());
    }

    #[test]
    fn embedded_error_fails_the_stream() {
        let payload = json!({
            "error": {"code": 429, "message": "quota exceeded", "status": "RESOURCE_EXHAUSTED"}
        })
        .to_string();

        match fragment_from_payload(&payload) {
            Err(ChatError::Remote(message)) => {
                assert_eq!(message, "429 RESOURCE_EXHAUSTED: quota exceeded")
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        assert!(matches!(
            fragment_from_payload("{not json"),
            Err(ChatError::Decode(_))
        ));
    }
}
