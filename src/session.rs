use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::ai_sdk::{fragment_from_payload, Content, GenerateContentRequest};
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::sse::SseDecoder;

/// Text fragments of one model reply, in arrival order. Single pass.
pub type FragmentStream = BoxStream<'static, Result<String, ChatError>>;

/// The remote end of a conversation.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn stream_generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<FragmentStream, ChatError>;
}

pub struct GeminiTransport {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiTransport {
    pub fn new(api_key: String, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        )
    }
}

#[async_trait]
impl ChatTransport for GeminiTransport {
    async fn stream_generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<FragmentStream, ChatError> {
        if self.api_key.is_empty() {
            return Err(ChatError::MissingCredential);
        }

        let response = self
            .client
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(decode_fragments(body))
    }
}

struct DecodeState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    exhausted: bool,
}

/// Turns an SSE response body into a stream of non-empty text fragments.
fn decode_fragments(body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> FragmentStream {
    let state = DecodeState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        exhausted: false,
    };

    stream::try_unfold(state, next_fragment).boxed()
}

async fn next_fragment(
    mut state: DecodeState,
) -> Result<Option<(String, DecodeState)>, ChatError> {
    loop {
        if let Some(fragment) = state.pending.pop_front() {
            return Ok(Some((fragment, state)));
        }
        if state.exhausted {
            return Ok(None);
        }

        let payloads = match state.body.next().await {
            Some(chunk) => state.decoder.push(&chunk?),
            None => {
                state.exhausted = true;
                state.decoder.finish().into_iter().collect()
            }
        };

        for payload in payloads {
            if let Some(fragment) = fragment_from_payload(&payload)? {
                state.pending.push_back(fragment);
            }
        }
    }
}

/// Builds sessions that all share one configuration and transport.
#[derive(Clone)]
pub struct SessionFactory {
    config: Arc<ChatConfig>,
    transport: Arc<dyn ChatTransport>,
}

impl SessionFactory {
    pub fn new(config: ChatConfig, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Never touches the network; a bad endpoint or key shows up on first send.
    pub fn create(&self) -> Session {
        let session = Session {
            id: Uuid::new_v4(),
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            history: Vec::new(),
        };
        tracing::debug!(session = %session.id, model = %self.config.model, "created chat session");
        session
    }
}

/// A conversational context with the remote model. The dialogue history is
/// kept here and resent with every request.
pub struct Session {
    id: Uuid,
    config: Arc<ChatConfig>,
    transport: Arc<dyn ChatTransport>,
    history: Vec<Content>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn exchanges(&self) -> usize {
        self.history.len() / 2
    }

    /// Starts the model's reply to `message` without recording anything yet.
    pub(crate) async fn open_stream(&self, message: &str) -> Result<FragmentStream, ChatError> {
        let mut contents = self.history.clone();
        contents.push(Content::user(message));
        let request = GenerateContentRequest::new(&self.config, contents);
        self.transport
            .stream_generate(&self.config.model, &request)
            .await
    }

    pub(crate) fn record_exchange(&mut self, message: &str, reply: &str) {
        self.history.push(Content::user(message));
        self.history.push(Content::model(reply));
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &self.config.model)
            .field("history", &self.history.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{factory, Reply, ScriptedTransport};
    use super::*;
    use crate::ai_sdk::ContentRole;

    fn body(chunks: Vec<&'static str>) -> BoxStream<'static, Result<Vec<u8>, reqwest::Error>> {
        stream::iter(chunks.into_iter().map(|chunk| Ok(chunk.as_bytes().to_vec()))).boxed()
    }

    #[tokio::test]
    async fn decodes_fragments_across_chunk_boundaries() {
        let fragments: Vec<String> = decode_fragments(body(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"he\"}]}}]}\n",
            "\ndata: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"llo\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[]},\"finishReason\":\"STOP\"}]}",
        ]))
        .map(|fragment| fragment.unwrap())
        .collect()
        .await;

        assert_eq!(fragments, vec!["he", "llo"]);
    }

    #[tokio::test]
    async fn malformed_payload_ends_the_stream_with_an_error() {
        let mut fragments = decode_fragments(body(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]}}]}\n\n",
            "data: <html>oops</html>\n\n",
        ]));

        assert_eq!(fragments.next().await.unwrap().unwrap(), "ok");
        assert!(matches!(
            fragments.next().await,
            Some(Err(ChatError::Decode(_)))
        ));
    }

    #[tokio::test]
    async fn missing_key_surfaces_on_first_use() {
        let transport = GeminiTransport::new(String::new(), "http://127.0.0.1:9");
        let factory = SessionFactory::new(ChatConfig::default(), Arc::new(transport));
        let session = factory.create();

        assert!(matches!(
            session.open_stream("hi").await,
            Err(ChatError::MissingCredential)
        ));
    }

    #[test]
    fn endpoint_targets_the_sse_stream_method() {
        let transport = GeminiTransport::new("key".to_string(), "https://example.test/");
        assert_eq!(
            transport.endpoint("gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
    }

    #[tokio::test]
    async fn requests_carry_history_and_the_new_message() {
        let transport = ScriptedTransport::new(vec![Reply::Fragments(vec!["ok"])]);
        let mut session = factory(Arc::clone(&transport)).create();
        session.record_exchange("first", "reply");

        let _ = session.open_stream("second").await.unwrap();

        let requests = transport.requests.lock().unwrap();
        let contents = &requests[0].contents;
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1].role, ContentRole::Model);
        assert_eq!(contents[2], Content::user("second"));
        assert_eq!(requests[0].generation_config.temperature, 0.7);
        assert_eq!(session.exchanges(), 1);
    }

    #[test]
    fn every_created_session_is_fresh() {
        let factory = factory(ScriptedTransport::new(Vec::new()));
        let a = factory.create();
        let b = factory.create();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.exchanges(), 0);
    }
}
