use async_trait::async_trait;
use dialectic_core::config::ProviderConfig;
use dialectic_core::gateway::{
    CallFailure, CompletionRequest, FailureKind, ProviderAdapter, ProviderRequest,
    ProviderResponse,
};
use dialectic_core::ProviderId;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{classify_transport, endpoint, status_failure};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Any chat-completions endpoint speaking the OpenAI wire format.
pub struct OpenAiCompatibleAdapter {
    client: Client,
    provider: ProviderId,
    url: String,
    model: String,
    api_key: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleAdapter {
    pub fn new(client: Client, provider: ProviderId, config: &ProviderConfig) -> Self {
        Self {
            client,
            provider,
            url: endpoint(&config.base_url, "chat/completions"),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            api_key: config
                .api_key
                .clone()
                .filter(|key| !key.expose_secret().trim().is_empty()),
        }
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
        });
        if request.json_output {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, CallFailure> {
        let Some(api_key) = &self.api_key else {
            return Err(CallFailure::new(
                FailureKind::AuthMissing,
                &self.provider,
                "no API key configured",
            ));
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key.expose_secret())
            .json(&self.body(request))
            .send()
            .await
            .map_err(|error| classify_transport(&self.provider, error))?;
        if !response.status().is_success() {
            return Err(status_failure(&self.provider, response).await);
        }

        let parsed = response
            .json::<ChatResponse>()
            .await
            .map_err(|error| CallFailure::malformed(&self.provider, error.to_string()))?;
        extract_content(&self.provider, parsed)
    }
}

fn extract_content(provider: &ProviderId, response: ChatResponse) -> Result<String, CallFailure> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| CallFailure::malformed(provider, "completion had no content"))
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    async fn call(&self, request: &ProviderRequest) -> Result<ProviderResponse, CallFailure> {
        match request {
            ProviderRequest::Completion(completion) => {
                self.complete(completion).await.map(ProviderResponse::Completion)
            }
            ProviderRequest::Search(_) => Err(CallFailure::new(
                FailureKind::Unknown,
                &self.provider,
                "completion provider cannot serve search requests",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use dialectic_core::config::AppConfig;
    use dialectic_core::gateway::{
        CompletionRequest, CompletionTask, FailureKind, ProviderAdapter, ProviderRequest,
    };
    use dialectic_core::ProviderId;
    use reqwest::Client;
    use serde_json::json;

    use super::{extract_content, ChatResponse, OpenAiCompatibleAdapter};

    fn adapter() -> OpenAiCompatibleAdapter {
        let config = AppConfig::default();
        let mut provider = config.providers["llm"].clone();
        provider.api_key = None;
        OpenAiCompatibleAdapter::new(Client::new(), ProviderId::new("llm"), &provider)
    }

    fn request(json_output: bool) -> CompletionRequest {
        CompletionRequest {
            task: CompletionTask::Clarify,
            system: "system".to_owned(),
            prompt: "prompt".to_owned(),
            json_output,
        }
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let failure = adapter()
            .call(&ProviderRequest::Completion(request(false)))
            .await
            .expect_err("no key");

        assert_eq!(failure.kind, FailureKind::AuthMissing);
    }

    #[test]
    fn json_output_requests_a_json_object() {
        let adapter = adapter();

        assert_eq!(adapter.body(&request(true))["response_format"]["type"], "json_object");
        assert!(adapter.body(&request(false)).get("response_format").is_none());
        assert_eq!(adapter.body(&request(false))["messages"][1]["content"], "prompt");
    }

    #[test]
    fn empty_choice_is_malformed() {
        let response: ChatResponse =
            serde_json::from_value(json!({ "choices": [{ "message": { "content": "" } }] }))
                .expect("parses");

        let failure = extract_content(&ProviderId::new("llm"), response).expect_err("empty");

        assert_eq!(failure.kind, FailureKind::Malformed);
    }
}
