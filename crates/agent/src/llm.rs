//! Helpers shared by every executor that talks to a completion model.

use dialectic_core::gateway::{
    CallFailure, CallGateway, CompletionRequest, CompletionTask, FailureKind, ProviderRequest,
    ProviderResponse,
};
use dialectic_core::ProviderId;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Invokes the gateway and retries a transient failure exactly once.
pub async fn invoke_once_retrying(
    gateway: &dyn CallGateway,
    provider: &ProviderId,
    request: ProviderRequest,
) -> Result<ProviderResponse, CallFailure> {
    match gateway.invoke(provider, request.clone()).await {
        Err(failure) if failure.kind == FailureKind::Transient => {
            warn!(
                event_name = "agent.call.transient_retry",
                provider = %provider,
                request = request.kind(),
                error = %failure.reason,
                "transient provider failure, retrying once"
            );
            gateway.invoke(provider, request).await
        }
        other => other,
    }
}

pub async fn complete(
    gateway: &dyn CallGateway,
    provider: &ProviderId,
    task: CompletionTask,
    system: impl Into<String>,
    prompt: impl Into<String>,
) -> Result<String, CallFailure> {
    let request = ProviderRequest::Completion(CompletionRequest {
        task,
        system: system.into(),
        prompt: prompt.into(),
        json_output: false,
    });
    invoke_once_retrying(gateway, provider, request).await?.into_completion(provider)
}

/// Asks for a single JSON object and deserializes it. Unparseable replies are `Malformed`.
pub async fn complete_json<T>(
    gateway: &dyn CallGateway,
    provider: &ProviderId,
    task: CompletionTask,
    system: impl Into<String>,
    prompt: impl Into<String>,
) -> Result<T, CallFailure>
where
    T: DeserializeOwned,
{
    let request = ProviderRequest::Completion(CompletionRequest {
        task,
        system: system.into(),
        prompt: prompt.into(),
        json_output: true,
    });
    let text = invoke_once_retrying(gateway, provider, request).await?.into_completion(provider)?;
    parse_json_reply(provider, &text)
}

/// Models wrap JSON in prose or code fences often enough that we take the
/// outermost `{...}` span before parsing.
pub fn parse_json_reply<T>(provider: &ProviderId, text: &str) -> Result<T, CallFailure>
where
    T: DeserializeOwned,
{
    let trimmed = text.trim();
    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(CallFailure::malformed(provider, "reply did not contain a JSON object"));
        }
    };

    serde_json::from_str(candidate).map_err(|error| {
        CallFailure::malformed(provider, format!("reply was not valid JSON: {error}"))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dialectic_core::gateway::{CompletionTask, FailureKind};
    use dialectic_core::ProviderId;
    use serde::Deserialize;

    use super::{complete, parse_json_reply};
    use crate::testing::{ScriptedGateway, ScriptedReply};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Decision {
        decision: String,
    }

    #[test]
    fn parses_json_wrapped_in_code_fence() {
        let provider = ProviderId::new("llm");
        let text = "Here you go:\n```json\n{\"decision\": \"continue\"}\n```";

        let parsed: Decision = parse_json_reply(&provider, text).expect("parses");
        assert_eq!(parsed, Decision { decision: "continue".to_owned() });
    }

    #[test]
    fn prose_without_object_is_malformed() {
        let provider = ProviderId::new("llm");
        let error = parse_json_reply::<Decision>(&provider, "I think we should continue.")
            .expect_err("no object");
        assert_eq!(error.kind, FailureKind::Malformed);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_exactly_once() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push(CompletionTask::Clarify, ScriptedReply::failure(FailureKind::Transient));
        gateway.push(CompletionTask::Clarify, ScriptedReply::text("second time lucky"));

        let text = complete(gateway.as_ref(), &ProviderId::new("llm"), CompletionTask::Clarify, "s", "p")
            .await
            .expect("retry succeeds");

        assert_eq!(text, "second time lucky");
        assert_eq!(gateway.calls_for_task(CompletionTask::Clarify), 2);
    }

    #[tokio::test]
    async fn second_transient_failure_is_returned() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push(CompletionTask::Clarify, ScriptedReply::failure(FailureKind::Transient));
        gateway.push(CompletionTask::Clarify, ScriptedReply::failure(FailureKind::Transient));
        gateway.push(CompletionTask::Clarify, ScriptedReply::text("never reached"));

        let failure =
            complete(gateway.as_ref(), &ProviderId::new("llm"), CompletionTask::Clarify, "s", "p")
                .await
                .expect_err("only one retry");

        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(gateway.calls_for_task(CompletionTask::Clarify), 2);
    }
}
