use super::anthropic_types::{MessagesResponse, ResponseContentBlock, StopReason, Usage};
use super::gemini_types::{FunctionCall, GenerateContentResponse, UsageMetadata};
use super::tools::{call_scope, derive_call_id, ToolMapping};
use crate::error::{ProxyError, Result};
use serde_json::Value;
use tracing::{debug, warn};

/// Finish reasons that mean the model was stopped rather than done.
const ERROR_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "MALFORMED_FUNCTION_CALL",
    "IMAGE_SAFETY",
    "LANGUAGE",
];

/// Translate a Gemini `generateContent` response into an Anthropic Messages response.
/// `original_model` is the model name the client asked for.
pub fn gemini_to_anthropic(
    resp: &GenerateContentResponse,
    original_model: &str,
    tools: &ToolMapping,
) -> Result<MessagesResponse> {
    let candidate = resp.first_candidate().ok_or_else(|| no_candidates(resp))?;

    let id = message_id(resp.response_id.as_deref());
    let scope = call_scope(id.trim_start_matches("msg_"));

    let parts = candidate
        .content
        .as_ref()
        .map(|c| c.parts.as_slice())
        .unwrap_or_default();

    let mut thoughts = String::new();
    let mut thought_signature: Option<&str> = None;
    for part in parts.iter().filter(|p| p.is_thought()) {
        if let Some(ref text) = part.text {
            thoughts.push_str(text);
        }
        if thought_signature.is_none() {
            thought_signature = part.thought_signature.as_deref();
        }
    }

    let mut ordinary = parts.iter().filter(|p| !p.is_thought()).peekable();
    let mut content: Vec<ResponseContentBlock> = Vec::new();

    // The leading thinking block carries the signature of the thoughts, or of
    // the first answer part when only that one is signed.
    let mut leading_signature = thought_signature.map(str::to_string);
    if leading_signature.is_none() {
        leading_signature = ordinary
            .peek()
            .and_then(|p| p.thought_signature.clone());
    }
    let consumed_first_signature = thought_signature.is_none() && leading_signature.is_some();
    if !thoughts.is_empty() || leading_signature.is_some() {
        content.push(ResponseContentBlock::Thinking {
            thinking: thoughts,
            signature: leading_signature.unwrap_or_default(),
        });
    }

    let mut ordinal = 0;
    let mut first = true;
    let mut answered = false;
    for part in ordinary {
        let skip_signature = first && consumed_first_signature;
        first = false;

        if let (Some(signature), false) = (part.thought_signature.as_ref(), skip_signature) {
            if answered {
                // Thinking blocks only lead the answer.
                debug!("Dropping thought signature on a part after answer content");
            } else {
                content.push(ResponseContentBlock::Thinking {
                    thinking: String::new(),
                    signature: signature.clone(),
                });
            }
        }

        if let Some(ref call) = part.function_call {
            content.push(tool_use_block(call, &scope, ordinal, tools));
            ordinal += 1;
            answered = true;
        } else if let Some(ref text) = part.text {
            if !text.is_empty() {
                content.push(ResponseContentBlock::Text { text: text.clone() });
                answered = true;
            }
        }
    }

    let saw_tool_use = ordinal > 0;

    // Clients expect at least one content block
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    Ok(MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: original_model.to_string(),
        stop_reason: Some(map_finish_reason(
            candidate.finish_reason.as_deref(),
            saw_tool_use,
        )),
        stop_sequence: None,
        usage: map_usage(resp.usage_metadata.as_ref()),
    })
}

fn no_candidates(resp: &GenerateContentResponse) -> ProxyError {
    match resp
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.as_deref())
    {
        Some(reason) => {
            ProxyError::upstream_shape(format!("response has no candidates (blockReason: {reason})"))
        }
        None => ProxyError::upstream_shape("response has no candidates"),
    }
}

/// Anthropic-style message id from the upstream response id.
pub fn message_id(response_id: Option<&str>) -> String {
    match response_id.filter(|id| !id.is_empty()) {
        Some(id) => format!("msg_{id}"),
        None => format!("msg_{}", uuid::Uuid::new_v4().simple()),
    }
}

/// Build a `tool_use` block, restoring the client's tool and argument names.
pub(crate) fn tool_use_block(
    call: &FunctionCall,
    scope: &str,
    ordinal: usize,
    tools: &ToolMapping,
) -> ResponseContentBlock {
    let name = tools.original_name(&call.name);
    let id = call
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| derive_call_id(scope, ordinal, &call.name));
    ResponseContentBlock::ToolUse {
        id,
        input: tools.args_from_upstream(&call.name, &call_args(call)),
        name,
    }
}

fn call_args(call: &FunctionCall) -> Value {
    if let Some(ref args) = call.args {
        return args.clone();
    }
    match call.partial_args.as_deref() {
        Some(partial) => serde_json::from_str(partial).unwrap_or_else(|e| {
            warn!(function = %call.name, error = %e, "Unparseable function arguments");
            Value::Null
        }),
        None => Value::Null,
    }
}

/// Map a Gemini finish reason onto Anthropic's stop reasons.
pub fn map_finish_reason(reason: Option<&str>, saw_tool_use: bool) -> StopReason {
    match reason {
        Some("MAX_TOKENS") => StopReason::MaxTokens,
        Some(r) if ERROR_FINISH_REASONS.contains(&r) => StopReason::Error,
        _ if saw_tool_use => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

/// Token counters, missing ones defaulting to zero.
pub fn map_usage(usage: Option<&UsageMetadata>) -> Usage {
    let Some(u) = usage else {
        return Usage::default();
    };
    let prompt = u.prompt_token_count.unwrap_or(0);
    let cached = u.cached_content_token_count.unwrap_or(0);
    let thoughts = u.thoughts_token_count.unwrap_or(0);

    Usage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: u.candidates_token_count.unwrap_or(0) + thoughts,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: (cached > 0).then_some(cached),
        thinking_tokens: (thoughts > 0).then_some(thoughts),
    }
}
