//! Translate Anthropic Messages API requests into Gemini `generateContent` requests.
//!
//! System text from every source is folded into `systemInstruction`, assistant
//! turns become `model` turns, and content blocks map onto parts in order.
//! Tool calls and results travel as `functionCall` / `functionResponse` parts
//! using the renamed declarations from [`super::tools`].

use std::collections::HashMap;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde_json::json;
use tracing::{debug, warn};

use super::anthropic_types::{
    ContentBlock, ImageSource, Message, MessagesRequest, Role, ToolChoice, ToolResultContent,
};
use super::gemini_types::{
    self as gemini, Content, FunctionCall, FunctionCallingConfig, FunctionCallingMode,
    FunctionResponse, GeminiTool, GenerateContentRequest, GenerationConfig, Part, SafetySetting,
    ToolConfig,
};
use super::tools::{convert_tools, decode_call_id, SchemaWarning, ToolMapping};
use crate::config::{ProxyConfig, ThinkingDefaults, TokenLimits, TokenPolicy};
use crate::error::{ProxyError, Result};
use crate::models::Route;

const MAX_STOP_SEQUENCES: usize = 5;

const HARM_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

/// Standard alphabet, padding optional.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A Gemini request plus what is needed to map its answer back.
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    pub body: GenerateContentRequest,
    pub tools: ToolMapping,
    pub schema_warnings: Vec<SchemaWarning>,
}

/// Translate an Anthropic request for the already-resolved `route`.
///
/// # Errors
/// `ProxyError::Validation` when there are no messages, an image cannot be
/// forwarded, or `max_tokens` is out of bounds under the `reject` policy.
pub fn anthropic_to_gemini(
    req: &MessagesRequest,
    route: &Route,
    config: &ProxyConfig,
) -> Result<TranslatedRequest> {
    if req.messages.is_empty() {
        return Err(ProxyError::validation(
            "messages: at least one message is required",
        ));
    }

    let converted = convert_tools(req.tools.as_deref().unwrap_or_default());
    let call_names = tool_use_names(&req.messages);

    let mut system_texts: Vec<String> = Vec::new();
    if let Some(ref system) = req.system {
        system_texts.push(system.as_text());
    }

    let mut contents = Vec::new();
    for msg in &req.messages {
        if msg.role == Role::System {
            system_texts.push(msg.content.text());
            continue;
        }
        if let Some(content) = translate_message(msg, &converted.mapping, &call_names)? {
            contents.push(content);
        }
    }

    if contents.is_empty() {
        return Err(ProxyError::validation(
            "messages: no user or assistant content to send",
        ));
    }

    let system_texts: Vec<String> = system_texts
        .into_iter()
        .filter(|t| !t.trim().is_empty())
        .collect();
    let system_instruction = (!system_texts.is_empty()).then(|| Content {
        role: None,
        parts: vec![Part::text(system_texts.join("\n\n"))],
    });

    let has_tools = !converted.declarations.is_empty();
    let tool_config = req
        .tool_choice
        .as_ref()
        .filter(|_| has_tools)
        .map(|tc| translate_tool_choice(tc, &converted.mapping));
    let tools = has_tools.then(|| {
        vec![GeminiTool {
            function_declarations: converted.declarations,
        }]
    });

    let generation_config = GenerationConfig {
        temperature: req.temperature.map(|t| t.clamp(0.0, 2.0)),
        top_p: req.top_p.map(|p| p.clamp(0.0, 1.0)),
        top_k: req.top_k.map(|k| k.max(1)),
        max_output_tokens: Some(apply_token_limits(req.max_tokens, &config.limits)?),
        stop_sequences: stop_sequences(req.stop_sequences.as_deref()),
        thinking_config: thinking_config(req, route, &config.thinking),
    };

    let safety_settings = HARM_CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category: (*category).to_string(),
            threshold: config.upstream.safety_threshold.clone(),
        })
        .collect();

    Ok(TranslatedRequest {
        body: GenerateContentRequest {
            contents,
            system_instruction,
            tools,
            tool_config,
            generation_config: Some(generation_config),
            safety_settings: Some(safety_settings),
        },
        tools: converted.mapping,
        schema_warnings: converted.warnings,
    })
}

/// Enforce the configured output-token bounds.
pub fn apply_token_limits(requested: u64, limits: &TokenLimits) -> Result<u64> {
    if (limits.min_tokens..=limits.max_tokens).contains(&requested) {
        return Ok(requested);
    }
    match limits.policy {
        TokenPolicy::Clamp => {
            let clamped = requested.clamp(limits.min_tokens, limits.max_tokens);
            debug!(requested, clamped, "Clamped max_tokens");
            Ok(clamped)
        }
        TokenPolicy::Reject => Err(ProxyError::validation(format!(
            "max_tokens {} is outside the allowed range {}..={}",
            requested, limits.min_tokens, limits.max_tokens
        ))),
    }
}

fn stop_sequences(requested: Option<&[String]>) -> Option<Vec<String>> {
    let sequences: Vec<String> = requested?
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect();
    if sequences.len() > MAX_STOP_SEQUENCES {
        warn!(
            count = sequences.len(),
            "Too many stop sequences, keeping the first {}", MAX_STOP_SEQUENCES
        );
    }
    let sequences: Vec<String> = sequences.into_iter().take(MAX_STOP_SEQUENCES).collect();
    (!sequences.is_empty()).then_some(sequences)
}

fn thinking_config(
    req: &MessagesRequest,
    route: &Route,
    defaults: &ThinkingDefaults,
) -> Option<gemini::ThinkingConfig> {
    let (default_enabled, default_budget) = defaults.for_tier(route.tier);
    match &req.thinking {
        None if default_enabled => Some(gemini::ThinkingConfig {
            thinking_budget: default_budget,
            include_thoughts: None,
        }),
        None => None,
        Some(t) if t.enabled => Some(gemini::ThinkingConfig {
            thinking_budget: t.budget.unwrap_or(default_budget).max(-1),
            include_thoughts: Some(t.include_thoughts.unwrap_or(true)),
        }),
        Some(_) => None,
    }
}

/// Function names of every `tool_use` in the conversation, by call id.
fn tool_use_names(messages: &[Message]) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for msg in messages {
        if let super::anthropic_types::MessageContent::Blocks(blocks) = &msg.content {
            for block in blocks {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    names.insert(id.clone(), name.clone());
                }
            }
        }
    }
    names
}

fn translate_message(
    msg: &Message,
    tools: &ToolMapping,
    call_names: &HashMap<String, String>,
) -> Result<Option<Content>> {
    let role = match msg.role {
        Role::Assistant => "model",
        Role::User | Role::System => "user",
    };

    let mut parts: Vec<Part> = Vec::new();
    // Signature of the last thinking block, owed to the next part we emit.
    let mut pending_signature: Option<String> = None;

    for block in msg.content.blocks() {
        let mut produced: Vec<Part> = match block {
            ContentBlock::Text { text } => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Part::text(text)]
                }
            }
            ContentBlock::Image { source } => vec![image_part(&source)?],
            ContentBlock::ToolUse { name, input, .. } => vec![Part::function_call(FunctionCall {
                name: tools.upstream_name(&name),
                args: Some(tools.args_to_upstream(&name, &input)),
                ..FunctionCall::default()
            })],
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => tool_result_parts(&tool_use_id, content.as_ref(), is_error, tools, call_names)?,
            ContentBlock::Thinking { signature, .. } => {
                pending_signature = signature.filter(|s| !s.is_empty());
                Vec::new()
            }
            ContentBlock::RedactedThinking { .. } => Vec::new(),
        };

        if let Some(first) = produced.first_mut() {
            if let Some(signature) = pending_signature.take() {
                first.thought_signature = Some(signature);
            }
        }
        parts.append(&mut produced);
    }

    if pending_signature.is_some() {
        debug!("Thinking signature with no following part dropped");
    }

    if parts.is_empty() {
        debug!(role, "Skipping message with no forwardable content");
        return Ok(None);
    }

    Ok(Some(Content {
        role: Some(role.to_string()),
        parts,
    }))
}

fn image_part(source: &ImageSource) -> Result<Part> {
    if source.source_type != "base64" {
        return Err(ProxyError::validation(format!(
            "image source type '{}' is not supported, send base64 data",
            source.source_type
        )));
    }
    let data = source
        .data
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ProxyError::validation("image source has no data"))?;
    let media_type = source
        .media_type
        .as_deref()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ProxyError::validation("image source has no media_type"))?;

    BASE64
        .decode(data)
        .map_err(|e| ProxyError::validation(format!("image data is not valid base64: {e}")))?;

    Ok(Part::inline_data(media_type, data))
}

fn tool_result_parts(
    tool_use_id: &str,
    content: Option<&ToolResultContent>,
    is_error: Option<bool>,
    tools: &ToolMapping,
    call_names: &HashMap<String, String>,
) -> Result<Vec<Part>> {
    let name = resolve_call_name(tool_use_id, call_names);

    let mut images = Vec::new();
    let text = match content {
        None => String::new(),
        Some(ToolResultContent::Text(t)) => t.clone(),
        Some(ToolResultContent::Blocks(blocks)) => {
            let mut texts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => texts.push(text.as_str()),
                    ContentBlock::Image { source } => images.push(image_part(source)?),
                    _ => {}
                }
            }
            texts.join("\n")
        }
    };

    let response = if is_error == Some(true) {
        json!({ "error": text })
    } else {
        json!({ "result": text })
    };

    let mut parts = vec![Part::function_response(FunctionResponse {
        id: None,
        name: tools.upstream_name(&name),
        response,
    })];
    parts.append(&mut images);
    Ok(parts)
}

/// Function name for a `tool_result`: from the matching `tool_use`, else from a
/// derived id, else the id itself.
fn resolve_call_name(tool_use_id: &str, call_names: &HashMap<String, String>) -> String {
    if let Some(name) = call_names.get(tool_use_id) {
        return name.clone();
    }
    if let Some(derived) = decode_call_id(tool_use_id) {
        return derived.name;
    }
    warn!(
        tool_use_id,
        "tool_result has no matching tool_use, using the id as function name"
    );
    tool_use_id.to_string()
}

fn translate_tool_choice(tc: &ToolChoice, tools: &ToolMapping) -> ToolConfig {
    let (mode, allowed) = match tc {
        ToolChoice::Auto => (FunctionCallingMode::Auto, None),
        ToolChoice::Any => (FunctionCallingMode::Any, None),
        ToolChoice::None => (FunctionCallingMode::None, None),
        ToolChoice::Tool { name } => match tools.declared(name) {
            Some(upstream) => (FunctionCallingMode::Any, Some(vec![upstream.to_string()])),
            None => {
                warn!(tool = %name, "tool_choice names an undeclared tool, allowing any tool");
                (FunctionCallingMode::Any, None)
            }
        },
    };
    ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode,
            allowed_function_names: allowed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tier;
    use crate::translate::anthropic_types::*;
    use serde_json::Value;

    fn request(messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 1024,
            messages,
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            tools: None,
            tool_choice: None,
            metadata: None,
            stop_sequences: None,
            thinking: None,
            extra: HashMap::default(),
        }
    }

    fn user(text: &str) -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Message {
        Message {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }

    fn big() -> Route {
        Route {
            tier: Tier::Big,
            target: "gemini-2.5-pro".to_string(),
        }
    }

    fn translate(req: &MessagesRequest) -> TranslatedRequest {
        anthropic_to_gemini(req, &big(), &ProxyConfig::default()).unwrap()
    }

    fn weather_tool() -> Tool {
        Tool {
            name: "get_weather".to_string(),
            description: Some("Weather".to_string()),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        }
    }

    #[test]
    fn test_simple_text_request() {
        let mut req = request(vec![user("Hello")]);
        req.system = Some(SystemContent::Text("You are helpful".to_string()));
        req.temperature = Some(0.3);

        let result = translate(&req);
        let body = &result.body;

        assert_eq!(body.contents.len(), 1);
        assert_eq!(body.contents[0].role.as_deref(), Some("user"));
        assert_eq!(body.contents[0].parts[0].text.as_deref(), Some("Hello"));
        assert_eq!(
            body.system_instruction.as_ref().unwrap().parts[0].text.as_deref(),
            Some("You are helpful")
        );
        let config = body.generation_config.as_ref().unwrap();
        assert_eq!(config.max_output_tokens, Some(1024));
        assert_eq!(config.temperature, Some(0.3));
        assert!(config.thinking_config.is_none());
        assert_eq!(body.safety_settings.as_ref().unwrap().len(), 5);
        assert!(body.tools.is_none());
        assert!(body.tool_config.is_none());
    }

    #[test]
    fn test_empty_messages_is_validation_error() {
        let err = anthropic_to_gemini(&request(vec![]), &big(), &ProxyConfig::default())
            .unwrap_err();
        assert!(matches!(err, ProxyError::Validation { .. }));
    }

    #[test]
    fn test_system_sources_concatenate_in_order() {
        let mut req = request(vec![
            Message {
                role: Role::System,
                content: MessageContent::Text("second".to_string()),
            },
            user("hi"),
        ]);
        req.system = Some(SystemContent::Text("first".to_string()));

        let body = translate(&req).body;
        assert_eq!(
            body.system_instruction.unwrap().parts[0].text.as_deref(),
            Some("first\n\nsecond")
        );
        assert_eq!(body.contents.len(), 1);
    }

    #[test]
    fn test_assistant_becomes_model_and_tool_flow_correlates() {
        let mut req = request(vec![
            user("Weather in Paris?"),
            blocks(
                Role::Assistant,
                vec![
                    ContentBlock::Thinking {
                        thinking: "need weather".to_string(),
                        signature: Some("sig-1".to_string()),
                    },
                    ContentBlock::ToolUse {
                        id: "toolu_01abc".to_string(),
                        name: "get_weather".to_string(),
                        input: serde_json::json!({"city": "Paris"}),
                    },
                ],
            ),
            blocks(
                Role::User,
                vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_01abc".to_string(),
                    content: Some(ToolResultContent::Text("sunny".to_string())),
                    is_error: None,
                }],
            ),
        ]);
        req.tools = Some(vec![weather_tool()]);

        let body = translate(&req).body;
        assert_eq!(body.contents.len(), 3);

        let model_turn = &body.contents[1];
        assert_eq!(model_turn.role.as_deref(), Some("model"));
        assert_eq!(model_turn.parts.len(), 1);
        let call = model_turn.parts[0].function_call.as_ref().unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.args, Some(serde_json::json!({"city": "Paris"})));
        assert_eq!(model_turn.parts[0].thought_signature.as_deref(), Some("sig-1"));

        let response = body.contents[2].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "get_weather");
        assert_eq!(response.response, serde_json::json!({"result": "sunny"}));
    }

    #[test]
    fn test_tool_result_name_from_derived_id() {
        let req = request(vec![blocks(
            Role::User,
            vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_abc123_0_read_file".to_string(),
                content: Some(ToolResultContent::Blocks(vec![
                    ContentBlock::Text {
                        text: "denied".to_string(),
                    },
                    ContentBlock::Image {
                        source: ImageSource {
                            source_type: "base64".to_string(),
                            media_type: Some("image/png".to_string()),
                            data: Some("aGVsbG8".to_string()),
                            url: None,
                        },
                    },
                ])),
                is_error: Some(true),
            }],
        )]);

        let body = translate(&req).body;
        let parts = &body.contents[0].parts;
        assert_eq!(parts.len(), 2);
        let response = parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "read_file");
        assert_eq!(response.response, serde_json::json!({"error": "denied"}));
        assert_eq!(parts[1].inline_data.as_ref().unwrap().mime_type, "image/png");
    }

    #[test]
    fn test_malformed_base64_is_validation_error() {
        let req = request(vec![blocks(
            Role::User,
            vec![ContentBlock::Image {
                source: ImageSource {
                    source_type: "base64".to_string(),
                    media_type: Some("image/png".to_string()),
                    data: Some("not base64!!".to_string()),
                    url: None,
                },
            }],
        )]);
        let err = anthropic_to_gemini(&req, &big(), &ProxyConfig::default()).unwrap_err();
        assert!(matches!(err, ProxyError::Validation { .. }));
    }

    #[test]
    fn test_url_images_are_rejected() {
        let req = request(vec![blocks(
            Role::User,
            vec![ContentBlock::Image {
                source: ImageSource {
                    source_type: "url".to_string(),
                    media_type: None,
                    data: None,
                    url: Some("https://example.com/cat.png".to_string()),
                },
            }],
        )]);
        assert!(anthropic_to_gemini(&req, &big(), &ProxyConfig::default()).is_err());
    }

    #[test]
    fn test_tool_choice_mapping() {
        let mut req = request(vec![user("hi")]);
        req.tools = Some(vec![weather_tool()]);

        let mode_for = |choice: ToolChoice| {
            let mut r = req.clone();
            r.tool_choice = Some(choice);
            translate(&r).body.tool_config.unwrap().function_calling_config
        };

        assert_eq!(mode_for(ToolChoice::Auto).mode, FunctionCallingMode::Auto);
        assert_eq!(mode_for(ToolChoice::Any).mode, FunctionCallingMode::Any);
        assert_eq!(mode_for(ToolChoice::None).mode, FunctionCallingMode::None);

        let specific = mode_for(ToolChoice::Tool {
            name: "get_weather".to_string(),
        });
        assert_eq!(specific.mode, FunctionCallingMode::Any);
        assert_eq!(
            specific.allowed_function_names,
            Some(vec!["get_weather".to_string()])
        );

        let unknown = mode_for(ToolChoice::Tool {
            name: "nope".to_string(),
        });
        assert_eq!(unknown.mode, FunctionCallingMode::Any);
        assert_eq!(unknown.allowed_function_names, None);
    }

    #[test]
    fn test_tool_choice_without_tools_is_omitted() {
        let mut req = request(vec![user("hi")]);
        req.tool_choice = Some(ToolChoice::Any);
        assert!(translate(&req).body.tool_config.is_none());
    }

    #[test]
    fn test_sampling_parameters_are_clamped() {
        let mut req = request(vec![user("hi")]);
        req.temperature = Some(3.5);
        req.top_p = Some(-0.2);
        req.top_k = Some(0);
        req.stop_sequences = Some((0..7).map(|i| format!("STOP{i}")).collect());

        let config = translate(&req).body.generation_config.unwrap();
        assert_eq!(config.temperature, Some(2.0));
        assert_eq!(config.top_p, Some(0.0));
        assert_eq!(config.top_k, Some(1));
        assert_eq!(config.stop_sequences.unwrap().len(), 5);
    }

    #[test]
    fn test_token_limits_clamp_and_reject() {
        let mut limits = TokenLimits::default();
        assert_eq!(apply_token_limits(1, &limits).unwrap(), 100);
        assert_eq!(apply_token_limits(1_000_000, &limits).unwrap(), 65_536);
        assert_eq!(apply_token_limits(500, &limits).unwrap(), 500);

        limits.policy = TokenPolicy::Reject;
        assert!(apply_token_limits(1, &limits).is_err());
        assert_eq!(apply_token_limits(500, &limits).unwrap(), 500);
    }

    #[test]
    fn test_thinking_budget_mapping() {
        let mut req = request(vec![user("hi")]);

        req.thinking = Some(ThinkingConfig {
            enabled: true,
            budget: Some(-1),
            include_thoughts: None,
        });
        let thinking = translate(&req)
            .body
            .generation_config
            .unwrap()
            .thinking_config
            .unwrap();
        assert_eq!(thinking.thinking_budget, -1);
        assert_eq!(thinking.include_thoughts, Some(true));

        req.thinking = Some(ThinkingConfig {
            enabled: true,
            budget: None,
            include_thoughts: Some(false),
        });
        let thinking = translate(&req)
            .body
            .generation_config
            .unwrap()
            .thinking_config
            .unwrap();
        assert_eq!(thinking.thinking_budget, 5000);
        assert_eq!(thinking.include_thoughts, Some(false));

        req.thinking = Some(ThinkingConfig {
            enabled: false,
            budget: Some(10_000),
            include_thoughts: None,
        });
        assert!(translate(&req)
            .body
            .generation_config
            .unwrap()
            .thinking_config
            .is_none());
    }

    #[test]
    fn test_thinking_defaults_follow_tier() {
        let mut config = ProxyConfig::default();
        config.thinking.small.enabled = true;
        let small = Route {
            tier: Tier::Small,
            target: "gemini-2.5-flash".to_string(),
        };

        let req = request(vec![user("hi")]);
        let body = anthropic_to_gemini(&req, &small, &config).unwrap().body;
        let thinking = body.generation_config.unwrap().thinking_config.unwrap();
        assert_eq!(thinking.thinking_budget, 1000);
        assert_eq!(thinking.include_thoughts, None);

        let body = anthropic_to_gemini(&req, &big(), &config).unwrap().body;
        assert!(body.generation_config.unwrap().thinking_config.is_none());
    }

    #[test]
    fn test_renamed_tools_and_arguments_are_used_in_history() {
        let mut req = request(vec![blocks(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: "toolu_x".to_string(),
                name: "fs/edit".to_string(),
                input: serde_json::json!({"file path": "/a"}),
            }],
        )]);
        req.tools = Some(vec![Tool {
            name: "fs/edit".to_string(),
            description: None,
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"file path": {"type": "string"}}
            }),
        }]);

        let translated = translate(&req);
        let call = translated.body.contents[0].parts[0]
            .function_call
            .as_ref()
            .unwrap();
        assert_eq!(call.name, "fs_edit");
        assert_eq!(call.args, Some(serde_json::json!({"file_path": "/a"})));

        let declared = &translated.body.tools.unwrap()[0].function_declarations[0];
        assert_eq!(declared.name, "fs_edit");
        let params: &Value = declared.parameters.as_ref().unwrap();
        assert!(params["properties"].get("file_path").is_some());
    }
}
