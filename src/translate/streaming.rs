//! State machine for rebuilding Anthropic SSE events from Gemini stream chunks.
//!
//! Gemini streams parts with no block framing. The [`StreamReconstructor`]
//! turns each part into a [`Fragment`] and feeds it through one transition
//! function, emitting `content_block_start` / `delta` / `stop` around it.
//! Text passes through fragment by fragment. Function call arguments are held
//! back until the call is complete and then sent as a single delta.
//!
//! Whatever happens upstream, the emitted sequence has one `message_start`,
//! matching start/stop pairs for every block and ends with `message_delta`
//! followed by `message_stop`.

use serde_json::Value;
use tracing::{debug, warn};

use super::anthropic_types::{
    Delta, DeltaUsage, ErrorBody, MessageDeltaBody, MessagesResponse, ResponseContentBlock,
    StopReason, StreamEvent, Usage,
};
use super::gemini_types::{FunctionCall, GenerateContentResponse, Part, UsageMetadata};
use super::response::{map_finish_reason, map_usage, message_id};
use super::tools::{call_scope, derive_call_id, ToolMapping};
use crate::error::ProxyError;
use crate::retry::classify_api_error;

#[derive(Debug)]
enum Phase {
    /// Nothing received yet.
    Idle,
    /// `message_start` sent, no block open.
    Open,
    Thinking {
        index: usize,
        signature: Option<String>,
    },
    Text {
        index: usize,
    },
    /// A `tool_use` block is open and its arguments are still arriving.
    ToolArgs {
        index: usize,
        name: String,
        buffer: String,
    },
    Terminal,
}

/// One unit of upstream output, or the end of it.
#[derive(Debug)]
enum Fragment {
    Thought {
        text: String,
        signature: Option<String>,
    },
    Text {
        text: String,
        signature: Option<String>,
    },
    Call {
        call: FunctionCall,
        signature: Option<String>,
    },
    End,
    Fail(ErrorBody),
}

impl Fragment {
    fn from_part(part: &Part) -> Option<Self> {
        let signature = part.thought_signature.clone().filter(|s| !s.is_empty());
        if let Some(ref call) = part.function_call {
            return Some(Fragment::Call {
                call: call.clone(),
                signature,
            });
        }
        if part.is_thought() {
            return Some(Fragment::Thought {
                text: part.text.clone().unwrap_or_default(),
                signature,
            });
        }
        if part.text.is_some() || signature.is_some() {
            return Some(Fragment::Text {
                text: part.text.clone().unwrap_or_default(),
                signature,
            });
        }
        debug!("Ignoring stream part with no text or function call");
        None
    }
}

/// Rebuilds one Anthropic event stream from one Gemini stream.
///
/// Usage:
///   let mut stream = StreamReconstructor::new("claude-sonnet-4-20250514", mapping);
///   for chunk in gemini_chunks {
///       let events = stream.process_chunk(&chunk);
///       // send each event as SSE
///   }
///   let final_events = stream.finish();
#[derive(Debug)]
pub struct StreamReconstructor {
    model: String,
    tools: ToolMapping,
    msg_id: String,
    scope: String,
    phase: Phase,
    next_index: usize,
    ordinary_started: bool,
    call_ordinal: usize,
    saw_tool_use: bool,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
    emitted_chars: usize,
    stop_reason: Option<StopReason>,
}

impl StreamReconstructor {
    pub fn new(model: &str, tools: ToolMapping) -> Self {
        Self {
            model: model.to_string(),
            tools,
            msg_id: String::new(),
            scope: String::new(),
            phase: Phase::Idle,
            next_index: 0,
            ordinary_started: false,
            call_ordinal: 0,
            saw_tool_use: false,
            finish_reason: None,
            usage: None,
            emitted_chars: 0,
            stop_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Terminal)
    }

    /// Stop reason of the final `message_delta`, once one was emitted.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Feed one upstream chunk, returning the events it produces.
    pub fn process_chunk(&mut self, chunk: &GenerateContentResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.is_terminal() {
            debug_assert!(false, "chunk received after the stream terminated");
            return events;
        }

        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(usage);
        }
        self.ensure_started(chunk, &mut events);

        if let Some(ref api_error) = chunk.error {
            let err = classify_api_error(api_error);
            self.step(Fragment::Fail(error_body(&err)), &mut events);
            return events;
        }

        let Some(candidate) = chunk.first_candidate() else {
            if let Some(reason) = chunk
                .prompt_feedback
                .as_ref()
                .and_then(|f| f.block_reason.as_deref())
            {
                let err = ProxyError::upstream_shape(format!("prompt blocked (blockReason: {reason})"));
                self.step(Fragment::Fail(error_body(&err)), &mut events);
            }
            return events;
        };

        if let Some(ref content) = candidate.content {
            for part in &content.parts {
                if let Some(fragment) = Fragment::from_part(part) {
                    self.step(fragment, &mut events);
                }
                if self.is_terminal() {
                    return events;
                }
            }
        }

        if let Some(ref reason) = candidate.finish_reason {
            self.finish_reason = Some(reason.clone());
        }
        events
    }

    /// The upstream stream ended normally.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.is_terminal() {
            return events;
        }
        if matches!(self.phase, Phase::Idle) {
            self.ensure_started(&GenerateContentResponse::default(), &mut events);
            let err = ProxyError::stream_integrity("upstream stream ended before any chunk");
            self.step(Fragment::Fail(error_body(&err)), &mut events);
        } else {
            self.step(Fragment::End, &mut events);
        }
        events
    }

    /// The upstream stream failed. Closes whatever is open and reports `err` in-band.
    pub fn fail(&mut self, err: &ProxyError) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.is_terminal() {
            return events;
        }
        self.ensure_started(&GenerateContentResponse::default(), &mut events);
        self.step(Fragment::Fail(error_body(err)), &mut events);
        events
    }

    fn ensure_started(&mut self, chunk: &GenerateContentResponse, events: &mut Vec<StreamEvent>) {
        if !matches!(self.phase, Phase::Idle) {
            return;
        }
        self.msg_id = message_id(chunk.response_id.as_deref());
        self.scope = call_scope(self.msg_id.trim_start_matches("msg_"));

        let input_tokens = map_usage(chunk.usage_metadata.as_ref()).input_tokens;
        events.push(StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens,
                    ..Usage::default()
                },
            },
        });
        self.phase = Phase::Open;
    }

    /// The transition function. Every state change goes through here.
    fn step(&mut self, fragment: Fragment, events: &mut Vec<StreamEvent>) {
        let phase = std::mem::replace(&mut self.phase, Phase::Terminal);
        match (phase, fragment) {
            (phase @ (Phase::Idle | Phase::Terminal), fragment) => {
                debug_assert!(false, "{fragment:?} fed to a stream in phase {phase:?}");
                self.phase = phase;
            }

            // Thoughts open a thinking block, but only ahead of any answer content.
            (Phase::Open, Fragment::Thought { text, signature }) => {
                if self.ordinary_started {
                    debug!(chars = text.len(), "Dropping thought after answer content started");
                    self.phase = Phase::Open;
                    return;
                }
                let index = self.open_block(
                    ResponseContentBlock::Thinking {
                        thinking: String::new(),
                        signature: String::new(),
                    },
                    events,
                );
                self.thinking_delta(index, text, events);
                self.phase = Phase::Thinking { index, signature };
            }
            (
                Phase::Thinking {
                    index,
                    signature: held,
                },
                Fragment::Thought { text, signature },
            ) => {
                self.thinking_delta(index, text, events);
                self.phase = Phase::Thinking {
                    index,
                    signature: held.or(signature),
                };
            }
            (phase @ (Phase::Text { .. } | Phase::ToolArgs { .. }), Fragment::Thought { text, .. }) => {
                debug!(chars = text.len(), "Dropping thought inside an open block");
                self.phase = phase;
            }

            (Phase::Open, Fragment::Text { text, signature }) => {
                if let Some(signature) = signature {
                    self.signature_block(signature, events);
                }
                if text.is_empty() {
                    self.phase = Phase::Open;
                    return;
                }
                let index = self.open_block(
                    ResponseContentBlock::Text {
                        text: String::new(),
                    },
                    events,
                );
                self.ordinary_started = true;
                self.text_delta(index, text, events);
                self.phase = Phase::Text { index };
            }
            (Phase::Text { index }, Fragment::Text { text, signature }) => {
                if signature.is_some() {
                    debug!("Dropping signature that arrived inside a text block");
                }
                self.text_delta(index, text, events);
                self.phase = Phase::Text { index };
            }
            (phase @ Phase::ToolArgs { .. }, Fragment::Text { text, .. }) => {
                self.phase = phase;
                if !text.is_empty() {
                    let err = ProxyError::stream_integrity(
                        "text arrived before the pending function call was complete",
                    );
                    self.step(Fragment::Fail(error_body(&err)), events);
                }
            }

            (Phase::Open, Fragment::Call { call, signature }) => {
                if let Some(signature) = signature {
                    self.signature_block(signature, events);
                }
                self.start_call(call, events);
            }
            (
                Phase::ToolArgs {
                    index,
                    name,
                    mut buffer,
                },
                Fragment::Call { call, .. },
            ) => {
                if !call.name.is_empty() && call.name != name {
                    self.phase = Phase::ToolArgs {
                        index,
                        name: name.clone(),
                        buffer,
                    };
                    let err = ProxyError::stream_integrity(format!(
                        "function call '{}' interleaved with pending call '{}'",
                        call.name, name
                    ));
                    self.step(Fragment::Fail(error_body(&err)), events);
                    return;
                }
                if let Some(ref partial) = call.partial_args {
                    buffer.push_str(partial);
                }
                if call.will_continue == Some(true) {
                    self.phase = Phase::ToolArgs {
                        index,
                        name,
                        buffer,
                    };
                    return;
                }
                let args = match call.args {
                    Some(args) => Ok(args),
                    None => parse_arguments(&buffer),
                };
                match args {
                    Ok(args) => {
                        self.finish_call(index, &name, &args, events);
                        self.phase = Phase::Open;
                    }
                    Err(message) => {
                        self.phase = Phase::ToolArgs {
                            index,
                            name,
                            buffer,
                        };
                        let err = ProxyError::stream_integrity(message);
                        self.step(Fragment::Fail(error_body(&err)), events);
                    }
                }
            }

            // Ordinary content after an open block: close it, then start over from Open.
            (
                phase @ (Phase::Thinking { .. } | Phase::Text { .. }),
                Fragment::Text { text, signature },
            ) => {
                let signature = self.close_block(phase, signature, events);
                self.phase = Phase::Open;
                self.step(Fragment::Text { text, signature }, events);
            }
            (
                phase @ (Phase::Thinking { .. } | Phase::Text { .. }),
                Fragment::Call { call, signature },
            ) => {
                let signature = self.close_block(phase, signature, events);
                self.phase = Phase::Open;
                self.step(Fragment::Call { call, signature }, events);
            }

            (phase @ Phase::ToolArgs { .. }, Fragment::End) => {
                self.phase = phase;
                let err =
                    ProxyError::stream_integrity("stream ended inside an incomplete function call");
                self.step(Fragment::Fail(error_body(&err)), events);
            }
            (phase, Fragment::End) => {
                self.close_block(phase, None, events);
                if self.finish_reason.is_none() {
                    warn!(message_id = %self.msg_id, "Upstream stream ended without a finish reason");
                }
                let stop_reason =
                    map_finish_reason(self.finish_reason.as_deref(), self.saw_tool_use);
                self.terminate(stop_reason, None, events);
            }

            (phase, Fragment::Fail(body)) => {
                self.close_block(phase, None, events);
                warn!(
                    message_id = %self.msg_id,
                    error = %body.message,
                    "Terminating stream with error"
                );
                self.terminate(StopReason::Error, Some(body), events);
            }
        }
    }

    fn open_block(&mut self, block: ResponseContentBlock, events: &mut Vec<StreamEvent>) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: block,
        });
        index
    }

    /// Close `phase`'s block. Returns `next_signature` unless the block used it.
    fn close_block(
        &mut self,
        phase: Phase,
        next_signature: Option<String>,
        events: &mut Vec<StreamEvent>,
    ) -> Option<String> {
        match phase {
            Phase::Thinking { index, signature } => {
                let (signature, leftover) = match signature {
                    Some(own) => (Some(own), next_signature),
                    None => (next_signature, None),
                };
                if let Some(signature) = signature {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: Delta::SignatureDelta { signature },
                    });
                }
                events.push(StreamEvent::ContentBlockStop { index });
                leftover
            }
            Phase::Text { index } | Phase::ToolArgs { index, .. } => {
                events.push(StreamEvent::ContentBlockStop { index });
                next_signature
            }
            Phase::Idle | Phase::Open | Phase::Terminal => next_signature,
        }
    }

    /// A thinking block holding only a signature, for signed answer parts.
    /// Thinking blocks only lead the answer, so later signatures are dropped.
    fn signature_block(&mut self, signature: String, events: &mut Vec<StreamEvent>) {
        if self.ordinary_started {
            debug!(chars = signature.len(), "Dropping thought signature after answer content started");
            return;
        }
        let index = self.open_block(
            ResponseContentBlock::Thinking {
                thinking: String::new(),
                signature: String::new(),
            },
            events,
        );
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::SignatureDelta { signature },
        });
        events.push(StreamEvent::ContentBlockStop { index });
    }

    fn text_delta(&mut self, index: usize, text: String, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.emitted_chars += text.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta { text },
        });
    }

    fn thinking_delta(&mut self, index: usize, thinking: String, events: &mut Vec<StreamEvent>) {
        if thinking.is_empty() {
            return;
        }
        self.emitted_chars += thinking.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::ThinkingDelta { thinking },
        });
    }

    /// Open a `tool_use` block. Complete calls are closed right away; calls
    /// marked `willContinue` wait in [`Phase::ToolArgs`].
    fn start_call(&mut self, call: FunctionCall, events: &mut Vec<StreamEvent>) {
        let name = self.tools.original_name(&call.name);
        let id = call
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| derive_call_id(&self.scope, self.call_ordinal, &call.name));
        self.call_ordinal += 1;
        self.saw_tool_use = true;
        self.ordinary_started = true;

        let index = self.open_block(
            ResponseContentBlock::ToolUse {
                id,
                name,
                input: Value::Object(serde_json::Map::new()),
            },
            events,
        );

        if call.will_continue == Some(true) {
            self.phase = Phase::ToolArgs {
                index,
                name: call.name,
                buffer: call.partial_args.unwrap_or_default(),
            };
            return;
        }

        let args = match call.args {
            Some(args) => Ok(args),
            None => parse_arguments(call.partial_args.as_deref().unwrap_or_default()),
        };
        match args {
            Ok(args) => {
                self.finish_call(index, &call.name, &args, events);
                self.phase = Phase::Open;
            }
            Err(message) => {
                self.phase = Phase::ToolArgs {
                    index,
                    name: call.name,
                    buffer: String::new(),
                };
                let err = ProxyError::stream_integrity(message);
                self.step(Fragment::Fail(error_body(&err)), events);
            }
        }
    }

    /// Emit the assembled arguments as one delta and close the block.
    fn finish_call(
        &mut self,
        index: usize,
        upstream_name: &str,
        args: &Value,
        events: &mut Vec<StreamEvent>,
    ) {
        let restored = self.tools.args_from_upstream(upstream_name, args);
        let partial_json = restored.to_string();
        self.emitted_chars += partial_json.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJsonDelta { partial_json },
        });
        events.push(StreamEvent::ContentBlockStop { index });
    }

    fn terminate(
        &mut self,
        stop_reason: StopReason,
        error: Option<ErrorBody>,
        events: &mut Vec<StreamEvent>,
    ) {
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
                error,
            },
            usage: self.final_usage(),
        });
        events.push(StreamEvent::MessageStop);
        self.stop_reason = Some(stop_reason);
        self.phase = Phase::Terminal;
    }

    /// Last cumulative counters from upstream, else an estimate from emitted text.
    fn final_usage(&self) -> DeltaUsage {
        match self.usage {
            Some(ref metadata) if metadata.candidates_token_count.is_some() => {
                let usage = map_usage(Some(metadata));
                DeltaUsage {
                    input_tokens: Some(usage.input_tokens),
                    output_tokens: usage.output_tokens,
                }
            }
            ref metadata => DeltaUsage {
                input_tokens: metadata
                    .as_ref()
                    .map(|m| map_usage(Some(m)).input_tokens),
                output_tokens: self.emitted_chars.div_ceil(4) as u64,
            },
        }
    }
}

fn parse_arguments(buffer: &str) -> std::result::Result<Value, String> {
    if buffer.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    match serde_json::from_str::<Value>(buffer) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err("function call arguments are not a JSON object".to_string()),
        Err(e) => Err(format!("function call arguments are not valid JSON: {e}")),
    }
}

fn error_body(err: &ProxyError) -> ErrorBody {
    err.to_error_response().1.error
}
