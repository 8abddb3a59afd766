//! Demonstrate using the translation layer without a server.
//!
//! Usage:
//!   `cargo run --example translate_only`

use claude_gemini_proxy::config::ProxyConfig;
use claude_gemini_proxy::models::ModelRouter;
use claude_gemini_proxy::translate::anthropic_types::MessagesRequest;
use claude_gemini_proxy::translate::gemini_types::GenerateContentResponse;
use claude_gemini_proxy::translate::request::anthropic_to_gemini;
use claude_gemini_proxy::translate::response::gemini_to_anthropic;
use claude_gemini_proxy::translate::streaming::StreamReconstructor;
use serde_json::json;

fn main() {
    let config = ProxyConfig::default();
    let router = ModelRouter::new(&config.models);

    // An Anthropic Messages API request, as Claude Code sends it
    let anthropic_req: MessagesRequest = serde_json::from_value(json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 1024,
        "stream": true,
        "system": "You are a geography expert. Be concise.",
        "tools": [{
            "name": "lookup_capital",
            "description": "Find the capital city of a country",
            "input_schema": {
                "type": "object",
                "properties": {"country": {"type": "string", "format": "country-name"}},
                "required": ["country"],
                "additionalProperties": false
            }
        }],
        "messages": [
            {"role": "user", "content": "What is the capital of France?"},
            {"role": "assistant", "content": "The capital of France is Paris."},
            {"role": "user", "content": "And Germany?"}
        ]
    }))
    .unwrap();

    let route = router.resolve(&anthropic_req.model);
    let translated = anthropic_to_gemini(&anthropic_req, &route, &config).unwrap();

    println!("=== Routed {} -> {} ({:?}) ===", anthropic_req.model, route.target, route.tier);
    println!("{}", serde_json::to_string_pretty(&translated.body).unwrap());
    for warning in &translated.schema_warnings {
        println!(
            "  dropped `{}` at {} in tool {}",
            warning.feature.keyword, warning.feature.path, warning.tool
        );
    }

    // Simulate a Gemini response and translate back
    let gemini_resp: GenerateContentResponse = serde_json::from_value(json!({
        "candidates": [{
            "content": {"role": "model", "parts": [
                {"text": "Let me look that up."},
                {"functionCall": {"name": "lookup_capital", "args": {"country": "Germany"}}}
            ]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {"promptTokenCount": 42, "candidatesTokenCount": 8},
        "responseId": "demo1"
    }))
    .unwrap();

    let anthropic_resp =
        gemini_to_anthropic(&gemini_resp, &anthropic_req.model, &translated.tools).unwrap();

    println!();
    println!("=== Translated Response (Anthropic format) ===");
    println!("{}", serde_json::to_string_pretty(&anthropic_resp).unwrap());

    // Rebuild an Anthropic event stream from Gemini SSE chunks
    println!();
    println!("=== Streaming Reconstruction Demo ===");

    let mut reconstructor = StreamReconstructor::new(&anthropic_req.model, translated.tools);

    let chunks = [
        json!({"candidates": [{"content": {"parts": [{"text": "The"}]}}], "responseId": "demo2"}),
        json!({"candidates": [{"content": {"parts": [{"text": " capital"}]}}], "responseId": "demo2"}),
        json!({
            "candidates": [{"content": {"parts": [{"text": " is Berlin."}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 42, "candidatesTokenCount": 5},
            "responseId": "demo2"
        }),
    ];

    for (i, chunk) in chunks.into_iter().enumerate() {
        let chunk: GenerateContentResponse = serde_json::from_value(chunk).unwrap();
        for event in reconstructor.process_chunk(&chunk) {
            println!("  chunk {} -> event: {}", i, event.event_name());
        }
    }

    for event in reconstructor.finish() {
        println!("  finish -> event: {}", event.event_name());
    }

    println!();
    println!("Done! The translation layer works without any network calls.");
}
