//! API translation between Anthropic Messages and Gemini `generateContent`.
//!
//! The core of the gateway: converts requests, responses, tool schemas and
//! streaming events between the two formats. All translation functions are
//! pure (no I/O).

pub mod anthropic_types;
pub mod gemini_types;
pub mod request;
pub mod response;
pub mod schema;
pub mod streaming;
pub mod tools;
