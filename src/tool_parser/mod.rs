//! Best-effort interpretation of raw assistant text: tool-call salvage,
//! argument normalization, strict tool-choice enforcement, and
//! response-format content normalization.

mod candidates;
mod extractor;
mod types;

pub use candidates::enumerate_candidates;
pub use extractor::{build_assistant_response, extract_format_value};
pub use types::{AssistantResponse, FinishReason};
