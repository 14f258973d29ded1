//! Client dialect → canonical model.

pub mod claude;
pub mod gemini;
pub mod openai;

use crate::dialect::{ThinkLevel, Thinking};

/// gemini-3 era models take discrete thinking levels; everything older takes
/// a numeric budget.
pub fn model_uses_thinking_levels(model: &str) -> bool {
    model.to_ascii_lowercase().contains("gemini-3")
}

pub(crate) fn model_supports_thinking(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    model.contains("gemini-2.5") || model.contains("gemini-3") || model.contains("claude")
}

/// Effort-token mapping. Budget-family models get an integer budget; the
/// level family gets a discrete level. `auto` defers to the upstream default
/// in both families.
pub(crate) fn thinking_from_effort(effort: crosswire_protocol::openai::ReasoningEffort, model: &str) -> Option<Thinking> {
    use crosswire_protocol::openai::ReasoningEffort as Effort;

    if model_uses_thinking_levels(model) {
        let level = match effort {
            Effort::None | Effort::Auto => return None,
            Effort::Minimal => ThinkLevel::Minimal,
            Effort::Low => ThinkLevel::Low,
            Effort::Medium => ThinkLevel::Medium,
            Effort::High => ThinkLevel::High,
        };
        return Some(Thinking::Level(level));
    }

    let tokens = match effort {
        Effort::None => 0,
        Effort::Auto => return None,
        Effort::Minimal | Effort::Low => 1024,
        Effort::Medium => 8192,
        Effort::High => 24576,
    };
    Some(Thinking::Budget {
        tokens,
        include_thoughts: tokens > 0,
    })
}
