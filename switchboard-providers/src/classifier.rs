//! Prompt classifier.
//!
//! A pure function from the message list to a complexity bucket, the
//! capability set a candidate model must cover, and a token estimate. The
//! router uses the result to filter and score candidates; nothing here
//! touches the network or any shared state.

use crate::capability::Capability;
use crate::models::{Message, Role};

/// Keyword families. Matching is case-insensitive substring search over the
/// concatenated conversation (code/math) or the last user message
/// (creative/simple-question).
const CODE_PATTERNS: &[&str] = &[
    "```",
    "function",
    "def ",
    "class ",
    "fn ",
    "import ",
    "compile",
    "debug",
    "refactor",
    "algorithm",
    "implement",
    "stack trace",
    "regex",
    "unit test",
];

const MATH_PATTERNS: &[&str] = &[
    "calculate",
    "solve",
    "equation",
    "integral",
    "derivative",
    "theorem",
    "proof",
    "probability",
    "matrix",
    "algebra",
];

const CREATIVE_PATTERNS: &[&str] = &[
    "story",
    "poem",
    "haiku",
    "fiction",
    "creative",
    "imagine",
    "lyrics",
    "screenplay",
    "brainstorm",
];

const SIMPLE_QUERY_PATTERNS: &[&str] = &[
    "what is",
    "what's",
    "who is",
    "when is",
    "when did",
    "where is",
    "how many",
    "define",
    "meaning of",
    "capital of",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Output of [`classify`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct Classification {
    pub complexity: Complexity,
    pub required_capabilities: Vec<Capability>,
    pub estimated_tokens: u32,
    /// Human-readable list of the rules that fired.
    pub reasoning: String,
}

/// Classifies a conversation. Pure: identical input yields identical output.
pub fn classify(messages: &[Message]) -> Classification {
    let full_text = messages
        .iter()
        .map(|m| m.content.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.to_lowercase())
        .unwrap_or_default();

    let total_chars: usize = messages.iter().map(|m| m.content.len()).sum();
    let estimated_tokens = total_chars.div_ceil(4) as u32;

    let mut score: i32 = 0;
    let mut capabilities = vec![Capability::General, Capability::InstructionFollowing];
    let mut reasons = Vec::new();

    let code_hits = CODE_PATTERNS
        .iter()
        .filter(|p| full_text.contains(**p))
        .count();
    if code_hits >= 2 {
        score += 3;
        capabilities.push(Capability::Code);
        reasons.push(format!("code patterns x{code_hits} (+3)"));
    } else if code_hits == 1 {
        score += 1;
        capabilities.push(Capability::Code);
        reasons.push("code pattern (+1)".to_string());
    }

    let math_hits = MATH_PATTERNS
        .iter()
        .filter(|p| full_text.contains(**p))
        .count();
    if math_hits >= 1 {
        score += 2;
        capabilities.push(Capability::Math);
        reasons.push(format!("math patterns x{math_hits} (+2)"));
    }

    let creative_hits = CREATIVE_PATTERNS
        .iter()
        .filter(|p| last_user.contains(**p))
        .count();
    if creative_hits >= 1 {
        score += 1;
        capabilities.push(Capability::Creative);
        reasons.push("creative request (+1)".to_string());
    }

    if messages.len() > 6 {
        score += 2;
        reasons.push("long conversation (+2)".to_string());
    }
    if messages.len() > 3 {
        score += 1;
        reasons.push("multi-turn conversation (+1)".to_string());
    }

    if estimated_tokens > 2000 {
        score += 2;
        reasons.push("large prompt (+2)".to_string());
    }
    if estimated_tokens > 500 {
        score += 1;
        reasons.push("sizeable prompt (+1)".to_string());
    }

    let simple_query = SIMPLE_QUERY_PATTERNS.iter().any(|p| last_user.contains(*p));
    if simple_query && messages.len() <= 2 && estimated_tokens < 100 {
        score -= 2;
        reasons.push("simple lookup question (-2)".to_string());
    }

    let score = score.max(0);
    let complexity = match score {
        0..=1 => Complexity::Simple,
        2..=4 => Complexity::Moderate,
        _ => Complexity::Complex,
    };

    capabilities.dedup();
    if reasons.is_empty() {
        reasons.push("no scoring rules fired".to_string());
    }

    Classification {
        complexity,
        required_capabilities: capabilities,
        estimated_tokens,
        reasoning: format!("score {score}: {}", reasons.join(", ")),
    }
}
