//! Extraction prompt and defensive parsing of the model's reply.
//!
//! The reply is expected to be a JSON array of candidate facts, or an object
//! with a `facts` array. Models wrap JSON in code fences or prose often
//! enough that both are tolerated. Anything that still does not parse is
//! zero candidates, never an error.

use std::sync::LazyLock;

use keeper_core::{ConversationMessage, ExtractedFact, Message};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

/// Longest slice of an unparseable reply included in the warning.
const SAMPLE_CHARS: usize = 200;

/// System prompt for the extraction call.
pub const EXTRACTION_PROMPT: &str = r#"You extract durable memories from a conversation transcript.

Return ONLY a JSON array. Each element is an object with these fields:
- "content": the fact, written so it makes sense without the transcript
- "summary": one short line describing the fact
- "kind": one of "fact", "preference", "decision", "insight", "lesson", "rule", "mistake"
- "category": a short free-form topic label
- "importance": number from 0.0 (trivia) to 1.0 (must never be forgotten)
- "confidence": number from 0.0 to 1.0
- "entities": names of people, systems, or instruments the fact mentions

Only record information worth remembering in future conversations: stated
preferences, decisions and their reasons, lessons from mistakes, and stable
facts about the user's work. Skip greetings, chit-chat, and anything that
only matters inside this exchange. If nothing qualifies, return []."#;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)```").unwrap());

/// Render a batch as `[role]: content` lines, oldest first.
pub fn transcript(messages: &[ConversationMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the extraction call for a transcript.
pub fn extraction_request(transcript: &str) -> Vec<Message> {
    vec![
        Message::system(EXTRACTION_PROMPT),
        Message::user(format!("Transcript:\n\n{transcript}")),
    ]
}

/// Parse a reply into candidates.
///
/// Items that fail to deserialize or carry no content are skipped.
/// Importance and confidence are clamped to `0.0..=1.0`; a missing summary
/// falls back to the content.
pub fn parse_candidates(raw: &str) -> Vec<ExtractedFact> {
    let Some(value) = parse_json_payload(raw) else {
        if !raw.trim().is_empty() {
            let sample: String = raw.chars().take(SAMPLE_CHARS).collect();
            warn!(sample = %sample, "extraction reply is not valid JSON, treating as zero facts");
        }
        return Vec::new();
    };

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("facts") {
            Some(Value::Array(items)) => items,
            _ => {
                warn!("extraction reply has no facts array, treating as zero facts");
                return Vec::new();
            }
        },
        _ => {
            warn!("extraction reply is not an array, treating as zero facts");
            return Vec::new();
        }
    };

    let total = items.len();
    let candidates: Vec<ExtractedFact> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<ExtractedFact>(item).ok())
        .filter_map(normalize)
        .collect();
    if candidates.len() < total {
        debug!(total, kept = candidates.len(), "skipped malformed candidates");
    }
    candidates
}

fn parse_json_payload(raw: &str) -> Option<Value> {
    let body = CODE_FENCE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map_or(raw, |m| m.as_str())
        .trim();
    if body.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(body) {
        return Some(value);
    }

    // Prose around the payload: take the widest bracketed span.
    let start = body.find(['[', '{'])?;
    let end = body.rfind([']', '}'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&body[start..=end]).ok()
}

fn normalize(mut fact: ExtractedFact) -> Option<ExtractedFact> {
    fact.content = fact.content.trim().to_string();
    if fact.content.is_empty() {
        return None;
    }
    fact.summary = fact.summary.trim().to_string();
    if fact.summary.is_empty() {
        fact.summary.clone_from(&fact.content);
    }
    fact.importance = clamp_unit(fact.importance);
    fact.confidence = fact.confidence.map(clamp_unit);
    Some(fact)
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 }
}
