//! Rule-based message classification
//!
//! Assigns an intent and a priority to each inbound message. The ingest
//! path raises the conversation priority to the classified priority; it
//! never lowers it.

use crate::types::{ParsedMessage, Priority};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Support,
    Sales,
    Billing,
    Complaint,
    Unsubscribe,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Support => "support",
            Intent::Sales => "sales",
            Intent::Billing => "billing",
            Intent::Complaint => "complaint",
            Intent::Unsubscribe => "unsubscribe",
            Intent::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    pub priority: Priority,
}

pub trait MessageClassifier: Send + Sync {
    fn classify(&self, message: &ParsedMessage) -> Classification;
}

/// Keyword matcher over subject and body
pub struct KeywordClassifier {
    /// Checked in order; first intent with a hit wins
    intents: Vec<(Intent, Vec<String>)>,
    urgent: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let words = |ws: &[&str]| ws.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        Self {
            intents: vec![
                (Intent::Unsubscribe, words(&["unsubscribe", "stop", "opt out", "opt-out"])),
                (
                    Intent::Complaint,
                    words(&["refund", "complaint", "terrible", "disappointed", "cancel my"]),
                ),
                (Intent::Billing, words(&["invoice", "billing", "charged", "payment", "receipt"])),
                (
                    Intent::Support,
                    words(&["help", "issue", "problem", "error", "broken", "not working"]),
                ),
                (
                    Intent::Sales,
                    words(&["pricing", "price", "quote", "demo", "interested", "buy"]),
                ),
            ],
            urgent: words(&["urgent", "asap", "emergency", "immediately", "right now"]),
        }
    }
}

impl KeywordClassifier {
    fn matches(haystack: &str, needle: &str) -> bool {
        // Single words must match whole tokens so "stop" does not hit "stopwatch"
        if needle.contains(' ') || needle.contains('-') {
            return haystack.contains(needle);
        }
        haystack
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| token == needle)
    }
}

impl MessageClassifier for KeywordClassifier {
    fn classify(&self, message: &ParsedMessage) -> Classification {
        let text = match &message.subject {
            Some(subject) => format!("{} {}", subject, message.body),
            None => message.body.clone(),
        }
        .to_lowercase();

        let intent = self
            .intents
            .iter()
            .find(|(_, words)| words.iter().any(|w| Self::matches(&text, w)))
            .map(|(intent, _)| *intent)
            .unwrap_or(Intent::General);

        let priority = if self.urgent.iter().any(|w| Self::matches(&text, w)) {
            Priority::Urgent
        } else {
            match intent {
                Intent::Complaint | Intent::Billing => Priority::High,
                Intent::Unsubscribe => Priority::Low,
                _ => Priority::Normal,
            }
        };

        Classification { intent, priority }
    }
}
