use crate::error::ErrorKind;
use crate::scoring::Verdict;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Token usage reported by the model service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the request
    pub prompt_token_count: u64,
    /// Tokens in the generated answer
    pub candidates_token_count: u64,
    /// Reasoning tokens, 0 when the service does not report them
    pub thoughts_token_count: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_token_count += other.prompt_token_count;
        self.candidates_token_count += other.candidates_token_count;
        self.thoughts_token_count += other.thoughts_token_count;
    }

    pub fn total(&self) -> u64 {
        self.prompt_token_count + self.candidates_token_count + self.thoughts_token_count
    }
}

impl std::iter::Sum for TokenUsage {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), |mut acc, usage| {
            acc.add(&usage);
            acc
        })
    }
}

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One piece of message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Base64-encoded PNG
    PngImage { data: String },
}

/// A role-tagged message sent to the model service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// A user message holding a single screenshot
    pub fn user_image(png_base64: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::PngImage {
                data: png_base64.into(),
            }],
        }
    }

    pub fn image_count(&self) -> usize {
        self.content
            .iter()
            .filter(|part| matches!(part, ContentPart::PngImage { .. }))
            .count()
    }

    /// Concatenated text parts
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::PngImage { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Copy with image payloads replaced by a short placeholder, for persisting.
    pub fn without_images(&self) -> Self {
        let content = self
            .content
            .iter()
            .map(|part| match part {
                ContentPart::PngImage { .. } => ContentPart::Text {
                    text: "<image>".to_string(),
                },
                text => text.clone(),
            })
            .collect();
        Self {
            role: self.role,
            content,
        }
    }
}

/// Request to the model service
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Model identifier
    pub model: String,
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f64,
}

/// Reply from the model service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    /// Generated text
    pub content: String,
    /// Token usage of this call
    pub usage: TokenUsage,
}

/// Which side of a comparison a candidate is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Candidate {
    A,
    B,
}

impl Candidate {
    pub const BOTH: [Candidate; 2] = [Candidate::A, Candidate::B];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of judge work, built from a dataset record
#[derive(Debug, Clone, PartialEq)]
pub struct TaskItem {
    /// Dataset question identifier
    pub question_id: String,
    /// The user's original request
    pub user_query: String,
    /// Set in pointwise mode, where each candidate is its own item
    pub candidate: Option<Candidate>,
    /// One code artifact in pointwise mode, two (A then B) in pairwise mode
    pub codes: Vec<String>,
    /// Screenshots in the same order as `codes`, when images are used
    pub screenshots: Vec<PathBuf>,
    /// Ground-truth label of the comparison
    pub label: Verdict,
}

/// Outcome of one model call inside the retry loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Sampling temperature used
    pub temperature: f64,
    /// Why the attempt was rejected, `None` for the accepted attempt
    pub error: Option<ErrorKind>,
}

/// Final state of a judged item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Ok,
    Failed,
}

/// Persisted judge output, one JSONL line per item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeRecord {
    /// Dataset question identifier
    pub question_id: String,
    /// Judged candidate in pointwise mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
    /// Last raw model answer
    pub model_response: Option<String>,
    /// Token usage summed over every attempt
    pub metadata: TokenUsage,
    /// Every model call made for this item
    pub attempts: Vec<AttemptRecord>,
    /// Whether the item produced a usable judgment
    pub status: ItemStatus,
    /// Error of the last attempt when the item failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

/// A predicted verdict, or the marker of an item that could not be judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prediction {
    ModelA,
    ModelB,
    Tie,
    Error,
}

impl From<Verdict> for Prediction {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::ModelA => Self::ModelA,
            Verdict::ModelB => Self::ModelB,
            Verdict::Tie => Self::Tie,
        }
    }
}

impl Prediction {
    pub fn verdict(self) -> Option<Verdict> {
        match self {
            Self::ModelA => Some(Verdict::ModelA),
            Self::ModelB => Some(Verdict::ModelB),
            Self::Tie => Some(Verdict::Tie),
            Self::Error => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModelA => "model_a",
            Self::ModelB => "model_b",
            Self::Tie => "tie",
            Self::Error => "error",
        }
    }
}

/// Prediction row persisted next to a batch report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub question_id: String,
    pub label: Verdict,
    pub pred: Prediction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_usage_sum() {
        let usages = vec![
            TokenUsage {
                prompt_token_count: 10,
                candidates_token_count: 5,
                thoughts_token_count: 0,
            },
            TokenUsage {
                prompt_token_count: 3,
                candidates_token_count: 2,
                thoughts_token_count: 7,
            },
        ];
        let total: TokenUsage = usages.into_iter().sum();
        assert_eq!(total.prompt_token_count, 13);
        assert_eq!(total.thoughts_token_count, 7);
        assert_eq!(total.total(), 27);
    }

    #[test]
    fn test_without_images_keeps_text() {
        let message = ChatMessage {
            role: Role::User,
            content: vec![
                ContentPart::Text {
                    text: "look".to_string(),
                },
                ContentPart::PngImage {
                    data: "aGVsbG8=".to_string(),
                },
            ],
        };
        assert_eq!(message.image_count(), 1);
        let stripped = message.without_images();
        assert_eq!(stripped.image_count(), 0);
        assert_eq!(stripped.joined_text(), "look\n<image>");
    }

    #[test]
    fn test_judge_record_serialization() {
        let record = JudgeRecord {
            question_id: "q1".to_string(),
            candidate: Some(Candidate::B),
            model_response: Some("raw".to_string()),
            metadata: TokenUsage::default(),
            attempts: vec![AttemptRecord {
                temperature: 0.0,
                error: Some(ErrorKind::NoJsonFound),
            }],
            status: ItemStatus::Failed,
            error: Some(ErrorKind::NoJsonFound),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["candidate"], json!("b"));
        assert_eq!(value["status"], json!("failed"));
        assert_eq!(value["error"], json!("no_json_found"));
        let parsed: JudgeRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_prediction_row_format() {
        let row = PredictionRow {
            question_id: "q7".to_string(),
            label: Verdict::Tie,
            pred: Prediction::from(Verdict::ModelA),
        };
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            json!({"question_id": "q7", "label": "tie", "pred": "model_a"})
        );
        assert_eq!(Prediction::Error.verdict(), None);
    }
}
