//! Bounded retries with escalating sampling temperature.

use crate::error::{ErrorKind, Result};
use crate::evaluation::ModelClient;
use crate::models::{AttemptRecord, ModelRequest, TokenUsage};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// How often, and how hot, to re-ask the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_temperature: f64,
    pub temperature_step: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_temperature: 0.0,
            temperature_step: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Temperature of the zero-based `attempt`
    pub fn temperature_for(&self, attempt: usize) -> f64 {
        self.initial_temperature + self.temperature_step * attempt as f64
    }
}

/// Everything the retry loop learned about one item
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    /// The first answer that passed validation
    pub parsed: Option<T>,
    /// Text of the last answer received, valid or not
    pub raw: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    /// Usage summed over every answered attempt
    pub usage: TokenUsage,
}

impl<T> RetryOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.parsed.is_some()
    }

    /// Rejection reason of the final attempt
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.attempts.last().and_then(|attempt| attempt.error)
    }
}

/// Ask `client` until `validate` accepts an answer or the policy runs out.
///
/// Server failures and validation failures both consume an attempt. Never
/// fails: exhaustion is reported through an outcome without `parsed`.
pub async fn generate_validated<T, F>(
    client: &dyn ModelClient,
    policy: &RetryPolicy,
    request: &ModelRequest,
    item_id: &str,
    validate: F,
) -> RetryOutcome<T>
where
    F: Fn(&str) -> Result<T>,
{
    let mut outcome = RetryOutcome {
        parsed: None,
        raw: None,
        attempts: Vec::new(),
        usage: TokenUsage::default(),
    };

    for attempt in 0..policy.max_attempts {
        let temperature = policy.temperature_for(attempt);
        let request = ModelRequest {
            temperature,
            ..request.clone()
        };

        let result = match client.generate(request).await {
            Ok(reply) => {
                outcome.usage.add(&reply.usage);
                let parsed = validate(&reply.content);
                outcome.raw = Some(reply.content);
                parsed
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(parsed) => {
                outcome.attempts.push(AttemptRecord {
                    temperature,
                    error: None,
                });
                outcome.parsed = Some(parsed);
                debug!(question_id = item_id, attempt = attempt + 1, "accepted model answer");
                return outcome;
            }
            Err(err) => {
                warn!(
                    question_id = item_id,
                    attempt = attempt + 1,
                    temperature,
                    error = %err,
                    "model answer rejected"
                );
                outcome.attempts.push(AttemptRecord {
                    temperature,
                    error: Some(err.kind()),
                });
            }
        }
    }

    error!(
        question_id = item_id,
        attempts = policy.max_attempts,
        "retry budget exhausted"
    );
    outcome
}
