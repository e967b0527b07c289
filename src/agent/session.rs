//! The sequential agent loop: screenshot, model turn, decoded commands,
//! repeat until a terminal state.

use super::Viewport;
use super::action::parse_actions;
use super::decoder::{AutomationCommand, Decoded, TaskOutcome, decode};
use crate::config::{AgentSettings, ModelSettings};
use crate::dataset::{read_json, write_json};
use crate::evaluation::ModelClient;
use crate::models::{ChatMessage, ModelRequest, TokenUsage};
use crate::prompts::{self, encode_png};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// What an agent task checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Static,
    Dynamic,
    Intention,
}

impl TaskKind {
    /// Instruction injected on the last allowed step
    pub fn finish_now(self) -> &'static str {
        match self {
            Self::Static => prompts::FINISH_NOW_STATIC,
            Self::Dynamic => prompts::FINISH_NOW_DYNAMIC,
            Self::Intention => prompts::FINISH_NOW_INTENTION,
        }
    }

    /// Only dynamic tasks tell the agent it may give up early
    pub fn allows_infeasible_exit(self) -> bool {
        matches!(self, Self::Dynamic)
    }
}

/// `metadata.json` of one task directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub instruction: String,
    pub task_type: TaskKind,
    /// Model turns allowed
    pub max_steps: usize,
}

/// Terminal state of an agent task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FinalResult {
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "MAX ROUNDS")]
    MaxRounds,
    #[serde(rename = "PARSING RESPONSE ERROR")]
    ParsingResponseError,
    #[serde(rename = "UNRECOGNIZED ACTION TYPE")]
    UnrecognizedActionType,
    #[serde(rename = "SERVER ERROR")]
    ServerError,
    #[serde(rename = "NONE RESPONSE")]
    NoneResponse,
    #[serde(rename = "INITIAL_ERROR")]
    InitialError,
    #[serde(rename = "ERROR ITERATION")]
    ErrorIteration,
}

impl FinalResult {
    pub const ALL: [FinalResult; 9] = [
        Self::Done,
        Self::Failed,
        Self::MaxRounds,
        Self::ParsingResponseError,
        Self::UnrecognizedActionType,
        Self::ServerError,
        Self::NoneResponse,
        Self::InitialError,
        Self::ErrorIteration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::MaxRounds => "MAX ROUNDS",
            Self::ParsingResponseError => "PARSING RESPONSE ERROR",
            Self::UnrecognizedActionType => "UNRECOGNIZED ACTION TYPE",
            Self::ServerError => "SERVER ERROR",
            Self::NoneResponse => "NONE RESPONSE",
            Self::InitialError => "INITIAL_ERROR",
            Self::ErrorIteration => "ERROR ITERATION",
        }
    }

    /// States caused by a bad model answer rather than by the page
    pub fn is_response_error(self) -> bool {
        matches!(self, Self::ParsingResponseError | Self::UnrecognizedActionType)
    }
}

impl std::fmt::Display for FinalResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured viewport image
#[derive(Debug, Clone, PartialEq)]
pub struct Screenshot {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Screenshot {
    pub fn viewport(&self) -> Viewport {
        Viewport {
            width: self.width,
            height: self.height,
        }
    }
}

/// Browser automation the agent loop drives
#[async_trait]
pub trait BrowserDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    async fn capture(&mut self) -> Result<Screenshot>;

    /// Execute decoded commands in order
    async fn perform(&mut self, commands: &[AutomationCommand]) -> Result<()>;
}

/// Persisted record of one agent task, `messages.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub final_result: FinalResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub costs: TokenUsage,
    /// Conversation with image payloads elided, absent when the page never loaded
    pub trajectory: Option<Vec<ChatMessage>>,
    /// Commands replayed per step
    #[serde(default)]
    pub codes: Vec<Vec<AutomationCommand>>,
}

impl Trajectory {
    /// Text of the last message, normally the model's final turn
    pub fn last_message_text(&self) -> Option<String> {
        self.trajectory
            .as_ref()
            .and_then(|messages| messages.last())
            .map(ChatMessage::joined_text)
    }
}

/// Result of one model turn
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Continue(Vec<AutomationCommand>),
    Terminal(FinalResult),
}

/// Conversation state of one agent task
pub struct AgentSession<'a> {
    client: &'a dyn ModelClient,
    model: &'a ModelSettings,
    settings: &'a AgentSettings,
    task: TaskMetadata,
    messages: Vec<ChatMessage>,
    images_in_history: usize,
    usage: TokenUsage,
}

impl<'a> AgentSession<'a> {
    pub fn new(
        client: &'a dyn ModelClient,
        model: &'a ModelSettings,
        settings: &'a AgentSettings,
        task: TaskMetadata,
    ) -> Self {
        let prompt = prompts::agent_system_prompt(
            task.task_type.allows_infeasible_exit(),
            &settings.language,
            &task.instruction,
        );
        Self {
            client,
            model,
            settings,
            task,
            messages: vec![ChatMessage::user(prompt)],
            images_in_history: 0,
            usage: TokenUsage::default(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// Drop the oldest screenshot message once the history is over budget.
    fn trim_images(&mut self) {
        while self.images_in_history > self.settings.max_image_history {
            let Some(index) = self.messages.iter().position(|m| m.image_count() > 0) else {
                break;
            };
            self.images_in_history -= self.messages[index].image_count();
            self.messages.remove(index);
        }
    }

    /// Send the latest screenshot and classify the model's answer.
    ///
    /// `step` counts from 1; the last allowed step carries the
    /// task-specific instruction to finish.
    pub async fn step(&mut self, screenshot: &Screenshot, step: usize) -> StepOutcome {
        self.messages.push(ChatMessage::user_image(encode_png(&screenshot.png)));
        self.images_in_history += 1;
        if step == self.task.max_steps {
            self.messages.push(ChatMessage::user(self.task.task_type.finish_now()));
        }
        self.trim_images();

        let request = ModelRequest {
            model: self.model.model.clone(),
            messages: self.messages.clone(),
            max_tokens: self.model.max_tokens,
            temperature: self.model.temperature,
        };
        let reply = match self.client.generate(request).await {
            Ok(reply) => reply,
            Err(err) => {
                error!(step, error = %err, "agent model call failed");
                return StepOutcome::Terminal(FinalResult::ServerError);
            }
        };
        self.usage.add(&reply.usage);
        self.messages.push(ChatMessage::assistant(reply.content.clone()));
        debug!(step, response = %reply.content, "agent turn");

        if reply.content.trim().is_empty() {
            error!(step, "agent model returned no text");
            return StepOutcome::Terminal(FinalResult::NoneResponse);
        }
        let actions = match parse_actions(&reply.content, self.settings.coordinate_factor) {
            Ok(actions) => actions,
            Err(err) => {
                error!(step, error = %err, "could not parse agent turn");
                return StepOutcome::Terminal(FinalResult::ParsingResponseError);
            }
        };

        let mut commands = Vec::new();
        for action in &actions {
            match decode(action, screenshot.viewport()) {
                Ok(Decoded::Commands(decoded)) => commands.extend(decoded),
                Ok(Decoded::Finished(TaskOutcome::Done)) => return StepOutcome::Terminal(FinalResult::Done),
                Ok(Decoded::Finished(TaskOutcome::Failed)) => return StepOutcome::Terminal(FinalResult::Failed),
                Ok(Decoded::Unrecognized(kind)) => {
                    error!(step, action_type = %kind, "unrecognized action type");
                    return StepOutcome::Terminal(FinalResult::UnrecognizedActionType);
                }
                Err(err) => {
                    error!(step, error = %err, "could not decode agent action");
                    return StepOutcome::Terminal(FinalResult::ParsingResponseError);
                }
            }
        }
        StepOutcome::Continue(commands)
    }
}

fn save_screenshot(dir: &Path, index: usize, screenshot: &Screenshot) -> Result<()> {
    let path = dir.join(format!("screenshot_{index:03}.png"));
    std::fs::write(&path, &screenshot.png)
        .with_context(|| format!("Failed to write screenshot: {}", path.display()))
}

/// Run the task in `task_dir` against the page at `url`.
///
/// Driver and model failures end the task with the matching terminal
/// state; only failures to read the task or persist results are errors.
/// Writes `messages.json` and `screenshots/` into `task_dir`.
pub async fn run_task(
    task_dir: &Path,
    url: &str,
    client: &dyn ModelClient,
    driver: &mut dyn BrowserDriver,
    model: &ModelSettings,
    settings: &AgentSettings,
) -> Result<Trajectory> {
    let task: TaskMetadata = read_json(&task_dir.join("metadata.json"))?;
    let screenshot_dir = task_dir.join("screenshots");
    std::fs::create_dir_all(&screenshot_dir)
        .with_context(|| format!("Failed to create directory: {}", screenshot_dir.display()))?;
    info!(task = %task_dir.display(), task_type = ?task.task_type, max_steps = task.max_steps, "starting agent task");

    let max_steps = task.max_steps;
    let initial = async {
        driver.navigate(url).await?;
        driver.capture().await
    }
    .await;
    let mut screenshot = match initial {
        Ok(screenshot) => screenshot,
        Err(err) => {
            error!(task = %task_dir.display(), error = %err, "could not load the page");
            let trajectory = Trajectory {
                final_result: FinalResult::InitialError,
                error_message: Some(format!("{err:#}")),
                costs: TokenUsage::default(),
                trajectory: None,
                codes: Vec::new(),
            };
            write_json(&task_dir.join("messages.json"), &trajectory)?;
            return Ok(trajectory);
        }
    };
    save_screenshot(&screenshot_dir, 1, &screenshot)?;

    let mut session = AgentSession::new(client, model, settings, task);
    let mut codes = Vec::new();
    let mut final_result = FinalResult::MaxRounds;
    let mut error_message = Some("reached the maximum number of steps".to_string());

    for step in 1..=max_steps {
        let commands = match session.step(&screenshot, step).await {
            StepOutcome::Terminal(result) => {
                final_result = result;
                error_message = None;
                break;
            }
            StepOutcome::Continue(commands) => commands,
        };

        let performed = async {
            driver.perform(&commands).await?;
            driver.capture().await
        }
        .await;
        codes.push(commands);
        match performed {
            Ok(next) => {
                screenshot = next;
                save_screenshot(&screenshot_dir, step + 1, &screenshot)?;
            }
            Err(err) => {
                error!(step, error = %err, "browser step failed");
                final_result = FinalResult::ErrorIteration;
                error_message = Some(format!("{err:#}"));
                break;
            }
        }
    }

    match final_result {
        FinalResult::Done | FinalResult::Failed => info!(result = %final_result, "agent task finished"),
        FinalResult::MaxRounds => warn!("agent task reached the step limit"),
        other => error!(result = %other, "agent task ended with an error"),
    }

    let trajectory = Trajectory {
        final_result,
        error_message,
        costs: session.usage(),
        trajectory: Some(session.messages().iter().map(ChatMessage::without_images).collect()),
        codes,
    };
    write_json(&task_dir.join("messages.json"), &trajectory)?;
    Ok(trajectory)
}
