//! Mapping parsed actions onto replayable automation commands.

use super::Viewport;
use super::action::ActionRecord;
use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};

/// Wheel clicks per `scroll` action
const SCROLL_AMOUNT: i32 = 5;
const WAIT_MILLIS: u64 = 3000;
const DRAG_MILLIS: u64 = 1000;
/// Pause between pasting text and submitting it
const PASTE_SETTLE_MILLIS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
}

/// A primitive input operation in absolute viewport pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AutomationCommand {
    MoveTo { x: f64, y: f64 },
    Click { x: f64, y: f64, button: MouseButton },
    DoubleClick { x: f64, y: f64 },
    /// Drag from the current pointer position, which a preceding `MoveTo` sets
    DragTo { x: f64, y: f64, millis: u64 },
    Hotkey { keys: Vec<String> },
    KeyDown { key: String },
    KeyUp { key: String },
    /// Put `text` on the clipboard and paste it into the focused element
    Paste { text: String },
    /// Positive scrolls up, negative down
    Scroll { amount: i32, x: Option<f64>, y: Option<f64> },
    Wait { millis: u64 },
}

/// How a `finished` action ended the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskOutcome {
    Done,
    Failed,
}

/// Classification of one decoded action
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Non-terminal: replay these and continue
    Commands(Vec<AutomationCommand>),
    Finished(TaskOutcome),
    /// An action type outside the action space
    Unrecognized(String),
}

/// Aliases the model uses for key names
fn normalize_key(key: &str) -> String {
    match key {
        "arrowleft" => "left".to_string(),
        "arrowright" => "right".to_string(),
        "arrowup" => "up".to_string(),
        "arrowdown" => "down".to_string(),
        "space" => " ".to_string(),
        other => other.to_string(),
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Pixel centre of a normalised box with 4 (or 2) values
fn box_center(values: &[f64], viewport: Viewport) -> Option<(f64, f64)> {
    let (x1, y1, x2, y2) = match values {
        [x1, y1, x2, y2] => (*x1, *y1, *x2, *y2),
        [x, y] => (*x, *y, *x, *y),
        _ => return None,
    };
    Some((
        round3((x1 + x2) / 2.0 * f64::from(viewport.width)),
        round3((y1 + y2) / 2.0 * f64::from(viewport.height)),
    ))
}

fn required_center(action: &ActionRecord, key: &str, viewport: Viewport) -> Result<(f64, f64)> {
    action
        .bbox(key)
        .and_then(|values| box_center(values, viewport))
        .ok_or_else(|| EvalError::InvalidAction(format!("{} needs a {key}", action.action_type)))
}

/// Decode one action for a viewport of the given size.
///
/// Fails only when an action in the action space lacks the coordinates it
/// needs; unknown action types decode to [`Decoded::Unrecognized`].
pub fn decode(action: &ActionRecord, viewport: Viewport) -> Result<Decoded> {
    let commands = match action.action_type.as_str() {
        "hotkey" => {
            let combo = action
                .text("key")
                .or_else(|| action.text("hotkey"))
                .unwrap_or_default()
                .to_lowercase();
            let combo = normalize_key(&combo);
            let keys: Vec<String> = if combo == " " {
                vec![combo]
            } else {
                combo.split_whitespace().map(normalize_key).collect()
            };
            if keys.is_empty() {
                Vec::new()
            } else {
                vec![AutomationCommand::Hotkey { keys }]
            }
        }
        kind @ ("press" | "keydown" | "release" | "keyup") => {
            let key = action
                .text("key")
                .or_else(|| action.text("press"))
                .ok_or_else(|| EvalError::InvalidAction(format!("{kind} needs a key")))?;
            let key = normalize_key(&key.to_lowercase());
            if matches!(kind, "press" | "keydown") {
                vec![AutomationCommand::KeyDown { key }]
            } else {
                vec![AutomationCommand::KeyUp { key }]
            }
        }
        "type" => {
            let content = action.text("content").unwrap_or_default();
            let (text, submit) = if let Some(stripped) = content.strip_suffix("\\n") {
                (stripped, true)
            } else if let Some(stripped) = content.strip_suffix('\n') {
                (stripped, true)
            } else {
                (content, false)
            };
            let mut commands = Vec::new();
            if !text.is_empty() {
                commands.push(AutomationCommand::Paste { text: text.to_string() });
                commands.push(AutomationCommand::Wait {
                    millis: PASTE_SETTLE_MILLIS,
                });
            }
            if submit {
                commands.push(AutomationCommand::Hotkey {
                    keys: vec!["enter".to_string()],
                });
            }
            commands
        }
        "drag" | "select" => {
            let (sx, sy) = required_center(action, "start_box", viewport)?;
            let (ex, ey) = required_center(action, "end_box", viewport)?;
            vec![
                AutomationCommand::MoveTo { x: sx, y: sy },
                AutomationCommand::DragTo {
                    x: ex,
                    y: ey,
                    millis: DRAG_MILLIS,
                },
            ]
        }
        "scroll" => {
            let at = action
                .bbox("start_box")
                .and_then(|values| box_center(values, viewport));
            let direction = action.text("direction").unwrap_or_default().to_lowercase();
            let amount = if direction.contains("up") {
                Some(SCROLL_AMOUNT)
            } else if direction.contains("down") {
                Some(-SCROLL_AMOUNT)
            } else {
                None
            };
            amount
                .map(|amount| AutomationCommand::Scroll {
                    amount,
                    x: at.map(|(x, _)| x),
                    y: at.map(|(_, y)| y),
                })
                .into_iter()
                .collect()
        }
        "click" | "left_single" => {
            let (x, y) = required_center(action, "start_box", viewport)?;
            vec![AutomationCommand::Click {
                x,
                y,
                button: MouseButton::Left,
            }]
        }
        "left_double" => {
            let (x, y) = required_center(action, "start_box", viewport)?;
            vec![AutomationCommand::DoubleClick { x, y }]
        }
        "right_single" => {
            let (x, y) = required_center(action, "start_box", viewport)?;
            vec![AutomationCommand::Click {
                x,
                y,
                button: MouseButton::Right,
            }]
        }
        "hover" => {
            let (x, y) = required_center(action, "start_box", viewport)?;
            vec![AutomationCommand::MoveTo { x, y }]
        }
        "wait" => vec![AutomationCommand::Wait { millis: WAIT_MILLIS }],
        "finished" => {
            let content = action.text("content").unwrap_or_default();
            let outcome = if content.to_lowercase().contains("failed") {
                TaskOutcome::Failed
            } else {
                TaskOutcome::Done
            };
            return Ok(Decoded::Finished(outcome));
        }
        other => return Ok(Decoded::Unrecognized(other.to_string())),
    };
    Ok(Decoded::Commands(commands))
}
