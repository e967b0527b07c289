//! Parsing `Thought: ... Action: name(key='value', ...)` model turns.

use crate::error::{EvalError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// One argument of a parsed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionInput {
    /// Normalised `[x1, y1, x2, y2]` box in the 0..1 range
    Box(Vec<f64>),
    Text(String),
}

/// A structured action decoded from one model turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_type: String,
    pub action_inputs: BTreeMap<String, ActionInput>,
    pub thought: Option<String>,
    /// Text of a `Reflection:` section, when the model writes one
    pub observation: Option<String>,
}

impl ActionRecord {
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.action_inputs.get(key) {
            Some(ActionInput::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn bbox(&self, key: &str) -> Option<&[f64]> {
        match self.action_inputs.get(key) {
            Some(ActionInput::Box(values)) => Some(values),
            _ => None,
        }
    }
}

fn call_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*$").expect("static regex"))
}

fn number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static regex"))
}

/// Canonical argument name; point arguments become boxes.
fn canonical_key(key: &str) -> &str {
    match key {
        "point" | "start_point" => "start_box",
        "end_point" => "end_box",
        other => other,
    }
}

fn is_box_key(key: &str) -> bool {
    matches!(key, "start_box" | "end_box")
}

/// Section of `text` after `label` and before the next of `stops`
fn section<'a>(text: &'a str, label: &str, stops: &[&str]) -> Option<&'a str> {
    let start = text.find(label)? + label.len();
    let rest = &text[start..];
    let end = stops
        .iter()
        .filter_map(|stop| rest.find(stop))
        .min()
        .unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// Parse a model turn into its actions.
///
/// Coordinates are divided by `coordinate_factor`; a single point becomes a
/// degenerate box. Several actions may follow `Action:`, separated by blank
/// lines.
pub fn parse_actions(response: &str, coordinate_factor: f64) -> Result<Vec<ActionRecord>> {
    let thought = section(response, "Thought:", &["Action:", "Reflection:"]).map(str::to_string);
    let observation = section(response, "Reflection:", &["Action_Summary:", "Action:", "Thought:"]).map(str::to_string);
    let action_text = response
        .rfind("Action:")
        .map(|i| &response[i + "Action:".len()..])
        .ok_or_else(|| EvalError::InvalidAction("no Action: section".to_string()))?;

    let mut actions = Vec::new();
    for call in split_calls(action_text).into_iter().map(str::trim).filter(|c| !c.is_empty()) {
        let (action_type, inputs) = parse_call(call, coordinate_factor)?;
        actions.push(ActionRecord {
            action_type,
            action_inputs: inputs,
            thought: thought.clone(),
            observation: observation.clone(),
        });
    }
    if actions.is_empty() {
        return Err(EvalError::InvalidAction("empty Action: section".to_string()));
    }
    Ok(actions)
}

/// Split on blank lines that fall outside quoted argument values
fn split_calls(text: &str) -> Vec<&str> {
    let mut calls = Vec::new();
    let mut start = 0;
    let mut quote = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if i < start {
            continue;
        }
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '\n' && text[i + 1..].starts_with('\n') => {
                calls.push(&text[start..i]);
                start = i + 2;
            }
            None => {}
        }
    }
    calls.push(&text[start..]);
    calls
}

fn parse_call(call: &str, coordinate_factor: f64) -> Result<(String, BTreeMap<String, ActionInput>)> {
    let caps = call_pattern()
        .captures(call)
        .ok_or_else(|| EvalError::InvalidAction(format!("not a function call: {call}")))?;
    let name = caps[1].to_string();
    let mut inputs = BTreeMap::new();
    for (key, raw) in parse_arguments(&caps[2])? {
        let key = canonical_key(&key).to_string();
        let value = if is_box_key(&key) {
            ActionInput::Box(parse_box(&raw, coordinate_factor)?)
        } else {
            ActionInput::Text(raw)
        };
        inputs.insert(key, value);
    }
    Ok((name, inputs))
}

fn parse_box(raw: &str, coordinate_factor: f64) -> Result<Vec<f64>> {
    let numbers: Vec<f64> = number_pattern()
        .find_iter(raw)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .map(|n| n / coordinate_factor)
        .collect();
    match numbers.as_slice() {
        [x, y] => Ok(vec![*x, *y, *x, *y]),
        [_, _, _, _] => Ok(numbers),
        _ => Err(EvalError::InvalidAction(format!("bad coordinates: {raw}"))),
    }
}

/// Split `key='value', key2="value"` into unescaped pairs.
fn parse_arguments(args: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = args.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=') {
            key.push(c);
        }
        if chars.next() != Some('=') {
            return Err(EvalError::InvalidAction(format!("argument without value: {}", key.trim())));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let quote = match chars.next() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(EvalError::InvalidAction(format!("unquoted value for {}", key.trim()))),
        };
        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(other) => value.push(other),
                    None => value.push('\\'),
                },
                c if c == quote => {
                    closed = true;
                    break;
                }
                c => value.push(c),
            }
        }
        if !closed {
            return Err(EvalError::InvalidAction(format!("unterminated value for {}", key.trim())));
        }
        pairs.push((key.trim().to_string(), value));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_point_is_normalised() {
        let actions = parse_actions(
            "Thought: The submit button is at the bottom.\nAction: click(point='<point>500 250</point>')",
            1000.0,
        )
        .unwrap();
        assert_eq!(actions.len(), 1);
        let action = &actions[0];
        assert_eq!(action.action_type, "click");
        assert_eq!(action.thought.as_deref(), Some("The submit button is at the bottom."));
        assert_eq!(action.bbox("start_box"), Some(&[0.5, 0.25, 0.5, 0.25][..]));
    }

    #[test]
    fn test_drag_has_start_and_end_boxes() {
        let actions = parse_actions(
            "Thought: drag it\nAction: drag(start_point='<point>100 100</point>', end_point='<point>300 400</point>')",
            1000.0,
        )
        .unwrap();
        assert_eq!(actions[0].bbox("start_box"), Some(&[0.1, 0.1, 0.1, 0.1][..]));
        assert_eq!(actions[0].bbox("end_box"), Some(&[0.3, 0.4, 0.3, 0.4][..]));
    }

    #[test]
    fn test_escaped_quotes_and_newline_in_content() {
        let actions = parse_actions(
            r#"Thought: type it
Action: type(content='It\'s "great"\n')"#,
            1000.0,
        )
        .unwrap();
        assert_eq!(actions[0].text("content"), Some("It's \"great\"\n"));
    }

    #[test]
    fn test_blank_line_inside_content_does_not_split() {
        let response = "Thought: fill the review\nAction: type(content='Great book.\n\nWould read again.')\n\nhotkey(key='enter')";
        let actions = parse_actions(response, 1000.0).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].text("content"), Some("Great book.\n\nWould read again."));
        assert_eq!(actions[1].action_type, "hotkey");
        assert_eq!(actions[1].text("key"), Some("enter"));
    }

    #[test]
    fn test_finished_content_keeps_ids() {
        let actions = parse_actions("Thought: done\nAction: finished(content='1.1 1.3')", 1000.0).unwrap();
        assert_eq!(actions[0].action_type, "finished");
        assert_eq!(actions[0].text("content"), Some("1.1 1.3"));
    }

    #[test]
    fn test_wait_without_arguments() {
        let actions = parse_actions("Thought: loading\nAction: wait()", 1000.0).unwrap();
        assert_eq!(actions[0].action_type, "wait");
        assert!(actions[0].action_inputs.is_empty());
    }

    #[test]
    fn test_four_value_box() {
        let actions = parse_actions("Action: click(start_box='(100,200,300,400)')", 1000.0).unwrap();
        assert_eq!(actions[0].bbox("start_box"), Some(&[0.1, 0.2, 0.3, 0.4][..]));
        assert_eq!(actions[0].thought, None);
    }

    #[test]
    fn test_missing_action_section_is_rejected() {
        let err = parse_actions("Thought: I am not sure what to do", 1000.0).unwrap_err();
        assert!(matches!(err, EvalError::InvalidAction(_)));
    }

    #[test]
    fn test_unterminated_value_is_rejected() {
        assert!(parse_actions("Action: type(content='abc)", 1000.0).is_err());
    }

    #[test]
    fn test_bad_coordinates_are_rejected() {
        assert!(parse_actions("Action: click(point='<point>12</point>')", 1000.0).is_err());
    }
}
