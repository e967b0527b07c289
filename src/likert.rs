//! Likert baseline judge: 1 to 5 ratings on a fixed list of criteria,
//! summed per candidate.

use crate::error::{EvalError, Result};
use crate::judgment::{JudgeMode, extract_json};
use serde_json::{Map, Value};

/// Sub-criterion ids the judge rates, in prompt order
pub const CRITERIA: [&str; 13] = [
    "1.1", "1.2", "1.3", "1.4", "2.1", "2.2", "2.3", "3.1", "3.2", "3.3", "4.1", "4.2", "4.3",
];

fn criteria(raw: &str) -> Result<Map<String, Value>> {
    match extract_json(raw)? {
        Value::Object(map) if !map.is_empty() => Ok(map),
        Value::Object(_) => Err(EvalError::shape("$", "no criteria rated")),
        _ => Err(EvalError::shape("$", "expected an object keyed by criterion")),
    }
}

fn rating(value: &Value, path: String) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| EvalError::shape(path, "expected a numeric rating"))
}

/// Sum of a pointwise answer's ratings
pub fn single_total(raw: &str) -> Result<f64> {
    criteria(raw)?
        .iter()
        .map(|(key, value)| rating(value, format!("$.{key}")))
        .sum()
}

/// Sums of a pairwise answer's `A` and `B` ratings
pub fn pair_totals(raw: &str) -> Result<(f64, f64)> {
    let mut totals = (0.0, 0.0);
    for (key, value) in criteria(raw)? {
        totals.0 += rating(&value["A"], format!("$.{key}.A"))?;
        totals.1 += rating(&value["B"], format!("$.{key}.B"))?;
    }
    Ok(totals)
}

/// Accept an answer only when it can be summed in `mode`
pub fn check_answer(raw: &str, mode: JudgeMode) -> Result<()> {
    match mode {
        JudgeMode::Pointwise => single_total(raw).map(drop),
        JudgeMode::Pairwise => pair_totals(raw).map(drop),
    }
}
