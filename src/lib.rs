//! Rubric-based evaluation of generated web applications: rubric trees,
//! LLM judging, coarse GUI agent scoring and accuracy metrics.

pub mod agent;
pub mod chunking;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod judgment;
pub mod likert;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod output;
pub mod pool;
pub mod preflight;
pub mod prompts;
pub mod retry;
pub mod rubric;
pub mod runner;
pub mod scoring;
