use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use webdev_rubric_eval::agent::{self, read_path_list};
use webdev_rubric_eval::config::Config;
use webdev_rubric_eval::dataset::{
    ArenaRecord, FeasibilityRecord, RubricRecord, read_jsonl, rubric_map, write_json, write_jsonl,
};
use webdev_rubric_eval::evaluation::Evaluator;
use webdev_rubric_eval::judgment::{JudgeMode, RubricScope};
use webdev_rubric_eval::logging;
use webdev_rubric_eval::models::JudgeRecord;
use webdev_rubric_eval::output::{AgentScoreReport, OutputFormat, print_report};
use webdev_rubric_eval::preflight::check_url;
use webdev_rubric_eval::rubric::RubricTree;
use webdev_rubric_eval::runner::{Runner, check_rubrics, rubric_statistics, score_judgments, score_likert};

/// Rubric-based evaluation of generated web applications
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format: plain or json
    #[arg(short, long, default_value = "plain", global = true)]
    output: OutputFormat,

    /// Verbose output - log every model request
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate, check or summarise rubric trees
    #[command(subcommand)]
    Rubric(RubricCommand),

    /// Judge candidates against their rubrics
    Judge {
        /// Comparison dataset (JSONL)
        #[arg(long)]
        dataset: PathBuf,
        /// Rubric records (JSONL)
        #[arg(long)]
        rubrics: PathBuf,
        /// Where to write judge records (JSONL)
        #[arg(long)]
        results: PathBuf,
        #[arg(long, value_enum, default_value = "single")]
        mode: JudgeMode,
        #[arg(long, value_enum, default_value = "combined")]
        scope: RubricScope,
        /// Directory of `<question_id>_<a|b>.png` screenshots to embed
        #[arg(long)]
        screenshots: Option<PathBuf>,
    },

    /// Turn judge records into verdicts and accuracy metrics
    Score {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        rubrics: PathBuf,
        /// Judge records (JSONL)
        #[arg(long)]
        judged: PathBuf,
        #[arg(long, value_enum, default_value = "single")]
        mode: JudgeMode,
        #[arg(long, value_enum, default_value = "combined")]
        scope: RubricScope,
        /// Where to write the prediction rows (JSON)
        #[arg(long)]
        predictions: Option<PathBuf>,
    },

    /// Likert baseline: rate candidates on fixed criteria without a rubric
    #[command(subcommand)]
    Likert(LikertCommand),

    /// Judge whether tasks are achievable on their pages
    Feasibility {
        /// Feasibility records (JSONL)
        #[arg(long)]
        dataset: PathBuf,
        /// Where to write the judgments (JSONL)
        #[arg(long)]
        results: PathBuf,
    },

    /// GUI agent track
    #[command(subcommand)]
    Agent(AgentCommand),
}

#[derive(Subcommand, Debug)]
enum RubricCommand {
    /// Ask the model for one rubric tree per comparison
    Generate {
        #[arg(long)]
        dataset: PathBuf,
        /// Where to write rubric records (JSONL)
        #[arg(long)]
        rubrics: PathBuf,
    },
    /// Validate persisted rubric trees
    Check {
        #[arg(long)]
        rubrics: PathBuf,
        /// Where to write the valid subset (JSONL)
        #[arg(long)]
        valid: Option<PathBuf>,
    },
    /// Height and leaf statistics of the valid rubric trees
    Stats {
        #[arg(long)]
        rubrics: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum LikertCommand {
    /// Ask the model for 1-5 ratings per criterion
    Judge {
        #[arg(long)]
        dataset: PathBuf,
        /// Where to write judge records (JSONL)
        #[arg(long)]
        results: PathBuf,
        #[arg(long, value_enum, default_value = "single")]
        mode: JudgeMode,
        #[arg(long)]
        screenshots: Option<PathBuf>,
    },
    /// Compare summed ratings and report accuracy
    Score {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        judged: PathBuf,
        #[arg(long, value_enum, default_value = "single")]
        mode: JudgeMode,
        #[arg(long)]
        predictions: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum AgentCommand {
    /// Lay out one task directory per rubric check
    Prepare {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        rubrics: PathBuf,
        /// Root of the comparison directories
        #[arg(long)]
        base_dir: PathBuf,
        /// Where to write the list of candidate directories
        #[arg(long)]
        path_list: PathBuf,
    },
    /// Collect trajectories and score every comparison against its label
    Score {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        base_dir: PathBuf,
        #[arg(long)]
        path_list: PathBuf,
        /// Where to write the prediction rows (JSON)
        #[arg(long)]
        predictions: Option<PathBuf>,
    },
    /// Sum token usage over every trajectory
    Cost {
        #[arg(long)]
        path_list: PathBuf,
    },
    /// Check that candidate pages are being served
    Preflight {
        /// URLs to request; `http://` is assumed when no scheme is given
        #[arg(required = true)]
        urls: Vec<String>,
    },
}

fn load_rubrics(path: &Path) -> Result<HashMap<String, RubricTree>> {
    let records: Vec<RubricRecord> = read_jsonl(path)?;
    Ok(rubric_map(&records))
}

fn runner(config: Config) -> Result<Runner> {
    let evaluator = Evaluator::from_settings(&config.model).context("Failed to create model client")?;
    Ok(Runner::new(config, Arc::new(evaluator)))
}

async fn run_rubric(command: RubricCommand, config: Config, format: OutputFormat) -> Result<()> {
    match command {
        RubricCommand::Generate { dataset, rubrics } => {
            let records: Vec<ArenaRecord> = read_jsonl(&dataset)?;
            let (generated, report) = runner(config)?.generate_rubrics(&records).await;
            write_jsonl(&rubrics, &generated)?;
            print_report(&report, format);
        }
        RubricCommand::Check { rubrics, valid } => {
            let records: Vec<RubricRecord> = read_jsonl(&rubrics)?;
            let (kept, report) = check_rubrics(&records);
            if let Some(path) = valid {
                write_jsonl(&path, &kept)?;
            }
            print_report(&report, format);
        }
        RubricCommand::Stats { rubrics } => {
            let records: Vec<RubricRecord> = read_jsonl(&rubrics)?;
            print_report(&rubric_statistics(&records), format);
        }
    }
    Ok(())
}

async fn run_likert(command: LikertCommand, config: Config, format: OutputFormat) -> Result<()> {
    match command {
        LikertCommand::Judge {
            dataset,
            results,
            mode,
            screenshots,
        } => {
            let records: Vec<ArenaRecord> = read_jsonl(&dataset)?;
            let (judged, report) = runner(config)?.likert(&records, mode, screenshots.as_deref()).await?;
            write_jsonl(&results, &judged)?;
            print_report(&report, format);
        }
        LikertCommand::Score {
            dataset,
            judged,
            mode,
            predictions,
        } => {
            let records: Vec<ArenaRecord> = read_jsonl(&dataset)?;
            let judged: Vec<JudgeRecord> = read_jsonl(&judged)?;
            let report = score_likert(&records, &judged, mode, &config.scoring);
            if let Some(path) = predictions {
                write_json(&path, &report.rows)?;
            }
            print_report(&report, format);
        }
    }
    Ok(())
}

async fn run_agent(command: AgentCommand, config: Config, format: OutputFormat) -> Result<()> {
    match command {
        AgentCommand::Prepare {
            dataset,
            rubrics,
            base_dir,
            path_list,
        } => {
            let records: Vec<ArenaRecord> = read_jsonl(&dataset)?;
            let rubrics = load_rubrics(&rubrics)?;
            let summary = agent::prepare_agent_tasks(&records, &rubrics, &base_dir, &path_list, &config.agent)?;
            print_report(&summary, format);
        }
        AgentCommand::Score {
            dataset,
            base_dir,
            path_list,
            predictions,
        } => {
            let candidate_dirs = read_path_list(&path_list)?;
            let terminal_states = agent::collect_all(&candidate_dirs)?;

            let records: Vec<ArenaRecord> = read_jsonl(&dataset)?;
            let labels: Vec<_> = records
                .iter()
                .filter(|record| base_dir.join(&record.question_id).is_dir())
                .map(|record| (record.question_id.clone(), record.label))
                .collect();
            let evaluation = agent::evaluate_agent_results(&base_dir, &labels, &config.scoring);
            if let Some(path) = predictions {
                write_json(&path, &evaluation.rows())?;
            }
            print_report(
                &AgentScoreReport {
                    terminal_states,
                    evaluation,
                },
                format,
            );
        }
        AgentCommand::Cost { path_list } => {
            let candidate_dirs = read_path_list(&path_list)?;
            print_report(&agent::total_agent_cost(&candidate_dirs)?, format);
        }
        AgentCommand::Preflight { urls } => {
            let mut reports = Vec::with_capacity(urls.len());
            for url in &urls {
                reports.push(check_url(url).await);
            }
            print_report(&reports, format);
            let failed = reports.iter().filter(|r| !r.ok).count();
            if failed > 0 {
                bail!("{failed} of {} URLs failed preflight", reports.len());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = Config::load(args.config.as_deref())?;
    let format = args.output;

    match args.command {
        Command::Rubric(command) => run_rubric(command, config, format).await?,
        Command::Judge {
            dataset,
            rubrics,
            results,
            mode,
            scope,
            screenshots,
        } => {
            let records: Vec<ArenaRecord> = read_jsonl(&dataset)?;
            let rubrics = load_rubrics(&rubrics)?;
            let (judged, report) = runner(config)?
                .judge(&records, &rubrics, mode, scope, screenshots.as_deref())
                .await?;
            write_jsonl(&results, &judged)?;
            print_report(&report, format);
        }
        Command::Score {
            dataset,
            rubrics,
            judged,
            mode,
            scope,
            predictions,
        } => {
            let records: Vec<ArenaRecord> = read_jsonl(&dataset)?;
            let rubrics = load_rubrics(&rubrics)?;
            let judged: Vec<JudgeRecord> = read_jsonl(&judged)?;
            let report = score_judgments(&records, &rubrics, &judged, mode, scope, &config.scoring);
            if let Some(path) = predictions {
                write_json(&path, &report.rows)?;
            }
            print_report(&report, format);
        }
        Command::Likert(command) => run_likert(command, config, format).await?,
        Command::Feasibility { dataset, results } => {
            let records: Vec<FeasibilityRecord> = read_jsonl(&dataset)?;
            let (judgments, report) = runner(config)?.feasibility(&records).await;
            write_jsonl(&results, &judgments)?;
            print_report(&report, format);
        }
        Command::Agent(command) => run_agent(command, config, format).await?,
    }

    Ok(())
}
