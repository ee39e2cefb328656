use clap::Parser;
use defidash_core::config::Environment;
use defidash_jobs::JobArgs;

use crate::builtin;

/// Runs the engine, or a single job in the foreground.
pub const START: &str = "start";

/// Argument key for a bare value without `=`.
pub const BARE_ARG_KEY: &str = "arg";

/// defidash: background job engine for the dashboard
#[derive(Debug, Parser)]
#[command(name = "defidash")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: $DEFIDASH_CONFIG, then ./defidash.toml)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,

    /// Job to run once, or `start` to run the worker, scheduler and HTTP listener
    #[arg(value_name = "JOB")]
    pub job: Option<String>,

    /// Job arguments as `key=value` pairs
    #[arg(value_name = "KEY=VALUE", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// The job to run when none is named: the job list while developing,
/// the engine in production.
pub fn resolve_job(job: Option<&str>, env: Environment) -> &str {
    match job {
        Some(job) if !job.is_empty() => job,
        _ if env.is_production() => START,
        _ => builtin::HELP,
    }
}

/// Turn `key=value` words into job arguments. Values stay strings; a word
/// without `=` is stored under `arg`, and a later duplicate key wins.
pub fn parse_args(raw: &[String]) -> JobArgs {
    let mut args = JobArgs::new();
    for word in raw {
        match word.split_once('=') {
            Some((key, value)) => args.set(key, value),
            None => args.set(BARE_ARG_KEY, word.as_str()),
        }
    }
    args
}
