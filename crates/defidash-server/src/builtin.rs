//! Jobs every deployment ships with.

use std::time::Duration;

use defidash_jobs::{JobArgs, JobContext, JobError, RegistryBuilder};
use rand::Rng;
use tracing::info;

pub const HELP: &str = "help";
pub const CLEANUP: &str = "cleanup";
pub const CACHE_CLEAR: &str = "cache-clear";
pub const GENERATE_SECRET: &str = "generate-secret";

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const SECRET_BYTES: usize = 32;
const MAX_SECRET_BYTES: usize = 1024;

pub fn register(builder: &mut RegistryBuilder) -> defidash_jobs::Result<()> {
    builder
        .register_job(HELP, help)?
        .register_job(CLEANUP, cleanup)?
        .register_job(CACHE_CLEAR, cache_clear)?
        .register_job(GENERATE_SECRET, generate_secret)?
        .register_schedule(CLEANUP, CLEANUP_INTERVAL)?;
    Ok(())
}

/// Print every registered job name.
async fn help(ctx: JobContext, _args: JobArgs) -> Result<(), JobError> {
    println!("Usage: defidash [JOB] [KEY=VALUE]...");
    println!();
    println!("Jobs:");
    println!("  start");
    for name in ctx.registry().job_names() {
        println!("  {name}");
    }
    Ok(())
}

/// Sweep cache rows that have expired.
async fn cleanup(ctx: JobContext, _args: JobArgs) -> Result<(), JobError> {
    let purged = ctx.cache().purge_expired()?;
    info!(purged, "cache cleanup finished");
    Ok(())
}

async fn cache_clear(ctx: JobContext, _args: JobArgs) -> Result<(), JobError> {
    ctx.cache().clear()?;
    Ok(())
}

/// Print a random hex secret, e.g. for `admin.secret`. `bytes=N` overrides the length.
async fn generate_secret(_ctx: JobContext, args: JobArgs) -> Result<(), JobError> {
    let len = match args.get_i64("bytes") {
        Some(n) if n > 0 && n as usize <= MAX_SECRET_BYTES => n as usize,
        Some(n) => {
            return Err(JobError::failed(format!(
                "bytes must be between 1 and {MAX_SECRET_BYTES}, got {n}"
            )))
        }
        None => SECRET_BYTES,
    };
    println!("{}", random_hex(len));
    Ok(())
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    hex::encode(bytes)
}
