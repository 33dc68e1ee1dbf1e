//! Entrypoint for batch job containers.
//!
//! Attaches scratch volumes when `SCRATCH_SIZE` asks for them, runs the job and always detaches the volumes again.
//! The process exits with the job's exit code, or 1 if the volumes could not be set up or torn down.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use hutch_batch::error::UserError;
use hutch_batch::runner::{LogFormat, TracingState};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitCode, ExitStatus, Stdio};

const SCRATCH_MOUNTPOINT: &str = "/scratch";
const FETCH_AND_RUN: &str = "fetch_and_run.sh";

#[derive(Parser, Clone, Debug)]
#[clap()]
struct Args {
    /// The batchit executable used to create and delete the scratch volumes
    #[clap(long, env = "BATCHIT_EXE", default_value = "batchit")]
    batchit: String,

    #[arg(long, value_enum, default_value = "human")]
    log_format: LogFormat,

    /// The job's command, ignored when the job uses fetch and run
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Runs external programs, stdout and stderr are passed through unless captured.
#[async_trait]
trait Processes: Send + Sync {
    /// Returns the exit code.
    async fn run(&self, program: &str, args: &[String]) -> Result<i32>;

    /// Returns stdout, failing on a non-zero exit code.
    async fn output(&self, program: &str, args: &[String]) -> Result<String>;
}

struct TokioProcesses;

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

fn quote(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|x| String::from_utf8_lossy(&shell_quote::Bash::quote_vec(x)).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Processes for TokioProcesses {
    async fn run(&self, program: &str, args: &[String]) -> Result<i32> {
        tracing::info!("Running {}", quote(program, args));
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .with_context(|| format!("Failed to start {program}"))?;
        let code = exit_code(status);
        tracing::info!("{program} exited with {code}");
        Ok(code)
    }

    async fn output(&self, program: &str, args: &[String]) -> Result<String> {
        tracing::info!("Running {}", quote(program, args));
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await
            .with_context(|| format!("Failed to start {program}"))?;
        if !output.status.success() {
            bail!(
                "{} failed with exit code {}",
                quote(program, args),
                exit_code(output.status)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// The requested scratch size in GB. Values that are not a number are ignored.
fn scratch_size(value: Option<&str>) -> Option<u32> {
    let size: Option<u32> = value?.trim().parse().ok();
    if size.is_none() {
        tracing::warn!("Ignoring SCRATCH_SIZE={value:?}, it is not a number");
    }
    size
}

fn ebsmount_args(size_gb: u32) -> Vec<String> {
    // Large requests are striped over two volumes
    let volumes = if size_gb > 200 { 2 } else { 1 };
    vec![
        "ebsmount".to_owned(),
        "--size".to_owned(),
        size_gb.to_string(),
        "--mountpoint".to_owned(),
        SCRATCH_MOUNTPOINT.to_owned(),
        "-n".to_owned(),
        volumes.to_string(),
    ]
}

/// The command to run: `fetch_and_run.sh` when batch provided a job file, otherwise the trailing arguments.
fn job_command(
    batch_file_type: Option<&str>,
    batch_file_s3_url: Option<&str>,
    command: &[String],
) -> Result<(String, Vec<String>), UserError> {
    let is_set = |x: Option<&str>| x.is_some_and(|x| !x.is_empty());
    if is_set(batch_file_type) && is_set(batch_file_s3_url) {
        return Ok((FETCH_AND_RUN.to_owned(), vec![]));
    }
    match command.split_first() {
        Some((program, args)) => Ok((program.clone(), args.to_vec())),
        None => Err(UserError::Usage(
            "You didn't specify a command! Exiting.".to_owned(),
        )),
    }
}

struct Entrypoint<'a> {
    processes: &'a dyn Processes,
    batchit: String,
}

impl Entrypoint<'_> {
    async fn mount_scratch(&self, size_gb: u32) -> Result<Vec<String>> {
        let stdout = self
            .processes
            .output(&self.batchit, &ebsmount_args(size_gb))
            .await
            .context("Failed to create the scratch volumes")?;
        let volumes: Vec<String> = stdout.split_whitespace().map(|x| x.to_owned()).collect();
        tracing::info!("Mounted scratch volumes {volumes:?} at {SCRATCH_MOUNTPOINT}");
        Ok(volumes)
    }

    async fn teardown(&self, volumes: &[String]) -> Result<()> {
        let args: Vec<String> = std::iter::once("ddv".to_owned())
            .chain(volumes.iter().cloned())
            .collect();
        let code = self.processes.run(&self.batchit, &args).await?;
        if code != 0 {
            bail!("Failed to tear down volumes {volumes:?}, exit code {code}");
        }
        Ok(())
    }

    /// Returns the exit code of the job.
    async fn run(&self, scratch_size_gb: Option<u32>, program: &str, args: &[String]) -> Result<i32> {
        let volumes = match scratch_size_gb {
            Some(size_gb) => self.mount_scratch(size_gb).await?,
            None => vec![],
        };

        let code = self.processes.run(program, args).await;

        if !volumes.is_empty() {
            self.teardown(&volumes).await?;
        }
        code
    }
}

fn main() -> ExitCode {
    // Disable anyhow from taking backtraces, which makes for very verbose error messages.
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0");
    }

    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to create the tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    let tracing_state = match TracingState::new("info", args.log_format) {
        Ok(tracing_state) => tracing_state,
        Err(err) => {
            eprintln!("Failed to initialize logging: {err:?}");
            return ExitCode::FAILURE;
        }
    };

    let env = |key: &str| std::env::var(key).ok();
    let code = match job_command(
        env("BATCH_FILE_TYPE").as_deref(),
        env("BATCH_FILE_S3_URL").as_deref(),
        &args.command,
    ) {
        Ok((program, program_args)) => {
            let entrypoint = Entrypoint {
                processes: &TokioProcesses,
                batchit: args.batchit,
            };
            let scratch = scratch_size(env("SCRATCH_SIZE").as_deref());
            match entrypoint.run(scratch, &program, &program_args).await {
                Ok(code) => {
                    tracing::info!("Exiting with return code {code}.");
                    // Exit codes outside of 0..=255 are truncated by the OS anyway
                    ExitCode::from(code as u8)
                }
                Err(err) => {
                    tracing::error!("{:?}", err);
                    ExitCode::FAILURE
                }
            }
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    };
    drop(tracing_state);
    code
}
