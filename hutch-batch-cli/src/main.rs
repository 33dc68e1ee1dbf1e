use anyhow::{Context, Result};
use clap::{crate_version, Parser, Subcommand};
use hutch_batch::ami::builder::{AmiBuilder, AmiOptions};
use hutch_batch::ami::ec2::Ec2AmiBackend;
use hutch_batch::aws::AwsContext;
use hutch_batch::batch::client::BatchClient;
use hutch_batch::batch::strategy::Strategy;
use hutch_batch::batch::submit::{build_job_templates, submit_jobs, SubmitRequest};
use hutch_batch::batch::template::JobOptions;
use hutch_batch::batch::{environment, jobdef, jobs};
use hutch_batch::config::{Config, Settings};
use hutch_batch::error::UserError;
use hutch_batch::logs::{fetch_job_log, LogsClient};
use hutch_batch::onboarding::{onboard, IamClient};
use hutch_batch::remote::{SshConfigurator, SshCredentials};
use hutch_batch::runner::{LogFormat, TracingState};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime;

/// Tools for submitting and inspecting AWS Batch jobs and for maintaining the batch environment.
#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(short, long, default_value = "config/config.yaml")]
    config_file: String,

    #[arg(long, value_enum, default_value = "human")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Submit one or more jobs built from the same template
    Submit(SubmitArgs),
    /// List the jobs in a queue
    List {
        /// Defaults to the configured queue
        #[clap(long)]
        queue: Option<String>,
        #[clap(long, default_value = jobs::DEFAULT_STATUS)]
        status: String,
    },
    /// Print the log output of a job
    Log {
        /// A job id, or a log stream name when it contains a `/`
        identifier: String,
        #[clap(long, default_value = "0")]
        attempt: usize,
    },
    /// Print a job definition to start from for a PI
    JobdefSkeleton {
        #[clap(long)]
        pi_name: String,
        /// Defaults to the configured image
        #[clap(long)]
        image: Option<String>,
    },
    /// Give a user access to batch under their PI
    Onboard { user: String, pi: String },
    /// Build a new ECS image with a scratch volume and remove the previous ones
    MakeAmi(MakeAmiArgs),
    /// Bootstrap or tear down the configured test environment
    Environment {
        #[command(subcommand)]
        action: EnvironmentAction,
    },
}

#[derive(clap::Args, Clone, Debug)]
struct SubmitArgs {
    /// Defaults to the configured queue
    #[clap(long)]
    queue: Option<String>,
    /// Defaults to the configured job definition
    #[clap(long)]
    jobdef: Option<String>,
    #[clap(long, default_value = "1")]
    numjobs: u32,
    #[clap(long, default_value = "sample_job")]
    name: String,
    /// One of echo-iteration, iteration-env or iteration-parameter
    #[clap(long)]
    strategy: Option<String>,
    /// Print the job templates instead of submitting them
    #[clap(long)]
    json: bool,
    #[clap(long)]
    cpus: Option<u32>,
    /// In MiB
    #[clap(long)]
    memory: Option<u32>,
    /// JSON object of string values
    #[clap(long)]
    parameters: Option<String>,
    #[clap(long)]
    attempts: Option<u32>,
    /// JSON array of strings
    #[clap(long)]
    command: Option<String>,
    /// JSON array of `{"name": .., "value": ..}` objects
    #[clap(long)]
    environment: Option<String>,
}

#[derive(clap::Args, Clone, Debug)]
struct MakeAmiArgs {
    /// Size of the scratch volume in GB
    #[clap(long, default_value = "1000")]
    scratch_size: u32,
    /// Must allow ssh from this host
    #[clap(long)]
    security_group_name: String,
    #[clap(long)]
    key_pair_name: String,
    #[clap(long)]
    private_key_file: PathBuf,
    /// Keep the images from previous builds
    #[clap(long)]
    keep_previous: bool,
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq)]
enum EnvironmentAction {
    Create,
    Clean,
}

fn main() -> ExitCode {
    // Disable anyhow from taking backtraces, which makes for very verbose error messages.
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0");
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // --help and --version are reported through the same path
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let runtime = match runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to create the tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let config = match Config::from_file(&cli.config_file) {
        Ok(config) => config,
        Err(err) => {
            // Without a config there is no log level to use, report with the simplest tracing setup.
            let _tracing_state = TracingState::new("error", cli.log_format);
            tracing::error!("{:?}", err);
            return ExitCode::FAILURE;
        }
    };
    let tracing_state = match TracingState::new(&config.main_log_level, cli.log_format) {
        Ok(tracing_state) => tracing_state,
        Err(err) => {
            eprintln!("Failed to initialize logging: {err:?}");
            return ExitCode::FAILURE;
        }
    };

    let result = async {
        let user = std::env::var("USER").context("The USER environment variable is not set")?;
        execute(cli.command, config, user, connect).await
    }
    .await;
    let code = match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match UserError::find(&err) {
                Some(user_error) => eprintln!("{user_error}"),
                None => tracing::error!("{:?}", err),
            }
            ExitCode::FAILURE
        }
    };
    // Flush the logs before exiting.
    drop(tracing_state);
    code
}

async fn connect(region: String) -> Result<(AwsContext, String)> {
    let aws = AwsContext::new(&region).await;
    let account_id = aws.account_id().await?;
    Ok((aws, account_id))
}

/// What a command needs before it can talk to AWS.
struct Session<F> {
    config: Config,
    user: String,
    connect: F,
}

impl<F, Fut> Session<F>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<(AwsContext, String)>>,
{
    /// Connects to AWS and resolves the configuration against the account of the loaded credentials.
    async fn open(self) -> Result<(AwsContext, Settings)> {
        let (aws, account_id) = (self.connect)(self.config.region.clone()).await?;
        let settings = Settings::resolve(self.config, &account_id, self.user)?;
        Ok((aws, settings))
    }
}

/// Runs `command`. Arguments that can be checked locally are checked before `connect` is called,
/// so a bad argument never results in an AWS request.
async fn execute<F, Fut>(command: Command, config: Config, user: String, connect: F) -> Result<()>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<(AwsContext, String)>>,
{
    let session = Session {
        config,
        user,
        connect,
    };

    match command {
        Command::Submit(args) => {
            let request = submit_request(&args, &session.config, &session.user)?;
            let (aws, _) = session.open().await?;
            let submission = submit_jobs(&BatchClient::new(&aws), &request, args.json).await?;
            println!("{}", submission.to_json());
        }
        Command::List { queue, status } => {
            let (aws, settings) = session.open().await?;
            let queue = queue.unwrap_or_else(|| settings.config.batch.default_queue.clone());
            let jobs = jobs::list_jobs(&BatchClient::new(&aws), &queue, &status).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        Command::Log {
            identifier,
            attempt,
        } => {
            let (aws, settings) = session.open().await?;
            fetch_job_log(
                &BatchClient::new(&aws),
                &LogsClient::new(&aws),
                &settings.config.batch.log_group,
                &identifier,
                attempt,
                &mut std::io::stdout(),
            )
            .await?;
        }
        Command::JobdefSkeleton { pi_name, image } => {
            let (_, settings) = session.open().await?;
            println!(
                "{}",
                jobdef::skeleton(&settings, &pi_name, image.as_deref()).to_json()
            );
        }
        Command::Onboard { user, pi } => {
            let (aws, settings) = session.open().await?;
            onboard(&IamClient::new(&aws), &settings, &user, &pi).await?;
        }
        Command::MakeAmi(args) => {
            let (aws, settings) = session.open().await?;
            let configurator = SshConfigurator {
                credentials: SshCredentials::from_file(
                    &settings.config.ami.ssh_user,
                    &args.private_key_file,
                )
                .await?,
                wait: settings.config.polling.wait_config(),
            };
            let backend = Ec2AmiBackend::new(&aws);
            let options = AmiOptions {
                scratch_size_gb: args.scratch_size,
                security_group: args.security_group_name,
                key_pair: args.key_pair_name,
                keep_previous: args.keep_previous,
            };
            let image_id = AmiBuilder::new(&backend, &configurator, &settings)
                .build(&options)
                .await?;
            println!("{image_id}");
        }
        Command::Environment { action } => {
            let (aws, settings) = session.open().await?;
            let batch = BatchClient::new(&aws);
            match action {
                EnvironmentAction::Create => {
                    let job = environment::create(&batch, &settings).await?;
                    println!("{}", serde_json::to_string_pretty(&job)?);
                }
                EnvironmentAction::Clean => environment::clean(&batch, &settings).await?,
            }
        }
    }
    Ok(())
}

/// Builds the request and checks that every job template of it can be built.
fn submit_request(args: &SubmitArgs, config: &Config, user: &str) -> Result<SubmitRequest> {
    let strategy = args
        .strategy
        .as_deref()
        .map(Strategy::from_name)
        .transpose()?;
    let batch_config = &config.batch;
    let request = SubmitRequest {
        options: JobOptions {
            name: args.name.clone(),
            queue: args
                .queue
                .clone()
                .unwrap_or_else(|| batch_config.default_queue.clone()),
            job_definition: args
                .jobdef
                .clone()
                .unwrap_or_else(|| batch_config.default_job_definition.clone()),
            vcpus: args.cpus,
            memory: args.memory,
            attempts: args.attempts,
            command: args.command.clone(),
            environment: args.environment.clone(),
            parameters: args.parameters.clone(),
        },
        num_jobs: args.numjobs,
        strategy,
        user: user.to_owned(),
    };
    build_job_templates(&request)?;
    Ok(request)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("hutch-batch").chain(args.iter().copied())).unwrap()
    }

    fn config() -> Config {
        Config::from_file(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../config/config.yaml"
        ))
        .unwrap()
    }

    /// Runs `args` with a connection that records whether it was attempted and then fails.
    async fn execute_offline(args: &[&str]) -> (anyhow::Error, bool) {
        let connected = AtomicBool::new(false);
        let err = execute(parse(args).command, config(), "jdoe".to_owned(), |_region| {
            connected.store(true, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("no AWS access in tests")) }
        })
        .await
        .unwrap_err();
        (err, connected.load(Ordering::SeqCst))
    }

    #[test]
    fn submit_defaults_from_config() {
        let Command::Submit(args) = parse(&["submit"]).command else {
            panic!("expected submit");
        };
        let request = submit_request(&args, &config(), "jdoe").unwrap();
        assert_eq!(request.options.queue, "small");
        assert_eq!(request.options.job_definition, "hello:2");
        assert_eq!(request.options.name, "sample_job");
        assert_eq!(request.num_jobs, 1);
        assert_eq!(request.strategy, None);
    }

    #[test]
    fn submit_with_strategy() {
        let Command::Submit(args) = parse(&[
            "submit",
            "--numjobs",
            "3",
            "--strategy",
            "iteration-env",
            "--environment",
            r#"[{"name": "A", "value": "1"}]"#,
        ])
        .command
        else {
            panic!("expected submit");
        };
        let request = submit_request(&args, &config(), "jdoe").unwrap();
        assert_eq!(request.strategy, Some(Strategy::IterationEnv));
        assert_eq!(request.num_jobs, 3);
    }

    #[test]
    fn unknown_strategy_is_user_error() {
        let Command::Submit(args) = parse(&["submit", "--strategy", "nope"]).command else {
            panic!("expected submit");
        };
        let err = submit_request(&args, &config(), "jdoe").unwrap_err();
        assert!(UserError::find(&err).is_some());
    }

    #[tokio::test]
    async fn malformed_environment_fails_before_connecting() {
        let (err, connected) = execute_offline(&["submit", "--environment", "{not json"]).await;
        assert_eq!(
            UserError::find(&err).unwrap().to_string(),
            "Environment argument is not properly formatted JSON!"
        );
        assert!(!connected);
    }

    #[tokio::test]
    async fn parameters_list_fails_before_connecting() {
        let (err, connected) = execute_offline(&["submit", "--parameters", r#"["a"]"#]).await;
        assert!(UserError::find(&err).is_some());
        assert!(!connected);
    }

    #[tokio::test]
    async fn valid_submit_connects() {
        let (err, connected) = execute_offline(&["submit", "--numjobs", "2"]).await;
        assert_eq!(err.to_string(), "no AWS access in tests");
        assert!(connected);
    }

    #[test]
    fn environment_actions() {
        let Command::Environment { action } = parse(&["environment", "clean"]).command else {
            panic!("expected environment");
        };
        assert_eq!(action, EnvironmentAction::Clean);
    }

    #[test]
    fn make_ami_requires_key_file() {
        assert!(Cli::try_parse_from([
            "hutch-batch",
            "make-ami",
            "--security-group-name",
            "ssh",
            "--key-pair-name",
            "key"
        ])
        .is_err());
    }

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
