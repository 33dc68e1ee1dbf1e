//! Reading the CloudWatch log output of a batch job.

use crate::aws::{error::is_not_found, AwsContext};
use crate::batch::BatchOperations;
use crate::error::UserError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::Client;
use std::io::Write;

/// The job statuses in which a job has started writing log output.
const STATUSES_WITH_LOGS: &[&str] = &["RUNNING", "SUCCEEDED", "FAILED"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogPage {
    pub messages: Vec<String>,
    pub next_forward_token: Option<String>,
}

#[async_trait]
pub trait LogEvents: Send + Sync {
    /// Reads one page of events, oldest first.
    async fn get_log_events(
        &self,
        group: &str,
        stream: &str,
        next_token: Option<String>,
    ) -> Result<LogPage>;
}

pub struct LogsClient {
    client: Client,
}

impl LogsClient {
    pub fn new(aws: &AwsContext) -> Self {
        LogsClient {
            client: aws.logs_client(),
        }
    }
}

#[async_trait]
impl LogEvents for LogsClient {
    async fn get_log_events(
        &self,
        group: &str,
        stream: &str,
        next_token: Option<String>,
    ) -> Result<LogPage> {
        let response = match self
            .client
            .get_log_events()
            .log_group_name(group)
            .log_stream_name(stream)
            .start_from_head(true)
            .set_next_token(next_token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => {
                return Err(UserError::NotFound(format!(
                    "No log stream {stream} in log group {group}"
                ))
                .into())
            }
            Err(err) => return Err(err.into()),
        };

        Ok(LogPage {
            messages: response
                .events()
                .iter()
                .filter_map(|x| x.message().map(|x| x.to_owned()))
                .collect(),
            next_forward_token: response.next_forward_token().map(|x| x.to_owned()),
        })
    }
}

/// Works out the log stream to read.
///
/// An identifier containing a `/` is already a log stream name, anything else is a job id.
/// For a job id the stream of attempt number `attempt` is used,
/// falling back to the running container when the job has not finished an attempt yet.
pub async fn resolve_log_stream(
    batch: &dyn BatchOperations,
    identifier: &str,
    attempt: usize,
) -> Result<String> {
    if identifier.contains('/') {
        return Ok(identifier.to_owned());
    }

    let job = batch
        .describe_job(identifier)
        .await
        .with_context(|| format!("Failed to describe job {identifier}"))?
        .ok_or_else(|| UserError::NotFound("No such job!".to_owned()))?;

    if !STATUSES_WITH_LOGS.contains(&job.status.as_str()) {
        return Err(UserError::NotFound(format!(
            "Job has no log output yet (status {}), try again when it's RUNNING.",
            job.status
        ))
        .into());
    }

    let stream = if job.attempt_log_streams.is_empty() {
        job.container_log_stream
    } else {
        match job.attempt_log_streams.get(attempt) {
            Some(stream) => stream.clone(),
            None => {
                return Err(UserError::NotFound(format!(
                    "Job {identifier} has no attempt {attempt}, it has {} attempts",
                    job.attempt_log_streams.len()
                ))
                .into())
            }
        }
    };
    stream.ok_or_else(|| {
        UserError::NotFound(format!("Job {identifier} has no log stream yet")).into()
    })
}

/// Writes every message of `stream` to `out`, one per line, reading from the head of the stream
/// until a page comes back empty or the forward token stops changing.
pub async fn write_log_stream(
    logs: &dyn LogEvents,
    group: &str,
    stream: &str,
    out: &mut dyn Write,
) -> Result<()> {
    let mut next_token: Option<String> = None;
    loop {
        let page = logs
            .get_log_events(group, stream, next_token.clone())
            .await
            .with_context(|| format!("Failed to read log stream {stream}"))?;
        if page.messages.is_empty() {
            break;
        }
        for message in &page.messages {
            writeln!(out, "{message}")?;
        }
        if page.next_forward_token.is_none() || page.next_forward_token == next_token {
            break;
        }
        next_token = page.next_forward_token;
    }
    Ok(())
}

pub async fn fetch_job_log(
    batch: &dyn BatchOperations,
    logs: &dyn LogEvents,
    group: &str,
    identifier: &str,
    attempt: usize,
    out: &mut dyn Write,
) -> Result<()> {
    let stream = resolve_log_stream(batch, identifier, attempt).await?;
    tracing::debug!(group, stream = %stream, "reading log stream");
    write_log_stream(logs, group, &stream, out).await
}
