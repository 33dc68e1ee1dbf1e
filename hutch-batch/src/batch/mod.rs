//! AWS Batch jobs, queues, compute environments and job definitions.
//!
//! Workflows are written against [`BatchOperations`] so they can be run against an in-memory fake in tests.
//! [`client::BatchClient`] is the implementation backed by the AWS SDK.

use crate::lifecycle::{ResourceDescriptor, ResourceStatus};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;

pub mod client;
pub mod environment;
pub mod jobdef;
pub mod jobs;
pub mod strategy;
pub mod submit;
pub mod template;

use template::JobTemplate;

/// The response to a successful submission, as printed to the user.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedJob {
    pub job_name: String,
    pub job_id: String,
    pub job_arn: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    pub job_name: String,
    pub status: String,
    /// RFC 3339
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPage {
    pub jobs: Vec<JobSummary>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobDetail {
    pub job_id: String,
    pub status: String,
    /// The log stream of each finished attempt, in attempt order.
    pub attempt_log_streams: Vec<Option<String>>,
    /// The log stream of the attempt currently running.
    pub container_log_stream: Option<String>,
}

/// The status shared by compute environments and job queues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchResourceStatus {
    Creating,
    Updating,
    Deleting,
    Deleted,
    Valid,
    Invalid,
}

impl Display for BatchResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchResourceStatus::Creating => "CREATING",
            BatchResourceStatus::Updating => "UPDATING",
            BatchResourceStatus::Deleting => "DELETING",
            BatchResourceStatus::Deleted => "DELETED",
            BatchResourceStatus::Valid => "VALID",
            BatchResourceStatus::Invalid => "INVALID",
        };
        write!(f, "{name}")
    }
}

impl ResourceStatus for BatchResourceStatus {
    fn is_failure(&self) -> bool {
        matches!(self, BatchResourceStatus::Invalid)
    }
}

/// The status of a compute environment or job queue together with whether it is enabled.
/// Batch only applies a change of enabled state once the status settles back to `VALID`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchResourceState {
    pub status: BatchResourceStatus,
    pub enabled: bool,
}

impl BatchResourceState {
    pub fn enabled(status: BatchResourceStatus) -> Self {
        BatchResourceState {
            status,
            enabled: true,
        }
    }

    pub fn disabled(status: BatchResourceStatus) -> Self {
        BatchResourceState {
            status,
            enabled: false,
        }
    }
}

impl Display for BatchResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.enabled {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{} and DISABLED", self.status)
        }
    }
}

impl ResourceStatus for BatchResourceState {
    fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

pub type BatchResource = ResourceDescriptor<BatchResourceState>;

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeEnvironmentSpec {
    pub name: String,
    pub max_vcpus: i32,
    pub instance_types: Vec<String>,
    pub subnets: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub instance_role_arn: String,
    pub service_role_arn: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobQueueSpec {
    pub name: String,
    pub priority: i32,
    pub compute_environment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinitionSpec {
    pub name: String,
    pub image: String,
    pub vcpus: i32,
    pub memory: i32,
    pub command: Vec<String>,
    pub job_role_arn: String,
}

#[async_trait]
pub trait BatchOperations: Send + Sync {
    async fn submit_job(&self, template: &JobTemplate) -> Result<SubmittedJob>;

    async fn list_jobs(
        &self,
        queue: &str,
        status: &str,
        next_token: Option<String>,
    ) -> Result<JobPage>;

    /// Returns `None` when no job has the id.
    async fn describe_job(&self, job_id: &str) -> Result<Option<JobDetail>>;

    /// Returns the arn of the new compute environment.
    async fn create_compute_environment(&self, spec: &ComputeEnvironmentSpec) -> Result<String>;

    async fn describe_compute_environment(&self, name: &str) -> Result<Option<BatchResource>>;

    async fn set_compute_environment_enabled(&self, name: &str, enabled: bool) -> Result<()>;

    async fn delete_compute_environment(&self, name: &str) -> Result<()>;

    /// Returns the arn of the new job queue.
    async fn create_job_queue(&self, spec: &JobQueueSpec) -> Result<String>;

    async fn describe_job_queue(&self, name: &str) -> Result<Option<BatchResource>>;

    async fn set_job_queue_enabled(&self, name: &str, enabled: bool) -> Result<()>;

    async fn delete_job_queue(&self, name: &str) -> Result<()>;

    /// Returns the arn of the new job definition revision.
    async fn register_job_definition(&self, spec: &JobDefinitionSpec) -> Result<String>;

    /// Returns the arn of the newest active revision of the named job definition.
    async fn active_job_definition(&self, name: &str) -> Result<Option<String>>;

    async fn deregister_job_definition(&self, arn: &str) -> Result<()>;
}
