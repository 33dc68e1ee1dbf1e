//! [`BatchOperations`] backed by the AWS SDK.

use super::template::JobTemplate;
use super::{
    BatchOperations, BatchResource, BatchResourceState, BatchResourceStatus,
    ComputeEnvironmentSpec, JobDefinitionSpec, JobDetail, JobPage, JobQueueSpec, JobSummary,
    SubmittedJob,
};
use crate::aws::AwsContext;
use crate::lifecycle::ResourceDescriptor;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_batch::types::{
    CeState, CeStatus, CeType, ComputeEnvironmentOrder, ComputeResource, ContainerOverrides,
    ContainerProperties, CrType, JobDefinitionType, JobStatus, JqState, JqStatus, KeyValuePair,
    ResourceRequirement, ResourceType, RetryStrategy,
};
use aws_sdk_batch::Client;
use std::collections::HashMap;

#[derive(Clone)]
pub struct BatchClient {
    client: Client,
}

impl BatchClient {
    pub fn new(aws: &AwsContext) -> Self {
        BatchClient {
            client: aws.batch_client(),
        }
    }
}

fn resource_requirement(ty: ResourceType, value: u32) -> ResourceRequirement {
    ResourceRequirement::builder()
        .r#type(ty)
        .value(value.to_string())
        .build()
}

fn container_overrides(template: &JobTemplate) -> ContainerOverrides {
    let overrides = &template.container_overrides;
    let mut requirements = vec![];
    if let Some(vcpus) = overrides.vcpus {
        requirements.push(resource_requirement(ResourceType::Vcpu, vcpus));
    }
    if let Some(memory) = overrides.memory {
        requirements.push(resource_requirement(ResourceType::Memory, memory));
    }

    ContainerOverrides::builder()
        .set_resource_requirements((!requirements.is_empty()).then_some(requirements))
        .set_command(overrides.command.clone())
        .set_environment(overrides.environment.as_ref().map(|environment| {
            environment
                .iter()
                .map(|x| KeyValuePair::builder().name(&x.name).value(&x.value).build())
                .collect()
        }))
        .build()
}

fn batch_status(status: &str) -> Result<BatchResourceStatus> {
    match status {
        "CREATING" => Ok(BatchResourceStatus::Creating),
        "UPDATING" => Ok(BatchResourceStatus::Updating),
        "DELETING" => Ok(BatchResourceStatus::Deleting),
        "DELETED" => Ok(BatchResourceStatus::Deleted),
        "VALID" => Ok(BatchResourceStatus::Valid),
        "INVALID" => Ok(BatchResourceStatus::Invalid),
        status => Err(anyhow!("Unknown batch resource status {status}")),
    }
}

fn created_at(millis: Option<i64>) -> Option<String> {
    millis
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|x| x.to_rfc3339())
}

#[async_trait]
impl BatchOperations for BatchClient {
    async fn submit_job(&self, template: &JobTemplate) -> Result<SubmittedJob> {
        let response = self
            .client
            .submit_job()
            .job_name(&template.job_name)
            .job_queue(&template.job_queue)
            .job_definition(&template.job_definition)
            .container_overrides(container_overrides(template))
            .set_retry_strategy(template.retry_strategy.as_ref().map(|retry| {
                RetryStrategy::builder()
                    .attempts(retry.attempts as i32)
                    .build()
            }))
            .set_parameters(
                template
                    .parameters
                    .as_ref()
                    .map(|x| x.clone().into_iter().collect::<HashMap<_, _>>()),
            )
            .send()
            .await?;

        let job_name: Option<&str> = response.job_name().into();
        let job_id: Option<&str> = response.job_id().into();
        Ok(SubmittedJob {
            job_name: job_name.unwrap_or(&template.job_name).to_owned(),
            job_id: job_id
                .context("SubmitJob response did not include a job id")?
                .to_owned(),
            job_arn: response.job_arn().map(|x| x.to_owned()),
        })
    }

    async fn list_jobs(
        &self,
        queue: &str,
        status: &str,
        next_token: Option<String>,
    ) -> Result<JobPage> {
        let response = self
            .client
            .list_jobs()
            .job_queue(queue)
            .job_status(JobStatus::from(status))
            .set_next_token(next_token)
            .send()
            .await?;

        let jobs = response
            .job_summary_list()
            .iter()
            .map(|job| {
                let job_id: Option<&str> = job.job_id().into();
                let job_name: Option<&str> = job.job_name().into();
                JobSummary {
                    job_id: job_id.unwrap_or_default().to_owned(),
                    job_name: job_name.unwrap_or_default().to_owned(),
                    status: job
                        .status()
                        .map(|x| x.as_str().to_owned())
                        .unwrap_or_else(|| status.to_owned()),
                    created_at: created_at(job.created_at()),
                }
            })
            .collect();

        Ok(JobPage {
            jobs,
            next_token: response.next_token().map(|x| x.to_owned()),
        })
    }

    async fn describe_job(&self, job_id: &str) -> Result<Option<JobDetail>> {
        let response = self.client.describe_jobs().jobs(job_id).send().await?;
        let Some(job) = response.jobs().first() else {
            return Ok(None);
        };

        let status: Option<&JobStatus> = job.status().into();
        Ok(Some(JobDetail {
            job_id: job_id.to_owned(),
            status: status.map(|x| x.as_str().to_owned()).unwrap_or_default(),
            attempt_log_streams: job
                .attempts()
                .iter()
                .map(|attempt| {
                    attempt
                        .container()
                        .and_then(|x| x.log_stream_name())
                        .map(|x| x.to_owned())
                })
                .collect(),
            container_log_stream: job
                .container()
                .and_then(|x| x.log_stream_name())
                .map(|x| x.to_owned()),
        }))
    }

    async fn create_compute_environment(&self, spec: &ComputeEnvironmentSpec) -> Result<String> {
        let resources = ComputeResource::builder()
            .r#type(CrType::Ec2)
            .minv_cpus(0)
            .maxv_cpus(spec.max_vcpus)
            .set_instance_types(Some(spec.instance_types.clone()))
            .set_subnets(Some(spec.subnets.clone()))
            .set_security_group_ids(Some(spec.security_group_ids.clone()))
            .instance_role(&spec.instance_role_arn)
            .set_tags(Some(spec.tags.clone().into_iter().collect()))
            .build();

        let response = self
            .client
            .create_compute_environment()
            .compute_environment_name(&spec.name)
            .r#type(CeType::Managed)
            .state(CeState::Enabled)
            .compute_resources(resources)
            .service_role(&spec.service_role_arn)
            .send()
            .await?;
        let arn: Option<&str> = response.compute_environment_arn().into();
        Ok(arn.unwrap_or(&spec.name).to_owned())
    }

    async fn describe_compute_environment(&self, name: &str) -> Result<Option<BatchResource>> {
        let response = self
            .client
            .describe_compute_environments()
            .compute_environments(name)
            .send()
            .await?;
        let Some(environment) = response.compute_environments().first() else {
            return Ok(None);
        };

        let status = environment
            .status()
            .map(CeStatus::as_str)
            .context("Compute environment has no status")?;
        let state = BatchResourceState {
            status: batch_status(status)?,
            enabled: environment.state() == Some(&CeState::Enabled),
        };
        let mut descriptor = ResourceDescriptor::new(name, state);
        descriptor.reason = environment.status_reason().map(|x| x.to_owned());
        descriptor.tags = environment
            .tags()
            .map(|x| x.clone().into_iter().collect())
            .unwrap_or_default();
        Ok(Some(descriptor))
    }

    async fn set_compute_environment_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let state = if enabled {
            CeState::Enabled
        } else {
            CeState::Disabled
        };
        self.client
            .update_compute_environment()
            .compute_environment(name)
            .state(state)
            .send()
            .await?;
        Ok(())
    }

    async fn delete_compute_environment(&self, name: &str) -> Result<()> {
        self.client
            .delete_compute_environment()
            .compute_environment(name)
            .send()
            .await?;
        Ok(())
    }

    async fn create_job_queue(&self, spec: &JobQueueSpec) -> Result<String> {
        let response = self
            .client
            .create_job_queue()
            .job_queue_name(&spec.name)
            .state(JqState::Enabled)
            .priority(spec.priority)
            .compute_environment_order(
                ComputeEnvironmentOrder::builder()
                    .order(0)
                    .compute_environment(&spec.compute_environment)
                    .build(),
            )
            .send()
            .await?;
        let arn: Option<&str> = response.job_queue_arn().into();
        Ok(arn.unwrap_or(&spec.name).to_owned())
    }

    async fn describe_job_queue(&self, name: &str) -> Result<Option<BatchResource>> {
        let response = self
            .client
            .describe_job_queues()
            .job_queues(name)
            .send()
            .await?;
        let Some(queue) = response.job_queues().first() else {
            return Ok(None);
        };

        let status = queue
            .status()
            .map(JqStatus::as_str)
            .context("Job queue has no status")?;
        let state = BatchResourceState {
            status: batch_status(status)?,
            enabled: queue.state() == Some(&JqState::Enabled),
        };
        let mut descriptor = ResourceDescriptor::new(name, state);
        descriptor.reason = queue.status_reason().map(|x| x.to_owned());
        Ok(Some(descriptor))
    }

    async fn set_job_queue_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let state = if enabled {
            JqState::Enabled
        } else {
            JqState::Disabled
        };
        self.client
            .update_job_queue()
            .job_queue(name)
            .state(state)
            .send()
            .await?;
        Ok(())
    }

    async fn delete_job_queue(&self, name: &str) -> Result<()> {
        self.client.delete_job_queue().job_queue(name).send().await?;
        Ok(())
    }

    async fn register_job_definition(&self, spec: &JobDefinitionSpec) -> Result<String> {
        let properties = ContainerProperties::builder()
            .image(&spec.image)
            .resource_requirements(resource_requirement(
                ResourceType::Vcpu,
                spec.vcpus as u32,
            ))
            .resource_requirements(resource_requirement(
                ResourceType::Memory,
                spec.memory as u32,
            ))
            .set_command(Some(spec.command.clone()))
            .job_role_arn(&spec.job_role_arn)
            .build();

        let response = self
            .client
            .register_job_definition()
            .job_definition_name(&spec.name)
            .r#type(JobDefinitionType::Container)
            .container_properties(properties)
            .send()
            .await?;
        let arn: Option<&str> = response.job_definition_arn().into();
        Ok(arn
            .context("RegisterJobDefinition response did not include an arn")?
            .to_owned())
    }

    async fn active_job_definition(&self, name: &str) -> Result<Option<String>> {
        let response = self
            .client
            .describe_job_definitions()
            .job_definition_name(name)
            .status("ACTIVE")
            .send()
            .await?;
        Ok(response
            .job_definitions()
            .iter()
            .max_by_key(|x| x.revision())
            .and_then(|x| {
                let arn: Option<&str> = x.job_definition_arn().into();
                arn.map(|x| x.to_owned())
            }))
    }

    async fn deregister_job_definition(&self, arn: &str) -> Result<()> {
        self.client
            .deregister_job_definition()
            .job_definition(arn)
            .send()
            .await?;
        Ok(())
    }
}
