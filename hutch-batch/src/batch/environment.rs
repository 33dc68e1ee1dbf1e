//! Bootstrapping and tearing down a compute environment, job queue and job definition.
//!
//! Each resource is created with a single request and then polled until batch reports it `VALID`
//! before the next resource that depends on it is created.

use super::template::{ContainerOverrides, JobTemplate};
use super::{
    BatchOperations, BatchResource, BatchResourceState, BatchResourceStatus::*,
    ComputeEnvironmentSpec, JobDefinitionSpec, JobQueueSpec, SubmittedJob,
};
use crate::config::Settings;
use crate::lifecycle::{await_state, LifecycleError, WaitConfig};
use anyhow::{Context, Result};

fn compute_environment_spec(settings: &Settings) -> ComputeEnvironmentSpec {
    let environment = &settings.config.environment;
    ComputeEnvironmentSpec {
        name: environment.compute_environment.clone(),
        max_vcpus: environment.max_vcpus,
        instance_types: environment.instance_types.clone(),
        subnets: environment.subnets.clone(),
        security_group_ids: environment.security_group_ids.clone(),
        instance_role_arn: settings.instance_profile_arn(&environment.instance_role),
        service_role_arn: settings.role_arn(&environment.service_role),
        tags: environment.tags.clone(),
    }
}

fn job_definition_spec(settings: &Settings) -> JobDefinitionSpec {
    let environment = &settings.config.environment;
    JobDefinitionSpec {
        name: environment.job_definition.clone(),
        image: environment.container.image.clone(),
        vcpus: environment.container.vcpus,
        memory: environment.container.memory,
        command: environment.container.command.clone(),
        job_role_arn: settings.role_arn(&environment.container.job_role),
    }
}

async fn await_compute_environment(
    batch: &dyn BatchOperations,
    name: &str,
    target: BatchResourceState,
    wait: &WaitConfig,
) -> Result<()> {
    await_state(
        &format!("compute environment {name}"),
        &target,
        wait,
        || batch.describe_compute_environment(name),
    )
    .await?;
    Ok(())
}

async fn await_job_queue(
    batch: &dyn BatchOperations,
    name: &str,
    target: BatchResourceState,
    wait: &WaitConfig,
) -> Result<()> {
    await_state(
        &format!("job queue {name}"),
        &target,
        wait,
        || batch.describe_job_queue(name),
    )
    .await?;
    Ok(())
}

async fn await_job_queue_deleted(
    batch: &dyn BatchOperations,
    name: &str,
    wait: &WaitConfig,
) -> Result<()> {
    match await_job_queue(batch, name, BatchResourceState::disabled(Deleted), wait).await {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<LifecycleError>() {
            Some(LifecycleError::Vanished { .. }) => Ok(()),
            _ => Err(err),
        },
    }
}

/// Deleted resources are still described by batch for a while after deletion.
fn exists(resource: Option<BatchResource>) -> bool {
    resource.is_some_and(|x| x.status.status != Deleted)
}

/// Creates the compute environment, job queue and job definition named in the configuration,
/// then submits a single job to check the chain works.
///
/// Nothing is rolled back on failure, resources created before the failing step are left in place for `clean` to remove.
pub async fn create(batch: &dyn BatchOperations, settings: &Settings) -> Result<SubmittedJob> {
    let environment = &settings.config.environment;
    let wait = settings.config.polling.wait_config();

    let compute_environment = compute_environment_spec(settings);
    let arn = batch
        .create_compute_environment(&compute_environment)
        .await
        .with_context(|| {
            format!(
                "Failed to create compute environment {}",
                compute_environment.name
            )
        })?;
    tracing::info!("Created compute environment {arn}");
    await_compute_environment(
        batch,
        &compute_environment.name,
        BatchResourceState::enabled(Valid),
        &wait,
    )
    .await?;

    let queue = JobQueueSpec {
        name: environment.job_queue.clone(),
        priority: environment.queue_priority,
        compute_environment: compute_environment.name.clone(),
    };
    let arn = batch
        .create_job_queue(&queue)
        .await
        .with_context(|| format!("Failed to create job queue {}", queue.name))?;
    tracing::info!("Created job queue {arn}");
    await_job_queue(batch, &queue.name, BatchResourceState::enabled(Valid), &wait).await?;

    let job_definition = job_definition_spec(settings);
    let job_definition_arn = batch
        .register_job_definition(&job_definition)
        .await
        .with_context(|| {
            format!(
                "Failed to register job definition {}",
                job_definition.name
            )
        })?;
    tracing::info!("Registered job definition {job_definition_arn}");

    let template = JobTemplate {
        job_name: environment.job_name.clone(),
        job_queue: queue.name,
        job_definition: job_definition_arn,
        container_overrides: ContainerOverrides::default(),
        retry_strategy: None,
        parameters: None,
    };
    batch
        .submit_job(&template)
        .await
        .with_context(|| format!("Failed to submit job {}", template.job_name))
}

/// Removes the job definition, job queue and compute environment named in the configuration.
/// Resources that do not exist are skipped.
pub async fn clean(batch: &dyn BatchOperations, settings: &Settings) -> Result<()> {
    let environment = &settings.config.environment;
    let wait = settings.config.polling.wait_config();

    match batch
        .active_job_definition(&environment.job_definition)
        .await?
    {
        Some(arn) => {
            batch
                .deregister_job_definition(&arn)
                .await
                .with_context(|| format!("Failed to deregister job definition {arn}"))?;
            tracing::info!("Deregistered job definition {arn}");
        }
        None => tracing::info!(
            "Job definition {} does not exist, skipping",
            environment.job_definition
        ),
    }

    let queue = &environment.job_queue;
    if exists(batch.describe_job_queue(queue).await?) {
        batch.set_job_queue_enabled(queue, false).await?;
        await_job_queue(batch, queue, BatchResourceState::disabled(Valid), &wait).await?;
        batch
            .delete_job_queue(queue)
            .await
            .with_context(|| format!("Failed to delete job queue {queue}"))?;
        // batch refuses to delete a compute environment while a queue still references it
        await_job_queue_deleted(batch, queue, &wait).await?;
        tracing::info!("Deleted job queue {queue}");
    } else {
        tracing::info!("Job queue {queue} does not exist, skipping");
    }

    let compute_environment = &environment.compute_environment;
    if exists(batch.describe_compute_environment(compute_environment).await?) {
        batch
            .set_compute_environment_enabled(compute_environment, false)
            .await?;
        await_compute_environment(
            batch,
            compute_environment,
            BatchResourceState::disabled(Valid),
            &wait,
        )
        .await?;
        batch
            .delete_compute_environment(compute_environment)
            .await
            .with_context(|| format!("Failed to delete compute environment {compute_environment}"))?;
        tracing::info!("Deleting compute environment {compute_environment}");
    } else {
        tracing::info!("Compute environment {compute_environment} does not exist, skipping");
    }
    Ok(())
}
