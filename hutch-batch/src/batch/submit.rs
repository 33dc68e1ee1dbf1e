//! Submitting a group of jobs built from one template.

use super::strategy::{Strategy, TemplateStrategy};
use super::template::{build_template, validate_job_name, JobOptions, JobTemplate, TemplateError};
use super::{BatchOperations, SubmittedJob};
use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub options: JobOptions,
    pub num_jobs: u32,
    pub strategy: Option<Strategy>,
    /// Included in every job name so that users can find their own jobs
    pub user: String,
}

#[derive(Debug)]
pub enum Submission {
    /// The templates that would have been submitted
    DryRun(Vec<JobTemplate>),
    Submitted(Vec<SubmittedJob>),
}

impl Submission {
    pub fn to_json(&self) -> String {
        match self {
            Submission::DryRun(templates) => serde_json::to_string_pretty(templates),
            Submission::Submitted(jobs) => serde_json::to_string_pretty(jobs),
        }
        .unwrap_or_default()
    }
}

/// Builds the template for every job of the request.
///
/// Each job starts from its own copy of the base template, so changes made by the strategy for one job never reach the next.
pub fn build_job_templates(request: &SubmitRequest) -> Result<Vec<JobTemplate>, TemplateError> {
    let base = build_template(&request.options)?;
    (1..=request.num_jobs)
        .map(|iteration| {
            let mut template = base.clone();
            template.job_name = format!("{}-{}-{iteration}", request.user, request.options.name);
            let template = match &request.strategy {
                Some(strategy) => strategy.apply(template, iteration),
                None => template,
            };
            validate_job_name(&template.job_name)?;
            Ok(template)
        })
        .collect()
}

/// Every template is built and validated before the first job is submitted,
/// so a bad argument never results in a partially submitted group.
pub async fn submit_jobs(
    batch: &dyn BatchOperations,
    request: &SubmitRequest,
    dry_run: bool,
) -> Result<Submission> {
    let templates = build_job_templates(request)?;
    if dry_run {
        return Ok(Submission::DryRun(templates));
    }

    let mut submitted = Vec::with_capacity(templates.len());
    for template in &templates {
        let job = batch
            .submit_job(template)
            .await
            .with_context(|| format!("Failed to submit job {}", template.job_name))?;
        tracing::info!(job_name = %job.job_name, job_id = %job.job_id, "submitted job");
        submitted.push(job);
    }
    Ok(Submission::Submitted(submitted))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::batch::test::FakeBatch;
    use pretty_assertions::assert_eq;

    fn request(num_jobs: u32) -> SubmitRequest {
        SubmitRequest {
            options: JobOptions {
                name: "x".to_owned(),
                queue: "small".to_owned(),
                job_definition: "hello:2".to_owned(),
                ..Default::default()
            },
            num_jobs,
            strategy: None,
            user: "jdoe".to_owned(),
        }
    }

    #[tokio::test]
    async fn submits_numbered_jobs() {
        let batch = FakeBatch::default();
        let submission = submit_jobs(&batch, &request(3), false).await.unwrap();

        let submitted = batch.submitted.lock().unwrap().clone();
        assert_eq!(
            submitted.iter().map(|x| x.job_name.as_str()).collect::<Vec<_>>(),
            vec!["jdoe-x-1", "jdoe-x-2", "jdoe-x-3"]
        );
        assert!(submitted
            .iter()
            .all(|x| x.job_queue == "small" && x.job_definition == "hello:2"));

        match submission {
            Submission::Submitted(jobs) => {
                assert_eq!(jobs.len(), 3);
                assert_eq!(jobs[2].job_id, "id-3");
            }
            Submission::DryRun(_) => panic!("expected a real submission"),
        }
    }

    #[tokio::test]
    async fn dry_run_makes_no_calls() {
        let batch = FakeBatch::default();
        let submission = submit_jobs(&batch, &request(2), true).await.unwrap();

        assert_eq!(batch.calls(), Vec::<String>::new());
        let json: serde_json::Value = serde_json::from_str(&submission.to_json()).unwrap();
        assert_eq!(json[1]["jobName"], "jdoe-x-2");
    }

    #[tokio::test]
    async fn strategy_changes_do_not_leak_between_jobs() {
        let batch = FakeBatch::default();
        let request = SubmitRequest {
            strategy: Some(Strategy::IterationEnv),
            ..request(3)
        };
        submit_jobs(&batch, &request, false).await.unwrap();

        let submitted = batch.submitted.lock().unwrap().clone();
        for (index, template) in submitted.iter().enumerate() {
            let environment = template.container_overrides.environment.as_ref().unwrap();
            assert_eq!(environment.len(), 1);
            assert_eq!(environment[0].value, (index + 1).to_string());
        }
    }

    #[tokio::test]
    async fn invalid_name_rejected_before_any_submission() {
        let batch = FakeBatch::default();
        let mut request = request(2);
        request.options.name = "has space".to_owned();
        let err = submit_jobs(&batch, &request, false).await.unwrap_err();

        assert!(err.downcast_ref::<TemplateError>().is_some());
        assert_eq!(batch.calls(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn submission_failure_names_the_job() {
        let batch = FakeBatch {
            failing_submission: Some(1),
            ..Default::default()
        };
        let err = submit_jobs(&batch, &request(3), false).await.unwrap_err();

        assert_eq!(err.to_string(), "Failed to submit job jdoe-x-2");
        assert_eq!(batch.calls(), vec!["submit_job jdoe-x-1"]);
    }
}
