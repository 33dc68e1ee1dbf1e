use anyhow::Result;
use async_trait::async_trait;
use hutch_batch::batch::strategy::Strategy;
use hutch_batch::batch::submit::{submit_jobs, Submission, SubmitRequest};
use hutch_batch::batch::template::{JobOptions, JobTemplate};
use hutch_batch::batch::{
    BatchOperations, BatchResource, ComputeEnvironmentSpec, JobDefinitionSpec, JobDetail, JobPage,
    JobQueueSpec, SubmittedJob,
};
use hutch_batch::error::UserError;
use pretty_assertions::assert_eq;
use std::sync::Mutex;

/// Accepts every submission and fails any other call.
#[derive(Default)]
struct RecordingBatch {
    submitted: Mutex<Vec<JobTemplate>>,
}

#[async_trait]
impl BatchOperations for RecordingBatch {
    async fn submit_job(&self, template: &JobTemplate) -> Result<SubmittedJob> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(template.clone());
        Ok(SubmittedJob {
            job_name: template.job_name.clone(),
            job_id: format!("job-{}", submitted.len()),
            job_arn: None,
        })
    }

    async fn list_jobs(&self, _: &str, _: &str, _: Option<String>) -> Result<JobPage> {
        unimplemented!()
    }

    async fn describe_job(&self, _: &str) -> Result<Option<JobDetail>> {
        unimplemented!()
    }

    async fn create_compute_environment(&self, _: &ComputeEnvironmentSpec) -> Result<String> {
        unimplemented!()
    }

    async fn describe_compute_environment(&self, _: &str) -> Result<Option<BatchResource>> {
        unimplemented!()
    }

    async fn set_compute_environment_enabled(&self, _: &str, _: bool) -> Result<()> {
        unimplemented!()
    }

    async fn delete_compute_environment(&self, _: &str) -> Result<()> {
        unimplemented!()
    }

    async fn create_job_queue(&self, _: &JobQueueSpec) -> Result<String> {
        unimplemented!()
    }

    async fn describe_job_queue(&self, _: &str) -> Result<Option<BatchResource>> {
        unimplemented!()
    }

    async fn set_job_queue_enabled(&self, _: &str, _: bool) -> Result<()> {
        unimplemented!()
    }

    async fn delete_job_queue(&self, _: &str) -> Result<()> {
        unimplemented!()
    }

    async fn register_job_definition(&self, _: &JobDefinitionSpec) -> Result<String> {
        unimplemented!()
    }

    async fn active_job_definition(&self, _: &str) -> Result<Option<String>> {
        unimplemented!()
    }

    async fn deregister_job_definition(&self, _: &str) -> Result<()> {
        unimplemented!()
    }
}

fn request(options: JobOptions, num_jobs: u32) -> SubmitRequest {
    SubmitRequest {
        options: JobOptions {
            name: "x".to_owned(),
            queue: "small".to_owned(),
            job_definition: "hello:2".to_owned(),
            ..options
        },
        num_jobs,
        strategy: None,
        user: "jdoe".to_owned(),
    }
}

#[tokio::test]
async fn three_jobs_share_queue_and_definition() {
    let batch = RecordingBatch::default();
    let submission = submit_jobs(&batch, &request(JobOptions::default(), 3), false)
        .await
        .unwrap();

    let submitted = batch.submitted.lock().unwrap().clone();
    assert_eq!(
        submitted
            .iter()
            .map(|x| (x.job_name.as_str(), x.job_queue.as_str(), x.job_definition.as_str()))
            .collect::<Vec<_>>(),
        vec![
            ("jdoe-x-1", "small", "hello:2"),
            ("jdoe-x-2", "small", "hello:2"),
            ("jdoe-x-3", "small", "hello:2"),
        ]
    );

    let json: serde_json::Value = serde_json::from_str(&submission.to_json()).unwrap();
    assert_eq!(
        json,
        serde_json::json!([
            {"jobName": "jdoe-x-1", "jobId": "job-1", "jobArn": null},
            {"jobName": "jdoe-x-2", "jobId": "job-2", "jobArn": null},
            {"jobName": "jdoe-x-3", "jobId": "job-3", "jobArn": null},
        ])
    );
}

#[tokio::test]
async fn malformed_environment_makes_no_calls() {
    let batch = RecordingBatch::default();
    let options = JobOptions {
        environment: Some("{not json".to_owned()),
        ..Default::default()
    };
    let err = submit_jobs(&batch, &request(options, 3), false)
        .await
        .unwrap_err();

    assert_eq!(
        UserError::find(&err).unwrap().to_string(),
        "Environment argument is not properly formatted JSON!"
    );
    assert!(batch.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn parameters_list_makes_no_calls() {
    let batch = RecordingBatch::default();
    let options = JobOptions {
        parameters: Some(r#"["a", "b"]"#.to_owned()),
        ..Default::default()
    };
    let err = submit_jobs(&batch, &request(options, 1), false)
        .await
        .unwrap_err();

    assert!(UserError::find(&err).is_some());
    assert!(batch.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn dry_run_with_strategy() {
    let batch = RecordingBatch::default();
    let request = SubmitRequest {
        strategy: Some(Strategy::EchoIteration),
        ..request(JobOptions::default(), 2)
    };
    let submission = submit_jobs(&batch, &request, true).await.unwrap();

    match submission {
        Submission::DryRun(templates) => {
            assert_eq!(
                templates[1].container_overrides.command,
                Some(vec!["echo".to_owned(), "hello from iteration 2".to_owned()])
            );
        }
        Submission::Submitted(_) => panic!("dry run submitted jobs"),
    }
    assert!(batch.submitted.lock().unwrap().is_empty());
}
