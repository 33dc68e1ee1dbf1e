use super::{BatchOperations, JobSummary};
use anyhow::{Context, Result};

pub const DEFAULT_STATUS: &str = "RUNNING";

/// Lists every job in `queue` with `status`, following pagination to the end.
pub async fn list_jobs(
    batch: &dyn BatchOperations,
    queue: &str,
    status: &str,
) -> Result<Vec<JobSummary>> {
    let mut jobs = vec![];
    let mut next_token = None;
    loop {
        let page = batch
            .list_jobs(queue, status, next_token)
            .await
            .with_context(|| format!("Failed to list {status} jobs in queue {queue}"))?;
        jobs.extend(page.jobs);
        match page.next_token {
            Some(token) => next_token = Some(token),
            None => break,
        }
    }
    tracing::debug!(queue, status, count = jobs.len(), "listed jobs");
    Ok(jobs)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::batch::test::FakeBatch;
    use crate::batch::JobPage;
    use pretty_assertions::assert_eq;

    fn job(id: &str) -> JobSummary {
        JobSummary {
            job_id: id.to_owned(),
            job_name: format!("jdoe-x-{id}"),
            status: "RUNNING".to_owned(),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn follows_pagination() {
        let batch = FakeBatch {
            pages: vec![
                JobPage {
                    jobs: vec![job("1"), job("2")],
                    next_token: Some("1".to_owned()),
                },
                JobPage {
                    jobs: vec![job("3")],
                    next_token: None,
                },
            ],
            ..Default::default()
        };
        let jobs = list_jobs(&batch, "small", DEFAULT_STATUS).await.unwrap();

        assert_eq!(jobs, vec![job("1"), job("2"), job("3")]);
        assert_eq!(
            batch.calls(),
            vec![
                "list_jobs small RUNNING None",
                "list_jobs small RUNNING Some(\"1\")"
            ]
        );
    }

    #[tokio::test]
    async fn empty_queue() {
        let batch = FakeBatch::default();
        let jobs = list_jobs(&batch, "small", "FAILED").await.unwrap();
        assert_eq!(jobs, vec![]);
    }
}
