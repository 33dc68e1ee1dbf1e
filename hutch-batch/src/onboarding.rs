//! Giving a user access to batch under their PI.
//!
//! A user needs membership of the end user batch group, permission to pass the shared batch roles,
//! and permission to pass their PI's task role, which grants jobs access to the PI's bucket.

use crate::aws::error::{is_already_exists, is_not_found};
use crate::aws::AwsContext;
use crate::config::Settings;
use crate::error::UserError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_iam::Client;

#[async_trait]
pub trait IamDirectory: Send + Sync {
    async fn group_exists(&self, group: &str) -> Result<bool>;

    async fn role_exists(&self, role: &str) -> Result<bool>;

    async fn create_role(&self, role: &str, trust_policy: &str, description: &str) -> Result<()>;

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()>;

    async fn add_user_to_group(&self, user: &str, group: &str) -> Result<()>;

    async fn attach_user_policy(&self, user: &str, policy_arn: &str) -> Result<()>;

    /// Returns the arn of the new policy, or `None` if a policy with the name already exists.
    async fn create_policy(
        &self,
        name: &str,
        document: &str,
        description: &str,
    ) -> Result<Option<String>>;
}

pub struct IamClient {
    client: Client,
}

impl IamClient {
    pub fn new(aws: &AwsContext) -> Self {
        IamClient {
            client: aws.iam_client(),
        }
    }
}

#[async_trait]
impl IamDirectory for IamClient {
    async fn group_exists(&self, group: &str) -> Result<bool> {
        match self.client.get_group().group_name(group).send().await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn role_exists(&self, role: &str) -> Result<bool> {
        match self.client.get_role().role_name(role).send().await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_role(&self, role: &str, trust_policy: &str, description: &str) -> Result<()> {
        self.client
            .create_role()
            .role_name(role)
            .assume_role_policy_document(trust_policy)
            .description(description)
            .send()
            .await?;
        Ok(())
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> Result<()> {
        self.client
            .attach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await?;
        Ok(())
    }

    async fn add_user_to_group(&self, user: &str, group: &str) -> Result<()> {
        self.client
            .add_user_to_group()
            .user_name(user)
            .group_name(group)
            .send()
            .await?;
        Ok(())
    }

    async fn attach_user_policy(&self, user: &str, policy_arn: &str) -> Result<()> {
        self.client
            .attach_user_policy()
            .user_name(user)
            .policy_arn(policy_arn)
            .send()
            .await?;
        Ok(())
    }

    async fn create_policy(
        &self,
        name: &str,
        document: &str,
        description: &str,
    ) -> Result<Option<String>> {
        match self
            .client
            .create_policy()
            .policy_name(name)
            .policy_document(document)
            .description(description)
            .send()
            .await
        {
            Ok(response) => Ok(response
                .policy()
                .and_then(|x| x.arn())
                .map(|x| x.to_owned())),
            Err(err) if is_already_exists(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn task_role_trust_policy() -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "",
            "Effect": "Allow",
            "Principal": {"Service": "ecs-tasks.amazonaws.com"},
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

fn pass_role_policy(role_arn: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": ["iam:PassRole"],
            "Resource": [role_arn]
        }]
    })
    .to_string()
}

/// Onboards `user` under `pi`.
///
/// Each step can be repeated safely, so onboarding can be rerun after a partial failure.
pub async fn onboard(iam: &dyn IamDirectory, settings: &Settings, user: &str, pi: &str) -> Result<()> {
    let group = settings.pi_group_name(pi);
    if !iam
        .group_exists(&group)
        .await
        .with_context(|| format!("Failed to look up IAM group {group}"))?
    {
        return Err(
            UserError::NotFound(format!("There is no IAM group {group} for this PI!")).into(),
        );
    }

    let role = settings.pi_task_role_name(pi);
    if iam.role_exists(&role).await? {
        tracing::info!("Task role {role} already exists");
    } else {
        let bucket = settings.pi_bucket_name(pi);
        iam.create_role(
            &role,
            &task_role_trust_policy(),
            &format!("batch role granting S3 access to {bucket} bucket"),
        )
        .await
        .with_context(|| format!("Failed to create task role {role}"))?;
        let bucket_policy = settings.policy_arn(&settings.pi_bucket_policy_name(pi));
        iam.attach_role_policy(&role, &bucket_policy)
            .await
            .with_context(|| format!("Failed to attach {bucket_policy} to {role}"))?;
        tracing::info!("Created task role {role} with access to bucket {bucket}");
    }

    let batch_group = &settings.config.iam.end_user_batch_group;
    iam.add_user_to_group(user, batch_group)
        .await
        .with_context(|| format!("Failed to add {user} to group {batch_group}"))?;

    let shared_pass_role = settings.policy_arn(&settings.config.iam.pass_role_policy);
    iam.attach_user_policy(user, &shared_pass_role)
        .await
        .with_context(|| format!("Failed to attach {shared_pass_role} to {user}"))?;

    let pass_role_name = settings.pi_pass_role_policy_name(pi);
    let pass_role_arn = match iam
        .create_policy(
            &pass_role_name,
            &pass_role_policy(&settings.role_arn(&role)),
            &format!("Allows users in {pi} group to pass S3 access role."),
        )
        .await
        .with_context(|| format!("Failed to create policy {pass_role_name}"))?
    {
        Some(arn) => {
            tracing::info!("Created policy {arn}");
            arn
        }
        None => {
            tracing::info!("Policy {pass_role_name} already exists, reusing it");
            settings.policy_arn(&pass_role_name)
        }
    };
    iam.attach_user_policy(user, &pass_role_arn)
        .await
        .with_context(|| format!("Failed to attach {pass_role_arn} to {user}"))?;

    tracing::info!("Onboarded {user} under {pi}");
    Ok(())
}
