//! Shared AWS configuration context
//!
//! The SDK configuration is loaded once and every service client is created from it.

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use std::sync::Arc;

pub mod error;

#[derive(Clone)]
pub struct AwsContext {
    config: Arc<SdkConfig>,
    region: String,
}

impl AwsContext {
    /// Load credentials and settings from the environment, config files and instance roles, for the given region.
    pub async fn new(region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .load()
            .await;

        AwsContext {
            config: Arc::new(config),
            region: region.to_owned(),
        }
    }

    pub fn batch_client(&self) -> aws_sdk_batch::Client {
        aws_sdk_batch::Client::new(&self.config)
    }

    pub fn ec2_client(&self) -> aws_sdk_ec2::Client {
        aws_sdk_ec2::Client::new(&self.config)
    }

    pub fn iam_client(&self) -> aws_sdk_iam::Client {
        aws_sdk_iam::Client::new(&self.config)
    }

    pub fn logs_client(&self) -> aws_sdk_cloudwatchlogs::Client {
        aws_sdk_cloudwatchlogs::Client::new(&self.config)
    }

    /// The id of the account the loaded credentials belong to.
    ///
    /// GetCallerIdentity requires no permissions so this only fails on invalid credentials.
    pub async fn account_id(&self) -> Result<String> {
        let identity = aws_sdk_sts::Client::new(&self.config)
            .get_caller_identity()
            .send()
            .await
            .context("Failed to get AWS caller identity, check your credentials")?;
        let account = identity
            .account()
            .context("No account id returned from STS GetCallerIdentity")?;
        tracing::debug!(account_id = %account, region = %self.region, "AWS account identified");
        Ok(account.to_owned())
    }
}

impl std::fmt::Debug for AwsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsContext")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}
