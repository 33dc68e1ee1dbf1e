//! Config types, used for deserializing the hutch-batch configuration file

use crate::lifecycle::WaitConfig;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub main_log_level: String,
    pub region: String,
    /// The AWS accounts these tools may run under.
    /// The active account is looked up once at startup and must be one of these.
    pub accounts: Vec<AccountProfile>,
    pub iam: IamConfig,
    pub batch: BatchConfig,
    pub ami: AmiConfig,
    pub polling: PollingConfig,
    pub environment: EnvironmentConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AccountProfile {
    pub name: String,
    pub account_id: String,
    pub bucket_prefix: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct IamConfig {
    /// Prefix of the per PI roles and policies, e.g. `fh-pi-` gives `fh-pi-smith-b-batchtask`
    pub role_prefix: String,
    pub pi_group_prefix: String,
    pub end_user_batch_group: String,
    /// Managed policy allowing end users to pass the shared batch roles
    pub pass_role_policy: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    pub default_queue: String,
    pub default_job_definition: String,
    pub log_group: String,
    pub default_image: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct AmiConfig {
    /// `manifest-location` filter selecting the ECS optimized images to build on top of.
    pub base_image_manifest: String,
    pub instance_type: String,
    /// Value of the `Type` tag that marks images built by this tool.
    pub type_tag: String,
    pub ssh_user: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl PollingConfig {
    pub fn wait_config(&self) -> WaitConfig {
        WaitConfig {
            poll_interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub compute_environment: String,
    pub job_queue: String,
    pub job_definition: String,
    pub job_name: String,
    pub queue_priority: i32,
    pub max_vcpus: i32,
    pub instance_types: Vec<String>,
    pub subnets: Vec<String>,
    pub security_group_ids: Vec<String>,
    /// Name of the instance profile the compute environment's instances run with
    pub instance_role: String,
    /// Name of the role the batch service assumes
    pub service_role: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub container: ContainerConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    pub image: String,
    pub vcpus: i32,
    pub memory: i32,
    pub command: Vec<String>,
    /// Name of the role the job's containers run as
    pub job_role: String,
}

impl Config {
    pub fn from_file(filepath: &str) -> Result<Config> {
        let file = std::fs::File::open(filepath)
            .with_context(|| format!("Couldn't open the config file {}", filepath))?;
        serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {}", filepath))
    }
}

/// The configuration resolved against the environment the tools are running in.
///
/// Built once at startup and passed into every workflow so that no workflow needs to inspect
/// the active account or environment variables itself.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: Config,
    pub account: AccountProfile,
    /// The invoking user, used in job names and resource tags.
    pub user: String,
}

impl Settings {
    pub fn resolve(config: Config, account_id: &str, user: String) -> Result<Settings> {
        let account = config
            .accounts
            .iter()
            .find(|account| account.account_id == account_id)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "Unknown AWS account number {account_id}, expected one of: {}",
                    config
                        .accounts
                        .iter()
                        .map(|x| format!("{} ({})", x.account_id, x.name))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })?;
        Ok(Settings {
            config,
            account,
            user,
        })
    }

    pub fn role_arn(&self, role_name: &str) -> String {
        format!("arn:aws:iam::{}:role/{role_name}", self.account.account_id)
    }

    pub fn policy_arn(&self, policy_name: &str) -> String {
        format!("arn:aws:iam::{}:policy/{policy_name}", self.account.account_id)
    }

    pub fn instance_profile_arn(&self, profile_name: &str) -> String {
        format!(
            "arn:aws:iam::{}:instance-profile/{profile_name}",
            self.account.account_id
        )
    }

    pub fn pi_group_name(&self, pi: &str) -> String {
        format!("{}{pi}", self.config.iam.pi_group_prefix)
    }

    pub fn pi_task_role_name(&self, pi: &str) -> String {
        format!("{}{pi}-batchtask", self.config.iam.role_prefix)
    }

    pub fn pi_bucket_policy_name(&self, pi: &str) -> String {
        format!("{}{pi}-bucket-access", self.config.iam.role_prefix)
    }

    pub fn pi_pass_role_policy_name(&self, pi: &str) -> String {
        format!("{}{pi}-passrole", self.config.iam.role_prefix)
    }

    pub fn pi_bucket_name(&self, pi: &str) -> String {
        format!("{}{pi}", self.account.bucket_prefix)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn test_config() -> Config {
        serde_yaml::from_str(include_str!("../../config/config.yaml")).unwrap()
    }

    pub(crate) fn test_settings() -> Settings {
        Settings::resolve(test_config(), "064561331775", "jdoe".to_owned()).unwrap()
    }

    #[test]
    fn shipped_config_parses() {
        let config = test_config();
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.polling.wait_config().poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn resolve_known_account() {
        let settings = test_settings();
        assert_eq!(settings.account.name, "hse");
        assert_eq!(settings.pi_bucket_name("smith-b"), "fh-pi-smith-b");
        assert_eq!(
            settings.role_arn(&settings.pi_task_role_name("smith-b")),
            "arn:aws:iam::064561331775:role/fh-pi-smith-b-batchtask"
        );
        assert_eq!(
            settings.policy_arn(&settings.pi_pass_role_policy_name("smith-b")),
            "arn:aws:iam::064561331775:policy/fh-pi-smith-b-passrole"
        );
        assert_eq!(
            settings.instance_profile_arn("fh-pi-universal-batchrole"),
            "arn:aws:iam::064561331775:instance-profile/fh-pi-universal-batchrole"
        );
    }

    #[test]
    fn resolve_unknown_account() {
        let err = Settings::resolve(test_config(), "111111111111", "jdoe".to_owned()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown AWS account number 111111111111, expected one of: 344850189907 (scicomp), 064561331775 (hse)"
        );
    }

    #[test]
    fn unknown_fields_rejected() {
        let yaml = include_str!("../../config/config.yaml").replace(
            "main_log_level:",
            "not_a_field: 1\nmain_log_level:",
        );
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }
}
