//! Construction of job submission templates from command line overrides.
//!
//! A [`JobTemplate`] serializes to the same json accepted by `aws batch submit-job --cli-input-json`.
//! Overrides that were not given are left out entirely so that the job definition's values apply.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

const MAX_JOB_NAME_LENGTH: usize = 128;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("{argument} argument is not properly formatted JSON!")]
    InvalidJson {
        argument: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Parameters argument is not a JSON object/dictionary!")]
    ParametersNotObject,
    #[error("Parameters argument value for {key:?} is not a string!")]
    ParameterValueNotString { key: String },
    #[error("Environment argument is not a JSON list!")]
    EnvironmentNotArray,
    #[error("Environment argument entry {index} is not an object with string \"name\" and \"value\" fields!")]
    EnvironmentEntryInvalid {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Command argument is not a JSON list of strings!")]
    CommandNotArrayOfStrings,
    #[error("Job name {name:?} is invalid, it must be at most 128 characters, start with a letter or number and contain only letters, numbers, hyphens and underscores")]
    InvalidJobName { name: String },
}

/// The overrides supplied on the command line, still as raw text.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub name: String,
    pub queue: String,
    pub job_definition: String,
    pub vcpus: Option<u32>,
    /// MiB
    pub memory: Option<u32>,
    pub attempts: Option<u32>,
    /// JSON list of strings
    pub command: Option<String>,
    /// JSON list of `{"name": .., "value": ..}` objects
    pub environment: Option<String>,
    /// JSON object of string values
    pub parameters: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    pub job_name: String,
    pub job_queue: String,
    pub job_definition: String,
    pub container_overrides: ContainerOverrides,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parameters: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverrides {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vcpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub memory: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub environment: Option<Vec<EnvironmentVariable>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    pub attempts: u32,
}

impl JobTemplate {
    pub fn to_json(&self) -> String {
        // A struct of strings and numbers always serializes
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

fn parse_json(argument: &'static str, text: &str) -> Result<serde_json::Value, TemplateError> {
    serde_json::from_str(text).map_err(|source| TemplateError::InvalidJson { argument, source })
}

fn parse_environment(text: &str) -> Result<Vec<EnvironmentVariable>, TemplateError> {
    match parse_json("Environment", text)? {
        serde_json::Value::Array(entries) => entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                serde_json::from_value(entry)
                    .map_err(|source| TemplateError::EnvironmentEntryInvalid { index, source })
            })
            .collect(),
        _ => Err(TemplateError::EnvironmentNotArray),
    }
}

fn parse_parameters(text: &str) -> Result<BTreeMap<String, String>, TemplateError> {
    match parse_json("Parameters", text)? {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(value) => Ok((key, value)),
                _ => Err(TemplateError::ParameterValueNotString { key }),
            })
            .collect(),
        _ => Err(TemplateError::ParametersNotObject),
    }
}

fn parse_command(text: &str) -> Result<Vec<String>, TemplateError> {
    match parse_json("Command", text)? {
        serde_json::Value::Array(args) => args
            .into_iter()
            .map(|arg| match arg {
                serde_json::Value::String(arg) => Ok(arg),
                _ => Err(TemplateError::CommandNotArrayOfStrings),
            })
            .collect(),
        _ => Err(TemplateError::CommandNotArrayOfStrings),
    }
}

/// Builds the template shared by every job of a submission.
/// The job name is set per job by the submitter.
pub fn build_template(options: &JobOptions) -> Result<JobTemplate, TemplateError> {
    let container_overrides = ContainerOverrides {
        vcpus: options.vcpus,
        memory: options.memory,
        command: options.command.as_deref().map(parse_command).transpose()?,
        environment: options
            .environment
            .as_deref()
            .map(parse_environment)
            .transpose()?,
    };

    Ok(JobTemplate {
        job_name: options.name.clone(),
        job_queue: options.queue.clone(),
        job_definition: options.job_definition.clone(),
        container_overrides,
        retry_strategy: options.attempts.map(|attempts| RetryStrategy { attempts }),
        parameters: options
            .parameters
            .as_deref()
            .map(parse_parameters)
            .transpose()?,
    })
}

pub fn validate_job_name(name: &str) -> Result<(), TemplateError> {
    let mut chars = name.chars();
    let valid = name.len() <= MAX_JOB_NAME_LENGTH
        && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TemplateError::InvalidJobName {
            name: name.to_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options() -> JobOptions {
        JobOptions {
            name: "sample_job".to_owned(),
            queue: "small".to_owned(),
            job_definition: "hello:2".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn absent_overrides_are_omitted() {
        let template = build_template(&options()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&template.to_json()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "jobName": "sample_job",
                "jobQueue": "small",
                "jobDefinition": "hello:2",
                "containerOverrides": {}
            })
        );
    }

    #[test]
    fn all_overrides() {
        let template = build_template(&JobOptions {
            vcpus: Some(4),
            memory: Some(8000),
            attempts: Some(3),
            command: Some(r#"["echo", "hello", "world"]"#.to_owned()),
            environment: Some(r#"[{"name": "FOO", "value": "bar"}]"#.to_owned()),
            parameters: Some(r#"{"KeyName": "s3://bucket/key"}"#.to_owned()),
            ..options()
        })
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&template.to_json()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "jobName": "sample_job",
                "jobQueue": "small",
                "jobDefinition": "hello:2",
                "containerOverrides": {
                    "vcpus": 4,
                    "memory": 8000,
                    "command": ["echo", "hello", "world"],
                    "environment": [{"name": "FOO", "value": "bar"}]
                },
                "retryStrategy": {"attempts": 3},
                "parameters": {"KeyName": "s3://bucket/key"}
            })
        );
    }

    #[test]
    fn parameters_must_be_object() {
        let err = build_template(&JobOptions {
            parameters: Some(r#"[{"KeyName": "x"}]"#.to_owned()),
            ..options()
        })
        .unwrap_err();
        assert!(matches!(err, TemplateError::ParametersNotObject));
        assert_eq!(
            err.to_string(),
            "Parameters argument is not a JSON object/dictionary!"
        );
    }

    #[test]
    fn parameter_values_must_be_strings() {
        let err = build_template(&JobOptions {
            parameters: Some(r#"{"count": 3}"#.to_owned()),
            ..options()
        })
        .unwrap_err();
        assert!(matches!(err, TemplateError::ParameterValueNotString { key } if key == "count"));
    }

    #[test]
    fn environment_must_be_array() {
        let err = build_template(&JobOptions {
            environment: Some(r#"{"name": "FOO", "value": "bar"}"#.to_owned()),
            ..options()
        })
        .unwrap_err();
        assert!(matches!(err, TemplateError::EnvironmentNotArray));
    }

    #[test]
    fn environment_entries_must_be_name_value() {
        let err = build_template(&JobOptions {
            environment: Some(r#"[{"name": "FOO"}]"#.to_owned()),
            ..options()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            TemplateError::EnvironmentEntryInvalid { index: 0, .. }
        ));
    }

    #[test]
    fn malformed_environment() {
        let err = build_template(&JobOptions {
            environment: Some("{not json".to_owned()),
            ..options()
        })
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Environment argument is not properly formatted JSON!"
        );
    }

    #[test]
    fn command_must_be_array_of_strings() {
        for command in [r#""echo hello""#, r#"["echo", 1]"#] {
            let err = build_template(&JobOptions {
                command: Some(command.to_owned()),
                ..options()
            })
            .unwrap_err();
            assert!(matches!(err, TemplateError::CommandNotArrayOfStrings));
        }
    }

    #[test]
    fn job_names() {
        validate_job_name("jdoe-sample_job-1").unwrap();
        validate_job_name(&"a".repeat(128)).unwrap();
        validate_job_name(&"a".repeat(129)).unwrap_err();
        validate_job_name("").unwrap_err();
        validate_job_name("-leading-hyphen").unwrap_err();
        validate_job_name("has space").unwrap_err();
        validate_job_name("has.dot").unwrap_err();
    }
}
