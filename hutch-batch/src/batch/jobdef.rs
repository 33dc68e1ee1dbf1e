//! A partially filled in container job definition for users to complete and register themselves.

use crate::config::Settings;
use serde::Serialize;
use std::collections::BTreeMap;

const SCRATCH_VOLUME: &str = "docker_scratch";

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinitionSkeleton {
    pub job_definition_name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub parameters: BTreeMap<String, String>,
    pub retry_strategy: RetryAttempts,
    pub container_properties: ContainerProperties,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RetryAttempts {
    pub attempts: u32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProperties {
    pub image: String,
    pub vcpus: u32,
    pub memory: u32,
    pub command: Vec<String>,
    pub job_role_arn: String,
    pub volumes: Vec<Volume>,
    pub environment: Vec<serde_json::Value>,
    pub mount_points: Vec<MountPoint>,
    pub ulimits: Vec<serde_json::Value>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Volume {
    pub host: VolumeHost,
    pub name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeHost {
    pub source_path: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    pub container_path: String,
    pub read_only: bool,
    pub source_volume: String,
}

/// Fills in the job role of `pi`, the image and the scratch volume mounted at `/scratch`.
/// The remaining fields are left as placeholders.
pub fn skeleton(settings: &Settings, pi: &str, image: Option<&str>) -> JobDefinitionSkeleton {
    JobDefinitionSkeleton {
        job_definition_name: String::new(),
        ty: "container".to_owned(),
        parameters: BTreeMap::from([("KeyName".to_owned(), String::new())]),
        retry_strategy: RetryAttempts { attempts: 1 },
        container_properties: ContainerProperties {
            image: image
                .unwrap_or(&settings.config.batch.default_image)
                .to_owned(),
            vcpus: 1,
            memory: 2000,
            command: vec![String::new()],
            job_role_arn: settings.role_arn(&settings.pi_task_role_name(pi)),
            volumes: vec![Volume {
                host: VolumeHost {
                    source_path: "/docker_scratch".to_owned(),
                },
                name: SCRATCH_VOLUME.to_owned(),
            }],
            environment: vec![],
            mount_points: vec![MountPoint {
                container_path: "/scratch".to_owned(),
                read_only: false,
                source_volume: SCRATCH_VOLUME.to_owned(),
            }],
            ulimits: vec![],
        },
    }
}

impl JobDefinitionSkeleton {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
