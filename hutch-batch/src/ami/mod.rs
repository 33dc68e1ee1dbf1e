//! Building the scratch-enabled AMI used by the batch compute environments.
//!
//! The newest ECS optimized image is launched with an extra EBS volume attached,
//! the volume is formatted and mounted over ssh, and the instance is then imaged and made public.
//! Older images built the same way are found through their `Type` tag and removed.

use crate::lifecycle::{ResourceDescriptor, ResourceStatus};
use crate::remote::ProvisioningScript;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Display;

pub mod builder;
pub mod ec2;

/// The device the scratch volume is attached as.
/// The kernel exposes `/dev/sdb` as `/dev/xvdb`, which is what the provisioning script formats.
pub const SCRATCH_DEVICE: &str = "/dev/sdb";

pub const SCRATCH_SCRIPT: ProvisioningScript = ProvisioningScript {
    name: "scratch volume",
    commands: &[
        "sudo yum -y update",
        "sudo mkfs -t ext4 /dev/xvdb",
        "sudo mkdir /docker_scratch",
        r"echo -e '/dev/xvdb\t/docker_scratch\text4\tdefaults\t0\t0' | sudo tee -a /etc/fstab",
        "sudo mount /docker_scratch",
        "sudo stop ecs",
        // The agent must register as a new container instance when the image is launched
        "sudo rm -rf /var/lib/ecs/data/ecs_agent_data.json",
    ],
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceStatus {
    pub fn from_name(name: &str) -> Option<InstanceStatus> {
        match name {
            "pending" => Some(InstanceStatus::Pending),
            "running" => Some(InstanceStatus::Running),
            "stopping" => Some(InstanceStatus::Stopping),
            "stopped" => Some(InstanceStatus::Stopped),
            "shutting-down" => Some(InstanceStatus::ShuttingDown),
            "terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::ShuttingDown => "shutting-down",
            InstanceStatus::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

impl ResourceStatus for InstanceStatus {
    fn is_failure(&self) -> bool {
        matches!(
            self,
            InstanceStatus::ShuttingDown | InstanceStatus::Terminated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImageStatus {
    Pending,
    Available,
    Failed,
    Deregistered,
}

impl ImageStatus {
    pub fn from_name(name: &str) -> Option<ImageStatus> {
        match name {
            "pending" | "transient" => Some(ImageStatus::Pending),
            "available" => Some(ImageStatus::Available),
            "failed" | "error" | "invalid" => Some(ImageStatus::Failed),
            "deregistered" | "disabled" => Some(ImageStatus::Deregistered),
            _ => None,
        }
    }
}

impl Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Available => "available",
            ImageStatus::Failed => "failed",
            ImageStatus::Deregistered => "deregistered",
        };
        write!(f, "{name}")
    }
}

impl ResourceStatus for ImageStatus {
    fn is_failure(&self) -> bool {
        matches!(self, ImageStatus::Failed | ImageStatus::Deregistered)
    }
}

pub type Instance = ResourceDescriptor<InstanceStatus>;
pub type Image = ResourceDescriptor<ImageStatus>;

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub base_image: String,
    pub instance_type: String,
    /// Name of a security group allowing ssh from this host
    pub security_group: String,
    pub key_pair: String,
    pub scratch_size_gb: u32,
    pub tags: BTreeMap<String, String>,
}

/// An image found when looking for previous builds.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: String,
    /// ISO 8601, as reported by EC2
    pub creation_date: String,
    /// The EBS snapshots backing the image
    pub snapshot_ids: Vec<String>,
}

#[async_trait]
pub trait AmiBackend: Send + Sync {
    /// The id of the newest image whose manifest location matches `manifest_pattern`.
    async fn latest_base_image(&self, manifest_pattern: &str) -> Result<String>;

    /// Returns the id of the new instance.
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<String>;

    async fn describe_instance(&self, id: &str) -> Result<Option<Instance>>;

    async fn stop_instance(&self, id: &str) -> Result<()>;

    async fn terminate_instance(&self, id: &str) -> Result<()>;

    /// Returns the id of the new image.
    async fn create_image(&self, instance_id: &str, name: &str, description: &str) -> Result<String>;

    async fn tag_resource(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    async fn describe_image(&self, id: &str) -> Result<Option<Image>>;

    /// Allows every AWS account to launch the image.
    async fn make_image_public(&self, id: &str) -> Result<()>;

    /// Images owned by the current account with the given `Type` tag.
    async fn list_images(&self, type_tag: &str) -> Result<Vec<ImageRecord>>;

    async fn deregister_image(&self, id: &str) -> Result<()>;

    async fn delete_snapshot(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn instance_status_names() {
        for name in [
            "pending",
            "running",
            "stopping",
            "stopped",
            "shutting-down",
            "terminated",
        ] {
            assert_eq!(InstanceStatus::from_name(name).unwrap().to_string(), name);
        }
        assert_eq!(InstanceStatus::from_name("rebooting"), None);
    }

    #[test]
    fn image_failure_states() {
        assert!(ImageStatus::from_name("error").unwrap().is_failure());
        assert!(!ImageStatus::from_name("transient").unwrap().is_failure());
    }

    #[test]
    fn scratch_script_formats_before_mounting() {
        let commands = SCRATCH_SCRIPT.commands;
        let position = |prefix: &str| commands.iter().position(|x| x.starts_with(prefix)).unwrap();
        assert!(position("sudo mkfs") < position("sudo mount"));
        assert!(position("sudo stop ecs") < position("sudo rm -rf /var/lib/ecs"));
    }
}
