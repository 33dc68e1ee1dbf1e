//! [`AmiBackend`] backed by the AWS SDK.

use super::{
    AmiBackend, Image, ImageRecord, ImageStatus, Instance, InstanceStatus, LaunchRequest,
    SCRATCH_DEVICE,
};
use crate::aws::error::is_not_found;
use crate::aws::AwsContext;
use crate::lifecycle::ResourceDescriptor;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, InstanceType, LaunchPermission,
    LaunchPermissionModifications, PermissionGroup, ResourceType, Tag, TagSpecification,
};
use aws_sdk_ec2::Client;
use std::collections::BTreeMap;

pub struct Ec2AmiBackend {
    client: Client,
}

impl Ec2AmiBackend {
    pub fn new(aws: &AwsContext) -> Self {
        Ec2AmiBackend {
            client: aws.ec2_client(),
        }
    }
}

fn to_tags(tags: &BTreeMap<String, String>) -> Vec<Tag> {
    tags.iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect()
}

fn from_tags(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .filter_map(|tag| Some((tag.key()?.to_owned(), tag.value()?.to_owned())))
        .collect()
}

#[async_trait]
impl AmiBackend for Ec2AmiBackend {
    async fn latest_base_image(&self, manifest_pattern: &str) -> Result<String> {
        let response = self
            .client
            .describe_images()
            .owners("amazon")
            .filters(
                Filter::builder()
                    .name("manifest-location")
                    .values(manifest_pattern)
                    .build(),
            )
            .filters(Filter::builder().name("state").values("available").build())
            .send()
            .await
            .context("Failed to describe images")?;

        let image = response
            .images()
            .iter()
            .max_by(|a, b| {
                a.creation_date()
                    .unwrap_or_default()
                    .cmp(b.creation_date().unwrap_or_default())
            })
            .and_then(|x| x.image_id())
            .with_context(|| format!("No image matches manifest location {manifest_pattern}"))?;
        tracing::debug!(image, "found latest base image");
        Ok(image.to_owned())
    }

    async fn launch_instance(&self, request: &LaunchRequest) -> Result<String> {
        let instance_type: InstanceType = request
            .instance_type
            .parse()
            .map_err(|_| anyhow!("Invalid instance type: {}", request.instance_type))?;

        let response = self
            .client
            .run_instances()
            .image_id(&request.base_image)
            .instance_type(instance_type)
            .min_count(1)
            .max_count(1)
            .security_groups(&request.security_group)
            .key_name(&request.key_pair)
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name(SCRATCH_DEVICE)
                    .ebs(
                        EbsBlockDevice::builder()
                            .encrypted(false)
                            .volume_size(request.scratch_size_gb as i32)
                            .build(),
                    )
                    .build(),
            )
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .set_tags(Some(to_tags(&request.tags)))
                    .build(),
            )
            .send()
            .await?;

        response
            .instances()
            .first()
            .and_then(|x| x.instance_id())
            .map(|x| x.to_owned())
            .context("RunInstances response did not include an instance")
    }

    async fn describe_instance(&self, id: &str) -> Result<Option<Instance>> {
        let response = match self.client.describe_instances().instance_ids(id).send().await {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(instance) = response
            .reservations()
            .first()
            .and_then(|x| x.instances().first())
        else {
            return Ok(None);
        };

        let state = instance
            .state()
            .and_then(|x| x.name())
            .context("Instance has no state")?;
        let status = InstanceStatus::from_name(state.as_str())
            .ok_or_else(|| anyhow!("Unknown instance state {}", state.as_str()))?;

        let mut descriptor = ResourceDescriptor::new(id, status);
        descriptor.reason = instance
            .state_reason()
            .and_then(|x| x.message())
            .map(|x| x.to_owned());
        descriptor.endpoint = instance
            .public_ip_address()
            .map(|x| x.parse())
            .transpose()
            .context("Instance has an invalid public ip address")?;
        descriptor.tags = from_tags(instance.tags());
        Ok(Some(descriptor))
    }

    async fn stop_instance(&self, id: &str) -> Result<()> {
        self.client.stop_instances().instance_ids(id).send().await?;
        Ok(())
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(id)
            .send()
            .await?;
        Ok(())
    }

    async fn create_image(&self, instance_id: &str, name: &str, description: &str) -> Result<String> {
        let response = self
            .client
            .create_image()
            .instance_id(instance_id)
            .name(name)
            .description(description)
            .send()
            .await?;
        response
            .image_id()
            .map(|x| x.to_owned())
            .context("CreateImage response did not include an image id")
    }

    async fn tag_resource(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.client
            .create_tags()
            .resources(id)
            .set_tags(Some(to_tags(tags)))
            .send()
            .await?;
        Ok(())
    }

    async fn describe_image(&self, id: &str) -> Result<Option<Image>> {
        let response = match self.client.describe_images().image_ids(id).send().await {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(image) = response.images().first() else {
            return Ok(None);
        };

        let state = image.state().context("Image has no state")?;
        let status = ImageStatus::from_name(state.as_str())
            .ok_or_else(|| anyhow!("Unknown image state {}", state.as_str()))?;
        let mut descriptor = ResourceDescriptor::new(id, status);
        descriptor.reason = image
            .state_reason()
            .and_then(|x| x.message())
            .map(|x| x.to_owned());
        descriptor.tags = from_tags(image.tags());
        Ok(Some(descriptor))
    }

    async fn make_image_public(&self, id: &str) -> Result<()> {
        self.client
            .modify_image_attribute()
            .image_id(id)
            .launch_permission(
                LaunchPermissionModifications::builder()
                    .add(
                        LaunchPermission::builder()
                            .group(PermissionGroup::All)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await?;
        Ok(())
    }

    async fn list_images(&self, type_tag: &str) -> Result<Vec<ImageRecord>> {
        let response = self
            .client
            .describe_images()
            .owners("self")
            .filters(Filter::builder().name("tag:Type").values(type_tag).build())
            .send()
            .await?;

        Ok(response
            .images()
            .iter()
            .filter_map(|image| {
                Some(ImageRecord {
                    id: image.image_id()?.to_owned(),
                    creation_date: image.creation_date().unwrap_or_default().to_owned(),
                    snapshot_ids: image
                        .block_device_mappings()
                        .iter()
                        .filter_map(|x| x.ebs()?.snapshot_id())
                        .map(|x| x.to_owned())
                        .collect(),
                })
            })
            .collect())
    }

    async fn deregister_image(&self, id: &str) -> Result<()> {
        self.client.deregister_image().image_id(id).send().await?;
        Ok(())
    }

    async fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.client.delete_snapshot().snapshot_id(id).send().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tags_skip_incomplete_entries() {
        let tags = vec![
            Tag::builder().key("Type").value("FredHutchBatchAMI").build(),
            Tag::builder().key("Empty").build(),
        ];
        assert_eq!(
            from_tags(&tags),
            BTreeMap::from([("Type".to_owned(), "FredHutchBatchAMI".to_owned())])
        );
    }
}
