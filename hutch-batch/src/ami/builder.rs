use super::{
    AmiBackend, Image, ImageRecord, ImageStatus, Instance, InstanceStatus, LaunchRequest,
    SCRATCH_SCRIPT,
};
use crate::config::Settings;
use crate::lifecycle::{await_state, WaitConfig};
use crate::remote::Configurator;
use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct AmiOptions {
    pub scratch_size_gb: u32,
    pub security_group: String,
    pub key_pair: String,
    /// Skip removing images from previous builds
    pub keep_previous: bool,
}

pub struct AmiBuilder<'a> {
    backend: &'a dyn AmiBackend,
    configurator: &'a dyn Configurator,
    settings: &'a Settings,
    wait: WaitConfig,
}

/// The images to remove, oldest first. `keep_id` is never included.
pub fn reclaim_plan(images: Vec<ImageRecord>, keep_id: &str) -> Vec<ImageRecord> {
    images
        .into_iter()
        .filter(|image| image.id != keep_id)
        .sorted_by(|a, b| a.creation_date.cmp(&b.creation_date))
        .collect()
}

pub fn image_name(scratch_size_gb: u32, timestamp: &str) -> String {
    format!("ECS image with {scratch_size_gb}GB non-encrypted scratch at /scratch. Created at {timestamp}.")
}

impl<'a> AmiBuilder<'a> {
    pub fn new(
        backend: &'a dyn AmiBackend,
        configurator: &'a dyn Configurator,
        settings: &'a Settings,
    ) -> Self {
        AmiBuilder {
            backend,
            configurator,
            settings,
            wait: settings.config.polling.wait_config(),
        }
    }

    /// Launches an instance of `base_image` with a scratch volume of the requested size attached.
    pub async fn provision(&self, base_image: &str, options: &AmiOptions) -> Result<String> {
        let request = LaunchRequest {
            base_image: base_image.to_owned(),
            instance_type: self.settings.config.ami.instance_type.clone(),
            security_group: options.security_group.clone(),
            key_pair: options.key_pair.clone(),
            scratch_size_gb: options.scratch_size_gb,
            tags: BTreeMap::from([
                (
                    "Name".to_owned(),
                    "To create a new AMI for use with Batch".to_owned(),
                ),
                ("ParentAMI".to_owned(), base_image.to_owned()),
                ("Creator".to_owned(), self.settings.user.clone()),
            ]),
        };
        let id = self
            .backend
            .launch_instance(&request)
            .await
            .with_context(|| format!("Failed to launch an instance of {base_image}"))?;
        tracing::info!("Launched instance {id} from {base_image}");
        Ok(id)
    }

    pub async fn await_instance(&self, id: &str, target: InstanceStatus) -> Result<Instance> {
        Ok(await_state(
            &format!("instance {id}"),
            &target,
            &self.wait,
            || self.backend.describe_instance(id),
        )
        .await?)
    }

    pub async fn await_image(&self, id: &str, target: ImageStatus) -> Result<Image> {
        Ok(await_state(&format!("image {id}"), &target, &self.wait, || {
            self.backend.describe_image(id)
        })
        .await?)
    }

    /// Stops the instance, images it, publishes the image and terminates the instance.
    /// Returns the id of the new image.
    pub async fn finalize(
        &self,
        instance_id: &str,
        base_image: &str,
        scratch_size_gb: u32,
        timestamp: &str,
    ) -> Result<String> {
        self.backend
            .stop_instance(instance_id)
            .await
            .with_context(|| format!("Failed to stop instance {instance_id}"))?;
        self.await_instance(instance_id, InstanceStatus::Stopped)
            .await?;

        let name = image_name(scratch_size_gb, timestamp);
        let description = format!("based on {base_image}, created by {}", self.settings.user);
        let image_id = self
            .backend
            .create_image(instance_id, &name, &description)
            .await
            .with_context(|| format!("Failed to create an image from instance {instance_id}"))?;
        tracing::info!("Creating image {image_id}: {name}");

        let tags = BTreeMap::from([
            ("Name".to_owned(), name),
            (
                "Type".to_owned(),
                self.settings.config.ami.type_tag.clone(),
            ),
        ]);
        self.backend
            .tag_resource(&image_id, &tags)
            .await
            .with_context(|| format!("Failed to tag image {image_id}"))?;
        self.await_image(&image_id, ImageStatus::Available).await?;

        self.backend
            .make_image_public(&image_id)
            .await
            .with_context(|| format!("Failed to make image {image_id} public"))?;
        tracing::info!("Made image {image_id} public");

        self.backend
            .terminate_instance(instance_id)
            .await
            .with_context(|| format!("Failed to terminate instance {instance_id}"))?;
        tracing::info!("Terminating instance {instance_id}");
        Ok(image_id)
    }

    /// Removes every previous image carrying the type tag apart from `keep_id`, oldest first.
    ///
    /// Each image is deregistered before its snapshots are deleted, since a snapshot backing a registered image cannot be deleted.
    /// The first failure stops the removal and is returned. Returns the ids of the removed images.
    pub async fn reclaim_previous(&self, type_tag: &str, keep_id: &str) -> Result<Vec<String>> {
        let images = self
            .backend
            .list_images(type_tag)
            .await
            .with_context(|| format!("Failed to list images tagged Type={type_tag}"))?;

        let mut removed = vec![];
        for image in reclaim_plan(images, keep_id) {
            tracing::info!("Deleting old image {}", image.id);
            self.backend
                .deregister_image(&image.id)
                .await
                .with_context(|| format!("Failed to deregister old image {}", image.id))?;
            for snapshot in &image.snapshot_ids {
                tracing::info!("Deleting old snapshot {snapshot}");
                self.backend
                    .delete_snapshot(snapshot)
                    .await
                    .with_context(|| format!("Failed to delete snapshot {snapshot} of old image {}", image.id))?;
            }
            removed.push(image.id);
        }
        Ok(removed)
    }

    /// Runs the whole build and returns the id of the new image.
    pub async fn build(&self, options: &AmiOptions) -> Result<String> {
        let ami = &self.settings.config.ami;
        let base_image = self
            .backend
            .latest_base_image(&ami.base_image_manifest)
            .await
            .context("Failed to find the base image")?;
        tracing::info!("Building on base image {base_image}");

        let instance_id = self.provision(&base_image, options).await?;
        let image_id = match self.configure_and_image(&instance_id, &base_image, options).await {
            Ok(image_id) => image_id,
            Err(err) => {
                tracing::error!("Instance {instance_id} was left behind and must be terminated manually");
                return Err(err);
            }
        };

        if options.keep_previous {
            tracing::info!("Keeping previous images");
        } else {
            let removed = self.reclaim_previous(&ami.type_tag, &image_id).await?;
            tracing::info!("Removed {} previous images", removed.len());
        }
        Ok(image_id)
    }

    async fn configure_and_image(
        &self,
        instance_id: &str,
        base_image: &str,
        options: &AmiOptions,
    ) -> Result<String> {
        let instance = self
            .await_instance(instance_id, InstanceStatus::Running)
            .await?;
        let endpoint = instance
            .endpoint
            .ok_or_else(|| anyhow!("Instance {instance_id} is running but has no public address"))?;
        self.configurator
            .configure(endpoint, &SCRATCH_SCRIPT)
            .await
            .with_context(|| format!("Failed to configure instance {instance_id}"))?;

        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        self.finalize(instance_id, base_image, options.scratch_size_gb, &timestamp)
            .await
    }
}
