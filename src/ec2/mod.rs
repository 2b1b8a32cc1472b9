pub mod device;
pub mod metadata;

use std::{path::Path, time::Instant};

use crate::errors::{
    CleanupOutcome,
    Error::{self, Other, API},
    Result,
};
use aws_sdk_ec2::{
    error::SdkError,
    types::{
        EbsInstanceBlockDeviceSpecification, Filter, InstanceBlockDeviceMappingSpecification,
        Volume, VolumeState, VolumeType,
    },
    Client,
};
use aws_types::SdkConfig as AwsSdkConfig;
use tokio::time::{sleep, Duration};

/// Implements the AWS EC2 manager for EBS provisioning.
#[derive(Debug, Clone)]
pub struct Manager {
    #[allow(dead_code)]
    shared_config: AwsSdkConfig,
    pub cli: Client,
}

/// Parameters for one create-and-attach run.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    /// Requested size in GiB. The upper bound is left to the platform.
    pub size: i32,
    /// EBS storage class, e.g. "gp2" or "gp3".
    pub volume_type: String,
    pub encrypted: bool,
    /// Ceiling on volumes already attached to the instance. The check is
    /// strictly greater-than, so an exactly-equal count still proceeds.
    pub max_attached_volumes: usize,
    /// Accepted for interface compatibility but not enforced anywhere.
    pub max_created_volumes: usize,
    /// Bounds both polling loops (volume state and device visibility).
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            size: 10,
            volume_type: String::from("gp2"),
            encrypted: true,
            max_attached_volumes: 16,
            max_created_volumes: 256,
            poll_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Creates a new EBS volume and attaches it to the local EC2 instance,
/// resolving the instance identity and placement from the metadata service.
/// Returns the device path the volume was attached at.
pub async fn create_and_attach_volume(opts: &VolumeOptions) -> Result<String> {
    let instance_id = metadata::fetch_instance_id().await?;
    let availability_zone = metadata::fetch_availability_zone().await?;
    let region = metadata::region_from_az(&availability_zone);
    log::info!(
        "provisioning a volume for '{}' in '{}'",
        instance_id,
        availability_zone
    );

    let shared_config = crate::load_config(Some(region)).await;
    let manager = Manager::new(&shared_config);
    manager
        .create_and_attach_volume(&instance_id, &availability_zone, opts)
        .await
}

/// Whether the attached-volume count is past the configured ceiling.
/// Strictly greater-than, so a count equal to the limit still passes.
#[inline]
fn over_attach_limit(attached: usize, limit: usize) -> bool {
    attached > limit
}

impl Manager {
    pub fn new(shared_config: &AwsSdkConfig) -> Self {
        let cloned = shared_config.clone();
        let cli = Client::new(shared_config);
        Self {
            shared_config: cloned,
            cli,
        }
    }

    /// Creates a volume in "availability_zone" and attaches it to
    /// "instance_id" at the next free "/dev/sd[a-z]" slot.
    ///
    /// The attached-volume ceiling and the device-slot ceiling are both
    /// checked before anything is created. If the attachment itself fails,
    /// the just-created volume is deleted so it does not keep billing, and
    /// the returned error records whether that cleanup succeeded.
    pub async fn create_and_attach_volume(
        &self,
        instance_id: &str,
        availability_zone: &str,
        opts: &VolumeOptions,
    ) -> Result<String> {
        let attached = self.describe_volumes(None, Some(instance_id)).await?;
        if over_attach_limit(attached.len(), opts.max_attached_volumes) {
            return Err(Error::MaxAttachedVolumesReached {
                attached: attached.len(),
                limit: opts.max_attached_volumes,
            });
        }

        let device = device::next_logical_device()?;

        let volume_id = self
            .create_volume(
                availability_zone,
                opts.size,
                &opts.volume_type,
                opts.encrypted,
            )
            .await?;
        self.poll_volume_state(
            &volume_id,
            VolumeState::Available,
            opts.poll_timeout,
            opts.poll_interval,
        )
        .await?;

        if let Err(e) = self.attach_volume(&volume_id, instance_id, &device).await {
            let cleanup = match self.delete_volume(&volume_id).await {
                Ok(()) => CleanupOutcome::Deleted,
                Err(del) => CleanupOutcome::DeleteFailed {
                    message: del.message(),
                },
            };
            return Err(Error::AttachFailed {
                volume_id,
                attach_error: e.message(),
                cleanup,
            });
        }

        device::poll_block_device(Path::new(&device), opts.poll_timeout, opts.poll_interval)
            .await?;

        self.set_delete_on_termination(instance_id, &device, &volume_id)
            .await?;

        Ok(device)
    }

    /// Describes volumes by volume Id or by attachment instance Id.
    /// If "volume_id" is not none, "instance_id" is ignored.
    ///
    /// e.g.,
    /// aws ec2 describe-volumes \
    /// --region ${AWS::Region} \
    /// --filters Name=attachment.instance-id,Values=$INSTANCE_ID
    ///
    /// ref. https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_DescribeVolumes.html
    pub async fn describe_volumes(
        &self,
        volume_id: Option<&str>,
        instance_id: Option<&str>,
    ) -> Result<Vec<Volume>> {
        let mut filters: Vec<Filter> = vec![];

        if let Some(vol_id) = volume_id {
            log::info!("filtering volumes via volume Id {}", vol_id);
            filters.push(
                Filter::builder()
                    .set_name(Some(String::from("volume-id")))
                    .set_values(Some(vec![vol_id.to_string()]))
                    .build(),
            );
        } else if let Some(inst_id) = instance_id {
            log::info!("filtering volumes via instance Id {}", inst_id);
            filters.push(
                Filter::builder()
                    .set_name(Some(String::from("attachment.instance-id")))
                    .set_values(Some(vec![inst_id.to_string()]))
                    .build(),
            );
        }

        let resp = self
            .cli
            .describe_volumes()
            .set_filters(Some(filters))
            .send()
            .await
            .map_err(|e| API {
                message: format!("failed describe_volumes {:?}", e),
                is_retryable: is_error_retryable(&e),
            })?;

        let volumes = resp.volumes().map(|v| v.to_vec()).unwrap_or_default();
        log::info!("described {} volumes", volumes.len());
        Ok(volumes)
    }

    /// Requests a new EBS volume in the availability zone.
    /// Platform rejections (insufficient permission, exhausted quota)
    /// propagate to the caller without retry or translation.
    ///
    /// ref. https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_CreateVolume.html
    pub async fn create_volume(
        &self,
        availability_zone: &str,
        size: i32,
        volume_type: &str,
        encrypted: bool,
    ) -> Result<String> {
        log::info!(
            "creating a {}-GiB '{}' volume in '{}' (encrypted {})",
            size,
            volume_type,
            availability_zone,
            encrypted
        );
        let resp = self
            .cli
            .create_volume()
            .availability_zone(availability_zone)
            .volume_type(VolumeType::from(volume_type))
            .size(size)
            .encrypted(encrypted)
            .send()
            .await
            .map_err(|e| API {
                message: format!("failed create_volume {:?}", e),
                is_retryable: is_error_retryable(&e),
            })?;

        let volume_id = resp
            .volume_id()
            .ok_or(Other {
                message: String::from("create_volume returned no volume Id"),
                is_retryable: false,
            })?
            .to_string();
        log::info!("created volume '{}'", volume_id);
        Ok(volume_id)
    }

    /// Polls the volume until it reports the desired state.
    /// The first poll happens after a second; subsequent polls wait "interval".
    pub async fn poll_volume_state(
        &self,
        volume_id: &str,
        desired_state: VolumeState,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Volume> {
        log::info!(
            "polling volume '{}' with desired state {:?} for timeout {:?} and interval {:?}",
            volume_id,
            desired_state,
            timeout,
            interval,
        );

        let start = Instant::now();
        let mut cnt: u128 = 0;
        loop {
            let elapsed = start.elapsed();
            if elapsed.gt(&timeout) {
                break;
            }

            let itv = {
                if cnt == 0 {
                    // first poll with no wait
                    Duration::from_secs(1)
                } else {
                    interval
                }
            };
            sleep(itv).await;

            let volumes = self.describe_volumes(Some(volume_id), None).await?;
            if volumes.len() != 1 {
                log::warn!("unexpected volume count {}", volumes.len());
                cnt += 1;
                continue;
            }
            let volume = volumes[0].clone();

            if let Some(current_state) = volume.state() {
                log::info!(
                    "poll (current volume state {:?}, elapsed {:?})",
                    current_state,
                    elapsed
                );
                if current_state.eq(&desired_state) {
                    return Ok(volume);
                }
            } else {
                log::warn!("no state in describe_volumes response");
            }

            cnt += 1;
        }

        Err(Other {
            message: format!(
                "volume '{}' did not reach {:?} in time",
                volume_id, desired_state
            ),
            is_retryable: true,
        })
    }

    /// Attaches the volume to the instance at the device path.
    ///
    /// ref. https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_AttachVolume.html
    pub async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<()> {
        log::info!(
            "attaching volume '{}' to '{}' at '{}'",
            volume_id,
            instance_id,
            device
        );
        self.cli
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(|e| API {
                message: format!("failed attach_volume {:?}", e),
                is_retryable: is_error_retryable(&e),
            })?;
        Ok(())
    }

    /// Deletes the volume.
    ///
    /// ref. https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_DeleteVolume.html
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        log::info!("deleting volume '{}'", volume_id);
        self.cli
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|e| API {
                message: format!("failed delete_volume {:?}", e),
                is_retryable: is_error_retryable(&e),
            })?;
        Ok(())
    }

    /// Updates the instance block-device mapping so the volume is deleted
    /// when the instance terminates.
    ///
    /// ref. https://docs.aws.amazon.com/AWSEC2/latest/APIReference/API_ModifyInstanceAttribute.html
    pub async fn set_delete_on_termination(
        &self,
        instance_id: &str,
        device: &str,
        volume_id: &str,
    ) -> Result<()> {
        log::info!(
            "marking volume '{}' at '{}' delete-on-termination for '{}'",
            volume_id,
            device,
            instance_id
        );
        self.cli
            .modify_instance_attribute()
            .instance_id(instance_id)
            .block_device_mappings(
                InstanceBlockDeviceMappingSpecification::builder()
                    .device_name(device)
                    .ebs(
                        EbsInstanceBlockDeviceSpecification::builder()
                            .delete_on_termination(true)
                            .volume_id(volume_id)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|e| API {
                message: format!("failed modify_instance_attribute {:?}", e),
                is_retryable: is_error_retryable(&e),
            })?;
        Ok(())
    }
}

#[inline]
pub fn is_error_retryable<E>(e: &SdkError<E>) -> bool {
    match e {
        SdkError::TimeoutError(_) | SdkError::ResponseError { .. } => true,
        SdkError::DispatchFailure(e) => e.is_timeout() || e.is_io(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_defaults() {
        let opts = VolumeOptions::default();
        assert_eq!(opts.size, 10);
        assert_eq!(opts.volume_type, "gp2");
        assert!(opts.encrypted);
        assert_eq!(opts.max_attached_volumes, 16);
        assert_eq!(opts.max_created_volumes, 256);
        assert_eq!(opts.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn attach_ceiling_permits_exactly_equal_count() {
        assert!(!over_attach_limit(15, 16));
        assert!(!over_attach_limit(16, 16));
        assert!(over_attach_limit(17, 16));
        assert!(!over_attach_limit(0, 0));
        assert!(over_attach_limit(1, 0));
    }
}
