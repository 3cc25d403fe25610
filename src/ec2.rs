use anyhow::{anyhow, Result};
use aws_sdk_ec2::types::InstanceMetadataTagsState;

/// Toggles the visibility of EC2 instance tags within the Instance Metadata
/// Service (IMDS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceMetadataToggle {
    Enabled,
    Disabled,
}

impl From<InstanceMetadataToggle> for InstanceMetadataTagsState {
    fn from(toggle: InstanceMetadataToggle) -> Self {
        match toggle {
            InstanceMetadataToggle::Enabled => InstanceMetadataTagsState::Enabled,
            InstanceMetadataToggle::Disabled => InstanceMetadataTagsState::Disabled,
        }
    }
}

/// Client for modifying the metadata options of a running EC2 instance
pub struct Client {
    api: aws_sdk_ec2::Client,
}

impl Client {
    pub fn new(api: aws_sdk_ec2::Client) -> Self {
        Self { api }
    }

    /// Modifies the parameters of a running EC2 instance by toggling the
    /// availability of instance tags within IMDS
    pub async fn toggle_instance_metadata_tags(
        &self,
        id: &str,
        toggle: InstanceMetadataToggle,
    ) -> Result<()> {
        self.api
            .modify_instance_metadata_options()
            .instance_id(id)
            .instance_metadata_tags(InstanceMetadataTagsState::from(toggle))
            .send()
            .await
            .map_err(|err| {
                anyhow!(
                    "modifying metadata options for instance {id}: {}",
                    err.into_service_error()
                )
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_maps_to_instance_metadata_tags_state() {
        assert_eq!(
            InstanceMetadataTagsState::from(InstanceMetadataToggle::Enabled),
            InstanceMetadataTagsState::Enabled
        );
        assert_eq!(
            InstanceMetadataTagsState::from(InstanceMetadataToggle::Disabled),
            InstanceMetadataTagsState::Disabled
        );
    }
}
