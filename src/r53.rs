use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, HostedZoneConfig, ResourceRecordSet, RrType, Vpc,
    VpcRegion,
};

const HOSTED_ZONE_PREFIX: &str = "/hostedzone/";
const DOT_SUFFIX: char = '.';

/// TTL assigned to every record published by this tool
pub const RECORD_TTL: i64 = 300;

/// Identifies a Route 53 Private Hosted Zone (PHZ). The provider prefix is
/// stripped from the ID and the trailing root separator from the name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateHostedZone {
    pub id: String,
    pub name: String,
}

/// An A record binding a name within a private hosted zone to the private
/// IPv4 address of this EC2 instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// ID of the private hosted zone the record lives in
    pub phz_id: String,

    /// Fully qualified name of the record
    pub name: String,

    /// Value associated with the record
    pub resource: String,
}

/// Tracks what the auto-attach workflow did so that teardown can reverse
/// exactly that and nothing more
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoAttachment {
    pub phz_id: String,
    pub vpc: String,
    pub region: String,
    pub created_phz: bool,
    pub associated_phz: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    Create,
    Delete,
}

/// Outcome of a mutating zone operation. Provider errors that simply mean
/// "already in the requested state" are classified as [`ChangeOutcome::Noop`]
/// at the directory boundary and never surface as errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Applied,
    Noop,
}

/// A hosted zone as reported by the provider, identifiers unnormalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSummary {
    pub id: String,
    pub name: String,
    pub private: bool,
}

/// Directory of hosted zones. All identifiers are provider-native; the
/// [`Client`] is responsible for normalizing them
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ZoneDirectory: Send + Sync {
    async fn list_by_name(&self, name: &str) -> Result<Vec<ZoneSummary>>;

    async fn list_by_vpc(&self, vpc: &str, region: &str) -> Result<Vec<ZoneSummary>>;

    async fn get_by_id(&self, id: &str) -> Result<ZoneSummary>;

    async fn create(
        &self,
        name: &str,
        vpc: &str,
        region: &str,
        caller_reference: &str,
    ) -> Result<ZoneSummary>;

    async fn delete(&self, id: &str) -> Result<ChangeOutcome>;

    async fn associate_vpc(&self, id: &str, vpc: &str, region: &str) -> Result<ChangeOutcome>;

    async fn disassociate_vpc(&self, id: &str, vpc: &str, region: &str)
        -> Result<ChangeOutcome>;

    async fn change_record(&self, action: RecordAction, record: &ResourceRecord) -> Result<()>;
}

/// Zone directory backed by the Amazon Route 53 API
pub struct Route53Directory {
    client: aws_sdk_route53::Client,
}

impl Route53Directory {
    pub fn new(client: aws_sdk_route53::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ZoneDirectory for Route53Directory {
    async fn list_by_name(&self, name: &str) -> Result<Vec<ZoneSummary>> {
        let resp = self
            .client
            .list_hosted_zones_by_name()
            .dns_name(name)
            .send()
            .await
            .map_err(|err| {
                anyhow!("listing hosted zones by name {name}: {}", err.into_service_error())
            })?;

        Ok(resp
            .hosted_zones()
            .iter()
            .map(|zone| ZoneSummary {
                id: zone.id().to_string(),
                name: zone.name().to_string(),
                private: zone.config().map(|config| config.private_zone()).unwrap_or(false),
            })
            .collect())
    }

    async fn list_by_vpc(&self, vpc: &str, region: &str) -> Result<Vec<ZoneSummary>> {
        let resp = self
            .client
            .list_hosted_zones_by_vpc()
            .vpc_id(vpc)
            .vpc_region(VpcRegion::from(region))
            .send()
            .await
            .map_err(|err| {
                anyhow!("listing hosted zones for VPC {vpc}: {}", err.into_service_error())
            })?;

        Ok(resp
            .hosted_zone_summaries()
            .iter()
            .map(|summary| ZoneSummary {
                id: summary.hosted_zone_id().to_string(),
                name: summary.name().to_string(),
                private: true,
            })
            .collect())
    }

    async fn get_by_id(&self, id: &str) -> Result<ZoneSummary> {
        let resp = self
            .client
            .get_hosted_zone()
            .id(id)
            .send()
            .await
            .map_err(|err| anyhow!("retrieving hosted zone {id}: {}", err.into_service_error()))?;

        let zone = resp
            .hosted_zone()
            .ok_or_else(|| anyhow!("hosted zone {id} missing from response"))?;

        Ok(ZoneSummary {
            id: zone.id().to_string(),
            name: zone.name().to_string(),
            private: zone.config().map(|config| config.private_zone()).unwrap_or(false),
        })
    }

    async fn create(
        &self,
        name: &str,
        vpc: &str,
        region: &str,
        caller_reference: &str,
    ) -> Result<ZoneSummary> {
        let resp = self
            .client
            .create_hosted_zone()
            .name(name)
            .vpc(
                Vpc::builder()
                    .vpc_id(vpc)
                    .vpc_region(VpcRegion::from(region))
                    .build(),
            )
            .hosted_zone_config(HostedZoneConfig::builder().private_zone(true).build())
            .caller_reference(caller_reference)
            .send()
            .await
            .map_err(|err| anyhow!("creating hosted zone {name}: {}", err.into_service_error()))?;

        let zone = resp
            .hosted_zone()
            .ok_or_else(|| anyhow!("created hosted zone missing from response"))?;

        Ok(ZoneSummary {
            id: zone.id().to_string(),
            name: zone.name().to_string(),
            private: true,
        })
    }

    async fn delete(&self, id: &str) -> Result<ChangeOutcome> {
        match self.client.delete_hosted_zone().id(id).send().await {
            Ok(_) => Ok(ChangeOutcome::Applied),
            Err(err) => {
                let err = err.into_service_error();

                // The hosted zone may be owned by another process and still
                // contain record sets; foreign records are never forced out
                if err.is_hosted_zone_not_empty() {
                    Ok(ChangeOutcome::Noop)
                } else {
                    Err(anyhow!("deleting hosted zone {id}: {err}"))
                }
            }
        }
    }

    async fn associate_vpc(&self, id: &str, vpc: &str, region: &str) -> Result<ChangeOutcome> {
        let result = self
            .client
            .associate_vpc_with_hosted_zone()
            .hosted_zone_id(id)
            .vpc(
                Vpc::builder()
                    .vpc_id(vpc)
                    .vpc_region(VpcRegion::from(region))
                    .build(),
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(ChangeOutcome::Applied),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_conflicting_domain_exists() {
                    Ok(ChangeOutcome::Noop)
                } else {
                    Err(anyhow!("associating VPC {vpc} with hosted zone {id}: {err}"))
                }
            }
        }
    }

    async fn disassociate_vpc(
        &self,
        id: &str,
        vpc: &str,
        region: &str,
    ) -> Result<ChangeOutcome> {
        let result = self
            .client
            .disassociate_vpc_from_hosted_zone()
            .hosted_zone_id(id)
            .vpc(
                Vpc::builder()
                    .vpc_id(vpc)
                    .vpc_region(VpcRegion::from(region))
                    .build(),
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(ChangeOutcome::Applied),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_vpc_association_not_found() {
                    Ok(ChangeOutcome::Noop)
                } else {
                    Err(anyhow!(
                        "disassociating VPC {vpc} from hosted zone {id}: {err}"
                    ))
                }
            }
        }
    }

    async fn change_record(&self, action: RecordAction, record: &ResourceRecord) -> Result<()> {
        let action = match action {
            RecordAction::Create => ChangeAction::Create,
            RecordAction::Delete => ChangeAction::Delete,
        };

        let record_set = ResourceRecordSet::builder()
            .name(&record.name)
            .r#type(RrType::A)
            .ttl(RECORD_TTL)
            .resource_records(
                aws_sdk_route53::types::ResourceRecord::builder()
                    .value(&record.resource)
                    .build()?,
            )
            .build()?;

        self.client
            .change_resource_record_sets()
            .hosted_zone_id(&record.phz_id)
            .change_batch(
                ChangeBatch::builder()
                    .changes(
                        Change::builder()
                            .action(action)
                            .resource_record_set(record_set)
                            .build()?,
                    )
                    .build()?,
            )
            .send()
            .await
            .map_err(|err| {
                anyhow!(
                    "changing record sets within hosted zone {}: {}",
                    record.phz_id,
                    err.into_service_error()
                )
            })?;

        Ok(())
    }
}

/// Client for resolving and mutating Route 53 Private Hosted Zones
pub struct Client {
    api: Box<dyn ZoneDirectory>,
}

impl Client {
    pub fn new(api: impl ZoneDirectory + 'static) -> Self {
        Self { api: Box::new(api) }
    }

    fn normalize(summary: ZoneSummary) -> PrivateHostedZone {
        let id = summary
            .id
            .strip_prefix(HOSTED_ZONE_PREFIX)
            .unwrap_or(&summary.id)
            .to_string();
        let name = summary
            .name
            .strip_suffix(DOT_SUFFIX)
            .unwrap_or(&summary.name)
            .to_string();

        PrivateHostedZone { id, name }
    }

    /// Finds the private hosted zone that exactly matches the given domain
    /// name. Public zones sharing the name are ignored; no match is not an
    /// error
    pub async fn by_name(&self, name: &str) -> Result<Option<PrivateHostedZone>> {
        let zones = self.api.list_by_name(name).await?;

        for summary in zones {
            if !summary.private {
                continue;
            }

            let zone = Self::normalize(summary);
            if zone.name == name {
                return Ok(Some(zone));
            }
        }

        Ok(None)
    }

    /// Retrieves a private hosted zone by its ID
    pub async fn by_id(&self, id: &str) -> Result<PrivateHostedZone> {
        Ok(Self::normalize(self.api.get_by_id(id).await?))
    }

    /// Finds all private hosted zones associated with a given VPC
    pub async fn by_vpc(&self, vpc: &str, region: &str) -> Result<Vec<PrivateHostedZone>> {
        Ok(self
            .api
            .list_by_vpc(vpc, region)
            .await?
            .into_iter()
            .map(Self::normalize)
            .collect())
    }

    /// Creates a private hosted zone scoped to the given VPC. The caller
    /// reference required for uniqueness is derived from the current time
    pub async fn create_private_hosted_zone(
        &self,
        name: &str,
        vpc: &str,
        region: &str,
    ) -> Result<PrivateHostedZone> {
        let caller_reference = chrono::Utc::now().to_rfc3339();
        let summary = self.api.create(name, vpc, region, &caller_reference).await?;

        Ok(Self::normalize(summary))
    }

    /// Deletes a private hosted zone by its ID. A zone that still contains
    /// record sets owned elsewhere is left in place and reported as success
    pub async fn delete_private_hosted_zone(&self, id: &str) -> Result<()> {
        self.api.delete(id).await.map(|_| ())
    }

    /// Associates a VPC with a private hosted zone. An association that
    /// already exists is reported as success
    pub async fn associate_vpc_with_zone(
        &self,
        id: &str,
        vpc: &str,
        region: &str,
    ) -> Result<()> {
        self.api.associate_vpc(id, vpc, region).await.map(|_| ())
    }

    /// Disassociates a VPC from a private hosted zone. A missing association
    /// is reported as success
    pub async fn disassociate_vpc_with_zone(
        &self,
        id: &str,
        vpc: &str,
        region: &str,
    ) -> Result<()> {
        self.api.disassociate_vpc(id, vpc, region).await.map(|_| ())
    }

    /// Creates a new A record within the given private hosted zone
    pub async fn associate_record(&self, record: &ResourceRecord) -> Result<()> {
        self.api.change_record(RecordAction::Create, record).await
    }

    /// Deletes an existing A record within the given private hosted zone
    pub async fn disassociate_record(&self, record: &ResourceRecord) -> Result<()> {
        self.api.change_record(RecordAction::Delete, record).await
    }

    /// Finds or provisions the named private hosted zone and attaches the
    /// given VPC to it. Exactly one branch runs: a missing zone is created,
    /// an existing one has the VPC associated with it. The returned
    /// attachment records which, so teardown can reverse it
    pub async fn auto_attach_to_zone(
        &self,
        name: &str,
        vpc: &str,
        region: &str,
    ) -> Result<(PrivateHostedZone, AutoAttachment)> {
        let mut attachment = AutoAttachment {
            phz_id: String::new(),
            vpc: vpc.to_string(),
            region: region.to_string(),
            created_phz: false,
            associated_phz: false,
        };

        let zone = match self.by_name(name).await? {
            Some(zone) => {
                self.associate_vpc_with_zone(&zone.id, vpc, region).await?;
                attachment.associated_phz = true;
                zone
            }
            None => {
                let zone = self.create_private_hosted_zone(name, vpc, region).await?;
                attachment.created_phz = true;
                zone
            }
        };

        attachment.phz_id = zone.id.clone();
        Ok((zone, attachment))
    }

    /// Reverses a previous auto-attachment: deletes the zone if it was
    /// created, otherwise disassociates the VPC from it
    pub async fn remove_attachment_to_zone(&self, attachment: &AutoAttachment) -> Result<()> {
        if attachment.created_phz {
            self.delete_private_hosted_zone(&attachment.phz_id).await
        } else {
            self.disassociate_vpc_with_zone(
                &attachment.phz_id,
                &attachment.vpc,
                &attachment.region,
            )
            .await
        }
    }
}
