use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

const PATH_IPV4: &str = "local-ipv4";
const PATH_MAC_ADDRESS: &str = "mac";
const PATH_PLACEMENT_REGION: &str = "placement/region";
const PATH_PLACEMENT_AZ: &str = "placement/availability-zone";
const PATH_INSTANCE_ID: &str = "instance-id";
const PATH_INSTANCE_TAGS: &str = "tags/instance";

/// Path-addressed access to the EC2 Instance Metadata Service (IMDS). The
/// empty path maps to the root category listing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn get(&self, path: &str) -> Result<String>;
}

/// Production metadata source backed by the SDK IMDS client
pub struct ImdsSource {
    client: aws_config::imds::Client,
}

impl ImdsSource {
    pub fn new(client: aws_config::imds::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetadataSource for ImdsSource {
    async fn get(&self, path: &str) -> Result<String> {
        let value = self
            .client
            .get(&format!("/latest/meta-data/{path}"))
            .await
            .map_err(|err| anyhow!("fetching instance metadata category {path:?}: {err}"))?;

        Ok(value.as_ref().to_string())
    }
}

/// Metadata associated with the current EC2 instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Private IPv4 address of the launched instance
    pub ipv4: String,

    /// Region where the instance was launched
    pub region: String,

    /// VPC the instance was launched into
    pub vpc: String,

    /// Availability zone where the instance was launched
    pub az: String,

    /// Unique ID of this instance
    pub instance_id: String,

    /// Name associated with the instance. Blank unless instance tags have
    /// been enabled within IMDS
    pub name: String,

    /// All instance tags exposed through IMDS
    pub tags: HashMap<String, String>,
}

/// Client for walking the Instance Metadata Service
pub struct Client {
    source: Box<dyn MetadataSource>,
}

impl Client {
    pub fn new(source: impl MetadataSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    /// Retrieves the metadata associated with the current EC2 instance by
    /// querying IMDS. Any required category that cannot be fetched aborts
    /// the walk; the tag category is optional since instance tags are not
    /// exposed through IMDS by default
    pub async fn instance_metadata(&self) -> Result<Metadata> {
        self.check_root().await?;

        let az = self.source.get(PATH_PLACEMENT_AZ).await?;
        let instance_id = self.source.get(PATH_INSTANCE_ID).await?;
        let ipv4 = self.source.get(PATH_IPV4).await?;
        let region = self.source.get(PATH_PLACEMENT_REGION).await?;
        let vpc = self.vpc().await?;
        let tags = self.tags().await;

        let name = tags.get("Name").cloned().unwrap_or_default();

        Ok(Metadata {
            ipv4,
            region,
            vpc,
            az,
            instance_id,
            name,
            tags,
        })
    }

    async fn check_root(&self) -> Result<()> {
        self.source.get("").await.map(|_| ())
    }

    async fn vpc(&self) -> Result<String> {
        let mac = self.source.get(PATH_MAC_ADDRESS).await?;
        self.source
            .get(&format!("network/interfaces/macs/{mac}/vpc-id"))
            .await
    }

    async fn tags(&self) -> HashMap<String, String> {
        // Instances without tag support reject the category listing outright
        let listing = match self.source.get(PATH_INSTANCE_TAGS).await {
            Ok(listing) => listing,
            Err(_) => return HashMap::new(),
        };

        let mut tags = HashMap::new();
        for tag in listing.lines().filter(|line| !line.is_empty()) {
            if let Ok(value) = self.source.get(&format!("{PATH_INSTANCE_TAGS}/{tag}")).await {
                tags.insert(tag.to_string(), value);
            }
        }

        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    const STUB_MAC: &str = "06:e5:43:29:8f:08";
    const STUB_VPC: &str = "vpc-016d173db537793d1";

    fn stub_required(source: &mut MockMetadataSource) {
        source
            .expect_get()
            .with(eq(""))
            .returning(|_| Ok("local-ipv4\nmac\nplacement\ninstance-id".to_string()));
        source
            .expect_get()
            .with(eq(PATH_PLACEMENT_AZ))
            .returning(|_| Ok("us-east-1a".to_string()));
        source
            .expect_get()
            .with(eq(PATH_INSTANCE_ID))
            .returning(|_| Ok("i-0decb1524582da041".to_string()));
        source
            .expect_get()
            .with(eq(PATH_IPV4))
            .returning(|_| Ok("10.0.1.100".to_string()));
        source
            .expect_get()
            .with(eq(PATH_PLACEMENT_REGION))
            .returning(|_| Ok("us-east-1".to_string()));
        source
            .expect_get()
            .with(eq(PATH_MAC_ADDRESS))
            .returning(|_| Ok(STUB_MAC.to_string()));
        source
            .expect_get()
            .with(eq(format!("network/interfaces/macs/{STUB_MAC}/vpc-id")))
            .returning(|_| Ok(STUB_VPC.to_string()));
    }

    #[tokio::test]
    async fn instance_metadata_walks_all_categories() {
        let mut source = MockMetadataSource::new();
        stub_required(&mut source);
        source
            .expect_get()
            .with(eq(PATH_INSTANCE_TAGS))
            .returning(|_| Ok("Name\nEnvironment".to_string()));
        source
            .expect_get()
            .with(eq("tags/instance/Name"))
            .returning(|_| Ok("stub-ec2".to_string()));
        source
            .expect_get()
            .with(eq("tags/instance/Environment"))
            .returning(|_| Ok("dev".to_string()));

        let metadata = Client::new(source).instance_metadata().await.unwrap();

        assert_eq!(metadata.ipv4, "10.0.1.100");
        assert_eq!(metadata.region, "us-east-1");
        assert_eq!(metadata.az, "us-east-1a");
        assert_eq!(metadata.instance_id, "i-0decb1524582da041");
        assert_eq!(metadata.vpc, STUB_VPC);
        assert_eq!(metadata.name, "stub-ec2");
        assert_eq!(metadata.tags.len(), 2);
        assert_eq!(metadata.tags.get("Environment"), Some(&"dev".to_string()));
    }

    #[tokio::test]
    async fn instance_metadata_fails_when_root_listing_unavailable() {
        let mut source = MockMetadataSource::new();
        source
            .expect_get()
            .with(eq(""))
            .returning(|_| Err(anyhow!("IMDS unreachable")));

        let err = Client::new(source).instance_metadata().await.unwrap_err();

        assert!(err.to_string().contains("IMDS unreachable"));
    }

    #[tokio::test]
    async fn instance_metadata_fails_when_required_category_unavailable() {
        let mut source = MockMetadataSource::new();
        source
            .expect_get()
            .with(eq(""))
            .returning(|_| Ok("instance-id".to_string()));
        source
            .expect_get()
            .with(eq(PATH_PLACEMENT_AZ))
            .returning(|_| Err(anyhow!("category unavailable")));

        let result = Client::new(source).instance_metadata().await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn instance_metadata_without_tag_support() {
        let mut source = MockMetadataSource::new();
        stub_required(&mut source);
        source
            .expect_get()
            .with(eq(PATH_INSTANCE_TAGS))
            .returning(|_| Err(anyhow!("unexpected instance category tags/instance")));

        let metadata = Client::new(source).instance_metadata().await.unwrap();

        assert!(metadata.tags.is_empty());
        assert_eq!(metadata.name, "");
    }

    #[tokio::test]
    async fn instance_metadata_skips_unreadable_tags() {
        let mut source = MockMetadataSource::new();
        stub_required(&mut source);
        source
            .expect_get()
            .with(eq(PATH_INSTANCE_TAGS))
            .returning(|_| Ok("Name\nEnvironment".to_string()));
        source
            .expect_get()
            .with(eq("tags/instance/Name"))
            .returning(|_| Err(anyhow!("tag unavailable")));
        source
            .expect_get()
            .with(eq("tags/instance/Environment"))
            .returning(|_| Ok("dev".to_string()));

        let metadata = Client::new(source).instance_metadata().await.unwrap();

        assert_eq!(metadata.tags.len(), 1);
        assert_eq!(metadata.name, "");
        assert_eq!(metadata.tags.get("Environment"), Some(&"dev".to_string()));
    }

    #[test]
    fn client_wraps_any_metadata_source() {
        let mut source = MockMetadataSource::new();
        source
            .expect_get()
            .with(eq(""))
            .returning(|_| Ok(String::new()));

        let client = Client::new(source);
        tokio_test::block_on(client.check_root()).unwrap();
    }
}
