use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::Region;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use url::Url;

mod domain;
mod ec2;
mod imds;
mod r53;
mod session;

#[derive(Parser)]
#[command(name = "aws-dns53")]
#[command(
    about = "Expose an EC2 instance privately through a dynamic record in a Route 53 Private Hosted Zone"
)]
#[command(version)]
struct Cli {
    /// An ID of a private hosted zone to use when generating the record
    #[arg(long = "phz-id", conflicts_with = "auto_attach")]
    phz_id: Option<String>,

    /// Assign a custom domain name when generating the record
    #[arg(short = 'n', long = "domain-name")]
    domain_name: Option<String>,

    /// Automatically create and attach to the dns53 private hosted zone
    #[arg(long = "auto-attach")]
    auto_attach: bool,

    /// AWS named profile to use when loading credentials
    #[arg(short = 'p', long = "profile", global = true)]
    profile: Option<String>,

    /// AWS region to use when querying AWS
    #[arg(short = 'r', long = "region", global = true)]
    region: Option<String>,

    /// The endpoint used for all IMDS requests
    #[arg(long = "imds-bind-addr", hide = true, global = true)]
    imds_bind_addr: Option<String>,

    /// Enable verbose output for debugging
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Toggle IMDS features for this EC2 instance
    Imds {
        /// Toggle the inclusion of instance tags within IMDS
        #[arg(long = "instance-metadata-tags", value_enum)]
        instance_metadata_tags: ToggleSetting,
    },

    /// List all instance tags available to domain name templates
    Tags,

    /// Print build time version information
    Version {
        /// Only print the version number
        #[arg(long = "short")]
        short: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ToggleSetting {
    On,
    Off,
}

impl fmt::Display for ToggleSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToggleSetting::On => f.write_str("on"),
            ToggleSetting::Off => f.write_str("off"),
        }
    }
}

pub fn print_info(message: &str) {
    eprintln!("{} {}", "[INFO]".blue().bold(), message);
}

pub fn print_debug(message: &str, verbose: bool) {
    if verbose {
        eprintln!("{} {}", "[DEBUG]".cyan().bold(), message);
    }
}

pub fn print_success(message: &str) {
    eprintln!("{} {}", "[SUCCESS]".green().bold(), message);
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", "[WARNING]".yellow().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message);
}

async fn get_aws_config(
    profile: Option<String>,
    region: Option<String>,
) -> Result<aws_config::SdkConfig> {
    // AWS configuration chain (in order of precedence):
    // 1. CLI arguments (--profile, --region)
    // 2. Environment variables (AWS_PROFILE, AWS_REGION)
    // 3. AWS credentials file (~/.aws/credentials)
    // 4. AWS config file (~/.aws/config)
    // 5. Instance metadata (if running on EC2)

    let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

    // Set region if provided, otherwise use default chain
    if let Some(region_str) = region {
        let region = Region::new(region_str);
        let region_provider = RegionProviderChain::default_provider().or_else(region);
        config_loader = config_loader.region(region_provider);
    }

    // Set profile if provided, otherwise use default
    if let Some(profile) = profile {
        config_loader = config_loader.profile_name(profile);
    }

    let config = config_loader.load().await;
    Ok(config)
}

async fn validate_aws_config(config: &aws_config::SdkConfig, verbose: bool) -> Result<()> {
    print_debug("Validating AWS configuration...", verbose);

    let sts_client = aws_sdk_sts::Client::new(config);

    match sts_client.get_caller_identity().send().await {
        Ok(_) => {
            print_debug("AWS authentication successful", verbose);
            Ok(())
        }
        Err(e) => Err(anyhow!("Failed to authenticate with AWS: {}", e)),
    }
}

fn imds_source(bind_addr: Option<&str>) -> Result<imds::ImdsSource> {
    let mut builder = aws_config::imds::Client::builder();

    if let Some(addr) = bind_addr {
        let endpoint =
            Url::parse(addr).map_err(|err| anyhow!("invalid IMDS endpoint {addr}: {err}"))?;
        builder = builder
            .endpoint(endpoint.as_str())
            .map_err(|err| anyhow!("invalid IMDS endpoint {addr}: {err}"))?;
    }

    Ok(imds::ImdsSource::new(builder.build()))
}

async fn run_session(config: &aws_config::SdkConfig, cli: Cli) -> Result<()> {
    validate_aws_config(config, cli.verbose).await?;

    let options = session::Options {
        r53: Arc::new(r53::Client::new(r53::Route53Directory::new(
            aws_sdk_route53::Client::new(config),
        ))),
        imds: Arc::new(imds::Client::new(imds_source(
            cli.imds_bind_addr.as_deref(),
        )?)),
        hosted_zone_id: cli.phz_id,
        domain_name: cli.domain_name,
        auto_attach: cli.auto_attach,
        profile: cli.profile,
        region: cli.region,
        verbose: cli.verbose,
    };

    session::run(options).await
}

async fn toggle_metadata_tags(
    config: &aws_config::SdkConfig,
    cli: &Cli,
    setting: ToggleSetting,
) -> Result<()> {
    let imds_client = imds::Client::new(imds_source(cli.imds_bind_addr.as_deref())?);
    let metadata = imds_client.instance_metadata().await?;

    let toggle = match setting {
        ToggleSetting::On => ec2::InstanceMetadataToggle::Enabled,
        ToggleSetting::Off => ec2::InstanceMetadataToggle::Disabled,
    };

    ec2::Client::new(aws_sdk_ec2::Client::new(config))
        .toggle_instance_metadata_tags(&metadata.instance_id, toggle)
        .await?;

    print_success(&format!(
        "instance metadata tags turned {} for {}",
        setting, metadata.instance_id
    ));
    Ok(())
}

async fn list_tags(cli: &Cli) -> Result<()> {
    let imds_client = imds::Client::new(imds_source(cli.imds_bind_addr.as_deref())?);
    let metadata = imds_client.instance_metadata().await?;

    if metadata.tags.is_empty() {
        print_warning(
            "no instance tags are exposed through IMDS; enable them with: aws-dns53 imds --instance-metadata-tags on",
        );
        return Ok(());
    }

    let mut rows: Vec<[String; 4]> = metadata
        .tags
        .iter()
        .map(|(key, value)| {
            let (alias, cleaned) = domain::clean_tag(key, value);
            [
                key.clone(),
                cleaned,
                format!("{{{{Tags.{alias}}}}}"),
                format!("{{{{Tags[\"{key}\"]}}}}"),
            ]
        })
        .collect();
    rows.sort();

    let headers = ["Tag", "Value", "Property Chaining", "Indexed"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    println!(
        "{:<w0$}  {:<w1$}  {:<w2$}  {}",
        headers[0],
        headers[1],
        headers[2],
        headers[3],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
    );
    for row in &rows {
        println!(
            "{:<w0$}  {:<w1$}  {:<w2$}  {}",
            row[0],
            row[1],
            row[2],
            row[3],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
        );
    }

    Ok(())
}

#[derive(Serialize)]
struct VersionInfo {
    version: &'static str,
    os: &'static str,
    arch: &'static str,
}

fn print_version(short: bool) -> Result<()> {
    if short {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let info = VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    };
    println!("{}", serde_json::to_string(&info)?);
    Ok(())
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    if !atty::is(atty::Stream::Stderr) {
        colored::control::set_override(false);
    }

    print_debug(
        &format!("Profile: {}", cli.profile.as_deref().unwrap_or("default")),
        cli.verbose,
    );
    print_debug(
        &format!(
            "Region: {}",
            cli.region.as_deref().unwrap_or("default (from config)")
        ),
        cli.verbose,
    );

    match cli.command.take() {
        Some(Commands::Version { short }) => print_version(short),
        Some(Commands::Imds {
            instance_metadata_tags,
        }) => {
            let config = get_aws_config(cli.profile.clone(), cli.region.clone()).await?;
            toggle_metadata_tags(&config, &cli, instance_metadata_tags).await
        }
        Some(Commands::Tags) => list_tags(&cli).await,
        None => {
            let config = get_aws_config(cli.profile.clone(), cli.region.clone()).await?;
            run_session(&config, cli).await
        }
    }
}
