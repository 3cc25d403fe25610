use std::collections::HashMap;

use anyhow::{anyhow, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::imds::Metadata;

/// Name of the private hosted zone created or attached to during auto-attach,
/// and the label inserted into generated record names.
pub const DEFAULT_ZONE_NAME: &str = "dns53";

const ENABLE_TAGS_REMEDIATION: &str = r#"to use metadata within a custom domain name, please enable IMDS instance tags support
for your EC2 instance:

  $ aws-dns53 imds --instance-metadata-tags on

Or read the official AWS documentation at:
https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/Using_Tags.html#allow-access-to-tags-in-IMDS"#;

// Metadata as exposed to domain name templates. The IPv4 address is dashed
// here so that it can form a valid DNS label; the original address is kept
// untouched for the record value
#[derive(Serialize)]
struct TemplateView<'a> {
    #[serde(rename = "IPv4")]
    ipv4: String,
    #[serde(rename = "Region")]
    region: &'a str,
    #[serde(rename = "AZ")]
    az: &'a str,
    #[serde(rename = "InstanceID")]
    instance_id: &'a str,
    #[serde(rename = "VPC")]
    vpc: &'a str,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Tags")]
    tags: &'a HashMap<String, String>,
}

/// Resolves a custom domain name template against the instance metadata,
/// returning a sanitized DNS-safe name. Templating requiring the instance
/// name fails fast when IMDS instance tags are not enabled
pub fn resolve_domain_name(domain: &str, metadata: &Metadata) -> Result<String> {
    let dmn: String = domain.chars().filter(|c| !c.is_whitespace()).collect();

    let mut name = metadata.name.clone();
    if dmn.contains("{{Name}}") {
        if metadata.name.is_empty() {
            return Err(anyhow!(ENABLE_TAGS_REMEDIATION));
        }

        name = kebab_case(&metadata.name);
    }

    let view = TemplateView {
        ipv4: metadata.ipv4.replace('.', "-"),
        region: &metadata.region,
        az: &metadata.az,
        instance_id: &metadata.instance_id,
        vpc: &metadata.vpc,
        name,
        tags: &metadata.tags,
    };

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let rendered = env
        .render_str(&dmn, &view)
        .map_err(|err| anyhow!("invalid domain name template {dmn:?}: {err}"))?;

    Ok(sanitize(&rendered))
}

/// Builds the fully qualified record name for a zone. Without a custom name
/// the generated default is `<dashed-ipv4>.dns53.<zone>`; a custom name is
/// suffixed with the zone root when missing
pub fn qualified_domain_name(custom: Option<&str>, ipv4: &str, zone_name: &str) -> String {
    match custom {
        Some(custom) if !custom.is_empty() => {
            let suffix = format!(".{zone_name}");
            if custom.ends_with(&suffix) {
                custom.to_string()
            } else {
                format!("{custom}{suffix}")
            }
        }
        _ => {
            let dashed = ipv4.replace('.', "-");

            // Attaching to the dns53 zone itself would duplicate the label
            if zone_name == DEFAULT_ZONE_NAME
                || zone_name.ends_with(&format!(".{DEFAULT_ZONE_NAME}"))
            {
                format!("{dashed}.{zone_name}")
            } else {
                format!("{dashed}.{DEFAULT_ZONE_NAME}.{zone_name}")
            }
        }
    }
}

/// Strips a rendered domain name down to `[A-Za-z0-9-.]`, collapsing any run
/// of hyphens or dots and trimming both from either end. Idempotent
pub fn sanitize(domain: &str) -> String {
    let mut out: String = domain
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .collect();

    while out.contains("--") {
        out = out.replace("--", "-");
    }
    while out.contains("..") {
        out = out.replace("..", ".");
    }

    out.trim_matches(|c| c == '-' || c == '.').to_string()
}

/// Rewrites all tag values into their DNS-safe kebab-cased form and inserts a
/// template-friendly alias key alongside each raw tag key, so both
/// `{{Tags.MyKey1}}` and `{{Tags["My+@-key_=,.:1"]}}` resolve
pub fn clean_tags(tags: &mut HashMap<String, String>) {
    let entries: Vec<(String, String)> = tags
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (key, value) in entries {
        let (alias, cleaned) = clean_tag(&key, &value);
        tags.insert(key, cleaned.clone());
        tags.insert(alias, cleaned);
    }
}

/// Returns the template-friendly alias for a tag key (alphanumerics only,
/// PascalCase) and the kebab-cased form of its value
pub fn clean_tag(key: &str, value: &str) -> (String, String) {
    (pascal_case(key), kebab_case(value))
}

/// Lowercase kebab-case conversion, splitting on both non-alphanumeric
/// characters and lower-to-upper camel boundaries
pub fn kebab_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 4);
    let mut boundary = false;

    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            if ch.is_ascii_uppercase() && boundary {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
            boundary = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        } else {
            out.push('-');
            boundary = false;
        }
    }

    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_string()
}

fn pascal_case(value: &str) -> String {
    value
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn named_metadata(name: &str) -> Metadata {
        Metadata {
            name: name.to_string(),
            ..Metadata::default()
        }
    }

    #[test]
    fn resolve_domain_name_passthrough() {
        let tests = [
            ("custom.domain", "custom.domain"),
            ("another--custom.domain", "another-custom.domain"),
            ("my-custom123..domain", "my-custom123.domain"),
            ("-this-is-a-custom.domain-", "this-is-a-custom.domain"),
            (".a-custom.domain.", "a-custom.domain"),
            ("custom@#.doma**in-123", "custom.domain-123"),
        ];

        for (domain, expected) in tests {
            let resolved = resolve_domain_name(domain, &named_metadata("my-ec2")).unwrap();
            assert_eq!(expected, resolved);
        }
    }

    #[test]
    fn resolve_domain_name_with_name_field() {
        let resolved =
            resolve_domain_name("custom.{{Name}}", &named_metadata("my-ec2")).unwrap();

        assert_eq!("custom.my-ec2", resolved);
    }

    #[test]
    fn resolve_domain_name_with_name_field_spaces() {
        let resolved =
            resolve_domain_name("custom.{{ Name }}", &named_metadata("my-ec2")).unwrap();

        assert_eq!("custom.my-ec2", resolved);
    }

    #[test]
    fn resolve_domain_name_without_instance_tags() {
        let err = resolve_domain_name("custom.{{Name}}", &Metadata::default()).unwrap_err();

        assert_eq!(
            err.to_string(),
            r#"to use metadata within a custom domain name, please enable IMDS instance tags support
for your EC2 instance:

  $ aws-dns53 imds --instance-metadata-tags on

Or read the official AWS documentation at:
https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/Using_Tags.html#allow-access-to-tags-in-IMDS"#
        );
    }

    #[test]
    fn resolve_domain_name_transforms_name_tag_to_kebab_case() {
        let resolved =
            resolve_domain_name("first.custom.{{Name}}", &named_metadata("MyEc2 123")).unwrap();

        assert_eq!("first.custom.my-ec2-123", resolved);
    }

    #[test]
    fn resolve_domain_name_strips_leading_trailing_hyphen_from_name_tag() {
        let resolved =
            resolve_domain_name("second.custom.{{Name}}", &named_metadata("-MyEc2 123-"))
                .unwrap();

        assert_eq!("second.custom.my-ec2-123", resolved);
    }

    #[test]
    fn resolve_domain_name_dashes_ipv4() {
        let metadata = Metadata {
            ipv4: "10.0.1.100".to_string(),
            region: "eu-west-2".to_string(),
            ..Metadata::default()
        };

        let resolved = resolve_domain_name("{{IPv4}}.{{Region}}", &metadata).unwrap();

        assert_eq!("10-0-1-100.eu-west-2", resolved);
    }

    #[test]
    fn resolve_domain_name_invalid_template() {
        assert!(resolve_domain_name("custom.{{Name}", &named_metadata("MyEc2 123")).is_err());
    }

    #[test]
    fn resolve_domain_name_unrecognised_template_field() {
        assert!(resolve_domain_name("custom.{{Unknown}}", &Metadata::default()).is_err());
    }

    #[test]
    fn resolve_domain_name_through_tags() {
        let mut metadata = named_metadata("my-ec2");
        metadata
            .tags
            .insert("Team".to_string(), "Platform Eng".to_string());
        clean_tags(&mut metadata.tags);

        let resolved = resolve_domain_name("{{Tags.Team}}.custom", &metadata).unwrap();

        assert_eq!("platform-eng.custom", resolved);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "--a---b--",
            "..a...b..",
            "-.mixed-.case.-",
            "already-clean.domain",
            "tr@il!ng#junk$",
        ];

        for input in inputs {
            let once = sanitize(input);
            assert_eq!(once, sanitize(&once));
            assert!(!once.starts_with(['-', '.']) && !once.ends_with(['-', '.']));
            assert!(!once.contains("--") && !once.contains(".."));
        }
    }

    #[test]
    fn qualified_domain_name_default() {
        let name = qualified_domain_name(None, "10.0.1.100", "testing");

        assert_eq!("10-0-1-100.dns53.testing", name);
    }

    #[test]
    fn qualified_domain_name_default_skips_duplicate_label() {
        let name = qualified_domain_name(None, "10.0.1.100", "dns53");

        assert_eq!("10-0-1-100.dns53", name);
    }

    #[test]
    fn qualified_domain_name_default_skips_duplicate_label_suffix() {
        let name = qualified_domain_name(None, "10.0.1.100", "internal.dns53");

        assert_eq!("10-0-1-100.internal.dns53", name);
    }

    #[test]
    fn qualified_domain_name_appends_zone_root() {
        let name = qualified_domain_name(Some("custom.domain"), "10.0.1.100", "testing");

        assert_eq!("custom.domain.testing", name);
    }

    #[test]
    fn qualified_domain_name_keeps_existing_zone_root() {
        let name = qualified_domain_name(Some("custom.testing"), "10.0.1.100", "testing");

        assert_eq!("custom.testing", name);
    }

    #[test]
    fn clean_tags_appends_to_map() {
        let mut tags = HashMap::from([("My+@-key_=,.:1".to_string(), "A value".to_string())]);

        clean_tags(&mut tags);

        assert_eq!(tags.get("My+@-key_=,.:1"), Some(&"a-value".to_string()));
        assert_eq!(tags.get("MyKey1"), Some(&"a-value".to_string()));
    }

    #[test]
    fn kebab_case_splits_camel_boundaries() {
        assert_eq!("my-ec2-123", kebab_case("MyEc2 123"));
        assert_eq!("my-ec2-123", kebab_case("-MyEc2 123-"));
        assert_eq!("a-value", kebab_case("A value"));
    }
}
