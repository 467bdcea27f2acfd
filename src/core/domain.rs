use anyhow::{Result, anyhow};

/// An order identifier after normalisation: ASCII, lower-case, no trailing dot,
/// with the wildcard label split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsIdentifier {
    pub name: String,
    pub wildcard: bool,
}

impl DnsIdentifier {
    /// Name as submitted to the authority (`*.` prefix restored for wildcards).
    pub fn order_value(&self) -> String {
        if self.wildcard {
            format!("*.{}", self.name)
        } else {
            self.name.clone()
        }
    }
}

pub fn normalize_dns_name(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    let ascii =
        idna::domain_to_ascii(trimmed).map_err(|err| anyhow!("invalid domain name: {err}"))?;
    Ok(ascii.to_lowercase())
}

pub fn parse_identifier(raw: &str) -> Result<DnsIdentifier> {
    let trimmed = raw.trim();
    let (wildcard, rest) = match trimmed.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if rest.contains('*') {
        return Err(anyhow!("wildcard is only allowed as the leftmost label: {raw}"));
    }
    Ok(DnsIdentifier {
        name: normalize_dns_name(rest)?,
        wildcard,
    })
}

/// Normalises and de-duplicates the names requested by an order, keeping first-seen order.
pub fn normalize_order_identifiers(names: &[String]) -> Result<Vec<DnsIdentifier>> {
    let mut identifiers: Vec<DnsIdentifier> = Vec::with_capacity(names.len());
    for name in names {
        let identifier = parse_identifier(name)?;
        if !identifiers.contains(&identifier) {
            identifiers.push(identifier);
        }
    }
    if identifiers.is_empty() {
        return Err(anyhow!("order must request at least one DNS name"));
    }
    Ok(identifiers)
}

pub fn display_dns_name(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('.');
    let (unicode, _) = idna::domain_to_unicode(trimmed);
    unicode.to_lowercase()
}
