//! Host → site resolution: which configured domain, if any, a request's
//! host addresses, and through which door (mapped MFS folder or IPNS
//! wildcard).

use axum::http::header::HOST;
use axum::http::HeaderMap;
use truthgate_core::{EdgeDomain, TruthGateConfig};

/// How a host maps onto configured content.
#[derive(Clone, Debug)]
pub enum HostTarget {
    /// The host is a configured apex: serve the current CID of its
    /// production MFS folder.
    Mapped {
        record: EdgeDomain,
        mfs_path: String,
    },
    /// `<label>.<wildcard base>` matched a domain's IPNS identity: content
    /// is addressed through the name rather than a fixed folder.
    IpnsWildcard { record: EdgeDomain, name: String },
}

impl HostTarget {
    pub fn record(&self) -> &EdgeDomain {
        match self {
            HostTarget::Mapped { record, .. } => record,
            HostTarget::IpnsWildcard { record, .. } => record,
        }
    }
}

/// The host a request is effectively addressed to: a development override
/// (query parameter, then header; honored only outside production), else
/// the `Host` header, punycoded and lowercased, without any port.
pub fn effective_host(
    config: &TruthGateConfig,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Option<String> {
    if !config.production {
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if key == config.server.dev_host_param.as_str() && !value.is_empty() {
                    return normalize_host(&value);
                }
            }
        }
        if let Some(value) = headers
            .get(config.server.dev_host_header.as_str())
            .and_then(|v| v.to_str().ok())
        {
            if !value.is_empty() {
                return normalize_host(value);
            }
        }
    }

    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(normalize_host)
}

/// Strip any port and normalize to lowercase ASCII (IDN → punycode).
pub fn normalize_host(raw: impl AsRef<str>) -> Option<String> {
    let raw = raw.as_ref().trim();
    if raw.is_empty() {
        return None;
    }
    // IPv6 literals keep their brackets, ports fall away.
    let without_port = if let Some(stripped) = raw.strip_prefix('[') {
        match stripped.split_once(']') {
            Some((inside, _)) => return Some(format!("[{}]", inside.to_ascii_lowercase())),
            None => raw,
        }
    } else {
        raw.split(':').next().unwrap_or(raw)
    };

    match idna::domain_to_ascii(without_port) {
        Ok(ascii) if !ascii.is_empty() => Some(ascii.to_ascii_lowercase()),
        _ => Some(without_port.to_ascii_lowercase()),
    }
}

/// Exact-apex lookup. With duplicate entries the longest domain string
/// wins.
pub fn find_mapped_domain<'c>(
    config: &'c TruthGateConfig,
    host: &str,
) -> Option<&'c EdgeDomain> {
    config
        .domains
        .iter()
        .filter(|record| record.domain.eq_ignore_ascii_case(host))
        .max_by_key(|record| record.domain.len())
}

/// Resolve a host to its target, trying the exact apex first and the IPNS
/// wildcard second.
pub fn resolve_host(config: &TruthGateConfig, host: &str) -> Option<HostTarget> {
    if let Some(record) = find_mapped_domain(config, host) {
        return Some(HostTarget::Mapped {
            record: record.clone(),
            mfs_path: record.site_mfs_path(),
        });
    }

    let base = config.ipns_wildcard_base.as_deref()?;
    let label = host
        .strip_suffix(base)
        .and_then(|prefix| prefix.strip_suffix('.'))?;
    if label.is_empty() || label.contains('.') {
        return None;
    }

    for record in config.domains.iter() {
        if let Some(peer_id) = record.ipns_peer_id.as_deref() {
            if peer_id.eq_ignore_ascii_case(label) {
                return Some(HostTarget::IpnsWildcard {
                    record: record.clone(),
                    name: peer_id.to_string(),
                });
            }
        }
    }
    for record in config.domains.iter() {
        if let Some(key_name) = record.ipns_key_name.as_deref() {
            if key_name.eq_ignore_ascii_case(label) {
                let name = record
                    .ipns_peer_id
                    .clone()
                    .unwrap_or_else(|| key_name.to_string());
                return Some(HostTarget::IpnsWildcard {
                    record: record.clone(),
                    name,
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config() -> TruthGateConfig {
        let mut config = TruthGateConfig {
            production: true,
            ipns_wildcard_base: Some("names.example.net".into()),
            ..Default::default()
        };
        let mut example = EdgeDomain::new("example.com");
        example.ipns_key_name = Some("example-key".into());
        example.ipns_peer_id = Some("k51qzi5uqu5dExample".into());
        config.domains.push(example);
        config
    }

    fn headers_with_host(host: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_str(host).unwrap());
        headers
    }

    #[test]
    fn host_header_is_normalized_and_deported() {
        let config = config();
        let headers = headers_with_host("Example.COM:8443");
        assert_eq!(
            effective_host(&config, &headers, None).as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn idn_hosts_become_punycode() {
        let config = config();
        let headers = headers_with_host("bücher.example");
        assert_eq!(
            effective_host(&config, &headers, None).as_deref(),
            Some("xn--bcher-kva.example")
        );
    }

    #[test]
    fn dev_override_only_applies_outside_production() {
        let mut config = config();
        let headers = headers_with_host("other.org");

        // In production the override is ignored.
        assert_eq!(
            effective_host(&config, &headers, Some("dev_host=example.com")).as_deref(),
            Some("other.org")
        );

        config.production = false;
        assert_eq!(
            effective_host(&config, &headers, Some("dev_host=example.com")).as_deref(),
            Some("example.com")
        );

        let mut headers = headers_with_host("other.org");
        headers.insert("x-truthgate-host", HeaderValue::from_static("example.com"));
        assert_eq!(
            effective_host(&config, &headers, None).as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn mapped_hosts_resolve_to_their_production_folder() {
        let config = config();
        match resolve_host(&config, "example.com") {
            Some(HostTarget::Mapped { mfs_path, .. }) => {
                assert_eq!(mfs_path, "/production/sites/example.com");
            }
            other => panic!("unexpected target: {:?}", other),
        }
        assert!(resolve_host(&config, "unmapped.org").is_none());
    }

    #[test]
    fn wildcard_labels_match_peer_id_then_key_name() {
        let config = config();
        match resolve_host(&config, "k51qzi5uqu5dexample.names.example.net") {
            Some(HostTarget::IpnsWildcard { name, .. }) => {
                assert_eq!(name, "k51qzi5uqu5dExample");
            }
            other => panic!("unexpected target: {:?}", other),
        }
        match resolve_host(&config, "example-key.names.example.net") {
            Some(HostTarget::IpnsWildcard { name, .. }) => {
                // Peer id preferred as the address even when matched by
                // key name.
                assert_eq!(name, "k51qzi5uqu5dExample");
            }
            other => panic!("unexpected target: {:?}", other),
        }
        assert!(resolve_host(&config, "nope.names.example.net").is_none());
        assert!(resolve_host(&config, "deep.nope.names.example.net").is_none());
    }
}
