//! Edge domain records: one per configured host.

use serde::{Deserialize, Serialize};

/// A passphrase-sealed IPNS key export, stored alongside the domain so that
/// a configuration backup is sufficient to reconstruct the name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedIpnsKey {
    pub version: u32,
    pub salt_b64: String,
    pub cipher_b64: String,
}

/// A host served by the gateway, mapped to a mutable folder in the node's
/// MFS. Created and edited only through configuration; read by the
/// dispatcher, the publish pipeline and the certificate lifecycle.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeDomain {
    /// DNS name, lowercase ASCII.
    pub domain: String,
    pub use_tls: bool,
    /// Leaf folder name under `/production/sites/`. Derived from `domain`
    /// when left empty in configuration.
    pub site_folder_leaf: String,
    /// Leaf folder name under `/production/pinned/`. Derived from
    /// `site_folder_leaf` when left empty.
    pub tgp_folder_leaf: String,
    pub ipns_key_name: Option<String>,
    pub ipns_peer_id: Option<String>,
    pub last_published_cid: Option<String>,
    pub sealed_ipns_key: Option<SealedIpnsKey>,
}

impl EdgeDomain {
    pub fn new(domain: &str) -> Self {
        let mut record = EdgeDomain {
            domain: domain.to_ascii_lowercase(),
            use_tls: true,
            ..Default::default()
        };
        record.normalize();
        record
    }

    /// Fill in the derived fields that configuration may omit. Idempotent.
    pub fn normalize(&mut self) {
        self.domain = self.domain.trim().to_ascii_lowercase();
        if self.site_folder_leaf.is_empty() {
            self.site_folder_leaf = site_leaf_for_domain(&self.domain);
        }
        if self.tgp_folder_leaf.is_empty() {
            self.tgp_folder_leaf = tgp_leaf_for_site(&self.site_folder_leaf);
        }
    }

    /// MFS folder holding the production site for this domain.
    pub fn site_mfs_path(&self) -> String {
        format!("/production/sites/{}", self.site_folder_leaf)
    }

    /// MFS folder holding the TGP pointer file for this domain.
    pub fn tgp_mfs_path(&self) -> String {
        format!("/production/pinned/{}", self.tgp_folder_leaf)
    }
}

/// Derive a path-safe MFS leaf from a DNS name. Deterministic: the same
/// domain always yields the same leaf.
pub fn site_leaf_for_domain(domain: &str) -> String {
    let mut leaf = String::with_capacity(domain.len());
    for ch in domain.trim().to_ascii_lowercase().chars() {
        match ch {
            'a'..='z' | '0'..='9' | '.' | '-' => leaf.push(ch),
            _ => leaf.push('-'),
        }
    }
    let trimmed = leaf.trim_matches(|c| c == '.' || c == '-');
    if trimmed.is_empty() {
        "site".into()
    } else {
        trimmed.to_string()
    }
}

pub fn tgp_leaf_for_site(site_leaf: &str) -> String {
    format!("{}-tgp", site_leaf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_derives_a_path_safe_site_leaf() {
        assert_eq!(site_leaf_for_domain("Example.COM"), "example.com");
        assert_eq!(site_leaf_for_domain("foo_bar.org"), "foo-bar.org");
        assert_eq!(site_leaf_for_domain("  spaced.io "), "spaced.io");
    }

    #[test]
    fn leaf_derivation_is_deterministic() {
        let a = site_leaf_for_domain("example.com");
        let b = site_leaf_for_domain("example.com");
        assert_eq!(a, b);
        assert_eq!(tgp_leaf_for_site(&a), tgp_leaf_for_site(&b));
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut record = EdgeDomain::new("Example.com");
        let site = record.site_folder_leaf.clone();
        let tgp = record.tgp_folder_leaf.clone();
        record.normalize();
        assert_eq!(record.site_folder_leaf, site);
        assert_eq!(record.tgp_folder_leaf, tgp);
        assert_eq!(record.site_mfs_path(), "/production/sites/example.com");
        assert_eq!(record.tgp_mfs_path(), "/production/pinned/example.com-tgp");
    }
}
