//! The portable backup blob for a single edge domain.
//!
//! The JSON field names are part of the wire format and must not change:
//! existing backups in the wild were written with exactly these keys.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{EdgeDomain, SealedIpnsKey};
use crate::sealed;

/// A self-contained, passphrase-protected backup of one domain: its
/// configuration record plus the sealed export of its IPNS key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainBackup {
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "SiteFolderLeaf")]
    pub site_folder_leaf: String,
    #[serde(rename = "TgpFolderLeaf")]
    pub tgp_folder_leaf: String,
    #[serde(rename = "IpnsKeyName")]
    pub ipns_key_name: Option<String>,
    #[serde(rename = "IpnsPeerId")]
    pub ipns_peer_id: Option<String>,
    #[serde(rename = "LastPublishedCid")]
    pub last_published_cid: Option<String>,
    #[serde(rename = "EncVersion")]
    pub enc_version: u32,
    #[serde(rename = "SaltB64")]
    pub salt_b64: String,
    #[serde(rename = "CipherB64")]
    pub cipher_b64: String,
}

impl DomainBackup {
    /// Build a backup from a domain record and the armored IPNS key export,
    /// sealing the export under `passphrase`.
    pub fn seal(record: &EdgeDomain, armored_key: &str, passphrase: &str) -> Result<Self> {
        let (salt_b64, cipher_b64) = sealed::seal(armored_key.as_bytes(), passphrase)?;
        Ok(DomainBackup {
            domain: record.domain.clone(),
            site_folder_leaf: record.site_folder_leaf.clone(),
            tgp_folder_leaf: record.tgp_folder_leaf.clone(),
            ipns_key_name: record.ipns_key_name.clone(),
            ipns_peer_id: record.ipns_peer_id.clone(),
            last_published_cid: record.last_published_cid.clone(),
            enc_version: sealed::SEAL_VERSION,
            salt_b64,
            cipher_b64,
        })
    }

    /// Unseal the armored IPNS key export carried by this backup.
    pub fn open_key(&self, passphrase: &str) -> Result<String> {
        if self.enc_version != sealed::SEAL_VERSION {
            bail!("unsupported backup encryption version {}", self.enc_version);
        }
        let bytes = sealed::open(&self.salt_b64, &self.cipher_b64, passphrase)?;
        Ok(String::from_utf8(bytes)?)
    }

    /// The domain record this backup restores to. The sealed key is carried
    /// over verbatim so a restored configuration can be backed up again
    /// without re-entering the passphrase.
    pub fn to_domain(&self) -> EdgeDomain {
        let mut record = EdgeDomain {
            domain: self.domain.clone(),
            use_tls: true,
            site_folder_leaf: self.site_folder_leaf.clone(),
            tgp_folder_leaf: self.tgp_folder_leaf.clone(),
            ipns_key_name: self.ipns_key_name.clone(),
            ipns_peer_id: self.ipns_peer_id.clone(),
            last_published_cid: self.last_published_cid.clone(),
            sealed_ipns_key: Some(SealedIpnsKey {
                version: self.enc_version,
                salt_b64: self.salt_b64.clone(),
                cipher_b64: self.cipher_b64.clone(),
            }),
        };
        record.normalize();
        record
    }
}
