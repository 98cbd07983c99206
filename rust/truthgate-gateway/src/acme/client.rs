//! A compact ACME v2 (RFC 8555) client: ES256 JWS over the directory's
//! endpoints, HTTP-01 challenges only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::ChallengeStore;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: usize = 30;

#[derive(Clone, Debug, Deserialize)]
struct Directory {
    #[serde(rename = "newNonce")]
    new_nonce: String,
    #[serde(rename = "newAccount")]
    new_account: String,
    #[serde(rename = "newOrder")]
    new_order: String,
}

#[derive(Debug, Deserialize)]
struct Order {
    status: String,
    authorizations: Vec<String>,
    finalize: String,
    certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Authorization {
    status: String,
    challenges: Vec<Challenge>,
}

#[derive(Debug, Deserialize)]
struct Challenge {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    token: String,
}

/// A successfully issued certificate, ready for the store.
pub struct IssuedCert {
    pub chain_pem: String,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

/// ACME client bound to one directory and one account key.
pub struct AcmeClient {
    http: reqwest::Client,
    directory_url: String,
    account_key: EcdsaKeyPair,
    rng: SystemRandom,
    contact: Option<String>,
}

impl AcmeClient {
    /// Build a client, loading the per-environment account key from
    /// `account_key_path` or generating and pinning a fresh one.
    pub fn new(
        directory_url: &str,
        contact: Option<String>,
        account_key_path: &Path,
    ) -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = load_or_create_account_key(account_key_path, &rng)?;
        let account_key =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &rng)
                .map_err(|_| anyhow!("unusable ACME account key at {:?}", account_key_path))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(AcmeClient {
            http,
            directory_url: directory_url.to_string(),
            account_key,
            rng,
            contact,
        })
    }

    /// Issue a certificate for `host` via HTTP-01, parking the challenge
    /// response in `challenges` for the dispatcher to serve.
    pub async fn issue(&self, host: &str, challenges: &ChallengeStore) -> Result<IssuedCert> {
        let directory: Directory = self
            .http
            .get(&self.directory_url)
            .send()
            .await?
            .json()
            .await
            .context("failed to fetch ACME directory")?;

        let mut nonce = self.fresh_nonce(&directory).await?;

        // Account: newAccount is idempotent for an existing key.
        let account_payload = match &self.contact {
            Some(contact) => json!({
                "termsOfServiceAgreed": true,
                "contact": [format!("mailto:{}", contact)],
            }),
            None => json!({ "termsOfServiceAgreed": true }),
        };
        let (account, account_headers) = self
            .post(&directory.new_account, &account_payload.to_string(), &mut nonce, None)
            .await?;
        if !account.status().is_success() {
            bail!("newAccount failed: {}", account.text().await.unwrap_or_default());
        }
        let kid = account_headers
            .get("location")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| anyhow!("newAccount response missing Location"))?
            .to_string();

        // Order for the single host.
        let order_payload = json!({
            "identifiers": [{ "type": "dns", "value": host }],
        });
        let (response, headers) = self
            .post(&directory.new_order, &order_payload.to_string(), &mut nonce, Some(&kid))
            .await?;
        if !response.status().is_success() {
            bail!("newOrder failed: {}", response.text().await.unwrap_or_default());
        }
        let order_url = headers
            .get("location")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| anyhow!("newOrder response missing Location"))?
            .to_string();
        let order: Order = response.json().await?;

        // HTTP-01 for every authorization (one, for a single name).
        for authz_url in order.authorizations.iter() {
            let (response, _) = self.post(authz_url, "", &mut nonce, Some(&kid)).await?;
            let authz: Authorization = response.json().await?;
            if authz.status == "valid" {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|challenge| challenge.kind == "http-01")
                .ok_or_else(|| anyhow!("no http-01 challenge offered for {}", host))?;

            let key_authorization =
                format!("{}.{}", challenge.token, self.key_thumbprint()?);
            challenges.put(&challenge.token, &key_authorization);

            let (response, _) = self
                .post(&challenge.url, "{}", &mut nonce, Some(&kid))
                .await?;
            if !response.status().is_success() {
                challenges.remove(&challenge.token);
                bail!(
                    "challenge trigger failed: {}",
                    response.text().await.unwrap_or_default()
                );
            }

            let outcome = self
                .poll(authz_url, &mut nonce, &kid, |authz: &Authorization| {
                    match authz.status.as_str() {
                        "valid" => Some(Ok(())),
                        "invalid" => Some(Err(anyhow!("authorization went invalid"))),
                        _ => None,
                    }
                })
                .await;
            challenges.remove(&challenge.token);
            outcome.with_context(|| format!("http-01 validation failed for {}", host))?;
        }

        // Finalize with a fresh key and CSR.
        let cert_key = rcgen::KeyPair::generate()?;
        let params = rcgen::CertificateParams::new(vec![host.to_string()])?;
        let csr = params.serialize_request(&cert_key)?;
        let finalize_payload = json!({
            "csr": URL_SAFE_NO_PAD.encode(csr.der().as_ref()),
        });
        let (response, _) = self
            .post(&order.finalize, &finalize_payload.to_string(), &mut nonce, Some(&kid))
            .await?;
        if !response.status().is_success() {
            bail!("finalize failed: {}", response.text().await.unwrap_or_default());
        }

        let certificate_url = self
            .poll(&order_url, &mut nonce, &kid, |order: &Order| {
                match order.status.as_str() {
                    "valid" => order
                        .certificate
                        .clone()
                        .map(Ok)
                        .or(Some(Err(anyhow!("valid order without certificate URL")))),
                    "invalid" => Some(Err(anyhow!("order went invalid"))),
                    _ => None,
                }
            })
            .await
            .with_context(|| format!("order never became valid for {}", host))?;

        let (response, _) = self
            .post(&certificate_url, "", &mut nonce, Some(&kid))
            .await?;
        if !response.status().is_success() {
            bail!(
                "certificate download failed: {}",
                response.text().await.unwrap_or_default()
            );
        }
        let chain_pem = response.text().await?;
        let key_pem = cert_key.serialize_pem();
        let not_after = super::certified_not_after(&chain_pem)?;

        info!("issued certificate for {} (expires {})", host, not_after);
        Ok(IssuedCert {
            chain_pem,
            key_pem,
            not_after,
        })
    }

    async fn fresh_nonce(&self, directory: &Directory) -> Result<String> {
        let response = self.http.head(&directory.new_nonce).send().await?;
        response
            .headers()
            .get("replay-nonce")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("newNonce did not return a nonce"))
    }

    /// One signed POST (or POST-as-GET for an empty payload). Refreshes
    /// `nonce` from the response.
    async fn post(
        &self,
        url: &str,
        payload: &str,
        nonce: &mut String,
        kid: Option<&str>,
    ) -> Result<(reqwest::Response, reqwest::header::HeaderMap)> {
        let protected = match kid {
            Some(kid) => json!({
                "alg": "ES256",
                "kid": kid,
                "nonce": nonce,
                "url": url,
            }),
            None => json!({
                "alg": "ES256",
                "jwk": self.jwk()?,
                "nonce": nonce,
                "url": url,
            }),
        };
        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string());
        let payload_b64 = if payload.is_empty() {
            String::new()
        } else {
            URL_SAFE_NO_PAD.encode(payload)
        };
        let signing_input = format!("{}.{}", protected_b64, payload_b64);
        let signature = self
            .account_key
            .sign(&self.rng, signing_input.as_bytes())
            .map_err(|_| anyhow!("JWS signing failed"))?;

        let body = json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature.as_ref()),
        });

        let response = self
            .http
            .post(url)
            .header("content-type", "application/jose+json")
            .body(body.to_string())
            .send()
            .await?;
        if let Some(next) = response
            .headers()
            .get("replay-nonce")
            .and_then(|value| value.to_str().ok())
        {
            *nonce = next.to_string();
        }
        let headers = response.headers().clone();
        Ok((response, headers))
    }

    async fn poll<T, O, F>(
        &self,
        url: &str,
        nonce: &mut String,
        kid: &str,
        judge: F,
    ) -> Result<O>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(&T) -> Option<Result<O>>,
    {
        for _ in 0..POLL_ATTEMPTS {
            let (response, _) = self.post(url, "", nonce, Some(kid)).await?;
            let parsed: T = response.json().await?;
            if let Some(outcome) = judge(&parsed) {
                return outcome;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        bail!("timed out polling {}", url)
    }

    /// Public JWK of the account key: uncompressed P-256 point split into
    /// x and y.
    fn jwk(&self) -> Result<serde_json::Value> {
        let public = self.account_key.public_key().as_ref();
        if public.len() != 65 || public[0] != 4 {
            bail!("unexpected public key encoding");
        }
        Ok(json!({
            "crv": "P-256",
            "kty": "EC",
            "x": URL_SAFE_NO_PAD.encode(&public[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&public[33..65]),
        }))
    }

    /// RFC 7638 thumbprint over the canonical JWK ordering.
    fn key_thumbprint(&self) -> Result<String> {
        let public = self.account_key.public_key().as_ref();
        if public.len() != 65 || public[0] != 4 {
            bail!("unexpected public key encoding");
        }
        let canonical = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(&public[1..33]),
            URL_SAFE_NO_PAD.encode(&public[33..65]),
        );
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(digest))
    }
}

/// The account key is pinned per environment: reused across restarts so
/// the directory recognizes the account.
fn load_or_create_account_key(path: &Path, rng: &SystemRandom) -> Result<Vec<u8>> {
    if path.exists() {
        let pem_text = std::fs::read_to_string(path)?;
        let block = pem::parse(pem_text.as_bytes())?;
        return Ok(block.into_contents());
    }
    let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, rng)
        .map_err(|_| anyhow!("failed to generate ACME account key"))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let block = pem::Pem::new("PRIVATE KEY", document.as_ref().to_vec());
    std::fs::write(path, pem::encode(&block))?;
    Ok(document.as_ref().to_vec())
}

/// Which directory URL an environment uses.
pub fn directory_url(staging: bool) -> &'static str {
    if staging {
        LETS_ENCRYPT_STAGING
    } else {
        LETS_ENCRYPT_PRODUCTION
    }
}

/// Account key file for an environment, under the cert directory.
pub fn account_key_path(cert_dir: &Path, staging: bool) -> PathBuf {
    if staging {
        cert_dir.join("account-staging.pem")
    } else {
        cert_dir.join("account-production.pem")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_keys_are_pinned_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = account_key_path(dir.path(), true);
        let rng = SystemRandom::new();

        let first = load_or_create_account_key(&path, &rng).unwrap();
        let second = load_or_create_account_key(&path, &rng).unwrap();
        assert_eq!(first, second);
        assert!(path.ends_with("account-staging.pem"));
    }

    #[test]
    fn jwk_and_thumbprint_are_stable_for_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let client = AcmeClient::new(
            LETS_ENCRYPT_STAGING,
            None,
            &dir.path().join("account.pem"),
        )
        .unwrap();

        let jwk_a = client.jwk().unwrap();
        let jwk_b = client.jwk().unwrap();
        assert_eq!(jwk_a, jwk_b);
        assert_eq!(jwk_a["kty"], "EC");
        assert_eq!(jwk_a["crv"], "P-256");

        let thumb_a = client.key_thumbprint().unwrap();
        let thumb_b = client.key_thumbprint().unwrap();
        assert_eq!(thumb_a, thumb_b);
        // Base64url SHA-256: 43 chars, no padding.
        assert_eq!(thumb_a.len(), 43);
        assert!(!thumb_a.contains('='));
    }
}
