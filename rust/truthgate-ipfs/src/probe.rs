//! HEAD probes against the node's HTTP gateway, used by the existence
//! cache to test paths inside a CID without transferring bodies.

use std::time::Duration;

use reqwest::StatusCode;
use url::Url;

use crate::error::{NodeError, NodeResult};

const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct ProbeClient {
    client: reqwest::Client,
    gateway_url: Url,
}

impl ProbeClient {
    pub fn new(gateway_url: &Url) -> NodeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|error| NodeError::Protocol(error.to_string()))?;
        Ok(ProbeClient {
            client,
            gateway_url: gateway_url.clone(),
        })
    }

    /// The gateway URL for a path inside a CID; also used by the reverse
    /// proxy as its forward target.
    pub fn ipfs_url(&self, cid: &str, path: &str) -> Url {
        let mut url = self.gateway_url.clone();
        let rest = path.trim_start_matches('/');
        if rest.is_empty() {
            url.set_path(&format!("/ipfs/{}/", cid));
        } else {
            url.set_path(&format!("/ipfs/{}/{}", cid, rest));
        }
        url
    }

    pub fn ipns_url(&self, name: &str, path: &str) -> Url {
        let mut url = self.gateway_url.clone();
        let rest = path.trim_start_matches('/');
        if rest.is_empty() {
            url.set_path(&format!("/ipns/{}/", name));
        } else {
            url.set_path(&format!("/ipns/{}/{}", name, rest));
        }
        url
    }

    /// Whether `path` exists inside `cid`, by HEAD status. Gateways answer
    /// 200 for files and directory indexes; 301 redirects (directory
    /// without trailing slash) count as present.
    #[instrument(skip(self), level = "trace")]
    pub async fn head_exists(&self, cid: &str, path: &str, fresh: bool) -> NodeResult<bool> {
        let url = self.ipfs_url(cid, path);
        let mut request = self.client.head(url);
        if fresh {
            request = request.header("Cache-Control", "no-cache");
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT => {
                Ok(true)
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(false),
            status if status.is_server_error() => Err(NodeError::Transient(status.to_string())),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_builds_gateway_urls_with_and_without_rest() {
        let probe = ProbeClient::new(&Url::parse("http://127.0.0.1:8080").unwrap()).unwrap();
        assert_eq!(
            probe.ipfs_url("QmAAA", "").as_str(),
            "http://127.0.0.1:8080/ipfs/QmAAA/"
        );
        assert_eq!(
            probe.ipfs_url("QmAAA", "deep/link").as_str(),
            "http://127.0.0.1:8080/ipfs/QmAAA/deep/link"
        );
        assert_eq!(
            probe.ipns_url("example-key", "a").as_str(),
            "http://127.0.0.1:8080/ipns/example-key/a"
        );
    }
}
