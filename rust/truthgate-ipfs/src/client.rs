//! The RPC client proper.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use truthgate_core::RotatingKey;
use url::Url;

use crate::error::{NodeError, NodeResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifetime passed to `name/publish`.
pub const PUBLISH_LIFETIME: &str = "24h";
/// Record TTL passed to `name/publish`.
pub const PUBLISH_TTL: &str = "1m";

/// A name key known to the node.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct KeyInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Id")]
    pub id: String,
}

/// The pointer file kept at `/production/pinned/<tgpLeaf>/tgp.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TgpPointer {
    pub current: String,
    pub previous: Option<String>,
    pub ts: String,
}

#[derive(Deserialize)]
struct FilesStatResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Deserialize)]
struct FilesLsResponse {
    #[serde(rename = "Entries")]
    entries: Option<Vec<FilesLsEntry>>,
}

#[derive(Deserialize)]
struct FilesLsEntry {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
struct LsResponse {
    #[serde(rename = "Objects")]
    objects: Vec<LsObject>,
}

#[derive(Deserialize)]
struct LsObject {
    #[serde(rename = "Links")]
    links: Vec<LsLink>,
}

#[derive(Deserialize)]
struct LsLink {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
struct NamePublishResponse {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Deserialize)]
struct NameResolveResponse {
    #[serde(rename = "Path")]
    path: String,
}

#[derive(Deserialize)]
struct KeyListResponse {
    #[serde(rename = "Keys")]
    keys: Vec<KeyInfo>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[serde(rename = "Message")]
    message: String,
}

/// A high-level client for the node's local RPC API, authenticating every
/// call with the rotating internal key.
#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
    rpc_url: Url,
    internal_key: Arc<RotatingKey>,
}

impl NodeClient {
    pub fn new(rpc_url: &Url, internal_key: Arc<RotatingKey>) -> NodeResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|error| NodeError::Protocol(error.to_string()))?;
        Ok(NodeClient {
            client,
            rpc_url: rpc_url.clone(),
            internal_key,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.rpc_url.clone();
        url.set_path(&format!("/api/v0/{}", path));
        url
    }

    /// POST an RPC call (the API rejects GET) and classify the outcome.
    async fn call(&self, path: &str, args: &[(&str, &str)]) -> NodeResult<reqwest::Response> {
        let mut url = self.endpoint(path);
        url.query_pairs_mut().clear().extend_pairs(args);

        let response = self
            .client
            .post(url)
            .header("X-API-Key", self.internal_key.current())
            .send()
            .await?;
        classify(response).await
    }

    async fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        args: &[(&str, &str)],
    ) -> NodeResult<T> {
        let response = self.call(path, args).await?;
        response
            .json::<T>()
            .await
            .map_err(|error| NodeError::Protocol(format!("{}: bad payload: {}", path, error)))
    }

    /// The current CID of an MFS folder, via the `Hash` field of
    /// `files/stat`.
    #[instrument(skip(self), level = "trace")]
    pub async fn resolve_mfs_folder_to_cid(&self, mfs_path: &str) -> NodeResult<String> {
        let stat: FilesStatResponse = self.call_json("files/stat", &[("arg", mfs_path)]).await?;
        Ok(stat.hash)
    }

    #[instrument(skip(self), level = "trace")]
    pub async fn files_mkdir(&self, mfs_path: &str, parents: bool) -> NodeResult<()> {
        self.call(
            "files/mkdir",
            &[("arg", mfs_path), ("parents", bool_str(parents))],
        )
        .await?;
        Ok(())
    }

    /// Stream `body` into a new MFS file, creating parents and truncating
    /// any previous content.
    #[instrument(skip(self, body), level = "trace")]
    pub async fn files_write(
        &self,
        mfs_path: &str,
        body: reqwest::Body,
        mime: &str,
    ) -> NodeResult<()> {
        let mut url = self.endpoint("files/write");
        url.query_pairs_mut().clear().extend_pairs([
            ("arg", mfs_path),
            ("create", "true"),
            ("truncate", "true"),
            ("parents", "true"),
        ]);

        let part = Part::stream(body)
            .file_name("data")
            .mime_str(mime)
            .map_err(|error| NodeError::Protocol(error.to_string()))?;
        let form = Form::new().part("data", part);

        let response = self
            .client
            .post(url)
            .header("X-API-Key", self.internal_key.current())
            .multipart(form)
            .send()
            .await?;
        classify(response).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    pub async fn files_read(&self, mfs_path: &str) -> NodeResult<Bytes> {
        let response = self.call("files/read", &[("arg", mfs_path)]).await?;
        response
            .bytes()
            .await
            .map_err(|error| NodeError::Transient(error.to_string()))
    }

    /// Copy immutable content into MFS.
    #[instrument(skip(self), level = "trace")]
    pub async fn files_cp_from_ipfs(&self, cid: &str, dst: &str) -> NodeResult<()> {
        let src = format!("/ipfs/{}", cid);
        self.call("files/cp", &[("arg", src.as_str()), ("arg", dst)])
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    pub async fn files_mv(&self, src: &str, dst: &str) -> NodeResult<()> {
        self.call("files/mv", &[("arg", src), ("arg", dst)]).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    pub async fn files_rm(&self, mfs_path: &str, recursive: bool) -> NodeResult<()> {
        self.call(
            "files/rm",
            &[("arg", mfs_path), ("recursive", bool_str(recursive))],
        )
        .await?;
        Ok(())
    }

    /// List an MFS directory as an ordered `lower(name) → name` map.
    #[instrument(skip(self), level = "trace")]
    pub async fn files_ls(&self, mfs_path: &str) -> NodeResult<BTreeMap<String, String>> {
        let listing: FilesLsResponse = self.call_json("files/ls", &[("arg", mfs_path)]).await?;
        Ok(name_map(
            listing.entries.unwrap_or_default().into_iter().map(|e| e.name),
        ))
    }

    /// List a directory addressed by CID (or `/ipfs/...` path) as an
    /// ordered `lower(name) → name` map.
    #[instrument(skip(self), level = "trace")]
    pub async fn ls(&self, cid_or_path: &str) -> NodeResult<BTreeMap<String, String>> {
        let listing: LsResponse = self
            .call_json("ls", &[("arg", cid_or_path), ("resolve-type", "false")])
            .await?;
        Ok(name_map(
            listing
                .objects
                .into_iter()
                .flat_map(|object| object.links)
                .map(|link| link.name),
        ))
    }

    #[instrument(skip(self), level = "trace")]
    pub async fn pin_add(&self, cid: &str, recursive: bool) -> NodeResult<()> {
        self.call(
            "pin/add",
            &[("arg", cid), ("recursive", bool_str(recursive))],
        )
        .await?;
        Ok(())
    }

    /// Whether the CID is pinned. "Not pinned" is a negative answer, not an
    /// error.
    #[instrument(skip(self), level = "trace")]
    pub async fn pin_ls(&self, cid: &str) -> NodeResult<bool> {
        match self.call("pin/ls", &[("arg", cid), ("type", "all")]).await {
            Ok(_) => Ok(true),
            Err(NodeError::NotFound) => Ok(false),
            Err(NodeError::Protocol(message)) if message.contains("is not pinned") => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Whether the block is present in the local store, without fetching.
    #[instrument(skip(self), level = "trace")]
    pub async fn block_stat(&self, cid: &str) -> NodeResult<bool> {
        match self
            .call("block/stat", &[("arg", cid), ("offline", "true")])
            .await
        {
            Ok(_) => Ok(true),
            Err(NodeError::NotFound) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// A CID counts as local iff it is pinned or its root block is in the
    /// local store. Pin status is consulted first.
    #[instrument(skip(self), level = "trace")]
    pub async fn is_cid_local(&self, cid: &str) -> NodeResult<bool> {
        if self.pin_ls(cid).await? {
            return Ok(true);
        }
        self.block_stat(cid).await
    }

    /// Publish `cid` under the named key, returning `(name, value)`.
    #[instrument(skip(self), level = "trace")]
    pub async fn name_publish(&self, key: &str, cid: &str) -> NodeResult<(String, String)> {
        let target = format!("/ipfs/{}", cid);
        let published: NamePublishResponse = self
            .call_json(
                "name/publish",
                &[
                    ("arg", target.as_str()),
                    ("key", key),
                    ("lifetime", PUBLISH_LIFETIME),
                    ("ttl", PUBLISH_TTL),
                    ("allow-offline", "true"),
                ],
            )
            .await?;
        Ok((published.name, published.value))
    }

    /// Resolve a name to its current `/ipfs/<cid>` path.
    #[instrument(skip(self), level = "trace")]
    pub async fn name_resolve(&self, name: &str) -> NodeResult<String> {
        let resolved: NameResolveResponse =
            self.call_json("name/resolve", &[("arg", name)]).await?;
        Ok(resolved.path)
    }

    #[instrument(skip(self), level = "trace")]
    pub async fn key_list(&self) -> NodeResult<Vec<KeyInfo>> {
        let listing: KeyListResponse = self.call_json("key/list", &[]).await?;
        Ok(listing.keys)
    }

    #[instrument(skip(self), level = "trace")]
    pub async fn key_gen(&self, name: &str) -> NodeResult<KeyInfo> {
        self.call_json("key/gen", &[("arg", name), ("type", "ed25519")])
            .await
    }

    /// Armored (PEM) export of a name key. Sealing for transport is the
    /// caller's concern.
    #[instrument(skip(self), level = "trace")]
    pub async fn key_export(&self, name: &str) -> NodeResult<String> {
        let response = self
            .call(
                "key/export",
                &[("arg", name), ("format", "pem-pkcs8-cleartext")],
            )
            .await?;
        response
            .text()
            .await
            .map_err(|error| NodeError::Transient(error.to_string()))
    }

    #[instrument(skip(self, armored), level = "trace")]
    pub async fn key_import(&self, name: &str, armored: &str) -> NodeResult<KeyInfo> {
        let mut url = self.endpoint("key/import");
        url.query_pairs_mut()
            .clear()
            .extend_pairs([("arg", name), ("format", "pem-pkcs8-cleartext")]);

        let part = Part::bytes(armored.as_bytes().to_vec()).file_name("key");
        let form = Form::new().part("key", part);

        let response = self
            .client
            .post(url)
            .header("X-API-Key", self.internal_key.current())
            .multipart(form)
            .send()
            .await?;
        let response = classify(response).await?;
        response
            .json::<KeyInfo>()
            .await
            .map_err(|error| NodeError::Protocol(format!("key/import: bad payload: {}", error)))
    }

    /// Discover the CID behind the node's bundled WebUI by HEAD-probing it
    /// and reading `X-Ipfs-Roots`, `X-Ipfs-Path` or `ETag`, in that order.
    #[instrument(skip(self), level = "trace")]
    pub async fn webui_cid(&self) -> NodeResult<Option<String>> {
        let mut url = self.rpc_url.clone();
        url.set_path("/webui/");

        let response = self
            .client
            .head(url)
            .header("X-API-Key", self.internal_key.current())
            .send()
            .await?;
        let headers = response.headers();

        if let Some(roots) = header_str(headers, "x-ipfs-roots") {
            if let Some(first) = roots.split(',').next() {
                return Ok(Some(first.trim().to_string()));
            }
        }
        if let Some(path) = header_str(headers, "x-ipfs-path") {
            if let Some(cid) = path.trim_start_matches("/ipfs/").split('/').next() {
                if !cid.is_empty() {
                    return Ok(Some(cid.to_string()));
                }
            }
        }
        if let Some(etag) = header_str(headers, "etag") {
            let trimmed = etag.trim_matches(|c| c == '"' || c == 'W' || c == '/');
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
        Ok(None)
    }
}

fn header_str<'h>(headers: &'h reqwest::header::HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn name_map(names: impl Iterator<Item = String>) -> BTreeMap<String, String> {
    names
        .filter(|name| !name.is_empty())
        .map(|name| (name.to_lowercase(), name))
        .collect()
}

/// Map an RPC response to the tagged error taxonomy. The API reports most
/// failures as 500 with a JSON `Message`; "does not exist" style messages
/// are negative answers rather than faults.
async fn classify(response: reqwest::Response) -> NodeResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(NodeError::NotFound);
    }

    let message = match response.json::<RpcErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        let lowered = message.to_lowercase();
        if lowered.contains("does not exist")
            || lowered.contains("not found")
            || lowered.contains("no link named")
            || lowered.contains("could not resolve")
        {
            return Err(NodeError::NotFound);
        }
        return Err(NodeError::Protocol(message));
    }
    if status.is_server_error() {
        return Err(NodeError::Transient(message));
    }
    Err(NodeError::Protocol(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{}", addr)).unwrap()
    }

    fn client_for(url: &Url) -> NodeClient {
        NodeClient::new(url, Arc::new(RotatingKey::new())).unwrap()
    }

    #[tokio::test]
    async fn files_stat_yields_the_hash_field() {
        let router = Router::new().route(
            "/api/v0/files/stat",
            post(|Query(args): Query<HashMap<String, String>>| async move {
                assert_eq!(args.get("arg").map(String::as_str), Some("/production/sites/x"));
                Json(serde_json::json!({ "Hash": "QmAAA", "Size": 0, "Type": "directory" }))
            }),
        );
        let url = serve(router).await;

        let cid = client_for(&url)
            .resolve_mfs_folder_to_cid("/production/sites/x")
            .await
            .unwrap();
        assert_eq!(cid, "QmAAA");
    }

    #[tokio::test]
    async fn missing_mfs_paths_classify_as_not_found() {
        let router = Router::new().route(
            "/api/v0/files/stat",
            post(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "Message": "files/stat: file does not exist",
                        "Code": 0,
                    })),
                )
            }),
        );
        let url = serve(router).await;

        let result = client_for(&url).resolve_mfs_folder_to_cid("/nope").await;
        assert!(matches!(result, Err(NodeError::NotFound)));
    }

    #[tokio::test]
    async fn ls_produces_a_case_folding_map() {
        let router = Router::new().route(
            "/api/v0/ls",
            post(|| async {
                Json(serde_json::json!({
                    "Objects": [{
                        "Hash": "QmAAA",
                        "Links": [
                            { "Name": "Index.HTML", "Hash": "Qm1", "Size": 1, "Type": 2 },
                            { "Name": "app.js", "Hash": "Qm2", "Size": 1, "Type": 2 },
                        ],
                    }]
                }))
            }),
        );
        let url = serve(router).await;

        let map = client_for(&url).ls("QmAAA").await.unwrap();
        assert_eq!(map.get("index.html").map(String::as_str), Some("Index.HTML"));
        assert_eq!(map.get("app.js").map(String::as_str), Some("app.js"));
    }

    #[tokio::test]
    async fn is_cid_local_consults_pins_before_blocks() {
        let router = Router::new()
            .route(
                "/api/v0/pin/ls",
                post(|| async {
                    (
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({
                            "Message": "path 'QmAAA' is not pinned",
                            "Code": 0,
                        })),
                    )
                }),
            )
            .route(
                "/api/v0/block/stat",
                post(|| async { Json(serde_json::json!({ "Key": "QmAAA", "Size": 42 })) }),
            );
        let url = serve(router).await;

        assert!(client_for(&url).is_cid_local("QmAAA").await.unwrap());
    }

    #[tokio::test]
    async fn calls_carry_the_internal_key() {
        let router = Router::new().route(
            "/api/v0/key/list",
            post(|headers: HeaderMap| async move {
                assert!(headers.get("x-api-key").is_some());
                Json(serde_json::json!({ "Keys": [{ "Name": "self", "Id": "12D3KooW" }] }))
            }),
        );
        let url = serve(router).await;

        let keys = client_for(&url).key_list().await.unwrap();
        assert_eq!(keys[0].name, "self");
    }
}
