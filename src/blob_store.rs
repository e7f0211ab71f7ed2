//! Durable byte storage for uploaded files.
//!
//! Two [`BlobStore`] backends keyed by sanitized filename:
//!
//! - **[`RemoteStore`]** — an S3-compatible bucket addressed through the S3
//!   REST API with AWS Signature V4. The default endpoint is Google Cloud
//!   Storage's interoperability API (`storage.googleapis.com`), which accepts
//!   HMAC keys; any S3-compatible service (AWS, MinIO, LocalStack) works by
//!   setting `endpoint_url`.
//! - **[`LocalStore`]** — a flat local directory used when no bucket is
//!   configured or a remote write fails.
//!
//! Signing uses only pure-Rust dependencies (`hmac`, `sha2`).
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! upload_dir = "./uploads_store"
//!
//! [storage.remote]
//! bucket = "acme-demo-uploads"
//! prefix = "uploads/"
//! region = "auto"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` — required for the remote store
//! - `AWS_SECRET_ACCESS_KEY` — required for the remote store
//! - `AWS_SESSION_TOKEN` — optional

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::RemoteStorageConfig;

/// Object storage keyed by filename.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend label for logs and status output.
    fn name(&self) -> &str;

    /// Filenames currently stored (prefix already stripped).
    async fn list(&self) -> Result<Vec<String>>;

    async fn get(&self, filename: &str) -> Result<Vec<u8>>;

    async fn put(&self, filename: &str, bytes: &[u8]) -> Result<()>;

    /// Delete `filename`. Deleting a missing object is not an error.
    async fn delete(&self, filename: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Local directory
// ═══════════════════════════════════════════════════════════════════════

/// Flat directory of uploaded files.
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) the upload directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create upload dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, filename: &str) -> Result<PathBuf> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename == "."
            || filename == ".."
        {
            bail!("invalid stored filename: {:?}", filename);
        }
        Ok(self.dir.join(filename))
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn list(&self) -> Result<Vec<String>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut names = Vec::new();
            for entry in walkdir::WalkDir::new(&dir).min_depth(1).max_depth(1) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
            names.sort();
            Ok(names)
        })
        .await?
    }

    async fn get(&self, filename: &str) -> Result<Vec<u8>> {
        let path = self.path_for(filename)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn put(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(filename)?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn delete(&self, filename: &str) -> Result<()> {
        let path = self.path_for(filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Remote S3-compatible bucket
// ═══════════════════════════════════════════════════════════════════════

type HmacSha256 = Hmac<Sha256>;

/// Default endpoint: Google Cloud Storage XML API (HMAC interoperability).
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// AWS-style credentials loaded from environment variables.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }

    pub fn new(access_key_id: &str, secret_access_key: &str) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: None,
        }
    }
}

/// Bucket store speaking the S3 REST API with SigV4 signing.
///
/// Uses path-style addressing (`<endpoint>/<bucket>/<key>`) so the same code
/// works against GCS, MinIO and AWS.
pub struct RemoteStore {
    config: RemoteStorageConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl RemoteStore {
    pub fn new(config: RemoteStorageConfig, creds: AwsCredentials) -> Self {
        Self {
            config,
            creds,
            client: reqwest::Client::new(),
        }
    }

    /// Build from config, reading credentials from the environment.
    pub fn from_env(config: &RemoteStorageConfig) -> Result<Self> {
        Ok(Self::new(config.clone(), AwsCredentials::from_env()?))
    }

    fn endpoint(&self) -> (&str, String) {
        let raw = self
            .config
            .endpoint_url
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT);
        let scheme = if raw.starts_with("http://") {
            "http"
        } else {
            "https"
        };
        let host = raw
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        (scheme, host)
    }

    fn object_key(&self, filename: &str) -> String {
        format!("{}{}", self.config.prefix, filename)
    }

    /// Send a signed request. `key` is `None` for bucket-level calls.
    async fn send(
        &self,
        method: reqwest::Method,
        key: Option<&str>,
        query_params: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let (scheme, host) = self.endpoint();
        let mut canonical_uri = format!("/{}", uri_encode(&self.config.bucket));
        if let Some(key) = key {
            let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
            canonical_uri.push('/');
            canonical_uri.push_str(&encoded_key);
        } else {
            canonical_uri.push('/');
        }

        let mut sorted_params = query_params.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let signed = sign_v4(SigningInput {
            method: method.as_str(),
            host: &host,
            canonical_uri: &canonical_uri,
            canonical_querystring: &canonical_querystring,
            payload_hash: &payload_hash,
            amz_date: &amz_date,
            date_stamp: &date_stamp,
            region: &self.config.region,
            creds: &self.creds,
        });

        let mut url = format!("{}://{}{}", scheme, host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &signed)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        debug!(%method, %url, "signed storage request");
        req.send()
            .await
            .with_context(|| format!("{} {} failed", method, url))
    }
}

#[async_trait]
impl BlobStore for RemoteStore {
    fn name(&self) -> &str {
        "remote"
    }

    /// List every object under the prefix, following `ListObjectsV2`
    /// continuation tokens.
    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.config.prefix.is_empty() {
                params.push(("prefix".to_string(), self.config.prefix.clone()));
            }
            if let Some(ref token) = continuation_token {
                params.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .send(reqwest::Method::GET, None, &params, Vec::new())
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml = resp.text().await?;
            let (keys, is_truncated, next_token) = parse_list_objects_response(&xml);
            names.extend(
                keys.into_iter()
                    .filter_map(|k| k.strip_prefix(&self.config.prefix).map(str::to_string))
                    .filter(|k| !k.is_empty() && !k.contains('/')),
            );

            if is_truncated && next_token.is_some() {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        names.sort();
        Ok(names)
    }

    async fn get(&self, filename: &str) -> Result<Vec<u8>> {
        let key = self.object_key(filename);
        let resp = self
            .send(reqwest::Method::GET, Some(&key), &[], Vec::new())
            .await?;
        if !resp.status().is_success() {
            bail!("GetObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn put(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        let key = self.object_key(filename);
        let resp = self
            .send(reqwest::Method::PUT, Some(&key), &[], bytes.to_vec())
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(500).collect::<String>()
            );
        }
        Ok(())
    }

    async fn delete(&self, filename: &str) -> Result<()> {
        let key = self.object_key(filename);
        let resp = self
            .send(reqwest::Method::DELETE, Some(&key), &[], Vec::new())
            .await?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            bail!("DeleteObject failed (HTTP {}) for key '{}'", status, key)
        }
    }
}

// ============ AWS SigV4 Helpers ============

struct SigningInput<'a> {
    method: &'a str,
    host: &'a str,
    canonical_uri: &'a str,
    canonical_querystring: &'a str,
    payload_hash: &'a str,
    amz_date: &'a str,
    date_stamp: &'a str,
    region: &'a str,
    creds: &'a AwsCredentials,
}

/// Build the `Authorization` header value for a request.
fn sign_v4(input: SigningInput<'_>) -> String {
    let mut headers = vec![
        ("host".to_string(), input.host.to_string()),
        (
            "x-amz-content-sha256".to_string(),
            input.payload_hash.to_string(),
        ),
        ("x-amz-date".to_string(), input.amz_date.to_string()),
    ];
    if let Some(ref token) = input.creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method,
        input.canonical_uri,
        input.canonical_querystring,
        canonical_headers,
        signed_headers,
        input.payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", input.date_stamp, input.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        input.amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        &input.creds.secret_access_key,
        input.date_stamp,
        input.region,
        "s3",
    );
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        input.creds.access_key_id, credential_scope, signed_headers, signature
    )
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length; `new_from_slice` cannot fail here.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC can take key of any size"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving `A-Z a-z 0-9 - _ . ~` as is.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing (minimal, no extra deps) ============

/// Keys, truncation flag and continuation token of a `ListObjectsV2` page.
fn parse_list_objects_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(xml_unescape(&key));
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    (keys, is_truncated, next_token)
}

/// Text content of the first `<tag>` (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
