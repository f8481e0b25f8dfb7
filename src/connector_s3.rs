//! S3 record source.
//!
//! Lists and downloads vCon documents from an S3 bucket using the S3 REST
//! API with AWS Signature V4 authentication. Keys are expected under
//! calendar-day partitions:
//!
//! ```text
//! <prefix><partition_format(day)><name><suffix>
//! vcons/2024/06/15/0190b2f2-....vcon.json
//! ```
//!
//! A listing never covers the whole bucket. The time window is split into
//! the UTC days it touches and one paginated `ListObjectsV2` call is issued
//! per day prefix. Objects whose `LastModified` falls outside the window or
//! whose key lacks the suffix are dropped; the rest are downloaded as soon
//! as their page arrives, `fetch_concurrency` at a time.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)
//!
//! # Custom endpoints
//!
//! When `endpoint_url` is set (MinIO, LocalStack) requests use path-style
//! addressing: `<endpoint>/<bucket>/<key>`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::S3SourceConfig;
use crate::connector_fs::object_identifier;
use crate::models::{CandidateRecord, TimeWindow};
use crate::traits::{RecordSource, SourceKind};

type HmacSha256 = Hmac<Sha256>;

// ============ Credentials ============

/// AWS credentials used to sign every request.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
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
}

// ============ Source ============

pub struct S3Source {
    config: S3SourceConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Source {
    pub fn new(config: S3SourceConfig, creds: AwsCredentials) -> Self {
        Self {
            config,
            creds,
            client: reqwest::Client::new(),
        }
    }

    /// Key prefix listed for one calendar day.
    pub fn partition_prefix(&self, day: NaiveDate) -> String {
        format!(
            "{}{}",
            self.config.prefix,
            day.format(&self.config.partition_format)
        )
    }

    fn host(&self) -> String {
        match &self.config.endpoint_url {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!(
                "{}.s3.{}.amazonaws.com",
                self.config.bucket, self.config.region
            ),
        }
    }

    /// Base URL and the path prefix that precedes object keys.
    fn base(&self) -> (String, String) {
        match &self.config.endpoint_url {
            Some(endpoint) => (
                endpoint.trim_end_matches('/').to_string(),
                format!("/{}", uri_encode(&self.config.bucket)),
            ),
            None => (format!("https://{}", self.host()), String::new()),
        }
    }

    /// List every object under one day prefix, following continuation
    /// tokens, and download the ones that match.
    async fn sync_partition(
        &self,
        prefix: &str,
        window: &TimeWindow,
    ) -> Result<Vec<CandidateRecord>> {
        let mut records = Vec::new();
        let mut continuation_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = &continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let (_, bucket_path) = self.base();
            let path = format!("{}/", bucket_path);
            let resp = self.signed_get(&path, &query).await.with_context(|| {
                format!(
                    "Failed to list s3://{}/{}",
                    self.config.bucket, prefix
                )
            })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let page = parse_list_objects_response(&resp.text().await?)?;
            pages += 1;

            let matched: Vec<(ObjectEntry, String)> = page
                .contents
                .into_iter()
                .filter(|obj| window.contains(obj.last_modified))
                .filter_map(|obj| {
                    let relative = obj
                        .key
                        .strip_prefix(self.config.prefix.as_str())
                        .unwrap_or(&obj.key);
                    let id = object_identifier(relative, &self.config.suffix)?;
                    Some((obj, id))
                })
                .collect();

            let fetched: Vec<Option<CandidateRecord>> = stream::iter(matched)
                .map(|(obj, identifier)| async move {
                    match self.get_object(&obj.key).await {
                        Ok(content) => Some(CandidateRecord {
                            identifier,
                            source_location: format!("s3://{}/{}", self.config.bucket, obj.key),
                            last_modified: obj.last_modified,
                            content,
                        }),
                        Err(e) => {
                            warn!(key = %obj.key, error = %e, "skipping object that failed to download");
                            None
                        }
                    }
                })
                .buffer_unordered(self.config.fetch_concurrency.max(1))
                .collect()
                .await;
            records.extend(fetched.into_iter().flatten());

            match (page.is_truncated, page.next_continuation_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        debug!(prefix, pages, matched = records.len(), "partition listed");
        Ok(records)
    }

    async fn get_object(&self, key: &str) -> Result<String> {
        let (_, bucket_path) = self.base();
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let path = format!("{}/{}", bucket_path, encoded_key);

        let resp = self
            .signed_get(&path, &[])
            .await
            .map_err(|e| anyhow!("Failed to get s3://{}/{}: {}", self.config.bucket, key, e))?;

        if !resp.status().is_success() {
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }

        let bytes = resp.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .with_context(|| format!("Object '{}' is not valid UTF-8", key))
    }

    /// Issue a SigV4-signed GET. `path` is the already-encoded canonical URI.
    async fn signed_get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let host = self.host();
        let (base_url, _) = self.base();

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut sorted_params = query.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(b"");

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.creds.session_token {
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
            "GET\n{}\n{}\n{}\n{}\n{}",
            path, canonical_querystring, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!(
            "{}/{}/s3/aws4_request",
            date_stamp, self.config.region
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        )?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let url = if canonical_querystring.is_empty() {
            format!("{}{}", base_url, path)
        } else {
            format!("{}{}?{}", base_url, path, canonical_querystring)
        };

        let mut req = self
            .client
            .get(&url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(token) = &self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        Ok(req.send().await?)
    }
}

#[async_trait]
impl RecordSource for S3Source {
    fn label(&self) -> String {
        format!("s3:{}", self.config.bucket)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    async fn enumerate(&self, window: Option<&TimeWindow>) -> Result<Vec<CandidateRecord>> {
        let window = window.ok_or_else(|| anyhow!("S3 listing requires a time window"))?;

        let mut records = Vec::new();
        for day in window.days() {
            let prefix = self.partition_prefix(day);
            let found = self.sync_partition(&prefix, window).await?;
            records.extend(found);
        }

        info!(
            bucket = %self.config.bucket,
            start = %window.start,
            end = %window.end,
            count = records.len(),
            "S3 enumeration complete"
        );
        Ok(records)
    }
}

// ============ ListObjectsV2 response ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ObjectEntry>,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectEntry {
    key: String,
    last_modified: DateTime<Utc>,
}

fn parse_list_objects_response(xml: &str) -> Result<ListBucketResult> {
    quick_xml::de::from_str(xml).context("Malformed ListObjectsV2 response")
}

// ============ AWS SigV4 helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|_| anyhow!("invalid HMAC key length"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~` as is.
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
