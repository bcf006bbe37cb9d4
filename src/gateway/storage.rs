//! S3-compatible object storage (Yandex Object Storage by default).
//!
//! Requests are signed with AWS Signature Version 4. Objects are addressed
//! path-style: `<endpoint>/<bucket>/<key>`, and that URL is the audio
//! reference handed to the recognizer.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode, Url};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::ObjectStore;
use crate::config::StorageConfig;
use crate::error::{BotError, GatewayError};
use crate::job::{AudioPayload, AudioReference};

const SERVICE: &str = "s3";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

pub struct S3Store {
    client: Client,
    endpoint: String,
    region: String,
    bucket: String,
    access_key_id: String,
    secret_access_key: String,
}

/// Headers produced by signing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Signature {
    amz_date: String,
    payload_hash: String,
    authorization: String,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Result<Self, BotError> {
        if config.bucket.is_empty() {
            return Err(BotError::MissingCredentials("storage bucket (BUCKET_NAME)"));
        }
        if config.access_key_id.is_empty() || config.secret_access_key.is_empty() {
            return Err(BotError::MissingCredentials(
                "storage keys (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)",
            ));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            region: config.region.clone(),
            bucket: config.bucket.clone(),
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
        })
    }

    /// Path-style object URL with every key segment percent-encoded.
    pub fn object_url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}/{}", self.endpoint, self.bucket, encoded.join("/"))
    }

    fn owns(&self, reference: &AudioReference) -> bool {
        reference
            .0
            .starts_with(&format!("{}/{}/", self.endpoint, self.bucket))
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<StatusCode, GatewayError> {
        let parsed = Url::parse(url)
            .map_err(|e| GatewayError::Permanent(format!("invalid object url {url}: {e}")))?;
        let signature = self.sign(method.as_str(), &parsed, &body, Utc::now())?;

        let mut request = self
            .client
            .request(method, parsed)
            .header("x-amz-date", &signature.amz_date)
            .header("x-amz-content-sha256", &signature.payload_hash)
            .header("authorization", &signature.authorization);
        if let Some(content_type) = content_type {
            request = request.header("content-type", content_type);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(GatewayError::from_status(status.as_u16(), &text))
    }

    fn sign(
        &self,
        method: &str,
        url: &Url,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Signature, GatewayError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(body));

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(GatewayError::Permanent(format!("object url has no host: {url}"))),
        };
        let canonical_request = format!(
            "{method}\n{path}\n{query}\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload_hash}",
            path = url.path(),
            query = url.query().unwrap_or(""),
        );

        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key = signing_key(&self.secret_access_key, &date, &self.region, SERVICE)?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(Signature {
            authorization: format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
                self.access_key_id
            ),
            amz_date,
            payload_hash,
        })
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| GatewayError::Permanent(format!("signing key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, GatewayError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, payload: &AudioPayload) -> Result<AudioReference, GatewayError> {
        let url = self.object_url(key);
        let content_type = payload
            .mime_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let status = self
            .send(Method::PUT, &url, payload.bytes.clone(), Some(content_type))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(GatewayError::Permanent(format!("bucket {} not found", self.bucket)));
        }
        debug!(%url, bytes = payload.len(), "object stored");
        Ok(AudioReference(url))
    }

    async fn delete(&self, reference: &AudioReference) -> Result<(), GatewayError> {
        if !self.owns(reference) {
            return Err(GatewayError::Permanent(format!(
                "reference {} is outside bucket {}",
                reference.0, self.bucket
            )));
        }
        self.send(Method::DELETE, &reference.0, Bytes::new(), None)
            .await?;
        Ok(())
    }
}
