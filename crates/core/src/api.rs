use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::Result;

pub type ApiFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, ApiError>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// 401/403: refresh the credential and repeat the step.
    Unauthorized,
    /// Worth another attempt after backoff.
    Transient,
    /// Retrying cannot help.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "http {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn unauthorized(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Transient,
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Permanent,
            status: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let kind = classify_status(status);
        Self {
            kind,
            status: Some(status),
            message: body.into(),
        }
    }
}

pub fn classify_status(status: u16) -> ApiErrorKind {
    match status {
        401 | 403 => ApiErrorKind::Unauthorized,
        408 | 429 => ApiErrorKind::Transient,
        500..=599 => ApiErrorKind::Transient,
        _ => ApiErrorKind::Permanent,
    }
}

/// Server-assigned context for one in-progress asset upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub complete_uri: String,
    pub upload_token: String,
    pub upload_uris: Vec<String>,
    pub min_part_size: Option<u64>,
    pub max_part_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteUpload<'a> {
    pub session: &'a UploadSession,
    pub file_name: &'a str,
    pub mime_type: &'a str,
    pub title: &'a str,
    pub description: String,
    pub tags: String,
}

/// The remote asset repository, one method per protocol call.
///
/// Implementations hold no per-task state and are shared by all workers.
pub trait AssetApi: Send + Sync {
    /// Create-if-absent; "already exists" is success.
    fn ensure_folder<'a>(&'a self, token: &'a str, folder: &'a str) -> ApiFuture<'a, ()>;

    fn initiate_upload<'a>(
        &'a self,
        token: &'a str,
        folder: &'a str,
        file_name: &'a str,
        file_size: u64,
    ) -> ApiFuture<'a, UploadSession>;

    fn upload_part<'a>(&'a self, token: &'a str, uri: &'a str, bytes: Vec<u8>)
    -> ApiFuture<'a, ()>;

    fn complete_upload<'a>(
        &'a self,
        token: &'a str,
        request: CompleteUpload<'a>,
    ) -> ApiFuture<'a, ()>;
}

/// Splits `len` bytes across at most `uri_count` parts.
///
/// Every part but the last has the same size, at least `min_part_size`. A
/// required part size above `max_part_size` is a permanent failure.
pub fn plan_parts(
    len: u64,
    uri_count: usize,
    min_part_size: Option<u64>,
    max_part_size: Option<u64>,
) -> std::result::Result<Vec<Range<u64>>, ApiError> {
    if uri_count == 0 {
        return Err(ApiError::permanent("upload session has no upload URIs"));
    }
    if len == 0 {
        return Ok(vec![0..0]);
    }

    let even = len.div_ceil(uri_count as u64);
    let part_size = even.max(min_part_size.unwrap_or(1)).min(len);
    if let Some(max) = max_part_size
        && part_size > max
    {
        return Err(ApiError::permanent(format!(
            "payload of {len} bytes needs parts of {part_size} bytes; server allows at most {max} across {uri_count} URIs"
        )));
    }

    let mut parts = Vec::new();
    let mut start = 0;
    while start < len {
        let end = (start + part_size).min(len);
        parts.push(start..end);
        start = end;
    }
    Ok(parts)
}

#[derive(Debug, Clone)]
pub struct AemHttpApiConfig {
    pub host: String,
    pub request_timeout: Duration,
}

/// AEM as a Cloud Service direct binary upload over HTTP.
pub struct AemHttpApi {
    config: AemHttpApiConfig,
    client: reqwest::Client,
}

impl AemHttpApi {
    pub fn new(config: AemHttpApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{}", self.config.host, path)
    }

}

/// Scheme, host and port of `uri` match those of `base`.
fn same_origin(base: &str, uri: &str) -> bool {
    match (reqwest::Url::parse(base), reqwest::Url::parse(uri)) {
        (Ok(base), Ok(uri)) => base.origin() == uri.origin(),
        _ => false,
    }
}

impl AssetApi for AemHttpApi {
    fn ensure_folder<'a>(&'a self, token: &'a str, folder: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let res = self
                .client
                .get(self.url(&format!("{folder}.json")))
                .bearer_auth(token)
                .send()
                .await
                .map_err(transport_error)?;
            let status = res.status();
            if status == StatusCode::OK {
                return Ok(());
            }
            if matches!(status.as_u16(), 401 | 403) {
                return Err(error_from_response(res).await);
            }

            let res = self
                .client
                .post(self.url(folder))
                .bearer_auth(token)
                .form(&[
                    ("jcr:primaryType", "sling:Folder"),
                    ("class", "sling:Folder"),
                ])
                .send()
                .await
                .map_err(transport_error)?;
            match res.status().as_u16() {
                200 | 201 | 409 => Ok(()),
                _ => Err(error_from_response(res).await),
            }
        })
    }

    fn initiate_upload<'a>(
        &'a self,
        token: &'a str,
        folder: &'a str,
        file_name: &'a str,
        file_size: u64,
    ) -> ApiFuture<'a, UploadSession> {
        Box::pin(async move {
            let size = file_size.to_string();
            let res = self
                .client
                .post(self.url(&format!("{folder}.initiateUpload.json")))
                .bearer_auth(token)
                .form(&[("fileName", file_name), ("fileSize", size.as_str())])
                .send()
                .await
                .map_err(transport_error)?;
            if !res.status().is_success() {
                return Err(error_from_response(res).await);
            }

            let body = res.text().await.map_err(transport_error)?;
            parse_initiate_response(&body)
        })
    }

    fn upload_part<'a>(
        &'a self,
        token: &'a str,
        uri: &'a str,
        bytes: Vec<u8>,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let mut req = self.client.put(uri).body(bytes);
            if same_origin(&self.config.host, uri) {
                req = req.bearer_auth(token);
            }
            let res = req.send().await.map_err(transport_error)?;
            if !res.status().is_success() {
                return Err(error_from_response(res).await);
            }
            Ok(())
        })
    }

    fn complete_upload<'a>(
        &'a self,
        token: &'a str,
        request: CompleteUpload<'a>,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let res = self
                .client
                .post(self.url(&request.session.complete_uri))
                .bearer_auth(token)
                .form(&[
                    ("uploadToken", request.session.upload_token.as_str()),
                    ("fileName", request.file_name),
                    ("mimeType", request.mime_type),
                    ("jcr:title", request.title),
                    ("jcr:description", request.description.as_str()),
                    ("jcr:tags", request.tags.as_str()),
                ])
                .send()
                .await
                .map_err(transport_error)?;
            if !res.status().is_success() {
                return Err(error_from_response(res).await);
            }
            Ok(())
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateResponse {
    #[serde(rename = "completeURI")]
    complete_uri: Option<String>,
    #[serde(default)]
    files: Vec<InitiateFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateFile {
    upload_token: Option<String>,
    #[serde(rename = "uploadURIs", default)]
    upload_uris: Vec<String>,
    min_part_size: Option<u64>,
    max_part_size: Option<u64>,
}

pub(crate) fn parse_initiate_response(body: &str) -> std::result::Result<UploadSession, ApiError> {
    let parsed: InitiateResponse = serde_json::from_str(body)
        .map_err(|e| ApiError::transient(format!("initiate: invalid json: {e}")))?;

    let complete_uri = parsed
        .complete_uri
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::permanent("initiate: response missing completeURI"))?;
    let file = parsed
        .files
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::permanent("initiate: response has no files"))?;
    let upload_token = file
        .upload_token
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::permanent("initiate: response missing uploadToken"))?;
    if file.upload_uris.is_empty() {
        return Err(ApiError::permanent("initiate: response has no uploadURIs"));
    }

    Ok(UploadSession {
        complete_uri,
        upload_token,
        upload_uris: file.upload_uris,
        min_part_size: file.min_part_size,
        max_part_size: file.max_part_size,
    })
}

fn transport_error(e: reqwest::Error) -> ApiError {
    if e.is_builder() {
        return ApiError::permanent(format!("invalid request: {e}"));
    }
    ApiError::transient(format!("request failed: {e}"))
}

async fn error_from_response(res: reqwest::Response) -> ApiError {
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    let mut message: String = body.chars().take(512).collect();
    if message.trim().is_empty() {
        message = "empty response body".to_string();
    }
    ApiError::from_status(status, message)
}
