//! Transport boundary: one GET with optional byte range, as a byte stream.

use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, HeaderMap, RANGE};
use reqwest::{Client, redirect};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::config::HttpConfig;
use crate::error::{DownloadError, Result};
use crate::model::ByteRange;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Upper bound on the buffer reserved from an announced `Content-Length`.
const MAX_PREALLOC: u64 = 1 << 20;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub range: Option<ByteRange>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }
}

pub struct FetchResponse {
    pub body: ByteStream,
    /// Length of this response body, when announced.
    pub content_length: Option<u64>,
    /// Full resource size taken from `Content-Range`, when present.
    pub total_length: Option<u64>,
    pub charset: Option<String>,
    /// URL after redirects.
    pub final_url: String,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("content_length", &self.content_length)
            .field("total_length", &self.total_length)
            .field("charset", &self.charset)
            .field("final_url", &self.final_url)
            .finish_non_exhaustive()
    }
}

/// Performs a single HTTP GET. Implementations follow redirects and fail on
/// non-success status codes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: FetchRequest, token: &CancellationToken)
    -> Result<FetchResponse>;
}

/// Fetch a whole body into memory. Used for keys and playlists.
pub async fn fetch_bytes(
    transport: &dyn Transport,
    request: FetchRequest,
    token: &CancellationToken,
) -> Result<(Bytes, String)> {
    let response = transport.fetch(request, token).await?;
    let final_url = response.final_url;
    let mut body = response.body;
    let capacity = response.content_length.unwrap_or(0).min(MAX_PREALLOC);
    let mut buffer = BytesMut::with_capacity(capacity as usize);
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(chunk) => buffer.extend_from_slice(&chunk?),
            None => break,
        }
    }
    Ok((buffer.freeze(), final_url))
}

/// Fetch a text document, returning its content and the URL it was served from.
pub async fn fetch_text(
    transport: &dyn Transport,
    url: &str,
    token: &CancellationToken,
) -> Result<(String, String)> {
    let (bytes, final_url) = fetch_bytes(transport, FetchRequest::get(url), token).await?;
    let text = String::from_utf8(bytes.to_vec())
        .map_err(|e| DownloadError::playlist(format!("{url} is not valid UTF-8: {e}")))?;
    Ok((text, final_url))
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        install_rustls_provider();

        let redirect_policy = if config.follow_redirects {
            redirect::Policy::limited(10)
        } else {
            redirect::Policy::none()
        };

        let mut builder = Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(config.headers.clone())
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .redirect(redirect_policy);

        if !config.timeout.is_zero() {
            builder = builder.timeout(config.timeout);
        }

        if let Some(proxy) = config.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| {
                DownloadError::configuration(format!("invalid proxy `{proxy}`: {e}"))
            })?;
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: FetchRequest,
        token: &CancellationToken,
    ) -> Result<FetchResponse> {
        let url = Url::parse(&request.url)
            .map_err(|e| DownloadError::invalid_url(&request.url, e.to_string()))?;

        let mut builder = self.client.get(url);
        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            response = builder.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, request.url, "fetch"));
        }

        let final_url = response.url().to_string();
        let headers = response.headers();
        let charset = parse_charset(headers);
        let total_length = parse_total_length(headers);
        let content_length = response.content_length();

        trace!(
            url = %final_url,
            status = %status,
            content_length = ?content_length,
            total_length = ?total_length,
            "Response received"
        );

        let body = response.bytes_stream().map_err(DownloadError::from).boxed();

        Ok(FetchResponse {
            body,
            content_length,
            total_length,
            charset,
            final_url,
        })
    }
}

fn parse_charset(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    content_type.split(';').find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        name.eq_ignore_ascii_case("charset")
            .then(|| value.trim_matches('"').to_owned())
    })
}

/// `Content-Range: bytes 0-0/12345` -> `12345`.
fn parse_total_length(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
