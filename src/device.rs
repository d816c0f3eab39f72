use common::{AckPayload, StatusPayload};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("device unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("device returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// JSON `error` field on an otherwise successful response.
    #[error("{0}")]
    Device(String),
}

/// The device status channel: one GET for status plus JSON/plain POSTs
/// for commands and upload traffic. The trait exists so the session and
/// poller can be driven against an in-memory device in tests.
#[allow(async_fn_in_trait)]
pub trait DeviceChannel {
    async fn get_status(&self) -> Result<StatusPayload, ChannelError>;

    /// JSON command with no body; `query` pairs are appended to the URL.
    async fn post_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<AckPayload, ChannelError>;

    /// `text/plain` POST carrying the raw manifest or a base64 chunk.
    async fn post_plain(&self, path: &str, body: String) -> Result<AckPayload, ChannelError>;
}

#[derive(Clone)]
pub struct HttpDeviceChannel {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDeviceChannel {
    pub fn new(base_url: &str) -> Self {
        HttpDeviceChannel {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A non-success status, or a JSON `error` field on any status, is a
    /// protocol failure. Bodies that fail to parse as JSON are tolerated;
    /// the HTTP status alone decides then.
    async fn read_ack(response: reqwest::Response) -> Result<AckPayload, ChannelError> {
        let status = response.status();
        let text = response.text().await?;
        let ack: Option<AckPayload> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let message = ack
                .and_then(|ack| ack.error)
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                });
            return Err(ChannelError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let ack = ack.unwrap_or_default();
        if let Some(error) = &ack.error {
            return Err(ChannelError::Device(error.clone()));
        }
        Ok(ack)
    }
}

impl DeviceChannel for HttpDeviceChannel {
    async fn get_status(&self) -> Result<StatusPayload, ChannelError> {
        let response = self
            .client
            .get(self.url(common::endpoints::STATUS))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Http {
                status: status.as_u16(),
                message: format!("HTTP {}", status.as_u16()),
            });
        }
        Ok(response.json::<StatusPayload>().await?)
    }

    async fn post_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<AckPayload, ChannelError> {
        let response = self
            .client
            .post(self.url(path))
            .query(query)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;
        Self::read_ack(response).await
    }

    async fn post_plain(&self, path: &str, body: String) -> Result<AckPayload, ChannelError> {
        let response = self
            .client
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;
        Self::read_ack(response).await
    }
}
