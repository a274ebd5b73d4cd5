use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::Client;
use url::Url;

use super::transport::{ProgressSink, Transport, TransportResponse};
use crate::error::ResponseError;

/// Upper bound on the buffer reserved up front from `Content-Length`: 8MB
const MAX_PREALLOCATION: u64 = 8 * 1024 * 1024;

/// HTTP(S) implementation of [`Transport`] backed by `reqwest`.
///
/// The body is streamed chunk by chunk so progress can be reported while it
/// downloads. Bodies of non-2xx responses are not read.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn transport_error(url: &Url, error: reqwest::Error) -> ResponseError {
    ResponseError::Transport {
        url: url.to_string(),
        message: error.to_string(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &Url,
        progress: &ProgressSink,
    ) -> Result<TransportResponse, ResponseError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Ok(TransportResponse {
                status: status.as_u16(),
                data: Default::default(),
            });
        }

        let total = response.content_length();
        // Content-Length is untrusted; larger bodies grow the buffer as they arrive
        let capacity = total.map_or(0, |total| total.min(MAX_PREALLOCATION) as usize);
        let mut data = BytesMut::with_capacity(capacity);
        while let Some(chunk) = response.chunk().await.map_err(|e| transport_error(url, e))? {
            data.extend_from_slice(&chunk);
            progress(data.len() as u64, total);
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            data: data.freeze(),
        })
    }
}
