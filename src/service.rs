//! Line-oriented admission service.
//!
//! Each request line is `<key> [amount]`; `-` stands for the empty key and
//! the amount defaults to 1. Each reply is one JSON object per line.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::ratelimit::Limiter;

/// Placeholder for the empty key on the wire.
const EMPTY_KEY: &str = "-";

/// A parsed admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub key: String,
    pub amount: i64,
}

impl AdmissionRequest {
    /// Parse one request line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else {
            return Ok(None);
        };
        let amount = match fields.next() {
            Some(amount) => amount
                .parse::<i64>()
                .map_err(|_| format!("invalid amount '{}'", amount))?,
            None => 1,
        };
        if fields.next().is_some() {
            return Err("expected '<key> [amount]'".to_string());
        }

        let key = if key == EMPTY_KEY { "" } else { key };
        Ok(Some(Self {
            key: key.to_string(),
            amount,
        }))
    }
}

/// The reply written for each request line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AdmissionReply {
    Decision {
        key: String,
        amount: i64,
        allowed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        permanent: bool,
    },
    Error {
        error: String,
    },
}

/// Front end that feeds request lines to a shared [`Limiter`].
pub struct AdmissionService {
    limiter: Arc<Limiter>,
}

impl AdmissionService {
    pub fn new(limiter: Arc<Limiter>) -> Self {
        Self { limiter }
    }

    /// Decide a single request line. Blank lines produce no reply.
    #[instrument(level = "trace", skip(self))]
    pub fn handle_line(&self, line: &str) -> Option<AdmissionReply> {
        let request = match AdmissionRequest::parse(line) {
            Ok(Some(request)) => request,
            Ok(None) => return None,
            Err(error) => {
                warn!(line = %line, error = %error, "Received malformed admission request");
                return Some(AdmissionReply::Error { error });
            }
        };

        match self.limiter.check(request.amount, &request.key) {
            Ok(decision) => Some(AdmissionReply::Decision {
                key: request.key,
                amount: request.amount,
                allowed: decision.allowed(),
                retry_after_ms: decision
                    .retry_after()
                    .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
                permanent: decision.is_permanent(),
            }),
            Err(e) => {
                warn!(key = %request.key, error = %e, "Rate limit check failed");
                Some(AdmissionReply::Error {
                    error: e.to_string(),
                })
            }
        }
    }

    /// Answer request lines from `reader` until end of input.
    ///
    /// Returns the number of replies written.
    #[instrument(skip_all)]
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("Admission service accepting requests");

        let mut lines = reader.lines();
        let mut replies = 0u64;
        while let Some(line) = lines.next_line().await? {
            let Some(reply) = self.handle_line(&line) else {
                continue;
            };
            let mut encoded = serde_json::to_vec(&reply)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
            replies += 1;
        }

        debug!(replies = replies, "Admission input closed");
        Ok(replies)
    }
}
