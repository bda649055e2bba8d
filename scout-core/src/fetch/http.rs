//! Generic JSON-over-HTTP fetcher.
//!
//! The URL is a template with `{name}` placeholders filled from the request
//! parameters (`{operation}` is the request's operation). Substituted values
//! are percent-encoded, so `&`, `?` or `/` inside a value cannot change the
//! shape of the URL. The response must
//! be a JSON array of flat records, optionally nested inside the document at
//! a JSON pointer such as `/data/matches`.

use polars::prelude::*;
use serde_json::Value;
use std::io::Cursor;
use std::time::Duration;

use super::{FetchError, Fetcher, SourceId};
use crate::cache::{Request, RequestKey};
use crate::ratelimit::RateLimit;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("scout/", env!("CARGO_PKG_VERSION"));

pub struct HttpFetcher {
    source: SourceId,
    url_template: String,
    records_at: Option<String>,
    rate_limit: Option<RateLimit>,
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(
        source: impl Into<SourceId>,
        url_template: impl Into<String>,
    ) -> Result<Self, FetchError> {
        Self::with_timeout(source, url_template, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        source: impl Into<SourceId>,
        url_template: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            source: source.into(),
            url_template: url_template.into(),
            records_at: None,
            rate_limit: None,
            client,
        })
    }

    /// Read records from this JSON pointer instead of the document root.
    pub fn with_records_at(mut self, pointer: impl Into<String>) -> Self {
        self.records_at = Some(pointer.into());
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// Fill the URL template from `request`.
    pub fn url_for(&self, request: &Request) -> Result<String, FetchError> {
        let mut url = String::with_capacity(self.url_template.len());
        let mut rest = self.url_template.as_str();

        while let Some(open) = rest.find('{') {
            url.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                FetchError::Other(format!("unclosed placeholder in '{}'", self.url_template))
            })?;
            let name = &after[..close];
            let value = if name == "operation" {
                request.operation().to_string()
            } else {
                request.get_str(name).ok_or_else(|| {
                    FetchError::Other(format!(
                        "request {request} has no '{name}' for {}",
                        self.url_template
                    ))
                })?
            };
            url.push_str(&urlencoding::encode(&value));
            rest = &after[close + 1..];
        }
        url.push_str(rest);
        Ok(url)
    }
}

impl Fetcher for HttpFetcher {
    fn source(&self) -> SourceId {
        self.source.clone()
    }

    fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limit
    }

    fn fetch(&self, request: &Request) -> Result<DataFrame, FetchError> {
        let url = self.url_for(request)?;
        let resp = self.client.get(&url).send().map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url,
            });
        }

        let body: Value = resp.json().map_err(|e| {
            if e.is_timeout() || e.is_body() {
                classify(e)
            } else {
                FetchError::Parse(format!("{url}: {e}"))
            }
        })?;
        let records = match &self.records_at {
            Some(pointer) => body
                .pointer(pointer)
                .ok_or_else(|| FetchError::Parse(format!("{url}: nothing at '{pointer}'")))?,
            None => &body,
        };
        records_to_frame(records)
    }
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_connect() || e.is_timeout() || e.is_body() {
        FetchError::Transient(e.to_string())
    } else {
        FetchError::Other(e.to_string())
    }
}

/// Decode a JSON array of records into a table.
pub fn records_to_frame(records: &Value) -> Result<DataFrame, FetchError> {
    let Value::Array(rows) = records else {
        return Err(FetchError::Parse(format!(
            "expected an array of records, found {}",
            json_kind(records)
        )));
    };
    if rows.is_empty() {
        return Ok(DataFrame::empty());
    }
    if let Some(bad) = rows.iter().find(|row| !row.is_object()) {
        return Err(FetchError::Parse(format!(
            "expected record objects, found {}",
            json_kind(bad)
        )));
    }

    let bytes = serde_json::to_vec(records).map_err(|e| FetchError::Parse(e.to_string()))?;
    JsonReader::new(Cursor::new(bytes))
        .finish()
        .map_err(|e| FetchError::Parse(e.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
