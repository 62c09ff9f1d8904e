// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP-like fetch over a multiplexed channel.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::error::{NetworkError, NetworkResult};
use super::resource::ResourceResponse;

/// Options for [`ChannelManager::fetch`](super::ChannelManager::fetch).
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Verb, `GET` by default.
    pub method: String,
    /// Header pairs. An `Authorization` header matching the stored
    /// credentials routes the request over the authenticated channel.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Option<Vec<u8>>,
    /// Response deadline.
    pub timeout: Option<Duration>,
    /// Cancels the request while it is in flight.
    pub cancel: Option<CancellationToken>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            cancel: None,
        }
    }
}

impl FetchOptions {
    /// Options for `method` with no headers or body.
    pub fn new(method: &str) -> Self {
        FetchOptions {
            method: method.to_string(),
            ..Default::default()
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Sets a binary body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets a UTF-8 text body.
    pub fn with_text(mut self, body: &str) -> Self {
        self.body = Some(body.as_bytes().to_vec());
        self
    }

    /// Sets the response deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a cancel token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Response to a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,
    /// Status text.
    pub status_text: String,
    /// Header pairs in wire order.
    pub headers: Vec<(String, String)>,
    /// Body bytes (empty when absent).
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub(crate) fn from_resource_response(response: ResourceResponse) -> NetworkResult<Self> {
        if response.is_connection_closed() {
            return Err(NetworkError::ConnectionClosed);
        }
        let status = u16::try_from(response.status).map_err(|_| {
            NetworkError::ProtocolViolation(format!("Invalid status {}", response.status))
        })?;
        let headers = response
            .headers
            .iter()
            .map(|line| parse_header(line))
            .collect::<NetworkResult<Vec<_>>>()?;

        Ok(FetchResponse {
            status,
            status_text: response.message,
            headers,
            body: response.body.unwrap_or_default(),
        })
    }

    /// Returns true for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header with `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Body parsed as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

fn parse_header(line: &str) -> NetworkResult<(String, String)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| NetworkError::InvalidHeader(line.to_string()))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

/// Path (with query) to request for `url`.
///
/// Absolute paths are used as-is; absolute URLs contribute their path and
/// query.
pub(crate) fn request_path(url: &str) -> NetworkResult<String> {
    if url.starts_with('/') {
        return Ok(url.to_string());
    }
    let parsed = url::Url::parse(url)?;
    Ok(match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_path_from_absolute_url() {
        assert_eq!(
            request_path("https://chat.example.com/v1/profile/abc?credentialType=x").unwrap(),
            "/v1/profile/abc?credentialType=x"
        );
        assert_eq!(request_path("/v1/config").unwrap(), "/v1/config");
        assert!(request_path("not a url").is_err());
    }

    #[test]
    fn test_headers_parsed_into_pairs() {
        let response = ResourceResponse {
            status: 200,
            message: "OK".into(),
            headers: vec!["Content-Type: application/json".into(), "X-Count:3".into()],
            body: Some(br#"{"a":1}"#.to_vec()),
        };
        let fetched = FetchResponse::from_resource_response(response).unwrap();
        assert_eq!(fetched.header("content-type"), Some("application/json"));
        assert_eq!(fetched.header("x-count"), Some("3"));
        let value: serde_json::Value = fetched.json().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_invalid_header_is_error() {
        let response = ResourceResponse {
            status: 200,
            message: "OK".into(),
            headers: vec!["no separator".into()],
            body: None,
        };
        assert!(matches!(
            FetchResponse::from_resource_response(response),
            Err(NetworkError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_closed_status_is_error() {
        let response = ResourceResponse {
            status: ResourceResponse::CLOSED_STATUS,
            message: "Connection closed".into(),
            headers: Vec::new(),
            body: None,
        };
        assert_eq!(
            FetchResponse::from_resource_response(response),
            Err(NetworkError::ConnectionClosed)
        );
    }
}
