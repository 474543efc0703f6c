//! HTTP transport module
//!
//! Every provider call goes through the `HttpTransport` trait rather than a
//! raw client, so adapters and the polling engine can be exercised against
//! a scripted transport in tests. The production implementation wraps
//! `reqwest` with the configured timeout and user agent.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::HttpConfig;
use crate::error::HttpError;

/// A provider-bound HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a JSON body and the matching content type
    pub fn json<T: serde::Serialize>(mut self, body: &T) -> Result<Self, HttpError> {
        let encoded = serde_json::to_string(body).map_err(|e| HttpError::Encode(e.to_string()))?;
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        self.body = Some(encoded);
        Ok(self)
    }

    /// Look up a header value (case-insensitive name match)
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status code plus raw body of a provider response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(&self) -> bool {
        self.status < 300
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::Decode(e.to_string()))
    }
}

/// Transport seam shared by all provider adapters
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Production transport backed by a shared reqwest client
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout_ms: u64,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| HttpError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            timeout_ms: config.timeout_secs * 1000,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = reqwest::Method::from_str(&request.method)
            .map_err(|_| HttpError::RequestFailed(format!("invalid method {}", request.method)))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &request.headers {
            let name =
                HeaderName::from_str(key).map_err(|_| HttpError::InvalidHeader(key.clone()))?;
            let val =
                HeaderValue::from_str(value).map_err(|_| HttpError::InvalidHeader(key.clone()))?;
            headers.insert(name, val);
        }

        let url = request.url;
        let mut builder = self.client.request(method, &url).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout(self.timeout_ms)
            } else if e.is_builder() {
                HttpError::InvalidUrl(url.clone())
            } else {
                HttpError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::RequestFailed(e.to_string()))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport shared by adapter and engine tests

    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync>;

    /// Replays queued responses in order; falls back to a responder
    /// function when the queue runs dry. Records every request it sees.
    pub struct StaticTransport {
        queue: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
        fallback: Option<Responder>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl StaticTransport {
        pub fn new() -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                fallback: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn with_fn<F>(f: F) -> Self
        where
            F: Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync + 'static,
        {
            Self {
                queue: Mutex::new(VecDeque::new()),
                fallback: Some(Box::new(f)),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn push_json(&self, status: u16, body: serde_json::Value) {
            self.queue.lock().push_back(Ok(HttpResponse {
                status,
                body: body.to_string().into_bytes(),
            }));
        }

        pub fn push_raw(&self, status: u16, body: &[u8]) {
            self.queue.lock().push_back(Ok(HttpResponse {
                status,
                body: body.to_vec(),
            }));
        }

        pub fn push_err(&self, err: HttpError) {
            self.queue.lock().push_back(Err(err));
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.seen.lock().clone()
        }

        pub fn request_count(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl HttpTransport for StaticTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            self.seen.lock().push(request.clone());

            if let Some(scripted) = self.queue.lock().pop_front() {
                return scripted;
            }
            if let Some(f) = &self.fallback {
                return f(&request);
            }
            Err(HttpError::RequestFailed(
                "no scripted response left".to_string(),
            ))
        }
    }
}
