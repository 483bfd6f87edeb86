use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;

use super::ApiError;

/// A pending call: everything needed to send it again, plus whether it
/// has already been replayed once after a 401.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    retried: bool,
}

impl RequestEnvelope {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Attach a JSON body and the matching content type
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to encode body: {}", e)))?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(bytes);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// Flip the retry marker. Returns false if it was already set, in
    /// which case the request must not be replayed again.
    pub fn mark_retried(&mut self) -> bool {
        if self.retried {
            return false;
        }
        self.retried = true;
        true
    }

    /// Set or remove the bearer `Authorization` header.
    pub fn set_bearer(&mut self, token: Option<&str>) -> Result<(), ApiError> {
        match token {
            Some(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| ApiError::InvalidRequest("access token is not a valid header value".into()))?;
                value.set_sensitive(true);
                self.headers.insert(header::AUTHORIZATION, value);
            }
            None => {
                self.headers.remove(header::AUTHORIZATION);
            }
        }
        Ok(())
    }

    pub(crate) fn to_request(&self, client: &Client) -> RequestBuilder {
        let request = client
            .request(self.method.clone(), self.url.as_str())
            .headers(self.headers.clone());
        match &self.body {
            Some(body) => request.body(body.clone()),
            None => request,
        }
    }
}
