//! Network abstraction used by the cache worker and the write queue.
//!
//! All network access in the core goes through the [`Fetch`] trait so that
//! the router, the precacher and the queue drain can run against fakes in
//! tests. [`HttpFetcher`] is the real reqwest-backed implementation.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// HTTP method of a request or queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

/// An outgoing request as seen by the router and the fetchers.
#[derive(Debug, Clone)]
pub struct Request {
  pub url: Url,
  pub method: Method,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET request with no headers.
  pub fn get(url: Url) -> Self {
    Self {
      url,
      method: Method::Get,
      headers: Vec::new(),
      body: None,
    }
  }

  /// A navigation-style GET request (`Accept: text/html`).
  pub fn navigate(url: Url) -> Self {
    Self {
      url,
      method: Method::Get,
      headers: vec![("accept".to_string(), "text/html".to_string())],
      body: None,
    }
  }

  /// Look up a header value, case-insensitive on the name.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response as stored in the cache and returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  /// 2xx status.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Abstraction over the network.
///
/// The future is boxed so the trait stays object-safe; strategies hold an
/// `Arc<dyn Fetch>` and spawn background revalidation tasks with it.
pub trait Fetch: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>>;
}

/// Reqwest-backed fetcher talking to the remote akkord API and asset host.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  bearer_token: Option<String>,
}

impl HttpFetcher {
  pub fn new(bearer_token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      bearer_token,
    })
  }
}

impl Fetch for HttpFetcher {
  fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
    let client = self.client.clone();
    let token = self.bearer_token.clone();

    Box::pin(async move {
      let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
      };

      let mut builder = client.request(method, request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(token) = &token {
        builder = builder.bearer_auth(token);
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_method_roundtrip() {
    for (s, m) in [
      ("get", Method::Get),
      ("POST", Method::Post),
      ("Put", Method::Put),
      ("patch", Method::Patch),
      ("DELETE", Method::Delete),
    ] {
      assert_eq!(s.parse::<Method>().unwrap(), m);
    }
    assert!("TRACE".parse::<Method>().is_err());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let url = Url::parse("https://akkord.test/").unwrap();
    let req = Request::navigate(url);
    assert_eq!(req.header("Accept"), Some("text/html"));
    assert_eq!(req.header("ACCEPT"), Some("text/html"));
    assert_eq!(req.header("content-type"), None);
  }

  #[test]
  fn test_response_ok_range() {
    let resp = |status| Response {
      status,
      headers: Vec::new(),
      body: Vec::new(),
    };
    assert!(resp(200).ok());
    assert!(resp(204).ok());
    assert!(!resp(199).ok());
    assert!(!resp(301).ok());
    assert!(!resp(500).ok());
  }
}
