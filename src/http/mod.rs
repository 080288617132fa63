//! Cookie-jar-backed HTTP session.
//!
//! One `Session` is owned by exactly one flow run. Redirects are never
//! followed by the transport client; the session follows them itself, one
//! bounded hop at a time, merging `Set-Cookie` headers into the jar on every
//! hop so the verifier can observe the whole chain.

pub mod cookies;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use reqwest::{Method, Url};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::FlowError;
use cookies::CookieJar;

/// Transport configuration for one run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Accept self-signed certificates (the target fleet uses them)
    pub insecure: bool,
    /// Per-request timeout
    pub timeout: Duration,
    /// Redirect hop bound for follow mode
    pub max_redirects: usize,
    /// Echo request/response traces to the log
    pub verbose: bool,
    /// Directory for captured wire traces, when artifact capture is on
    pub trace_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            insecure: true,
            timeout: Duration::from_secs(15),
            max_redirects: 10,
            verbose: false,
            trace_dir: None,
        }
    }
}

/// One hop of a redirect chain.
#[derive(Debug, Clone)]
pub struct Hop {
    pub url: String,
    pub status: u16,
    pub location: Option<String>,
}

/// Response as seen by a step executor: the final hop plus the chain that
/// led to it.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub location: Option<String>,
    pub body: String,
    pub chain: Vec<Hop>,
}

impl HttpResponse {
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

/// Persistent HTTP session for one flow run.
pub struct Session {
    client: reqwest::Client,
    pub jar: CookieJar,
    config: SessionConfig,
    trace_seq: u32,
    trace_label: String,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .context("Failed to build HTTP client")?;

        if let Some(ref dir) = config.trace_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create trace dir {}", dir.display()))?;
        }

        Ok(Self {
            client,
            jar: CookieJar::new(),
            config,
            trace_seq: 0,
            trace_label: String::new(),
        })
    }

    /// Name the traces of the requests that follow after the current step.
    pub fn begin_step(&mut self, label: &str) {
        self.trace_seq += 1;
        self.trace_label = label.to_string();
    }

    /// Redirect hop bound shared with callers that walk chains themselves.
    pub fn max_redirects(&self) -> usize {
        self.config.max_redirects
    }

    /// GET without following redirects: exactly one hop.
    pub async fn get(&mut self, url: &str) -> Result<HttpResponse, FlowError> {
        self.request(Method::GET, url, None, false).await
    }

    /// GET following redirects up to the configured hop bound.
    pub async fn get_following(&mut self, url: &str) -> Result<HttpResponse, FlowError> {
        self.request(Method::GET, url, None, true).await
    }

    /// POST a JSON body without following redirects.
    pub async fn post_json(
        &mut self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, FlowError> {
        self.request(Method::POST, url, Some(body.clone()), false)
            .await
    }

    /// Drive one request, optionally chasing the redirect chain. Every hop
    /// merges `Set-Cookie` into the jar; only jar cookies matching the hop
    /// URL are sent.
    pub async fn request(
        &mut self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
        follow: bool,
    ) -> Result<HttpResponse, FlowError> {
        let mut current =
            Url::parse(url).map_err(|e| FlowError::Protocol(format!("invalid URL {}: {}", url, e)))?;
        let mut current_method = method;
        let mut current_body = body;
        let mut chain: Vec<Hop> = Vec::new();

        loop {
            let (status, location, response_body) = self
                .execute_once(current_method.clone(), &current, current_body.as_ref())
                .await?;

            chain.push(Hop {
                url: current.to_string(),
                status,
                location: location.clone(),
            });

            let redirected = matches!(status, 301 | 302 | 303 | 307 | 308);
            if !follow || !redirected {
                return Ok(HttpResponse {
                    status,
                    url: current.to_string(),
                    location,
                    body: response_body,
                    chain,
                });
            }

            let target = location.as_deref().ok_or_else(|| {
                FlowError::Protocol(format!("status {} without a Location header", status))
            })?;
            // Hop bound guarantees termination against a redirect loop
            if chain.len() > self.config.max_redirects {
                return Err(FlowError::Protocol(format!(
                    "redirect budget of {} hops exhausted at {}",
                    self.config.max_redirects, current
                )));
            }
            current = current
                .join(target)
                .map_err(|e| FlowError::Protocol(format!("invalid Location {}: {}", target, e)))?;
            // Redirected hops degrade to GET (we never replay a POST body)
            current_method = Method::GET;
            current_body = None;
        }
    }

    async fn execute_once(
        &mut self,
        method: Method,
        url: &Url,
        body: Option<&serde_json::Value>,
    ) -> Result<(u16, Option<String>, String), FlowError> {
        let mut req = self.client.request(method.clone(), url.clone());

        let cookie_header = self.jar.header_for(url);
        if let Some(ref header) = cookie_header {
            req = req.header(COOKIE, header.as_str());
        }
        if let Some(json) = body {
            req = req.header(CONTENT_TYPE, "application/json").json(json);
        }

        if self.config.verbose {
            log::debug!("> {} {}", method, url);
            if let Some(ref h) = cookie_header {
                log::debug!("> Cookie: {}", redact_cookie_header(h));
            }
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let set_cookies: Vec<String> = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .collect();
        let response_headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();
        let response_body = resp.text().await.unwrap_or_default();

        self.jar
            .store_response_cookies(set_cookies.iter().map(|s| s.as_str()), url);

        if self.config.verbose {
            log::debug!("< {} {}", status, url);
            if let Some(ref l) = location {
                log::debug!("< Location: {}", l);
            }
        }

        self.write_trace(
            &method,
            url,
            cookie_header.as_deref(),
            body,
            status,
            &response_headers,
            &response_body,
        );

        Ok((status, location, response_body))
    }

    #[allow(clippy::too_many_arguments)]
    fn write_trace(
        &self,
        method: &Method,
        url: &Url,
        cookie_header: Option<&str>,
        body: Option<&serde_json::Value>,
        status: u16,
        response_headers: &[(String, String)],
        response_body: &str,
    ) {
        let Some(ref dir) = self.config.trace_dir else {
            return;
        };
        let path = dir.join(format!("{:02}-{}.txt", self.trace_seq, self.trace_label));
        let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) else {
            log::warn!("Failed to open trace file {}", path.display());
            return;
        };

        let mut out = format!("> {} {}\n", method, url);
        if let Some(header) = cookie_header {
            out.push_str(&format!("> Cookie: {}\n", redact_cookie_header(header)));
        }
        if let Some(json) = body {
            out.push_str(&format!("> {}\n", redact_body(&json.to_string())));
        }
        out.push_str(&format!("< HTTP {}\n", status));
        for (name, value) in response_headers {
            let value = if name.eq_ignore_ascii_case("set-cookie") {
                redact_cookie_header(value)
            } else {
                value.clone()
            };
            out.push_str(&format!("< {}: {}\n", name, value));
        }
        out.push_str(response_body);
        out.push_str("\n\n");
        let _ = file.write_all(out.as_bytes());
    }
}

/// Keep cookie names visible in traces, never their values.
fn redact_cookie_header(header: &str) -> String {
    header
        .split(';')
        .map(|part| {
            let part = part.trim();
            match part.find('=') {
                Some(i) => format!("{}=<redacted>", &part[..i]),
                None => part.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Strip credential values from a captured JSON body.
fn redact_body(body: &str) -> String {
    let re = Regex::new(r#""password"\s*:\s*"[^"]*""#).unwrap();
    re.replace_all(body, r#""password":"<redacted>""#).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_cookie_header() {
        let redacted = redact_cookie_header("authelia_session=secret; Path=/; HttpOnly");
        assert!(redacted.contains("authelia_session=<redacted>"));
        assert!(redacted.contains("Path=<redacted>"));
        assert!(!redacted.contains("secret"));
    }

    #[test]
    fn test_redact_body_strips_password() {
        let body = r#"{"username":"admin","password":"secret123","keepMeLoggedIn":true}"#;
        let redacted = redact_body(body);
        assert!(!redacted.contains("secret123"));
        assert!(redacted.contains(r#""password":"<redacted>""#));
        assert!(redacted.contains("admin"));
    }

    #[test]
    fn test_session_builds_with_defaults() {
        let session = Session::new(SessionConfig::default()).unwrap();
        assert!(session.jar.is_empty());
    }

    #[tokio::test]
    async fn test_redirect_loop_exhausts_hop_budget() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let resp = "HTTP/1.1 302 Found\r\nLocation: /loop\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
                    let _ = socket.write_all(resp.as_bytes()).await;
                });
            }
        });

        let mut session = Session::new(SessionConfig {
            insecure: false,
            timeout: Duration::from_secs(5),
            max_redirects: 3,
            verbose: false,
            trace_dir: None,
        })
        .unwrap();

        let err = session
            .get_following(&format!("http://{}/", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Protocol(_)));
        assert!(err.to_string().contains("redirect budget"));
    }
}
