//! Session cookie jar with RFC 6265 matching rules.
//!
//! The verifier needs to inspect the jar directly (which cookies the IdP
//! set, whether they cross subdomains, whether one of them is a JWT), so
//! cookies are stored in a plain typed structure instead of being hidden
//! inside the transport client.

use reqwest::Url;

/// A single cookie as stored in the jar.
#[derive(Debug, Clone, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Normalized domain, no leading dot
    pub domain: String,
    /// True when the Set-Cookie carried no Domain attribute; such a cookie
    /// only ever matches its exact origin host
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    /// Parse one `Set-Cookie` header value in the context of the request
    /// that carried it. Returns `None` for malformed headers.
    pub fn parse(header: &str, request_url: &Url) -> Option<Cookie> {
        let mut parts = header.split(';');

        let pair = parts.next()?.trim();
        let eq = pair.find('=')?;
        let name = pair[..eq].trim().to_string();
        let value = pair[eq + 1..].trim().to_string();
        if name.is_empty() {
            return None;
        }

        let request_host = request_url.host_str()?.to_lowercase();
        let mut domain = request_host.clone();
        let mut host_only = true;
        let mut path: Option<String> = None;
        let mut secure = false;
        let mut http_only = false;

        for attr in parts {
            let attr = attr.trim();
            let (key, val) = match attr.find('=') {
                Some(i) => (attr[..i].trim(), attr[i + 1..].trim()),
                None => (attr, ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    // A leading dot means "this domain and all subdomains";
                    // normalized away, the wildcard is implied by host_only=false
                    domain = val.trim_start_matches('.').to_lowercase();
                    host_only = false;
                }
                "path" if val.starts_with('/') => path = Some(val.to_string()),
                "secure" => secure = true,
                "httponly" => http_only = true,
                _ => {}
            }
        }

        Some(Cookie {
            name,
            value,
            domain,
            host_only,
            path: path.unwrap_or_else(|| default_path(request_url)),
            secure,
            http_only,
        })
    }

    /// Domain-match per RFC 6265 §5.1.3: host-only cookies match exactly,
    /// domain cookies match the domain itself and every subdomain.
    pub fn domain_matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        }
    }

    /// Path-match per RFC 6265 §5.1.4.
    pub fn path_matches(&self, request_path: &str) -> bool {
        if request_path == self.path {
            return true;
        }
        if !request_path.starts_with(&self.path) {
            return false;
        }
        self.path.ends_with('/') || request_path[self.path.len()..].starts_with('/')
    }

    /// Whether this cookie would be presented to every subdomain of `base`.
    pub fn shared_across_subdomains(&self, base_domain: &str) -> bool {
        !self.host_only && self.domain == base_domain.to_lowercase()
    }
}

/// Default path from the request URL: everything up to the last '/'.
fn default_path(url: &Url) -> String {
    let p = url.path();
    match p.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => p[..i].to_string(),
    }
}

/// In-memory cookie jar, one per flow run.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one parsed cookie into the jar, replacing any existing cookie
    /// with the same name and domain.
    pub fn store(&mut self, cookie: Cookie) {
        self.cookies
            .retain(|c| !(c.name == cookie.name && c.domain == cookie.domain));
        self.cookies.push(cookie);
    }

    /// Merge every `Set-Cookie` header of a response.
    pub fn store_response_cookies<'a, I: Iterator<Item = &'a str>>(
        &mut self,
        headers: I,
        request_url: &Url,
    ) {
        for header in headers {
            if let Some(cookie) = Cookie::parse(header, request_url) {
                log::debug!(
                    "jar: set {} for {}{} (host_only={})",
                    cookie.name,
                    cookie.domain,
                    cookie.path,
                    cookie.host_only
                );
                self.store(cookie);
            }
        }
    }

    /// Cookies that match a request URL (domain, path, and secure gating).
    pub fn matching(&self, url: &Url) -> Vec<&Cookie> {
        let host = match url.host_str() {
            Some(h) => h,
            None => return Vec::new(),
        };
        let https = url.scheme() == "https";
        self.cookies
            .iter()
            .filter(|c| c.domain_matches(host) && c.path_matches(url.path()))
            .filter(|c| https || !c.secure)
            .collect()
    }

    /// `Cookie:` header value for a request, or `None` when nothing matches.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let matched = self.matching(url);
        if matched.is_empty() {
            return None;
        }
        Some(
            matched
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// First cookie whose name contains `needle` (case-insensitive).
    pub fn find(&self, needle: &str) -> Option<&Cookie> {
        let needle = needle.to_lowercase();
        self.cookies
            .iter()
            .find(|c| c.name.to_lowercase().contains(&needle))
    }

    /// All stored cookies, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter()
    }

    /// Cookies judged as shared across every subdomain of `base_domain`.
    pub fn shared_across_subdomains(&self, base_domain: &str) -> Vec<&Cookie> {
        self.cookies
            .iter()
            .filter(|c| c.shared_across_subdomains(base_domain))
            .collect()
    }

    /// Drop every cookie that would not be sent to `host`. Used by the SSO
    /// scenario to model a client that carries only the IdP session across
    /// subdomains.
    pub fn retain_matching_host(&mut self, host: &str) {
        self.cookies.retain(|c| c.domain_matches(host));
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_parse_with_attributes() {
        let u = url("https://auth.boat.local/api/firstfactor");
        let c = Cookie::parse(
            "authelia_session=abc123; Domain=.boat.local; Path=/; Secure; HttpOnly",
            &u,
        )
        .unwrap();
        assert_eq!(c.name, "authelia_session");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.domain, "boat.local");
        assert!(!c.host_only);
        assert_eq!(c.path, "/");
        assert!(c.secure);
        assert!(c.http_only);
    }

    #[test]
    fn test_parse_without_domain_is_host_only() {
        let u = url("https://signalk.boat.local/signalk/v1/auth/oidc/login");
        let c = Cookie::parse("oidc_state=xyz; Path=/; HttpOnly", &u).unwrap();
        assert_eq!(c.domain, "signalk.boat.local");
        assert!(c.host_only);
    }

    #[test]
    fn test_domain_cookie_shared_across_subdomains() {
        let u = url("https://auth.boat.local/");
        let shared = Cookie::parse("sess=1; Domain=.boat.local", &u).unwrap();
        let host_only = Cookie::parse("sess2=2", &u).unwrap();

        assert!(shared.shared_across_subdomains("boat.local"));
        assert!(shared.domain_matches("signalk.boat.local"));
        assert!(shared.domain_matches("auth.boat.local"));

        assert!(!host_only.shared_across_subdomains("boat.local"));
        assert!(host_only.domain_matches("auth.boat.local"));
        assert!(!host_only.domain_matches("signalk.boat.local"));
    }

    #[test]
    fn test_path_matching() {
        let u = url("https://signalk.boat.local/");
        let c = Cookie::parse("a=1; Path=/signalk", &u).unwrap();
        assert!(c.path_matches("/signalk"));
        assert!(c.path_matches("/signalk/v1/auth"));
        assert!(!c.path_matches("/signalkserver"));
        assert!(!c.path_matches("/"));
    }

    #[test]
    fn test_default_path_from_request() {
        let u = url("https://signalk.boat.local/signalk/v1/auth/oidc/login");
        let c = Cookie::parse("a=1", &u).unwrap();
        assert_eq!(c.path, "/signalk/v1/auth/oidc");
    }

    #[test]
    fn test_store_replaces_by_name_and_domain() {
        let u = url("https://auth.boat.local/");
        let mut jar = CookieJar::new();
        jar.store(Cookie::parse("sess=old; Domain=.boat.local", &u).unwrap());
        jar.store(Cookie::parse("sess=new; Domain=.boat.local", &u).unwrap());
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.find("sess").unwrap().value, "new");
    }

    #[test]
    fn test_secure_cookie_not_sent_over_http() {
        let https = url("https://auth.boat.local/");
        let http = url("http://auth.boat.local/");
        let mut jar = CookieJar::new();
        jar.store(Cookie::parse("sess=1; Secure", &https).unwrap());
        assert!(jar.header_for(&https).is_some());
        assert!(jar.header_for(&http).is_none());
    }

    #[test]
    fn test_retain_matching_host_keeps_idp_session() {
        let idp = url("https://auth.boat.local/");
        let app = url("https://signalk.boat.local/");
        let mut jar = CookieJar::new();
        jar.store(Cookie::parse("authelia_session=1; Domain=.boat.local", &idp).unwrap());
        jar.store(Cookie::parse("oidc_state=2; Path=/", &app).unwrap());
        jar.store(Cookie::parse("JAUTHENTICATION=3; Path=/", &app).unwrap());

        jar.retain_matching_host("auth.boat.local");
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.find("authelia_session").unwrap().value, "1");
    }

    #[test]
    fn test_header_joins_matching_cookies() {
        let u = url("https://signalk.boat.local/skServer/loginStatus");
        let mut jar = CookieJar::new();
        jar.store(Cookie::parse("a=1; Domain=.boat.local; Path=/", &u).unwrap());
        jar.store(Cookie::parse("b=2; Path=/", &u).unwrap());
        jar.store(Cookie::parse("c=3; Path=/other", &u).unwrap());
        let header = jar.header_for(&u).unwrap();
        assert!(header.contains("a=1"));
        assert!(header.contains("b=2"));
        assert!(!header.contains("c=3"));
    }
}
