//! The per-request context a CGI front end hands to the cache: the
//! cache key, what kind of page is being asked for (which picks its
//! TTL), and whether the request may use the cache at all.
//!
//! Everything comes from an explicit environment map, so tests (and
//! embedders) never have to touch the process environment.
use std::collections::HashMap;

use url::form_urlencoded;

/// What a request asks for, as far as TTL selection cares.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestClass {
    /// The repository name, if the request names one.
    pub repo: Option<String>,
    /// The page (`log`, `tree`, `about`, ...), if any.
    pub page: Option<String>,
    /// Whether the request pins an object id (`id=` or `id2=`).
    pub has_oid: bool,
    /// Whether the request names a symbolic ref (`h=`).
    pub has_symref: bool,
}

/// A CGI request, reduced to what the cache needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgiRequest {
    query: Option<String>,
    path_info: Option<String>,
    method: Option<String>,
    authenticated: bool,
}

/// Splits a query string into decoded `(name, value)` pairs.  A name
/// without `=` has an empty value.
fn query_pairs(query: &str) -> impl Iterator<Item = (String, String)> + '_ {
    form_urlencoded::parse(query.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
}

/// Fills `class` from a virtual URL: `repo/page/path...`.
fn parse_url(url: &str, class: &mut RequestClass) {
    let mut parts = url.trim_start_matches('/').splitn(3, '/');

    if let Some(repo) = parts.next().filter(|repo| !repo.is_empty()) {
        class.repo = Some(repo.to_owned());
        if let Some(page) = parts.next().filter(|page| !page.is_empty()) {
            class.page = Some(page.to_owned());
        }
    }
}

impl CgiRequest {
    /// Builds a request from CGI environment variables.
    pub fn new(
        query: Option<String>,
        path_info: Option<String>,
        method: Option<String>,
    ) -> CgiRequest {
        CgiRequest {
            query,
            path_info,
            method,
            authenticated: true,
        }
    }

    /// Builds a request from `QUERY_STRING`, `PATH_INFO`, and
    /// `REQUEST_METHOD` in `env`.  Empty variables count as unset.
    pub fn from_env_map(env: &HashMap<String, String>) -> CgiRequest {
        let get = |name: &str| env.get(name).filter(|value| !value.is_empty()).cloned();

        CgiRequest::new(get("QUERY_STRING"), get("PATH_INFO"), get("REQUEST_METHOD"))
    }

    /// Builds a request from the process environment.
    pub fn from_env() -> CgiRequest {
        let env: HashMap<String, String> = std::env::vars().collect();

        CgiRequest::from_env_map(&env)
    }

    /// Marks the request as (un)authenticated.  Unauthenticated
    /// requests never use the cache.
    pub fn with_authenticated(mut self, authenticated: bool) -> CgiRequest {
        self.authenticated = authenticated;
        self
    }

    fn has_url_param(&self) -> bool {
        match &self.query {
            Some(query) => query_pairs(query).any(|(name, _)| name == "url"),
            None => false,
        }
    }

    /// `PATH_INFO` without its leading slash, when it stands in for a
    /// missing `url=` parameter.
    fn virtual_url(&self) -> Option<&str> {
        if self.has_url_param() {
            return None;
        }

        self.path_info
            .as_deref()
            .map(|path| path.strip_prefix('/').unwrap_or(path))
    }

    /// Returns the cache key for this request: the raw query string,
    /// prefixed with `<path>?` when `PATH_INFO` acts as the URL.
    pub fn cache_key(&self) -> String {
        match (self.virtual_url(), &self.query) {
            (Some(path), Some(query)) => format!("{}?{}", path, query),
            (Some(path), None) => path.to_owned(),
            (None, Some(query)) => query.clone(),
            (None, None) => String::new(),
        }
    }

    /// Classifies the request for TTL selection.
    pub fn class(&self) -> RequestClass {
        let mut class = RequestClass::default();

        if let Some(query) = &self.query {
            for (name, value) in query_pairs(query) {
                match name.as_str() {
                    "r" if !value.is_empty() => class.repo = Some(value),
                    "p" => class.page = Some(value),
                    "url" => parse_url(&value, &mut class),
                    "h" => class.has_symref = true,
                    "id" | "id2" => class.has_oid = true,
                    _ => {}
                }
            }
        }

        if let Some(url) = self.virtual_url() {
            parse_url(url, &mut class);
        }

        class
    }

    /// Returns whether this request must skip the cache entirely:
    /// `HEAD` requests (their response has no body to cache) and
    /// unauthenticated requests.
    pub fn bypasses_cache(&self) -> bool {
        !self.authenticated || self.method.as_deref() == Some("HEAD")
    }
}

#[cfg(test)]
fn request(query: Option<&str>, path_info: Option<&str>) -> CgiRequest {
    CgiRequest::new(
        query.map(String::from),
        path_info.map(String::from),
        Some("GET".to_owned()),
    )
}

#[test]
fn test_cache_key() {
    assert_eq!(request(None, None).cache_key(), "");
    assert_eq!(request(Some("r=git&p=log"), None).cache_key(), "r=git&p=log");
    assert_eq!(request(None, Some("/git/log")).cache_key(), "git/log");
    assert_eq!(
        request(Some("ofs=50"), Some("/git/log")).cache_key(),
        "git/log?ofs=50"
    );
    // An explicit url= wins over PATH_INFO.
    assert_eq!(
        request(Some("url=/git/tree"), Some("/git/log")).cache_key(),
        "url=/git/tree"
    );
}

#[test]
fn test_class() {
    assert_eq!(request(None, None).class(), RequestClass::default());

    let class = request(Some("r=git&p=about"), None).class();
    assert_eq!(class.repo.as_deref(), Some("git"));
    assert_eq!(class.page.as_deref(), Some("about"));
    assert!(!class.has_oid && !class.has_symref);

    let class = request(Some("id=abc123&h=master"), Some("/git/tree/src")).class();
    assert_eq!(class.repo.as_deref(), Some("git"));
    assert_eq!(class.page.as_deref(), Some("tree"));
    assert!(class.has_oid);
    assert!(class.has_symref);

    let class = request(Some("url=%2Fgit%2Fsnapshot&id2=x"), None).class();
    assert_eq!(class.repo.as_deref(), Some("git"));
    assert_eq!(class.page.as_deref(), Some("snapshot"));
    assert!(class.has_oid);

    // Names and values are form-decoded; empty pairs are skipped.
    let class = request(Some("r=my+repo&&p=%6cog&h"), None).class();
    assert_eq!(class.repo.as_deref(), Some("my repo"));
    assert_eq!(class.page.as_deref(), Some("log"));
    assert!(class.has_symref);

    let class = request(None, Some("/git")).class();
    assert_eq!(class.repo.as_deref(), Some("git"));
    assert_eq!(class.page, None);
}

#[test]
fn test_bypass() {
    assert!(!request(Some("p=log"), None).bypasses_cache());
    assert!(request(Some("p=log"), None)
        .with_authenticated(false)
        .bypasses_cache());

    let head = CgiRequest::new(Some("p=log".to_owned()), None, Some("HEAD".to_owned()));
    assert!(head.bypasses_cache());
}

#[test]
fn test_from_env_map() {
    let mut env = HashMap::new();
    env.insert("QUERY_STRING".to_owned(), String::new());
    env.insert("PATH_INFO".to_owned(), "/git/log".to_owned());
    env.insert("REQUEST_METHOD".to_owned(), "GET".to_owned());

    let req = CgiRequest::from_env_map(&env);
    assert_eq!(req.cache_key(), "git/log");
    assert!(!req.bypasses_cache());
}
