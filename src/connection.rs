//! Turns a feed link into bytes. Each URL scheme is served by a registered
//! `ProtocolHandler`; HTTP honours conditional GET, credentials and proxy
//! settings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    HeaderName, AUTHORIZATION, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    PROXY_AUTHENTICATE, WWW_AUTHENTICATE,
};
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, instrument};

use crate::config::{self, Credential};
use crate::error::FetchError;
use crate::model::ConditionalGet;

/// Body of a successful fetch plus the validators to remember for next time.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub conditional: ConditionalGet,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, link: &str, conditional: &ConditionalGet) -> Result<Fetched, FetchError>;
}

#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn open(&self, link: &Url, conditional: &ConditionalGet) -> Result<Fetched, FetchError>;
}

/// Dispatches on the link's scheme.
#[derive(Clone, Default)]
pub struct ConnectionService {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<&String> = self.handlers.keys().collect();
        schemes.sort();
        f.debug_struct("ConnectionService")
            .field("schemes", &schemes)
            .finish()
    }
}

impl ConnectionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// `http`, `https` and `file` handlers built from configuration.
    pub fn from_config(cfg: &config::Connection) -> Result<Self, FetchError> {
        let http: Arc<dyn ProtocolHandler> = Arc::new(HttpHandler::from_config(cfg)?);
        let mut service = Self::new();
        service.register("http", http.clone());
        service.register("https", http);
        service.register("file", Arc::new(FileHandler));
        Ok(service)
    }

    pub fn register(&mut self, scheme: &str, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(scheme.to_ascii_lowercase(), handler);
    }
}

#[async_trait]
impl Fetcher for ConnectionService {
    #[instrument(skip_all, fields(link = %link))]
    async fn fetch(&self, link: &str, conditional: &ConditionalGet) -> Result<Fetched, FetchError> {
        let url = Url::parse(link).map_err(|_| FetchError::InvalidLink(link.to_string()))?;
        let handler = self
            .handlers
            .get(url.scheme())
            .ok_or_else(|| FetchError::UnsupportedProtocol(url.scheme().to_string()))?;
        handler.open(&url, conditional).await
    }
}

#[derive(Clone)]
pub struct HttpHandler {
    http: Client,
    credentials: Vec<Credential>,
}

impl fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHandler")
            .field("credentials", &self.credentials.len())
            .finish_non_exhaustive()
    }
}

impl HttpHandler {
    pub fn from_config(cfg: &config::Connection) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.timeout_secs));
        builder = match &cfg.proxy {
            Some(proxy) => {
                let mut p = reqwest::Proxy::all(&proxy.url)
                    .map_err(|e| FetchError::InvalidLink(format!("proxy {}: {}", proxy.url, e)))?;
                if let Some(user) = &proxy.username {
                    p = p.basic_auth(user, proxy.password.as_deref().unwrap_or_default());
                }
                builder.proxy(p)
            }
            None => builder.no_proxy(),
        };
        let http = builder
            .build()
            .map_err(|e| FetchError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            credentials: cfg.credentials.clone(),
        })
    }

    /// Longest matching prefix wins.
    fn credential_for(&self, link: &str) -> Option<&Credential> {
        self.credentials
            .iter()
            .filter(|c| link.starts_with(&c.link_prefix))
            .max_by_key(|c| c.link_prefix.len())
    }

    pub fn build_request(
        &self,
        link: &Url,
        conditional: &ConditionalGet,
    ) -> Result<reqwest::Request, FetchError> {
        let mut req = self.http.get(link.clone());
        if let Some(since) = &conditional.if_modified_since {
            req = req.header(IF_MODIFIED_SINCE, since);
        }
        if let Some(etag) = &conditional.if_none_match {
            req = req.header(IF_NONE_MATCH, etag);
        }
        if let Some(cred) = self.credential_for(link.as_str()) {
            req = req.basic_auth(&cred.username, Some(&cred.password));
        }
        req.build().map_err(FetchError::from)
    }
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    async fn open(&self, link: &Url, conditional: &ConditionalGet) -> Result<Fetched, FetchError> {
        let request = self.build_request(link, conditional)?;
        let sent_auth = request.headers().contains_key(AUTHORIZATION);
        let res = self.http.execute(request).await?;
        let status = res.status();
        debug!(%status, sent_auth, "feed response");

        match status {
            StatusCode::NOT_MODIFIED => return Err(FetchError::NotModified),
            StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let challenge = if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                    PROXY_AUTHENTICATE
                } else {
                    WWW_AUTHENTICATE
                };
                let realm = res
                    .headers()
                    .get(challenge)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_realm);
                return Err(FetchError::AuthRequired {
                    link: link.to_string(),
                    realm,
                });
            }
            s if !s.is_success() => {
                return Err(FetchError::Unreachable(format!("HTTP {} for {}", s, link)));
            }
            _ => {}
        }

        let header = |name: HeaderName| {
            res.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let conditional = ConditionalGet {
            if_modified_since: header(LAST_MODIFIED),
            if_none_match: header(ETAG),
        };
        let bytes = res.bytes().await?;
        Ok(Fetched {
            bytes: bytes.to_vec(),
            conditional,
        })
    }
}

/// `Basic realm="x"` -> `x`
fn parse_realm(value: &str) -> Option<String> {
    let start = value.find("realm=")? + "realm=".len();
    let rest = value[start..].trim_start_matches('"');
    let end = rest.find('"').unwrap_or(rest.len());
    Some(rest[..end].to_string()).filter(|r| !r.is_empty())
}

/// Reads local files; never reports validators.
#[derive(Debug, Clone, Copy)]
pub struct FileHandler;

#[async_trait]
impl ProtocolHandler for FileHandler {
    async fn open(&self, link: &Url, _conditional: &ConditionalGet) -> Result<Fetched, FetchError> {
        let path = link
            .to_file_path()
            .map_err(|_| FetchError::InvalidLink(link.to_string()))?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FetchError::Unreachable(format!("{}: {}", path.display(), e)))?;
        Ok(Fetched {
            bytes,
            conditional: ConditionalGet::default(),
        })
    }
}
