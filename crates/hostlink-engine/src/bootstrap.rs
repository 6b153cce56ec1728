//! Module instantiation bootstrap
//!
//! Turns a module source into a running instance attached to a bridge:
//!
//! 1. Build the import object from the bridge.
//! 2. Instantiate from bytes, a precompiled module, or a locator. Locators
//!    are fetched; if the engine supports streaming and the response has the
//!    expected content type, streaming instantiation is tried first. Any
//!    streaming failure is logged and the response bytes are instantiated
//!    the buffered way instead.
//! 3. Attach the instance to the bridge and run the start export once.
//!
//! Locators are fetched by scheme: `file:` from the filesystem, `http:` and
//! `https:` over the network.

use std::cell::OnceCell;
use std::io::Read;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use reqwest::blocking::Client;
use url::Url;

use hostlink_sdk::{BridgeError, ImportRegistry, ModuleInstance};

use crate::bridge::Bridge;

/// Bootstrap failure
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Locator could not be fetched
    #[error("failed to fetch {url}: {reason}")]
    Fetch {
        /// Locator that was requested
        url: String,
        /// What went wrong
        reason: String,
    },

    /// No fetcher handles the locator's scheme
    #[error("unsupported locator scheme {0:?}")]
    UnsupportedScheme(String),

    /// Locator string was neither a URL nor a usable path
    #[error("invalid module locator {0:?}")]
    InvalidLocator(String),

    /// Streaming path rejected the response's content type
    #[error("expected content type {expected}, got {}", .got.as_deref().unwrap_or("none"))]
    ContentType {
        /// Required content type
        expected: String,
        /// Content type of the response
        got: Option<String>,
    },

    /// Engine has no streaming path
    #[error("engine does not support streaming instantiation")]
    StreamingUnsupported,

    /// Bytes are not a module the engine can compile
    #[error("compile error: {0}")]
    Compile(String),

    /// Linking or instantiation failed
    #[error("instantiation failed: {0}")]
    Instantiate(#[from] BridgeError),

    /// The start export trapped
    #[error("start export failed: {0}")]
    Start(#[source] BridgeError),

    /// The bridge already has a module attached
    #[error("bridge already has an instantiated module")]
    AlreadyInstantiated,
}

/// A module compiled and ready to instantiate
pub trait CompiledModule {
    /// Link against `imports` and create an instance
    fn instantiate(self: Rc<Self>, imports: &ImportRegistry) -> Result<Rc<dyn ModuleInstance>, BridgeError>;
}

/// Compiles module bytes for one execution backend
pub trait ModuleEngine {
    /// Compile a module image
    fn compile(&self, bytes: &[u8]) -> Result<Rc<dyn CompiledModule>, BootstrapError>;

    /// Whether [`ModuleEngine::instantiate_streaming`] is available
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Compile and instantiate straight from a fetched response
    fn instantiate_streaming(
        &self,
        _response: &Response,
        _imports: &ImportRegistry,
    ) -> Result<Rc<dyn ModuleInstance>, BootstrapError> {
        Err(BootstrapError::StreamingUnsupported)
    }
}

/// Fetched module response
#[derive(Debug, Clone)]
pub struct Response {
    /// Locator the body came from
    pub url: Url,
    /// Declared content type, if any
    pub content_type: Option<String>,
    /// Response body
    pub body: Vec<u8>,
}

/// Resolves module locators to responses
pub trait Fetcher {
    /// Fetch the module at `url`
    fn fetch(&self, url: &Url) -> Result<Response, BootstrapError>;
}

/// Fetcher for `file:` locators. `.wasm` files are served as
/// `application/wasm`, everything else as `application/octet-stream`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl Fetcher for FileFetcher {
    fn fetch(&self, url: &Url) -> Result<Response, BootstrapError> {
        if url.scheme() != "file" {
            return Err(BootstrapError::UnsupportedScheme(url.scheme().to_string()));
        }
        let path = url
            .to_file_path()
            .map_err(|()| BootstrapError::InvalidLocator(url.to_string()))?;
        let body = std::fs::read(&path).map_err(|e| BootstrapError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let content_type = match path.extension().and_then(|ext| ext.to_str()) {
            Some("wasm") => "application/wasm",
            _ => "application/octet-stream",
        };
        Ok(Response {
            url: url.clone(),
            content_type: Some(content_type.to_string()),
            body,
        })
    }
}

/// Maximum module size accepted over the network (50 MB)
pub const MAX_MODULE_SIZE: u64 = 50 * 1024 * 1024;

/// Timeout for network fetches
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetcher for `http:` and `https:` locators
pub struct HttpFetcher {
    client: Client,
    max_size: u64,
}

impl HttpFetcher {
    /// Create a fetcher with the default timeout and size limit
    pub fn new() -> Result<Self, BootstrapError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hostlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BootstrapError::Fetch {
                url: String::new(),
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            max_size: MAX_MODULE_SIZE,
        }
    }

    /// Change the size limit
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &Url) -> Result<Response, BootstrapError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BootstrapError::UnsupportedScheme(url.scheme().to_string()));
        }
        let failed = |reason: String| BootstrapError::Fetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {}", status.as_u16())));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_size {
                return Err(failed(format!(
                    "content too large: {len} bytes (max: {})",
                    self.max_size
                )));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let final_url = response.url().clone();

        let mut body = Vec::new();
        response
            .take(self.max_size + 1)
            .read_to_end(&mut body)
            .map_err(|e| failed(e.to_string()))?;
        if body.len() as u64 > self.max_size {
            return Err(failed(format!(
                "content too large: more than {} bytes",
                self.max_size
            )));
        }

        Ok(Response {
            url: final_url,
            content_type,
            body,
        })
    }
}

/// Default fetcher: dispatches on the locator's scheme. The HTTP client is
/// created on first use.
#[derive(Default)]
pub struct LocatorFetcher {
    http: OnceCell<HttpFetcher>,
}

impl LocatorFetcher {
    /// Fetcher with no HTTP client created yet
    pub fn new() -> Self {
        Self::default()
    }

    fn http(&self) -> Result<&HttpFetcher, BootstrapError> {
        if let Some(http) = self.http.get() {
            return Ok(http);
        }
        let http = HttpFetcher::new()?;
        Ok(self.http.get_or_init(|| http))
    }
}

impl Fetcher for LocatorFetcher {
    fn fetch(&self, url: &Url) -> Result<Response, BootstrapError> {
        match url.scheme() {
            "file" => FileFetcher.fetch(url),
            "http" | "https" => self.http()?.fetch(url),
            other => Err(BootstrapError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Where the module comes from
pub enum ModuleSource {
    /// Module image bytes
    Bytes(Vec<u8>),
    /// Already compiled module
    Compiled(Rc<dyn CompiledModule>),
    /// Locator to fetch
    Locator(Url),
}

impl ModuleSource {
    /// Parse a locator: a URL, or a filesystem path turned into a `file:` URL
    pub fn locator(s: &str) -> Result<Self, BootstrapError> {
        if let Ok(url) = Url::parse(s) {
            if url.scheme().len() > 1 {
                return Ok(ModuleSource::Locator(url));
            }
        }
        let path = std::path::absolute(Path::new(s))
            .map_err(|_| BootstrapError::InvalidLocator(s.to_string()))?;
        Url::from_file_path(&path)
            .map(ModuleSource::Locator)
            .map_err(|()| BootstrapError::InvalidLocator(s.to_string()))
    }
}

impl From<Vec<u8>> for ModuleSource {
    fn from(bytes: Vec<u8>) -> Self {
        ModuleSource::Bytes(bytes)
    }
}

impl From<&[u8]> for ModuleSource {
    fn from(bytes: &[u8]) -> Self {
        ModuleSource::Bytes(bytes.to_vec())
    }
}

impl From<Url> for ModuleSource {
    fn from(url: Url) -> Self {
        ModuleSource::Locator(url)
    }
}

impl From<Rc<dyn CompiledModule>> for ModuleSource {
    fn from(module: Rc<dyn CompiledModule>) -> Self {
        ModuleSource::Compiled(module)
    }
}

/// Which path produced the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstantiationPath {
    /// Compiled from bytes
    Buffered,
    /// Instantiated from a precompiled module
    Precompiled,
    /// Streamed from a fetched response
    Streaming,
    /// Streaming failed; buffered from the fetched response
    StreamingFallback,
    /// Fetched and buffered without trying to stream
    Fetched,
}

/// Instantiates modules for bridges
pub struct Bootstrap<'a> {
    engine: &'a dyn ModuleEngine,
    fetcher: Option<&'a dyn Fetcher>,
    locators: LocatorFetcher,
}

impl<'a> Bootstrap<'a> {
    /// Bootstrap fetching `file:`, `http:` and `https:` locators
    pub fn new(engine: &'a dyn ModuleEngine) -> Self {
        Self {
            engine,
            fetcher: None,
            locators: LocatorFetcher::new(),
        }
    }

    /// Use a different fetcher for locators
    pub fn with_fetcher(mut self, fetcher: &'a dyn Fetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    fn fetcher(&self) -> &dyn Fetcher {
        match self.fetcher {
            Some(fetcher) => fetcher,
            None => &self.locators,
        }
    }

    /// Instantiate `source`, attach it to `bridge`, and run its start export.
    ///
    /// Host imports must already be defined on the bridge.
    pub fn init(
        &self,
        bridge: &Bridge,
        source: impl Into<ModuleSource>,
    ) -> Result<InstantiationPath, BootstrapError> {
        if bridge.is_attached() {
            return Err(BootstrapError::AlreadyInstantiated);
        }
        let imports = bridge.imports();
        let (instance, path) = self.load(bridge, source.into(), &imports)?;
        bridge.attach(instance);
        bridge.start().map_err(BootstrapError::Start)?;
        tracing::debug!(?path, "module ready");
        Ok(path)
    }

    fn load(
        &self,
        bridge: &Bridge,
        source: ModuleSource,
        imports: &ImportRegistry,
    ) -> Result<(Rc<dyn ModuleInstance>, InstantiationPath), BootstrapError> {
        match source {
            ModuleSource::Bytes(bytes) => {
                let instance = self.engine.compile(&bytes)?.instantiate(imports)?;
                Ok((instance, InstantiationPath::Buffered))
            }
            ModuleSource::Compiled(module) => {
                Ok((module.instantiate(imports)?, InstantiationPath::Precompiled))
            }
            ModuleSource::Locator(url) => {
                let response = self.fetcher().fetch(&url)?;
                tracing::debug!(
                    url = %url,
                    content_type = response.content_type.as_deref().unwrap_or(""),
                    bytes = response.body.len(),
                    "module fetched"
                );
                let options = bridge.options();
                if !(options.streaming && self.engine.supports_streaming()) {
                    let instance = self.engine.compile(&response.body)?.instantiate(imports)?;
                    return Ok((instance, InstantiationPath::Fetched));
                }
                match self.stream(bridge, &response, imports) {
                    Ok(instance) => Ok((instance, InstantiationPath::Streaming)),
                    Err(e) => {
                        tracing::warn!(
                            url = %url,
                            error = %e,
                            "streaming instantiation failed, falling back to buffered instantiation"
                        );
                        let instance = self.engine.compile(&response.body)?.instantiate(imports)?;
                        Ok((instance, InstantiationPath::StreamingFallback))
                    }
                }
            }
        }
    }

    fn stream(
        &self,
        bridge: &Bridge,
        response: &Response,
        imports: &ImportRegistry,
    ) -> Result<Rc<dyn ModuleInstance>, BootstrapError> {
        let expected = &bridge.options().expected_content_type;
        let matches = response
            .content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(expected));
        if !matches {
            return Err(BootstrapError::ContentType {
                expected: expected.clone(),
                got: response.content_type.clone(),
            });
        }
        self.engine.instantiate_streaming(response, imports)
    }
}
