//! Endpoint and credential resolution.
//!
//! Every value is looked up in the same order:
//!
//! 1. explicit builder parameters
//! 2. `EVR_*` environment variables
//! 3. `evrmore.conf` in the data directory (network sections first)
//! 4. the daemon-managed `.cookie` file (credentials only)
//!
//! Credentials are never merged: the first source that supplies both a
//! username and a password wins outright.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use percent_encoding::percent_decode_str;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

/// Username the daemon writes into its cookie file.
pub const COOKIE_USERNAME: &str = "__cookie__";

/// Prefix shared by all recognized environment variables.
pub const ENV_PREFIX: &str = "EVR_";

pub const ENV_RPC_USER: &str = "EVR_RPC_USER";
pub const ENV_RPC_PASSWORD: &str = "EVR_RPC_PASSWORD";
pub const ENV_RPC_HOST: &str = "EVR_RPC_HOST";
pub const ENV_RPC_PORT: &str = "EVR_RPC_PORT";
pub const ENV_TESTNET: &str = "EVR_TESTNET";

const CONF_FILE_NAME: &str = "evrmore.conf";
const COOKIE_FILE_NAME: &str = ".cookie";
const DEFAULT_HOST: &str = "127.0.0.1";

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Network
// =============================================================================

/// Which chain the daemon serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    /// Default RPC port for this network.
    pub fn default_rpc_port(self) -> u16 {
        match self {
            Network::Mainnet => 8819,
            Network::Testnet => 18819,
        }
    }

    /// Subdirectory of the data directory used by this network.
    pub fn data_subdir(self) -> Option<&'static str> {
        match self {
            Network::Mainnet => None,
            Network::Testnet => Some("testnet1"),
        }
    }

    /// Name of the `[section]` in `evrmore.conf` scoped to this network.
    pub fn conf_section(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
        }
    }

    fn from_flag(testnet: bool) -> Self {
        if testnet {
            Network::Testnet
        } else {
            Network::Mainnet
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Where a resolved credential pair came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Explicit,
    Environment,
    ConfigFile,
    /// Read from the cookie file at this path.
    Cookie(PathBuf),
}

/// A username/password pair used for HTTP basic auth.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub source: CredentialSource,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        source: CredentialSource,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            source,
        }
    }

    /// Whether these credentials were read from a cookie file.
    pub fn cookie_path(&self) -> Option<&Path> {
        match &self.source {
            CredentialSource::Cookie(path) => Some(path),
            _ => None,
        }
    }

    /// Password with everything but the first and last few characters hidden.
    pub fn masked_password(&self) -> String {
        let chars: Vec<char> = self.password.chars().collect();
        if chars.len() <= 16 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// Read a daemon cookie file.
///
/// Returns `Ok(None)` when the file does not exist, which callers treat as
/// "no credentials available" rather than an error.
///
/// # Errors
///
/// Returns `Error::Configuration` if the file exists but is not a single
/// `username:secret` line, and `Error::Io` if it cannot be read.
pub fn read_cookie(path: &Path) -> Result<Option<Credentials>> {
    match fs::read_to_string(path) {
        Ok(content) => parse_cookie(&content, path).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No cookie file at {}", path.display());
            Ok(None)
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Async variant of [`read_cookie`] for code running on a runtime.
pub async fn read_cookie_async(path: &Path) -> Result<Option<Credentials>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_cookie(&content, path).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No cookie file at {}", path.display());
            Ok(None)
        }
        Err(e) => Err(Error::Io(e)),
    }
}

fn parse_cookie(content: &str, path: &Path) -> Result<Credentials> {
    let line = content.lines().next().unwrap_or("").trim();
    match line.split_once(':') {
        Some((user, secret)) if !user.is_empty() && !secret.is_empty() => Ok(Credentials::new(
            user,
            secret,
            CredentialSource::Cookie(path.to_path_buf()),
        )),
        _ => Err(Error::Configuration(format!(
            "Malformed cookie file {}: expected 'username:secret'",
            path.display()
        ))),
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Snapshot of the `EVR_*` environment variables.
///
/// Resolution takes a snapshot instead of reading the process environment
/// directly so it can be driven from tests without mutating global state.
#[derive(Debug, Clone, Default)]
pub struct EnvVars {
    vars: HashMap<String, String>,
}

impl EnvVars {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect()
    }

    /// Look up a non-empty variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// =============================================================================
// Config file
// =============================================================================

/// Parsed `evrmore.conf`.
///
/// The format is `key=value` per line with `#` comments. Keys under a
/// `[main]` or `[test]` header apply only to that network and shadow the
/// global value. Later assignments win.
#[derive(Debug, Clone, Default)]
pub struct ConfFile {
    global: HashMap<String, String>,
    sections: HashMap<String, HashMap<String, String>>,
}

impl ConfFile {
    pub fn parse(text: &str) -> Self {
        let mut conf = ConfFile::default();
        let mut section: Option<String> = None;

        for raw in text.lines() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();

            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                section = Some(line[1..line.len() - 1].trim().to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                debug!("Ignoring config line without '=': {}", line);
                continue;
            };

            let target = match &section {
                Some(name) => conf.sections.entry(name.clone()).or_default(),
                None => &mut conf.global,
            };
            target.insert(key.trim().to_string(), value.trim().to_string());
        }

        conf
    }

    /// Load a config file. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                debug!("Loaded config file {}", path.display());
                Ok(Self::parse(&text))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Look up a non-empty key, preferring the network's section.
    pub fn get(&self, key: &str, network: Network) -> Option<&str> {
        self.sections
            .get(network.conf_section())
            .and_then(|s| s.get(key))
            .or_else(|| self.global.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Whether the global `testnet` flag is set.
    pub fn testnet(&self) -> bool {
        self.global
            .get("testnet")
            .map(|v| parse_flag(v))
            .unwrap_or(false)
    }

    /// `zmqpub*` notification endpoints, keyed by topic (`hashblock`, `rawtx`, ...).
    pub fn zmq_endpoints(&self, network: Network) -> BTreeMap<String, String> {
        let mut endpoints = BTreeMap::new();
        let scoped = self.sections.get(network.conf_section());
        for map in std::iter::once(&self.global).chain(scoped) {
            for (key, value) in map {
                if let Some(topic) = key.strip_prefix("zmqpub") {
                    endpoints.insert(topic.to_string(), value.clone());
                }
            }
        }
        endpoints
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// =============================================================================
// Resolution
// =============================================================================

/// Values passed directly by the caller. All optional.
#[derive(Debug, Clone, Default)]
pub struct ExplicitParams {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub testnet: Option<bool>,
    pub datadir: Option<PathBuf>,
    pub conf_path: Option<PathBuf>,
}

/// Resolve credentials in precedence order: explicit, environment, config
/// file, cookie file.
///
/// Returns `Ok(None)` when no source has credentials.
///
/// # Errors
///
/// - `Error::Configuration` when the explicit parameters hold only one half
///   of a pair, or the cookie file is malformed
/// - `Error::Io` when the cookie file exists but cannot be read
pub fn resolve_credentials(
    explicit: &ExplicitParams,
    env: &EnvVars,
    conf: &ConfFile,
    network: Network,
    cookie_path: &Path,
) -> Result<Option<Credentials>> {
    match (explicit.user.as_deref(), explicit.password.as_deref()) {
        (Some(user), Some(password)) => {
            return Ok(Some(Credentials::new(
                user,
                password,
                CredentialSource::Explicit,
            )))
        }
        (None, None) => {}
        _ => {
            return Err(Error::Configuration(
                "Explicit credentials need both a user and a password".to_string(),
            ))
        }
    }

    if let Some(creds) = pair_from(
        env.get(ENV_RPC_USER),
        env.get(ENV_RPC_PASSWORD),
        CredentialSource::Environment,
    ) {
        return Ok(Some(creds));
    }

    if let Some(creds) = pair_from(
        conf.get("rpcuser", network),
        conf.get("rpcpassword", network),
        CredentialSource::ConfigFile,
    ) {
        return Ok(Some(creds));
    }

    read_cookie(cookie_path)
}

fn pair_from(
    user: Option<&str>,
    password: Option<&str>,
    source: CredentialSource,
) -> Option<Credentials> {
    match (user, password) {
        (Some(user), Some(password)) => Some(Credentials::new(user, password, source)),
        (None, None) => None,
        _ => {
            warn!(
                "Ignoring incomplete credentials from {:?}: user and password must both be set",
                source
            );
            None
        }
    }
}

/// Build an HTTP endpoint from a host and port.
///
/// The host may carry a scheme. `tcp://` is accepted as an alias for
/// `http://`, and a port embedded in the host wins over `port`.
pub fn endpoint_url(host: &str, port: u16) -> Result<Url> {
    let host = host.trim();
    let with_scheme = match host.split_once("://") {
        Some(("tcp", rest)) => format!("http://{}", rest),
        Some(_) => host.to_string(),
        None => format!("http://{}", host),
    };

    let mut url = parse_url(&with_scheme)?;
    if url.port().is_none() {
        url.set_port(Some(port))
            .map_err(|_| Error::Configuration(format!("Cannot set port on {}", with_scheme)))?;
    }
    Ok(url)
}

fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::Configuration(format!("Invalid RPC URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" => Ok(url),
        "https" => Err(Error::Configuration(format!(
            "TLS is not supported, the daemon serves RPC over plain HTTP: {}",
            raw
        ))),
        other => Err(Error::Configuration(format!(
            "Unsupported RPC URL scheme '{}'",
            other
        ))),
    }
}

/// Default data directory (`~/.evrmore`).
pub fn default_datadir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".evrmore")
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub url: Url,
    pub credentials: Option<Credentials>,
    pub network: Network,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// `zmqpub*` endpoints found in the config file.
    pub zmq_endpoints: BTreeMap<String, String>,
}

impl RpcConfig {
    /// Start building a configuration from explicit parameters.
    pub fn builder() -> RpcConfigBuilder {
        RpcConfigBuilder::default()
    }

    /// A configuration with a fixed URL and credential pair.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the URL is invalid.
    pub fn new(url: &str, user: &str, password: &str) -> Result<Self> {
        Ok(Self {
            url: parse_url(url)?,
            credentials: Some(Credentials::new(user, password, CredentialSource::Explicit)),
            network: Network::Mainnet,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            zmq_endpoints: BTreeMap::new(),
        })
    }

    /// Override the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Builder collecting explicit parameters for [`RpcConfig`].
#[derive(Debug, Clone, Default)]
pub struct RpcConfigBuilder {
    params: ExplicitParams,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl RpcConfigBuilder {
    /// Full endpoint URL. May carry `user:password@` userinfo.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.params.url = Some(url.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.params.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.params.password = Some(password.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.params.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.params.port = Some(port);
        self
    }

    pub fn testnet(mut self, testnet: bool) -> Self {
        self.params.testnet = Some(testnet);
        self
    }

    pub fn datadir(mut self, datadir: impl Into<PathBuf>) -> Self {
        self.params.datadir = Some(datadir.into());
        self
    }

    pub fn conf_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.params.conf_path = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Resolve against the current process environment.
    pub fn resolve(self) -> Result<RpcConfig> {
        self.resolve_with(&EnvVars::from_process())
    }

    /// Resolve against an explicit environment snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for invalid URLs, ports or partial
    /// explicit credentials, and `Error::Io` for unreadable files.
    pub fn resolve_with(self, env: &EnvVars) -> Result<RpcConfig> {
        let mut params = self.params;

        let datadir = params.datadir.clone().unwrap_or_else(default_datadir);
        let conf_path = params
            .conf_path
            .clone()
            .unwrap_or_else(|| datadir.join(CONF_FILE_NAME));
        let conf = ConfFile::load(&conf_path)?;

        let testnet = params
            .testnet
            .or_else(|| env.get(ENV_TESTNET).map(parse_flag))
            .unwrap_or_else(|| conf.testnet());
        let network = Network::from_flag(testnet);

        let url = match params.url.take() {
            Some(raw) => {
                let mut url = parse_url(&raw)?;
                take_userinfo(&mut url, &mut params);
                url
            }
            None => {
                let host = params
                    .host
                    .clone()
                    .or_else(|| env.get(ENV_RPC_HOST).map(str::to_string))
                    .or_else(|| conf.get("rpcconnect", network).map(str::to_string))
                    .unwrap_or_else(|| DEFAULT_HOST.to_string());
                let port = match params.port {
                    Some(port) => port,
                    None => match env.get(ENV_RPC_PORT).or_else(|| conf.get("rpcport", network)) {
                        Some(raw) => raw.parse().map_err(|_| {
                            Error::Configuration(format!("Invalid RPC port '{}'", raw))
                        })?,
                        None => network.default_rpc_port(),
                    },
                };
                endpoint_url(&host, port)?
            }
        };

        let net_datadir = match network.data_subdir() {
            Some(sub) => datadir.join(sub),
            None => datadir,
        };
        let cookie_path = match conf.get("rpccookiefile", network) {
            Some(path) => net_datadir.join(path),
            None => net_datadir.join(COOKIE_FILE_NAME),
        };

        let credentials = resolve_credentials(&params, env, &conf, network, &cookie_path)?;
        match &credentials {
            Some(creds) => debug!("Using RPC credentials from {:?}", creds.source),
            None => debug!("No RPC credentials available"),
        }

        Ok(RpcConfig {
            url,
            credentials,
            network,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            zmq_endpoints: conf.zmq_endpoints(network),
        })
    }
}

/// Move `user:password@` out of the URL into the explicit parameters,
/// unless explicit credentials were already given.
fn take_userinfo(url: &mut Url, params: &mut ExplicitParams) {
    if url.username().is_empty() {
        return;
    }
    if params.user.is_none() && params.password.is_none() {
        // Url keeps userinfo percent-encoded
        params.user = Some(decode_userinfo(url.username()));
        params.password = url.password().map(decode_userinfo);
    }
    // Url setters only fail for cannot-be-a-base URLs, which http(s) never is.
    let _ = url.set_username("");
    let _ = url.set_password(None);
}

fn decode_userinfo(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
