//! Caller authentication.
//!
//! The gate runs before routing: a rejected request never reaches the pool
//! manager. Credentials are read from the `Authorization` header and checked
//! by a [`CredentialVerifier`]:
//!
//! - `none`: every caller is anonymous
//! - `token`: bearer tokens are hashed and looked up in a token file
//! - `kerberos`: `Negotiate` tokens are verified by the external security
//!   backend; the gateway's own principal and keytab are checked at startup
//!
//! Credential material is never logged.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use http::header::{HeaderName, AUTHORIZATION};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::GatewayError;

/// Default header carrying the authenticated principal to backends.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-switchyard-identity";

/// Name of the login descriptor written into the working directory.
pub const LOGIN_CONFIG_FILE: &str = "login.conf";

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    None,
    Token,
    Kerberos,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Token => "token",
            Self::Kerberos => "kerberos",
        };
        f.write_str(s)
    }
}

/// Security settings.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub mode: SecurityMode,
    pub token_file: Option<PathBuf>,
    /// The gateway's own principal (kerberos).
    pub principal: Option<String>,
    pub keytab: Option<PathBuf>,
    /// Security backend verification endpoint (kerberos).
    pub verify_url: Option<String>,
    pub identity_header: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: SecurityMode::None,
            token_file: None,
            principal: None,
            keytab: None,
            verify_url: None,
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
        }
    }
}

/// Who made a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    principal: String,
    anonymous: bool,
}

impl Identity {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            anonymous: false,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            principal: "anonymous".to_string(),
            anonymous: true,
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }
}

/// Credential presented by a caller.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Negotiate(String),
}

impl Credential {
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Bearer(_) => "bearer",
            Self::Negotiate(_) => "negotiate",
        }
    }

    fn secret(&self) -> &str {
        match self {
            Self::Bearer(s) | Self::Negotiate(s) => s,
        }
    }

    /// Parse the `Authorization` header, if present.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>, AuthError> {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| AuthError::Malformed("authorization header is not ASCII".to_string()))?;
        let (scheme, secret) = value
            .trim()
            .split_once(' ')
            .ok_or_else(|| AuthError::Malformed("expected '<scheme> <credential>'".to_string()))?;
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(AuthError::Malformed("empty credential".to_string()));
        }

        if scheme.eq_ignore_ascii_case("bearer") {
            Ok(Some(Self::Bearer(secret.to_string())))
        } else if scheme.eq_ignore_ascii_case("negotiate") {
            Ok(Some(Self::Negotiate(secret.to_string())))
        } else {
            Err(AuthError::UnsupportedScheme(scheme.to_string()))
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({}, <redacted>)", self.scheme())
    }
}

/// Why a credential was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("malformed credentials: {0}")]
    Malformed(String),
    #[error("unsupported authorization scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("security backend error: {0}")]
    Backend(String),
}

/// Setup errors of the security gate.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("{0} must be set for security mode '{1}'")]
    MissingSetting(&'static str, SecurityMode),
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid token file {path}: {message}")]
    TokenFile { path: PathBuf, message: String },
    #[error("failed to write login configuration to {path}")]
    LoginConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{setting} contains characters not allowed in the login configuration: {value:?}")]
    UnsafeLoginValue { setting: &'static str, value: String },
    #[error("invalid identity header name '{0}'")]
    InvalidIdentityHeader(String),
    #[error("invalid security backend client: {0}")]
    Client(String),
}

/// Checks a credential and derives the caller's identity.
#[async_trait]
pub trait CredentialVerifier: Send + Sync + 'static {
    async fn verify(&self, credential: &Credential) -> Result<Identity, AuthError>;
}

/// Hex SHA-256 of a token, the form stored in token files.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    principal: String,
    sha256: String,
}

/// Bearer tokens checked against a set of token hashes.
///
/// ```toml
/// [[tokens]]
/// principal = "svc-ingest"
/// sha256 = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
/// ```
pub struct TokenVerifier {
    principals: HashMap<String, String>,
}

impl TokenVerifier {
    /// Build from `(principal, token_sha256_hex)` pairs.
    pub fn from_hashes<I, P, H>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, H)>,
        P: Into<String>,
        H: AsRef<str>,
    {
        let principals = entries
            .into_iter()
            .map(|(principal, hash)| (hash.as_ref().trim().to_ascii_lowercase(), principal.into()))
            .collect();
        Self { principals }
    }

    pub fn from_file(path: &Path) -> Result<Self, SecurityError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SecurityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: TokenFile = toml::from_str(&raw).map_err(|e| SecurityError::TokenFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        for entry in &file.tokens {
            let valid = entry.sha256.len() == 64 && hex::decode(&entry.sha256).is_ok();
            if !valid {
                return Err(SecurityError::TokenFile {
                    path: path.to_path_buf(),
                    message: format!("token for '{}' is not a hex SHA-256 digest", entry.principal),
                });
            }
        }

        let verifier = Self::from_hashes(file.tokens.into_iter().map(|t| (t.principal, t.sha256)));
        info!(path = %path.display(), token_count = verifier.len(), "Loaded token file");
        Ok(verifier)
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

#[async_trait]
impl CredentialVerifier for TokenVerifier {
    async fn verify(&self, credential: &Credential) -> Result<Identity, AuthError> {
        let Credential::Bearer(token) = credential else {
            return Err(AuthError::UnsupportedScheme(credential.scheme().to_string()));
        };
        self.principals
            .get(&hash_token(token))
            .map(Identity::new)
            .ok_or_else(|| AuthError::Rejected("unknown token".to_string()))
    }
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    scheme: &'a str,
    credential: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_principal: Option<&'a str>,
}

#[derive(Deserialize)]
struct VerifyResponse {
    principal: String,
}

/// Verifies credentials against the external security backend.
///
/// `POST {verify_url}` with `{"scheme", "credential"}`; a 2xx response with
/// `{"principal": ...}` accepts, 401/403 rejects.
pub struct RemoteVerifier {
    client: reqwest::Client,
    verify_url: String,
    service_principal: Option<String>,
}

impl RemoteVerifier {
    pub fn new(
        verify_url: impl Into<String>,
        service_principal: Option<String>,
    ) -> Result<Self, SecurityError> {
        let client = reqwest::Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .build()
            .map_err(|e| SecurityError::Client(e.to_string()))?;
        Ok(Self {
            client,
            verify_url: verify_url.into(),
            service_principal,
        })
    }
}

#[async_trait]
impl CredentialVerifier for RemoteVerifier {
    async fn verify(&self, credential: &Credential) -> Result<Identity, AuthError> {
        let body = VerifyRequest {
            scheme: credential.scheme(),
            credential: credential.secret(),
            service_principal: self.service_principal.as_deref(),
        };
        let resp = self
            .client
            .post(&self.verify_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Backend(e.without_url().to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::Rejected(format!("security backend returned {status}")));
        }
        if !status.is_success() {
            return Err(AuthError::Backend(format!("security backend returned {status}")));
        }

        let verified: VerifyResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Backend(e.without_url().to_string()))?;
        Ok(Identity::new(verified.principal))
    }
}

/// Inputs the gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub headers: &'a HeaderMap,
    pub peer: Option<SocketAddr>,
}

/// Authenticates requests before routing.
pub struct SecurityGate {
    mode: SecurityMode,
    verifier: Option<Arc<dyn CredentialVerifier>>,
    identity_header: HeaderName,
}

impl SecurityGate {
    /// A gate that admits everyone as anonymous.
    pub fn disabled() -> Self {
        Self {
            mode: SecurityMode::None,
            verifier: None,
            identity_header: HeaderName::from_static(DEFAULT_IDENTITY_HEADER),
        }
    }

    pub fn with_verifier(mode: SecurityMode, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            mode,
            verifier: Some(verifier),
            identity_header: HeaderName::from_static(DEFAULT_IDENTITY_HEADER),
        }
    }

    pub fn with_identity_header(mut self, header: HeaderName) -> Self {
        self.identity_header = header;
        self
    }

    /// Build the gate for `config`.
    ///
    /// In kerberos mode the keytab must be readable and a login descriptor is
    /// written into `workdir`.
    pub fn from_config(config: &SecurityConfig, workdir: &Path) -> Result<Self, SecurityError> {
        let identity_header = HeaderName::from_bytes(config.identity_header.as_bytes())
            .map_err(|_| SecurityError::InvalidIdentityHeader(config.identity_header.clone()))?;

        let gate = match config.mode {
            SecurityMode::None => Self::disabled(),
            SecurityMode::Token => {
                let path = config
                    .token_file
                    .as_deref()
                    .ok_or(SecurityError::MissingSetting("security.token_file", config.mode))?;
                Self::with_verifier(config.mode, Arc::new(TokenVerifier::from_file(path)?))
            }
            SecurityMode::Kerberos => {
                let principal = config
                    .principal
                    .as_deref()
                    .ok_or(SecurityError::MissingSetting("security.principal", config.mode))?;
                let keytab = config
                    .keytab
                    .as_deref()
                    .ok_or(SecurityError::MissingSetting("security.keytab", config.mode))?;
                let verify_url = config
                    .verify_url
                    .as_deref()
                    .ok_or(SecurityError::MissingSetting("security.verify_url", config.mode))?;

                enable_kerberos(workdir, keytab, principal)?;
                let verifier = RemoteVerifier::new(verify_url, Some(principal.to_string()))?;
                Self::with_verifier(config.mode, Arc::new(verifier))
            }
        };

        info!(mode = %config.mode, identity_header = %identity_header, "Security gate configured");
        Ok(gate.with_identity_header(identity_header))
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn identity_header(&self) -> &HeaderName {
        &self.identity_header
    }

    /// Authenticate one request.
    pub async fn authenticate(&self, ctx: &RequestContext<'_>) -> Result<Identity, GatewayError> {
        let Some(verifier) = &self.verifier else {
            return Ok(Identity::anonymous());
        };

        let result = match Credential::from_headers(ctx.headers) {
            Ok(Some(credential)) => verifier.verify(&credential).await,
            Ok(None) => Err(AuthError::Missing),
            Err(e) => Err(e),
        };

        match result {
            Ok(identity) => {
                debug!(principal = identity.principal(), "Caller authenticated");
                Ok(identity)
            }
            Err(err) => {
                match &err {
                    AuthError::Backend(_) => warn!(error = %err, peer = ?ctx.peer, "Credential verification failed"),
                    _ => debug!(error = %err, peer = ?ctx.peer, "Caller rejected"),
                }
                Err(match err {
                    AuthError::Backend(reason) => GatewayError::SecurityBackendUnavailable(reason),
                    other => GatewayError::AuthenticationFailure(other.to_string()),
                })
            }
        }
    }
}

/// Check the gateway's keytab and write its login descriptor into `workdir`.
fn enable_kerberos(workdir: &Path, keytab: &Path, principal: &str) -> Result<PathBuf, SecurityError> {
    let keytab_text = keytab.to_string_lossy();
    check_login_value("security.principal", principal)?;
    check_login_value("security.keytab", &keytab_text)?;
    std::fs::File::open(keytab).map_err(|source| SecurityError::Read {
        path: keytab.to_path_buf(),
        source,
    })?;

    let path = workdir.join(LOGIN_CONFIG_FILE);
    let contents = format!(
        "gateway {{\n  principal=\"{principal}\"\n  keyTab=\"{}\"\n  useKeyTab=true\n  storeKey=true\n}};\n",
        keytab_text
    );
    std::fs::write(&path, contents).map_err(|source| SecurityError::LoginConfig {
        path: path.clone(),
        source,
    })?;
    info!(principal, keytab = %keytab.display(), "Kerberos login configured");
    Ok(path)
}

/// Login descriptor values are written inside double quotes and cannot be
/// escaped, so quotes, backslashes and line breaks are refused.
fn check_login_value(setting: &'static str, value: &str) -> Result<(), SecurityError> {
    if value.contains(['"', '\\', '\n', '\r']) {
        return Err(SecurityError::UnsafeLoginValue {
            setting,
            value: value.to_string(),
        });
    }
    Ok(())
}
