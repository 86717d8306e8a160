//! Authenticated connection handle to the remote catalog service.
//!
//! Building a [`Connection`] never touches the network; it only checks that
//! every required setting is present and that the account type names a
//! supported signing scheme.

use crate::config::WriterConfig;
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Signing scheme used for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountType {
    /// Default signing scheme
    Aliyun,
    /// Secondary signing scheme
    Taobao,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Aliyun => "aliyun",
            AccountType::Taobao => "taobao",
        }
    }
}

impl FromStr for AccountType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("aliyun") {
            Ok(AccountType::Aliyun)
        } else if s.eq_ignore_ascii_case("taobao") {
            Ok(AccountType::Taobao)
        } else {
            Err(Error::UnsupportedAccountType(s.to_string()))
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access credentials. The secret never appears in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    access_id: String,
    access_key: String,
}

impl Credentials {
    pub fn access_id(&self) -> &str {
        &self.access_id
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_id", &self.access_id)
            .field("access_key", &"<redacted>")
            .finish()
    }
}

/// Immutable handle bound to (endpoint, credentials, default project).
///
/// Owned by the job and passed by reference into every remote operation.
#[derive(Debug, Clone)]
pub struct Connection {
    endpoint: String,
    tunnel_endpoint: Option<String>,
    credentials: Credentials,
    account_type: AccountType,
    default_project: String,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    /// Build a connection from writer configuration.
    pub fn from_config(config: &WriterConfig) -> Result<Self> {
        let mut builder = Connection::builder()
            .endpoint(&config.endpoint)
            .access_id(&config.access_id)
            .access_key(&config.access_key)
            .default_project(&config.project)
            .account_type(&config.account_type);
        if let Some(tunnel) = &config.tunnel_endpoint {
            builder = builder.tunnel_endpoint(tunnel);
        }
        builder.build()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Tunnel endpoint override; `None` lets the service route uploads.
    pub fn tunnel_endpoint(&self) -> Option<&str> {
        self.tunnel_endpoint.as_deref()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn account_type(&self) -> AccountType {
        self.account_type
    }

    pub fn default_project(&self) -> &str {
        &self.default_project
    }
}

/// Builder for [`Connection`].
#[derive(Debug, Default)]
pub struct ConnectionBuilder {
    endpoint: Option<String>,
    tunnel_endpoint: Option<String>,
    access_id: Option<String>,
    access_key: Option<String>,
    default_project: Option<String>,
    account_type: Option<String>,
}

impl ConnectionBuilder {
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn tunnel_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.tunnel_endpoint = Some(endpoint.into());
        self
    }

    pub fn access_id(mut self, access_id: impl Into<String>) -> Self {
        self.access_id = Some(access_id.into());
        self
    }

    pub fn access_key(mut self, access_key: impl Into<String>) -> Self {
        self.access_key = Some(access_key.into());
        self
    }

    pub fn default_project(mut self, project: impl Into<String>) -> Self {
        self.default_project = Some(project.into());
        self
    }

    /// Account type tag; defaults to `aliyun` when never set.
    pub fn account_type(mut self, account_type: impl Into<String>) -> Self {
        self.account_type = Some(account_type.into());
        self
    }

    pub fn build(self) -> Result<Connection> {
        let endpoint = required("endpoint", self.endpoint)?;
        let access_id = required("access_id", self.access_id)?;
        let access_key = required("access_key", self.access_key)?;
        let default_project = required("project", self.default_project)?;
        let account_type = match self.account_type {
            Some(tag) => tag.parse()?,
            None => AccountType::Aliyun,
        };
        let tunnel_endpoint = self.tunnel_endpoint.filter(|t| !t.trim().is_empty());

        info!(
            endpoint = %endpoint,
            project = %default_project,
            account_type = %account_type,
            "Connection configured"
        );

        Ok(Connection {
            endpoint,
            tunnel_endpoint,
            credentials: Credentials {
                access_id,
                access_key,
            },
            account_type,
            default_project,
        })
    }
}

fn required(name: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::Config(format!("{} is required", name))),
    }
}
