//! Broker credentials and the connection key derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Credentials for a publish/subscribe broker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl BrokerCredentials {
    /// Build credentials for `host:port` with the given login.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    /// The key under which a shared connection for these credentials lives.
    #[must_use]
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// Check the credentials can address a broker at all.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyHost`] when no host is set.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyHost);
        }
        Ok(())
    }
}

impl Default for BrokerCredentials {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// `(host, port, username, password)`; at most one live connection per key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_derive_equal_keys_for_equal_credentials() {
        let a = BrokerCredentials::new("broker", 1883, "user", "secret");
        let b = BrokerCredentials::new("broker", 1883, "user", "secret");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn should_derive_distinct_keys_when_password_differs() {
        let a = BrokerCredentials::new("broker", 1883, "user", "secret");
        let b = BrokerCredentials::new("broker", 1883, "user", "other");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn should_not_leak_password_in_debug_output() {
        let creds = BrokerCredentials::new("broker", 1883, "user", "hunter2");
        let debug = format!("{creds:?} {:?}", creds.key());
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn should_reject_empty_host() {
        let creds = BrokerCredentials::new("  ", 1883, "", "");
        assert_eq!(creds.validate(), Err(ValidationError::EmptyHost));
    }
}
