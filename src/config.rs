//! Connection configuration.
//!
//! Opening the transport (DNS resolution, TCP connect, choosing TLS vs Unix
//! socket) is the caller's job; `Config` only carries what the connection
//! state machine needs once a byte stream already exists: who to authenticate
//! as, which database to attach to, and how to react to the server's SSL
//! negotiation response.

/// How to react to the server's SSL negotiation response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never send `SSLRequest`; always speak plaintext.
    Disable,
    /// Send `SSLRequest`; upgrade to TLS if the server accepts, fall back to
    /// plaintext if it doesn't.
    #[default]
    Prefer,
    /// Send `SSLRequest`; fail the connection if the server doesn't accept.
    Require,
}

/// Parameters needed to authenticate and start a session on an already-open
/// byte stream.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database role name.
    pub user: String,
    /// Database to attach to. Defaults to `user` if omitted by the server.
    pub database: Option<String>,
    /// Password used for cleartext, MD5, or SCRAM authentication.
    pub password: Option<String>,
    /// Reported via the `application_name` startup parameter.
    pub application_name: Option<String>,
    /// SSL negotiation behavior.
    pub ssl_mode: SslMode,
    /// Extra startup parameters beyond user/database/application_name.
    pub params: Vec<(String, String)>,
}

impl Config {
    /// Start building a config for the given role name.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            database: None,
            password: None,
            application_name: None,
            ssl_mode: SslMode::default(),
            params: Vec::new(),
        }
    }

    /// Set the database to attach to.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the SSL mode.
    #[must_use]
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// The startup-message parameter list: `user`, optional `database` and
    /// `application_name`, then any extra params, in that order.
    pub fn startup_params(&self) -> Vec<(&str, &str)> {
        let mut params = vec![("user", self.user.as_str())];
        if let Some(database) = &self.database {
            params.push(("database", database.as_str()));
        }
        if let Some(application_name) = &self.application_name {
            params.push(("application_name", application_name.as_str()));
        }
        for (k, v) in &self.params {
            params.push((k.as_str(), v.as_str()));
        }
        params
    }
}
