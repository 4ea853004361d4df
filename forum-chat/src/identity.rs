//! Sender identity.
//!
//! Issuing and checking identity tokens belongs to the auth service. The
//! hub only needs to know, per connection, who is talking and whether
//! the token they presented was valid. That decision sits behind
//! [`TokenValidator`].

use url::form_urlencoded;

/// Username used when the upgrade request carries none.
pub const ANONYMOUS_USERNAME: &str = "anonymous";

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    /// Only authenticated senders have their messages persisted.
    pub authenticated: bool,
}

impl Identity {
    pub fn authenticated(user_id: i64, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            authenticated: true,
        }
    }

    pub fn unauthenticated(user_id: i64, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            authenticated: false,
        }
    }
}

/// Decides whether a presented token is valid for a user id.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str, user_id: i64) -> bool;
}

/// Accepts one shared secret for every user.
#[derive(Debug, Clone)]
pub struct SharedSecret {
    secret: String,
}

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl TokenValidator for SharedSecret {
    fn validate(&self, token: &str, _user_id: i64) -> bool {
        !self.secret.is_empty() && token == self.secret
    }
}

/// Treats every connection as unauthenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

impl TokenValidator for RejectAll {
    fn validate(&self, _token: &str, _user_id: i64) -> bool {
        false
    }
}

/// Connection parameters carried in the upgrade request query string:
/// `?token=...&user_id=...&username=...`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
}

impl ConnectParams {
    /// Parse from a raw (percent-encoded) query string. Unknown keys and
    /// unparsable user ids are ignored.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "token" if !value.is_empty() => params.token = Some(value.into_owned()),
                "user_id" => params.user_id = value.parse().ok(),
                "username" if !value.trim().is_empty() => {
                    params.username = Some(value.into_owned())
                }
                _ => {}
            }
        }
        params
    }

    /// Render as a query string (without the leading `?`).
    pub fn to_query(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        if let Some(token) = &self.token {
            query.append_pair("token", token);
        }
        if let Some(user_id) = self.user_id {
            query.append_pair("user_id", &user_id.to_string());
        }
        if let Some(username) = &self.username {
            query.append_pair("username", username);
        }
        query.finish()
    }

    /// Resolve into an identity. A missing or rejected token yields an
    /// unauthenticated identity; the connection is still accepted.
    pub fn resolve(&self, validator: &dyn TokenValidator) -> Identity {
        let user_id = self.user_id.unwrap_or(0);
        let username = self
            .username
            .clone()
            .unwrap_or_else(|| ANONYMOUS_USERNAME.to_string());

        let valid = self
            .token
            .as_deref()
            .is_some_and(|token| validator.validate(token, user_id));

        if valid {
            Identity::authenticated(user_id, username)
        } else {
            Identity::unauthenticated(user_id, username)
        }
    }
}
