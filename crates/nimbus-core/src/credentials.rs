use std::fmt;
use zeroize::Zeroize;

/// Authorization material for the account a provider serves.
///
/// Secrets are wiped when the value is dropped and never appear in `Debug`
/// output.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    /// Not resolved yet, or the account needs none.
    #[default]
    None,
    OAuth1 {
        consumer_key: String,
        consumer_secret: String,
        token: String,
        token_secret: String,
    },
    OAuth2 {
        access_token: String,
    },
    Password {
        username: String,
        password: String,
    },
}

impl Credentials {
    pub fn is_none(&self) -> bool {
        matches!(self, Credentials::None)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("Credentials::None"),
            Credentials::OAuth1 { consumer_key, .. } => f
                .debug_struct("Credentials::OAuth1")
                .field("consumer_key", consumer_key)
                .field("consumer_secret", &"[REDACTED]")
                .field("token", &"[REDACTED]")
                .field("token_secret", &"[REDACTED]")
                .finish(),
            Credentials::OAuth2 { .. } => f
                .debug_struct("Credentials::OAuth2")
                .field("access_token", &"[REDACTED]")
                .finish(),
            Credentials::Password { username, .. } => f
                .debug_struct("Credentials::Password")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        match self {
            Credentials::None => {}
            Credentials::OAuth1 {
                consumer_key,
                consumer_secret,
                token,
                token_secret,
            } => {
                consumer_key.zeroize();
                consumer_secret.zeroize();
                token.zeroize();
                token_secret.zeroize();
            }
            Credentials::OAuth2 { access_token } => access_token.zeroize(),
            Credentials::Password { username, password } => {
                username.zeroize();
                password.zeroize();
            }
        }
    }
}
