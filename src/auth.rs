use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

/// Cleartext password check. The login user becomes the booking owner, so
/// with a user table configured only listed users may connect.
#[derive(Debug, Clone)]
pub struct SpotbookAuthSource {
    password: String,
    users: Arc<HashMap<String, String>>,
}

impl SpotbookAuthSource {
    pub fn new(password: String, users: HashMap<String, String>) -> Self {
        Self {
            password,
            users: Arc::new(users),
        }
    }

    /// Expected password for `user`, or `None` if the user may not log in.
    pub fn password_for(&self, user: Option<&str>) -> Option<&str> {
        let user = user.filter(|u| !u.is_empty())?;
        if self.users.is_empty() {
            Some(&self.password)
        } else {
            self.users.get(user).map(String::as_str)
        }
    }
}

/// Parse `alice:secret,bob:hunter2`. Entries without a `:` are skipped.
pub fn parse_users(list: &str) -> HashMap<String, String> {
    list.split(',')
        .filter_map(|entry| {
            let (user, password) = entry.trim().split_once(':')?;
            let user = user.trim();
            (!user.is_empty()).then(|| (user.to_string(), password.to_string()))
        })
        .collect()
}

#[async_trait]
impl AuthSource for SpotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        match self.password_for(login.user()) {
            Some(pw) => Ok(Password::new(None, pw.as_bytes().to_vec())),
            None => {
                let user = login.user().unwrap_or_default().to_string();
                tracing::warn!("login rejected for unknown user {user:?}");
                Err(PgWireError::InvalidPassword(user))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_password_for_any_user() {
        let auth = SpotbookAuthSource::new("spotbook".into(), HashMap::new());
        assert_eq!(auth.password_for(Some("alice")), Some("spotbook"));
        assert_eq!(auth.password_for(Some("bob")), Some("spotbook"));
        assert_eq!(auth.password_for(None), None);
        assert_eq!(auth.password_for(Some("")), None);
    }

    #[test]
    fn user_table_restricts_logins() {
        let auth = SpotbookAuthSource::new("spotbook".into(), parse_users("alice:a1,bob:b2"));
        assert_eq!(auth.password_for(Some("alice")), Some("a1"));
        assert_eq!(auth.password_for(Some("bob")), Some("b2"));
        assert_eq!(auth.password_for(Some("mallory")), None);
    }

    #[test]
    fn parse_users_skips_malformed_entries() {
        let users = parse_users(" alice:a1 , nocolon, :orphan, carol:with:colon,");
        assert_eq!(users.len(), 2);
        assert_eq!(users["alice"], "a1");
        assert_eq!(users["carol"], "with:colon");
    }
}
