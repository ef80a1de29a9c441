use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::model::Caller;

/// Every login shares one password; the login name becomes the caller's user id.
#[derive(Debug)]
pub struct MeetbookAuthSource {
    password: String,
}

impl MeetbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for MeetbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Turn an authenticated login name into a caller. Names listed in
/// `admin_users` act as admins.
pub fn caller_from_login(user: &str, admin_users: &HashSet<String>) -> Caller {
    if admin_users.contains(user) {
        Caller::admin(user)
    } else {
        Caller::user(user)
    }
}
