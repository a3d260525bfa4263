use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::engine::Engine;

/// Password check for the portal: one shared password, and the login name
/// must be the admin account or the email of a registered user.
pub struct PortalAuthSource {
    engine: Arc<Engine>,
    password: String,
    admin_user: String,
}

impl PortalAuthSource {
    pub fn new(engine: Arc<Engine>, password: String, admin_user: String) -> Self {
        Self {
            engine,
            password,
            admin_user,
        }
    }

    pub fn is_known_login(&self, user: &str) -> bool {
        user == self.admin_user || self.engine.find_user_by_email(user).is_some()
    }
}

impl fmt::Debug for PortalAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalAuthSource")
            .field("admin_user", &self.admin_user)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for PortalAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if !self.is_known_login(user) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("login rejected for unknown user {user:?}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("unknown user: {user}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
