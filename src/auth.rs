use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::engine::Engine;

/// Shared-password login. The user name must be the configured admin or a
/// registered ledger user; it becomes the caller for every statement.
pub struct LedgerAuthSource {
    engine: Arc<Engine>,
    admin_user: String,
    password: String,
}

impl std::fmt::Debug for LedgerAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerAuthSource")
            .field("admin_user", &self.admin_user)
            .finish_non_exhaustive()
    }
}

impl LedgerAuthSource {
    pub fn new(engine: Arc<Engine>, admin_user: String, password: String) -> Self {
        Self {
            engine,
            admin_user,
            password,
        }
    }
}

#[async_trait]
impl AuthSource for LedgerAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if self.engine.resolve_caller(user, &self.admin_user).is_none() {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!(user, "login refused for unknown user");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("unknown user: {user}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
