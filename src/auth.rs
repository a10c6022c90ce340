use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::Actor;

/// Map a connection user to an actor: the admin user is the business, a
/// ULID is that customer, anything else is refused.
pub fn resolve_actor(user: &str, admin_user: &str) -> Result<Actor, EngineError> {
    if user == admin_user {
        return Ok(Actor::Business);
    }
    Ulid::from_string(user)
        .map(Actor::Customer)
        .map_err(|_| EngineError::Unauthorized)
}

/// Shared-password authentication that also refuses users which do not
/// resolve to an actor.
#[derive(Debug)]
pub struct BookdAuthSource {
    password: String,
    admin_user: String,
}

impl BookdAuthSource {
    pub fn new(password: String, admin_user: String) -> Self {
        Self { password, admin_user }
    }
}

#[async_trait]
impl AuthSource for BookdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if let Err(e) = resolve_actor(user, &self.admin_user) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!(user, "login refused: {e}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user {user:?} is neither the admin user nor a customer id"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
