//! Who is the local user?

use std::sync::Mutex;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub user_id: Uuid,
}

impl CurrentUser {
    #[must_use]
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }
}

#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The signed-in user, if any. May suspend on a session lookup.
    async fn current_user(&self) -> Option<CurrentUser>;
}

/// Identity fixed by the host (config, CLI flag, or an already-validated session).
#[derive(Debug, Default)]
pub struct StaticIdentity {
    user: Mutex<Option<CurrentUser>>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new(user: Option<CurrentUser>) -> Self {
        Self { user: Mutex::new(user) }
    }

    #[must_use]
    pub fn signed_in(user_id: Uuid) -> Self {
        Self::new(Some(CurrentUser::new(user_id)))
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self::new(None)
    }

    pub fn set(&self, user: Option<CurrentUser>) {
        *self.user.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = user;
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<CurrentUser> {
        self.user
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
