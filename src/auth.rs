use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::info;

/// AuthRegistry decides which USERIDs may use the proxy.
///
/// One registry is shared by every connection of a server. While
/// authentication is disabled every USERID is accepted, the empty one
/// included.
#[derive(Debug, Default)]
pub struct AuthRegistry {
    inner: RwLock<AuthState>,
}

#[derive(Debug, Default)]
struct AuthState {
    enabled: bool,
    users: HashSet<String>,
}

/// AuthRegistry implementation block
impl AuthRegistry {
    /// new builds a registry with authentication disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// with_users builds a registry that only accepts `users`
    pub fn with_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: RwLock::new(AuthState {
                enabled: true,
                users: users.into_iter().map(Into::into).collect(),
            }),
        }
    }

    /// is_valid reports whether `user_id` may proceed
    pub async fn is_valid(&self, user_id: &str) -> bool {
        self.is_valid_raw(user_id.as_bytes()).await
    }

    /// is_valid_raw checks a USERID exactly as it came off the wire. Bytes
    /// that are not UTF-8 never match an accepted user
    pub async fn is_valid_raw(&self, user_id: &[u8]) -> bool {
        let state = self.inner.read().await;
        if !state.enabled {
            return true;
        }

        std::str::from_utf8(user_id).is_ok_and(|user| state.users.contains(user))
    }

    /// add_user accepts `user_id` from now on. Adding a user switches
    /// authentication on
    pub async fn add_user(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        let mut state = self.inner.write().await;

        if !state.enabled {
            info!("authentication enabled");
        }
        state.enabled = true;
        state.users.insert(user_id);
    }

    /// set_users replaces the accepted set, leaving the enabled flag alone
    pub async fn set_users<I, S>(&self, users: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let users = users.into_iter().map(Into::into).collect();
        self.inner.write().await.users = users;
    }

    /// valid_users returns a snapshot of the accepted set
    pub async fn valid_users(&self) -> HashSet<String> {
        self.inner.read().await.users.clone()
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.inner.write().await.enabled = enabled;
        info!("authentication {}", if enabled { "enabled" } else { "disabled" });
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.read().await.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_accepts_everyone() {
        let auth = AuthRegistry::new();
        assert!(!auth.is_enabled().await);
        assert!(auth.is_valid("").await);
        assert!(auth.is_valid("anyone").await);
    }

    #[tokio::test]
    async fn add_user_enables() {
        let auth = AuthRegistry::new();
        auth.add_user("alice").await;

        assert!(auth.is_enabled().await);
        assert!(auth.is_valid("alice").await);
        assert!(!auth.is_valid("bob").await);
        assert!(!auth.is_valid("").await);
    }

    #[tokio::test]
    async fn enabled_without_users_rejects_all() {
        let auth = AuthRegistry::new();
        auth.set_enabled(true).await;

        assert!(!auth.is_valid("").await);
        assert!(!auth.is_valid("alice").await);
    }

    #[tokio::test]
    async fn disabling_keeps_users() {
        let auth = AuthRegistry::with_users(["alice"]);
        auth.set_enabled(false).await;

        assert!(auth.is_valid("mallory").await);
        assert!(auth.valid_users().await.contains("alice"));

        auth.set_enabled(true).await;
        assert!(!auth.is_valid("mallory").await);
    }

    #[tokio::test]
    async fn set_users_does_not_touch_flag() {
        let auth = AuthRegistry::new();
        auth.set_users(["alice", "bob"]).await;

        assert!(!auth.is_enabled().await);
        assert!(auth.is_valid("carol").await);

        auth.set_enabled(true).await;
        assert!(auth.is_valid("bob").await);
        assert!(!auth.is_valid("carol").await);

        auth.set_users(Vec::<String>::new()).await;
        assert!(auth.is_enabled().await);
        assert!(!auth.is_valid("bob").await);
    }

    #[tokio::test]
    async fn non_utf8_user_never_matches() {
        let auth = AuthRegistry::new();
        assert!(auth.is_valid_raw(&[0xFF, 0x00]).await);

        auth.add_user("\u{FFFD}").await;
        assert!(auth.is_valid_raw("\u{FFFD}".as_bytes()).await);
        assert!(!auth.is_valid_raw(&[0xFF]).await);
        assert!(!auth.is_valid_raw(&[0xC3, 0x28]).await);
    }
}
