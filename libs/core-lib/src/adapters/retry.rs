use crate::{AccountMetadata, AuthenticatedAccount, IdentityError, IdentityProvider};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub const MAX_ALLOWED_ATTEMPTS: u32 = 5;

/// Bounded exponential backoff for identity provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Attempts are clamped to `1..=5`.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ALLOWED_ATTEMPTS),
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base, ... capped.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, IdentityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IdentityError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let wait = self.calculate_backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Transient identity provider failure, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Decorates any `IdentityProvider` with the retry policy.
pub struct RetryingIdentityProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: IdentityProvider> RetryingIdentityProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<P: IdentityProvider> IdentityProvider for RetryingIdentityProvider<P> {
    async fn create_account(
        &self,
        email: &str,
        password: &str,
        metadata: &AccountMetadata,
    ) -> Result<Uuid, IdentityError> {
        let attempts = AtomicU32::new(0);
        let created = self
            .policy
            .run("create_account", || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.inner.create_account(email, password, metadata)
            })
            .await;

        // A retry that hits AlreadyExists may be seeing the account an earlier
        // attempt created before its reply was lost. If our password opens it, it is ours.
        match created {
            Err(IdentityError::AlreadyExists) if attempts.load(Ordering::Relaxed) > 1 => {
                match self.authenticate(email, password).await {
                    Ok(account) => {
                        warn!(
                            account_id = %account.account_id,
                            "Recovered account created by an interrupted attempt"
                        );
                        Ok(account.account_id)
                    }
                    Err(_) => Err(IdentityError::AlreadyExists),
                }
            }
            other => other,
        }
    }

    async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthenticatedAccount, IdentityError> {
        self.policy
            .run("authenticate", || self.inner.authenticate(email, password))
            .await
    }

    async fn rotate_password(
        &self,
        account_id: Uuid,
        new_password: &str,
    ) -> Result<(), IdentityError> {
        self.policy
            .run("rotate_password", || {
                self.inner.rotate_password(account_id, new_password)
            })
            .await
    }

    async fn account_email(&self, account_id: Uuid) -> Result<String, IdentityError> {
        self.policy
            .run("account_email", || self.inner.account_email(account_id))
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthenticatedAccount, IdentityError> {
        self.policy
            .run("refresh", || self.inner.refresh(refresh_token))
            .await
    }

    async fn delete_account(&self, account_id: Uuid) -> Result<(), IdentityError> {
        self.policy
            .run("delete_account", || self.inner.delete_account(account_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokenPair;
    use crate::adapters::in_memory_identity::InMemoryIdentityProvider;
    use std::sync::Mutex;

    /// Fails with the queued errors in order, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        failures: Mutex<Vec<IdentityError>>,
    }

    impl Flaky {
        fn new(failures: Vec<IdentityError>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures: Mutex::new(failures),
            }
        }

        fn next(&self) -> Result<(), IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.remove(0))
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for Flaky {
        async fn create_account(&self, _: &str, _: &str, _: &AccountMetadata) -> Result<Uuid, IdentityError> {
            self.next().map(|_| Uuid::nil())
        }

        async fn authenticate(&self, email: &str, _: &str) -> Result<AuthenticatedAccount, IdentityError> {
            self.next().map(|_| AuthenticatedAccount {
                account_id: Uuid::nil(),
                email: email.to_string(),
                metadata: AccountMetadata::default(),
                tokens: TokenPair {
                    access_token: "a".into(),
                    refresh_token: "r".into(),
                    expires_in: 3600,
                },
            })
        }

        async fn rotate_password(&self, _: Uuid, _: &str) -> Result<(), IdentityError> {
            self.next()
        }

        async fn account_email(&self, _: Uuid) -> Result<String, IdentityError> {
            self.next().map(|_| "flaky@example.com".to_string())
        }

        async fn refresh(&self, _: &str) -> Result<AuthenticatedAccount, IdentityError> {
            self.authenticate("r@example.com", "").await
        }

        async fn delete_account(&self, _: Uuid) -> Result<(), IdentityError> {
            self.next()
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500));
        assert_eq!(policy.calculate_backoff(0), Duration::ZERO);
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(500));
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.calculate_backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.calculate_backoff(6), Duration::from_secs(8));
        assert_eq!(policy.calculate_backoff(40), Duration::from_secs(8));
    }

    #[test]
    fn test_attempts_are_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryPolicy::new(9, Duration::ZERO).max_attempts, 5);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = RetryingIdentityProvider::new(
            Flaky::new(vec![IdentityError::Timeout, IdentityError::Network("reset".into())]),
            fast_policy(3),
        );
        let account = provider.authenticate("a@example.com", "pw").await.unwrap();
        assert_eq!(account.email, "a@example.com");
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let provider = RetryingIdentityProvider::new(
            Flaky::new(vec![IdentityError::Timeout; 5]),
            fast_policy(3),
        );
        let err = provider.refresh("token").await.unwrap_err();
        assert_eq!(err, IdentityError::Timeout);
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_errors_are_not_retried() {
        for failure in [
            IdentityError::InvalidCredentials,
            IdentityError::EmailUnconfirmed,
            IdentityError::RateLimited,
            IdentityError::AlreadyExists,
        ] {
            let provider = RetryingIdentityProvider::new(Flaky::new(vec![failure.clone()]), fast_policy(5));
            let err = provider.authenticate("a@example.com", "pw").await.unwrap_err();
            assert_eq!(err, failure);
            assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_create_with_lost_reply_recovers_the_account() {
        let idp = InMemoryIdentityProvider::default();
        idp.lose_next_create_reply();
        let provider = RetryingIdentityProvider::new(idp.clone(), fast_policy(3));

        let id = provider
            .create_account("late@example.com", "Secret123", &AccountMetadata::default())
            .await
            .unwrap();
        assert_eq!(idp.account_count(), 1);
        assert_eq!(idp.account_id_for("late@example.com"), Some(id));
    }

    #[tokio::test]
    async fn test_existing_account_of_someone_else_is_still_a_conflict() {
        let idp = InMemoryIdentityProvider::default();
        idp.create_account("taken@example.com", "Theirs123", &AccountMetadata::default())
            .await
            .unwrap();
        idp.fail_next_create(IdentityError::Timeout);
        let provider = RetryingIdentityProvider::new(idp.clone(), fast_policy(3));

        let err = provider
            .create_account("taken@example.com", "Mine4567", &AccountMetadata::default())
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::AlreadyExists);
        assert_eq!(idp.account_count(), 1);
    }
}
