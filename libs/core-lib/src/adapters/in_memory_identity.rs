use crate::{AccountMetadata, AuthenticatedAccount, IdentityError, IdentityProvider, TokenPair};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString,
};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Matches the hosted provider's minimum password length.
const MIN_PROVIDER_PASSWORD_LEN: usize = 6;
const TOKEN_TTL_SECONDS: u64 = 3600;

#[derive(Debug, Clone)]
struct LocalAccount {
    id: Uuid,
    email: String,
    password_hash: String,
    metadata: AccountMetadata,
    email_confirmed: bool,
}

/// Local identity provider that keeps argon2 password hashes in memory.
/// Used when no hosted provider is configured and throughout the test suite.
#[derive(Debug, Clone)]
pub struct InMemoryIdentityProvider {
    accounts: Arc<DashMap<Uuid, LocalAccount>>,
    by_email: Arc<DashMap<String, Uuid>>,
    refresh_tokens: Arc<DashMap<String, Uuid>>,
    auto_confirm: bool,
    next_create_failure: Arc<Mutex<Option<IdentityError>>>,
    lose_next_create_reply: Arc<AtomicBool>,
}

impl Default for InMemoryIdentityProvider {
    fn default() -> Self {
        Self::new(true)
    }
}

fn random_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

fn hash_password(password: &str) -> Result<String, IdentityError> {
    let salt_bytes: [u8; 16] = rand::rng().random();
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| IdentityError::Unexpected(format!("salt encoding failed: {e}")))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| IdentityError::Unexpected(format!("password hashing failed: {e}")))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

impl InMemoryIdentityProvider {
    /// `auto_confirm = false` leaves new accounts unconfirmed until
    /// [`confirm_email`](Self::confirm_email) is called.
    pub fn new(auto_confirm: bool) -> Self {
        Self {
            accounts: Arc::new(DashMap::new()),
            by_email: Arc::new(DashMap::new()),
            refresh_tokens: Arc::new(DashMap::new()),
            auto_confirm,
            next_create_failure: Arc::new(Mutex::new(None)),
            lose_next_create_reply: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn confirm_email(&self, account_id: Uuid) {
        if let Some(mut account) = self.accounts.get_mut(&account_id) {
            account.email_confirmed = true;
        }
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn account_id_for(&self, email: &str) -> Option<Uuid> {
        self.by_email.get(&email.to_lowercase()).map(|id| *id)
    }

    /// Makes the next `create_account` call fail with `error`.
    pub fn fail_next_create(&self, error: IdentityError) {
        if let Ok(mut slot) = self.next_create_failure.lock() {
            *slot = Some(error);
        }
    }

    /// The next `create_account` stores the account but reports `Timeout`,
    /// as when the reply is lost on the way back.
    pub fn lose_next_create_reply(&self) {
        self.lose_next_create_reply.store(true, Ordering::SeqCst);
    }

    fn issue_session(&self, account: &LocalAccount) -> AuthenticatedAccount {
        let refresh_token = random_token();
        self.refresh_tokens.insert(refresh_token.clone(), account.id);
        AuthenticatedAccount {
            account_id: account.id,
            email: account.email.clone(),
            metadata: account.metadata.clone(),
            tokens: TokenPair {
                access_token: random_token(),
                refresh_token,
                expires_in: TOKEN_TTL_SECONDS,
            },
        }
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn create_account(
        &self,
        email: &str,
        password: &str,
        metadata: &AccountMetadata,
    ) -> Result<Uuid, IdentityError> {
        if let Some(error) = self.next_create_failure.lock().ok().and_then(|mut s| s.take()) {
            return Err(error);
        }
        if password.chars().count() < MIN_PROVIDER_PASSWORD_LEN {
            return Err(IdentityError::WeakPassword(format!(
                "Password should be at least {MIN_PROVIDER_PASSWORD_LEN} characters"
            )));
        }

        let key = email.trim().to_lowercase();
        let password_hash = hash_password(password)?;
        let id = Uuid::new_v4();

        match self.by_email.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(IdentityError::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        self.accounts.insert(
            id,
            LocalAccount {
                id,
                email: key,
                password_hash,
                metadata: metadata.clone(),
                email_confirmed: self.auto_confirm,
            },
        );
        if self.lose_next_create_reply.swap(false, Ordering::SeqCst) {
            return Err(IdentityError::Timeout);
        }
        Ok(id)
    }

    async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthenticatedAccount, IdentityError> {
        let id = self
            .account_id_for(email.trim())
            .ok_or(IdentityError::InvalidCredentials)?;
        let account = self
            .accounts
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(IdentityError::InvalidCredentials)?;

        if !verify_password(password, &account.password_hash) {
            return Err(IdentityError::InvalidCredentials);
        }
        if !account.email_confirmed {
            return Err(IdentityError::EmailUnconfirmed);
        }
        Ok(self.issue_session(&account))
    }

    async fn rotate_password(
        &self,
        account_id: Uuid,
        new_password: &str,
    ) -> Result<(), IdentityError> {
        if new_password.chars().count() < MIN_PROVIDER_PASSWORD_LEN {
            return Err(IdentityError::WeakPassword(format!(
                "Password should be at least {MIN_PROVIDER_PASSWORD_LEN} characters"
            )));
        }
        let hash = hash_password(new_password)?;
        let mut account = self
            .accounts
            .get_mut(&account_id)
            .ok_or(IdentityError::NotFound)?;
        account.password_hash = hash;
        Ok(())
    }

    async fn account_email(&self, account_id: Uuid) -> Result<String, IdentityError> {
        self.accounts
            .get(&account_id)
            .map(|a| a.email.clone())
            .ok_or(IdentityError::NotFound)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthenticatedAccount, IdentityError> {
        // Refresh tokens are single use.
        let (_, account_id) = self
            .refresh_tokens
            .remove(refresh_token)
            .ok_or(IdentityError::InvalidToken)?;
        let account = self
            .accounts
            .get(&account_id)
            .map(|a| a.value().clone())
            .ok_or(IdentityError::InvalidToken)?;
        Ok(self.issue_session(&account))
    }

    async fn delete_account(&self, account_id: Uuid) -> Result<(), IdentityError> {
        let (_, account) = self
            .accounts
            .remove(&account_id)
            .ok_or(IdentityError::NotFound)?;
        self.by_email.remove(&account.email);
        self.refresh_tokens.retain(|_, id| *id != account_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::user::UserRole;

    fn metadata() -> AccountMetadata {
        AccountMetadata {
            role: Some(UserRole::Driver),
            force_password_change: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_authenticate() {
        let idp = InMemoryIdentityProvider::default();
        let id = idp
            .create_account("Driver@Example.com", "Secret123!", &metadata())
            .await
            .unwrap();

        let session = idp.authenticate("driver@example.com", "Secret123!").await.unwrap();
        assert_eq!(session.account_id, id);
        assert_eq!(session.metadata.role, Some(UserRole::Driver));
        assert!(session.metadata.force_password_change);
        assert_ne!(session.tokens.access_token, session.tokens.refresh_token);
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let idp = InMemoryIdentityProvider::default();
        idp.create_account("a@example.com", "Secret123!", &metadata()).await.unwrap();
        let err = idp
            .create_account("A@example.com", "Secret123!", &metadata())
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::AlreadyExists);
        assert_eq!(idp.account_count(), 1);
    }

    #[tokio::test]
    async fn test_wrong_password_and_unconfirmed() {
        let idp = InMemoryIdentityProvider::new(false);
        let id = idp.create_account("u@example.com", "Secret123!", &metadata()).await.unwrap();

        assert_eq!(
            idp.authenticate("u@example.com", "nope").await.unwrap_err(),
            IdentityError::InvalidCredentials
        );
        assert_eq!(
            idp.authenticate("u@example.com", "Secret123!").await.unwrap_err(),
            IdentityError::EmailUnconfirmed
        );
        idp.confirm_email(id);
        assert!(idp.authenticate("u@example.com", "Secret123!").await.is_ok());
    }

    #[tokio::test]
    async fn test_rotate_password() {
        let idp = InMemoryIdentityProvider::default();
        let id = idp.create_account("r@example.com", "Secret123!", &metadata()).await.unwrap();
        idp.rotate_password(id, "Another456!").await.unwrap();
        assert!(idp.authenticate("r@example.com", "Secret123!").await.is_err());
        assert!(idp.authenticate("r@example.com", "Another456!").await.is_ok());
        assert!(matches!(
            idp.rotate_password(id, "abc").await,
            Err(IdentityError::WeakPassword(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_is_single_use() {
        let idp = InMemoryIdentityProvider::default();
        idp.create_account("s@example.com", "Secret123!", &metadata()).await.unwrap();
        let session = idp.authenticate("s@example.com", "Secret123!").await.unwrap();

        let refreshed = idp.refresh(&session.tokens.refresh_token).await.unwrap();
        assert_eq!(refreshed.account_id, session.account_id);
        assert_eq!(
            idp.refresh(&session.tokens.refresh_token).await.unwrap_err(),
            IdentityError::InvalidToken
        );
    }

    #[tokio::test]
    async fn test_delete_frees_email() {
        let idp = InMemoryIdentityProvider::default();
        let id = idp.create_account("x@example.com", "Secret123!", &metadata()).await.unwrap();
        idp.delete_account(id).await.unwrap();
        assert_eq!(idp.account_count(), 0);
        idp.create_account("x@example.com", "Secret123!", &metadata()).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let idp = InMemoryIdentityProvider::default();
        idp.fail_next_create(IdentityError::WeakPassword("too common".into()));
        assert!(idp.create_account("y@example.com", "Secret123!", &metadata()).await.is_err());
        assert!(idp.create_account("y@example.com", "Secret123!", &metadata()).await.is_ok());
    }
}
