//! Repository lock protocol.
//!
//! A repository is either unlocked or locked by one token. Tokens carry an
//! expiry; once it passes, any caller may take the lock over. This bounds
//! how long a crashed process can keep a repository locked.
//!
//! Backends persist tokens in whatever medium they have and call
//! [`arbitrate`] to decide what a lock attempt does. Callers normally go
//! through [`RepositoryLock`] or [`with_repository_lock`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::Backend;
use cairn_common::{Error, LockToken, Result};

/// Default token lifetime.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 3600;

/// Contents of a lock token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: Uuid,
    /// Process that acquired the lock.
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// A fresh record for this process, valid for `ttl` from now.
    pub fn new(ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Decode a token. Returns `None` for tokens this version cannot read.
    pub fn from_token(token: &LockToken) -> Option<Self> {
        serde_json::from_slice(token.as_bytes()).ok()
    }

    pub fn to_token(&self) -> Result<LockToken> {
        serde_json::to_vec(self)
            .map(LockToken::from_bytes)
            .map_err(|e| Error::LockFailed(format!("Failed to encode lock token: {}", e)))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// How long granted tokens stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    ttl: Duration,
}

impl LockPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn from_secs(secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        Self::new(Duration::try_seconds(secs).unwrap_or(Duration::MAX))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A record to hand out under this policy.
    pub fn issue(&self) -> LockRecord {
        LockRecord::new(self.ttl)
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::from_secs(DEFAULT_LOCK_TTL_SECS)
    }
}

/// What a lock attempt is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockDecision {
    /// Nobody holds the lock.
    Acquire,
    /// The caller presented the token currently held.
    Renew,
    /// The held lock has expired and may be replaced.
    TakeOver { previous: LockRecord },
}

/// Decide the outcome of a lock attempt.
///
/// `held` is the token currently stored for the repository, `presented`
/// the token the caller passed in. An unreadable held token is treated as
/// valid and unexpired.
///
/// # Errors
/// - `LockFailed` when another holder owns an unexpired lock
pub fn arbitrate(
    held: Option<&LockToken>,
    presented: Option<&LockToken>,
    now: DateTime<Utc>,
) -> Result<LockDecision> {
    let held = match held {
        None => return Ok(LockDecision::Acquire),
        Some(held) => held,
    };

    if let Some(presented) = presented {
        if bool::from(held.as_bytes().ct_eq(presented.as_bytes())) {
            return Ok(LockDecision::Renew);
        }
    }

    match LockRecord::from_token(held) {
        Some(record) if record.is_expired_at(now) => {
            Ok(LockDecision::TakeOver { previous: record })
        }
        Some(record) => Err(Error::LockFailed(format!(
            "Repository is locked by process {} until {}",
            record.pid,
            record.expires_at.to_rfc3339()
        ))),
        None => Err(Error::LockFailed(
            "Repository holds a lock this version cannot read".to_string(),
        )),
    }
}

enum Hold {
    Held(LockToken),
    Advisory,
    Released,
}

/// Caller-side handle on a repository lock.
///
/// Release it explicitly with [`RepositoryLock::release`]; dropping a held
/// lock leaves the repository locked until the token expires.
pub struct RepositoryLock<'a> {
    backend: &'a dyn Backend,
    hold: Hold,
}

impl<'a> RepositoryLock<'a> {
    /// Acquire exclusive access to the repository behind `backend`.
    ///
    /// A backend without lock support yields an advisory handle instead of
    /// an error.
    ///
    /// # Errors
    /// - `LockFailed` if the repository is locked by someone else
    pub async fn acquire(backend: &'a dyn Backend) -> Result<Self> {
        let hold = match backend.lock_repository(None).await? {
            Some(token) => {
                info!(location = %backend.location(), "Repository locked");
                Hold::Held(token)
            }
            None => {
                warn!(
                    location = %backend.location(),
                    "Backend cannot lock repositories, coordinate writers out of band"
                );
                Hold::Advisory
            }
        };
        Ok(Self { backend, hold })
    }

    /// The token currently held, if the lock is enforced.
    pub fn token(&self) -> Option<&LockToken> {
        match &self.hold {
            Hold::Held(token) => Some(token),
            _ => None,
        }
    }

    /// Whether the backend gave no mutual-exclusion guarantee.
    pub fn is_advisory(&self) -> bool {
        matches!(self.hold, Hold::Advisory)
    }

    /// Extend the lock by renewing the held token.
    pub async fn refresh(&mut self) -> Result<()> {
        let current = match &self.hold {
            Hold::Held(token) => token.clone(),
            Hold::Advisory => return Ok(()),
            Hold::Released => {
                return Err(Error::LockFailed("Lock was already released".to_string()))
            }
        };

        self.hold = match self.backend.lock_repository(Some(&current)).await? {
            Some(token) => Hold::Held(token),
            None => Hold::Advisory,
        };
        Ok(())
    }

    /// Release the lock.
    pub async fn release(mut self) -> Result<()> {
        match std::mem::replace(&mut self.hold, Hold::Released) {
            Hold::Held(_) => {
                self.backend.unlock_repository().await?;
                info!(location = %self.backend.location(), "Repository unlocked");
                Ok(())
            }
            Hold::Advisory | Hold::Released => Ok(()),
        }
    }
}

impl Drop for RepositoryLock<'_> {
    fn drop(&mut self) {
        if let Hold::Held(_) = self.hold {
            warn!(
                location = %self.backend.location(),
                "Repository lock dropped without release, it stays held until it expires"
            );
        }
    }
}

/// Run `op` while holding the repository lock.
///
/// The lock is released whether or not `op` succeeds. An error from `op`
/// takes precedence over an error releasing the lock.
pub async fn with_repository_lock<T, F, Fut>(backend: &dyn Backend, op: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lock = RepositoryLock::acquire(backend).await?;
    let outcome = op().await;
    let released = lock.release().await;

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!(error = %release_err, "Failed to release repository lock after error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::NoLockBackend;
    use crate::memory::MemoryBackend;

    fn token_with_ttl(ttl: Duration) -> LockToken {
        LockRecord::new(ttl).to_token().unwrap()
    }

    #[test]
    fn test_arbitrate_unlocked_acquires() {
        assert_eq!(arbitrate(None, None, Utc::now()).unwrap(), LockDecision::Acquire);
    }

    #[test]
    fn test_arbitrate_matching_token_renews() {
        let held = token_with_ttl(Duration::minutes(5));
        let decision = arbitrate(Some(&held), Some(&held.clone()), Utc::now()).unwrap();
        assert_eq!(decision, LockDecision::Renew);
    }

    #[test]
    fn test_arbitrate_foreign_token_fails() {
        let held = token_with_ttl(Duration::minutes(5));
        let foreign = token_with_ttl(Duration::minutes(5));

        assert!(matches!(
            arbitrate(Some(&held), Some(&foreign), Utc::now()),
            Err(Error::LockFailed(_))
        ));
        assert!(matches!(
            arbitrate(Some(&held), None, Utc::now()),
            Err(Error::LockFailed(_))
        ));
    }

    #[test]
    fn test_arbitrate_expired_lock_taken_over() {
        let held = token_with_ttl(Duration::minutes(5));
        let later = Utc::now() + Duration::minutes(10);

        match arbitrate(Some(&held), None, later).unwrap() {
            LockDecision::TakeOver { previous } => {
                assert_eq!(Some(previous), LockRecord::from_token(&held));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_arbitrate_unreadable_token_fails_closed() {
        let held = LockToken::from_bytes(b"not json".to_vec());
        let later = Utc::now() + Duration::days(365);
        assert!(matches!(
            arbitrate(Some(&held), None, later),
            Err(Error::LockFailed(_))
        ));
    }

    #[test]
    fn test_policy_from_secs() {
        assert_eq!(LockPolicy::from_secs(90).ttl(), Duration::seconds(90));
        assert_eq!(LockPolicy::default().ttl(), Duration::hours(1));
    }

    #[tokio::test]
    async fn test_guard_acquire_and_release() {
        let backend = MemoryBackend::new();

        let lock = RepositoryLock::acquire(&backend).await.unwrap();
        assert!(!lock.is_advisory());
        assert!(!lock.token().unwrap().is_empty());

        assert!(RepositoryLock::acquire(&backend).await.is_err());

        lock.release().await.unwrap();
        let again = RepositoryLock::acquire(&backend).await.unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_refresh_replaces_token() {
        let backend = MemoryBackend::new();

        let mut lock = RepositoryLock::acquire(&backend).await.unwrap();
        let first = lock.token().cloned().unwrap();
        lock.refresh().await.unwrap();
        let second = lock.token().cloned().unwrap();

        assert_ne!(first, second);
        assert!(backend.lock_repository(Some(&first)).await.is_err());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_advisory_when_unsupported() {
        let backend = NoLockBackend::new(MemoryBackend::new());

        let lock = RepositoryLock::acquire(&backend).await.unwrap();
        assert!(lock.is_advisory());
        assert!(lock.token().is_none());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_repository_lock_releases_on_error() {
        let backend = MemoryBackend::new();

        let result: Result<()> = with_repository_lock(&backend, || async {
            Err(Error::StoreRepositoryFailed("disk full".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::StoreRepositoryFailed(_))));

        let repo = &backend;
        let value = with_repository_lock(repo, move || async move {
            repo.save_repository(b"meta").await?;
            repo.load_repository().await
        })
        .await
        .unwrap();
        assert_eq!(value, b"meta");
    }
}
