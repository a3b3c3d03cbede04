//! Credentials and access-token caching.
//!
//! OAuth flows and credential persistence are a host concern; this module
//! only holds the blob a host hands the engine and caches the access token
//! it's exchanged for, with a safety margin before expiry.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol_constants::TOKEN_EXPIRY_SAFETY_MARGIN_SECS;

/// A reusable authentication blob (refresh token / stored credentials) or a
/// directly-supplied access token. Opaque to the engine beyond what's
/// needed to request a fresh access token.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// A reusable blob the host obtained out-of-band (e.g. from a previous
    /// OAuth flow) that can be exchanged for access tokens repeatedly.
    Reusable(Vec<u8>),
    /// A single access token with a known lifetime, not renewable by the
    /// engine itself.
    AccessToken { token: String, expires_in: Duration },
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Caches the current access token, refreshing it with a safety margin
/// before it actually expires. Refresh deduplication (a single in-flight
/// refresh serving all waiters) is the responsibility of
/// `crate::session::Session::get_access_token`, which holds this cache
/// behind its own lock.
pub struct AccessTokenCache {
    cached: Mutex<Option<CachedToken>>,
}

impl AccessTokenCache {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached token if it is still valid outside the safety
    /// margin, `None` if a refresh is needed.
    pub fn get(&self) -> Option<String> {
        let guard = self.cached.lock();
        let cached = guard.as_ref()?;
        let margin = Duration::from_secs(TOKEN_EXPIRY_SAFETY_MARGIN_SECS);
        if Instant::now() + margin < cached.expires_at {
            Some(cached.token.clone())
        } else {
            None
        }
    }

    pub fn set(&self, token: String, ttl: Duration) {
        *self.cached.lock() = Some(CachedToken {
            token,
            expires_at: Instant::now() + ttl,
        });
    }

    /// Drops the cached token, forcing the next `get()` to miss.
    pub fn clear(&self) {
        *self.cached.lock() = None;
    }
}

impl Default for AccessTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_returned() {
        let cache = AccessTokenCache::new();
        cache.set("tok".into(), Duration::from_secs(3600));
        assert_eq!(cache.get(), Some("tok".to_string()));
    }

    #[test]
    fn token_within_safety_margin_is_treated_as_expired() {
        let cache = AccessTokenCache::new();
        cache.set("tok".into(), Duration::from_secs(10));
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn empty_cache_returns_none() {
        let cache = AccessTokenCache::new();
        assert_eq!(cache.get(), None);
    }
}
