use chrono::{DateTime, Duration, Utc};
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

pub const TOKEN_BYTES: usize = 32;

/// Issues a parent-link token: 32 bytes from the thread-local CSPRNG,
/// digested and hex encoded into 64 characters.
pub fn generate() -> String {
    let bytes: [u8; TOKEN_BYTES] = thread_rng().gen();

    let mut hasher: Sha256 = Digest::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Tokens are matched verbatim, so anything that could never have been issued
/// is rejected before touching the store.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_BYTES * 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Lifetime of parent-link tokens. `None` keeps them valid forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenPolicy {
    pub ttl: Option<Duration>,
}

impl TokenPolicy {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }

    pub fn is_live(&self, issued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.ttl {
            // A deadline past the calendar's end never arrives.
            Some(ttl) => issued_at.checked_add_signed(ttl).map_or(true, |deadline| now < deadline),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ten_thousand_tokens_are_distinct() {
        let tokens: HashSet<String> = (0..10_000).map(|_| generate()).collect();
        assert_eq!(tokens.len(), 10_000);
    }

    #[test]
    fn generated_tokens_are_well_formed() {
        let token = generate();
        assert_eq!(token.len(), 64);
        assert!(is_well_formed(&token));
        assert!(!is_well_formed("abc"));
        assert!(!is_well_formed(&"z".repeat(64)));
    }

    #[test]
    fn ttl_is_optional() {
        let issued = Utc::now() - Duration::days(400);
        assert!(TokenPolicy::default().is_live(issued, Utc::now()));
        assert!(!TokenPolicy::with_ttl(Duration::days(365)).is_live(issued, Utc::now()));
        assert!(TokenPolicy::with_ttl(Duration::days(500)).is_live(issued, Utc::now()));
    }

    #[test]
    fn ttl_past_the_calendar_end_never_expires() {
        let policy = TokenPolicy::with_ttl(Duration::days(4_000_000_000));
        assert!(policy.is_live(Utc::now(), Utc::now()));
    }
}
