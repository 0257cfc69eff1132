use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local pseudonym allocator: the first time an identity is seen it
/// receives the next unused ordinal starting at 1, and keeps it for the
/// registry's lifetime. Nothing is persisted, so a fresh registry (new
/// process, reload) may hand the same person a different number.
///
/// The registry is meant to be constructed once per session scope and
/// injected wherever display names are derived, not held as a global.
pub struct PseudonymRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    ordinals: HashMap<String, u32>,
    next: u32,
}

impl PseudonymRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ordinals: HashMap::new(),
                next: 1,
            }),
        }
    }

    /// The stable ordinal for this identity. Racing first-time lookups
    /// serialize on the lock, so exactly one ordinal is ever allocated per
    /// identity and the second caller observes the first one's value.
    pub fn ordinal(&self, id: &str) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&n) = inner.ordinals.get(id) {
            return n;
        }
        let n = inner.next;
        inner.next += 1;
        inner.ordinals.insert(id.to_string(), n);
        n
    }

    /// Display pseudonym, e.g. "User 3".
    pub fn name(&self, id: &str) -> String {
        format!("User {}", self.ordinal(id))
    }

    /// Avatar initial, e.g. "U3".
    pub fn initial(&self, id: &str) -> String {
        format!("U{}", self.ordinal(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ordinals_are_stable_and_dense() {
        let registry = PseudonymRegistry::new();
        assert_eq!(registry.ordinal("alice"), 1);
        assert_eq!(registry.ordinal("bob"), 2);
        assert_eq!(registry.ordinal("alice"), 1);
        assert_eq!(registry.ordinal("carol"), 3);
        assert_eq!(registry.name("bob"), "User 2");
        assert_eq!(registry.initial("carol"), "U3");
    }

    #[test]
    fn distinct_identities_never_share_an_ordinal() {
        let registry = PseudonymRegistry::new();
        let a = registry.ordinal("a");
        let b = registry.ordinal("b");
        assert_ne!(a, b);
    }

    #[test]
    fn racing_first_lookups_agree_on_one_ordinal() {
        let registry = Arc::new(PseudonymRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.ordinal("carol"))
            })
            .collect();

        let seen: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(seen.iter().all(|&n| n == seen[0]));

        // The losers must not have burned ordinals.
        assert_eq!(registry.ordinal("dave"), 2);
    }
}
