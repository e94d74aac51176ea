//! Fresh-name generation for staging tensors and loop variables.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Produces unique names of the form `{prefix}_{n}`.
///
/// A generator is shared by reference between lowering sessions; the counter
/// is atomic, so sessions running on different threads never collide.
#[derive(Debug, Default)]
pub struct NameGenerator {
    counter: AtomicUsize,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a name no other call on this generator has returned.
    pub fn fresh(&self, prefix: &str) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{id}")
    }

    /// Number of names handed out so far.
    pub fn issued(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_fresh_names_are_distinct() {
        let names = NameGenerator::new();
        let a = names.fresh("tmp");
        let b = names.fresh("tmp");
        assert_ne!(a, b);
        assert_eq!(a, "tmp_0");
        assert_eq!(names.issued(), 2);
    }

    #[test]
    fn test_fresh_names_across_threads() {
        let names = NameGenerator::new();
        let collected: Vec<Vec<String>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..100).map(|_| names.fresh("x")).collect::<Vec<_>>()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let unique: FxHashSet<String> = collected.into_iter().flatten().collect();
        assert_eq!(unique.len(), 400);
    }
}
