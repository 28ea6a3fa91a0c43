//! Process-wide bookkeeping of token library users.
//!
//! A token library must be initialized exactly once per process, irrespective
//! of how many contexts use it, and must only be finalized once the last of
//! them is done with it. The [`LibraryRegistry`] counts the users of each
//! library, keyed by the path the library was loaded from.
//!
//! Contexts hold the registry lock for the whole time it takes to move a
//! library across the initialized/finalized boundary, see [`LibraryRegistry::lock`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

lazy_static! {
    static ref GLOBAL: Arc<LibraryRegistry> = Arc::new(LibraryRegistry::new());
}

//------------ LibraryRegistry -----------------------------------------------

#[derive(Debug, Default)]
pub struct LibraryRegistry {
    usage: Mutex<HashMap<String, usize>>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by all contexts that were not given one explicitly.
    pub fn global() -> Arc<LibraryRegistry> {
        GLOBAL.clone()
    }

    /// Takes the registry lock.
    ///
    /// Every context in the process that uses this registry is blocked from
    /// opening or closing until the returned guard is dropped.
    pub fn lock(&self) -> LibraryUsage<'_> {
        LibraryUsage {
            usage: self.usage.lock().unwrap(),
        }
    }

    /// Registers one more user of the library. Returns true if it is the first.
    pub fn acquire(&self, library: &str) -> bool {
        self.lock().acquire(library)
    }

    /// Unregisters a user of the library. Returns true if it was the last.
    ///
    /// # Panics
    ///
    /// Panics if the library has no registered users.
    pub fn release(&self, library: &str) -> bool {
        self.lock().release(library)
    }

    pub fn usage_count(&self, library: &str) -> usize {
        self.lock().usage_count(library)
    }
}

//------------ LibraryUsage --------------------------------------------------

/// The locked usage table of a [`LibraryRegistry`].
pub struct LibraryUsage<'a> {
    usage: MutexGuard<'a, HashMap<String, usize>>,
}

impl LibraryUsage<'_> {
    pub fn usage_count(&self, library: &str) -> usize {
        self.usage.get(library).copied().unwrap_or(0)
    }

    pub fn is_in_use(&self, library: &str) -> bool {
        self.usage_count(library) > 0
    }

    pub fn acquire(&mut self, library: &str) -> bool {
        let count = self.usage.entry(library.to_string()).or_insert(0);
        *count += 1;
        trace!("Library '{}' now has {} user(s)", library, count);
        *count == 1
    }

    pub fn release(&mut self, library: &str) -> bool {
        let count = match self.usage.get_mut(library) {
            Some(count) if *count > 0 => count,
            _ => panic!("Library '{}' released more often than it was acquired", library),
        };
        *count -= 1;
        trace!("Library '{}' now has {} user(s)", library, count);

        if *count == 0 {
            self.usage.remove(library);
            true
        } else {
            false
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn first_and_last_user() {
        let registry = LibraryRegistry::new();

        assert!(registry.acquire("lib-a"));
        assert!(!registry.acquire("lib-a"));
        assert!(registry.acquire("lib-b"));
        assert_eq!(2, registry.usage_count("lib-a"));

        assert!(!registry.release("lib-a"));
        assert!(registry.release("lib-a"));
        assert_eq!(0, registry.usage_count("lib-a"));
        assert!(registry.release("lib-b"));

        // A library can be taken into use again after it was released completely.
        assert!(registry.acquire("lib-a"));
        assert!(registry.release("lib-a"));
    }

    #[test]
    #[should_panic(expected = "released more often")]
    fn release_of_unknown_library_panics() {
        LibraryRegistry::new().release("lib-x");
    }

    #[test]
    #[should_panic(expected = "released more often")]
    fn release_underflow_panics() {
        let registry = LibraryRegistry::new();
        registry.acquire("lib-x");
        registry.release("lib-x");
        registry.release("lib-x");
    }

    #[test]
    fn balanced_use_from_many_threads() {
        let registry = Arc::new(LibraryRegistry::new());

        let firsts: usize = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let mut firsts = 0;
                    for _ in 0..100 {
                        if registry.acquire("lib") {
                            firsts += 1;
                        }
                        registry.release("lib");
                    }
                    firsts
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert!(firsts >= 1);
        assert_eq!(0, registry.usage_count("lib"));
    }
}
