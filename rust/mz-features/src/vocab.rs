//! Append-only string vocabulary shared by every worker of a session.

use std::sync::RwLock;

use rustc_hash::FxHashMap;

/// Interns keys into dense, stable indices.
///
/// Indices are assigned in first-seen order and never reused or removed, so an
/// index handed to the inference server keeps its meaning for the whole session.
#[derive(Debug, Default)]
pub struct Vocabulary {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    index: FxHashMap<String, i64>,
    keys: Vec<String>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `key`, assigning the next free index on first sight.
    pub fn intern(&self, key: &str) -> i64 {
        if let Some(i) = self.get(key) {
            return i;
        }
        let mut g = self.inner.write().unwrap_or_else(|e| e.into_inner());
        // Another thread may have inserted between the read and write locks.
        if let Some(&i) = g.index.get(key) {
            return i;
        }
        let i = g.keys.len() as i64;
        g.keys.push(key.to_string());
        g.index.insert(key.to_string(), i);
        i
    }

    /// Index of `key` if it has been interned.
    pub fn get(&self, key: &str) -> Option<i64> {
        let g = self.inner.read().unwrap_or_else(|e| e.into_inner());
        g.index.get(key).copied()
    }

    pub fn key_of(&self, index: i64) -> Option<String> {
        let g = self.inner.read().unwrap_or_else(|e| e.into_inner());
        usize::try_from(index).ok().and_then(|i| g.keys.get(i).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn indices_are_dense_and_stable() {
        let v = Vocabulary::new();
        assert_eq!(v.intern("a"), 0);
        assert_eq!(v.intern("b"), 1);
        assert_eq!(v.intern("a"), 0);
        assert_eq!(v.get("c"), None);
        assert_eq!(v.key_of(1).as_deref(), Some("b"));
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn concurrent_interning_assigns_each_key_once() {
        let v = Arc::new(Vocabulary::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let v = Arc::clone(&v);
                thread::spawn(move || {
                    for i in 0..100 {
                        v.intern(&format!("k{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(v.len(), 100);
        let mut seen: Vec<i64> = (0..100).map(|i| v.get(&format!("k{i}")).unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<i64>>());
    }
}
