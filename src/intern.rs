//! Interned strings shared across the whole run.
//!
//! Paths dominate memory: a full scan sees hundreds of thousands of them, and
//! the same path is used as a key in several indexes at once. The pool stores
//! every distinct string once, in large append-only pages, and hands out
//! cheap [`Name`] handles that all phases share.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::Mutex;

/// Handle to a string interned in a [`StringPool`].
///
/// `Copy`, content-compared and content-hashed, so it works as a hash-map key
/// with heterogeneous lookup by `&str`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(&'static str);

impl Name {
    /// The interned string; lives for the rest of the process.
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &str {
        self.0
    }
}

impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        self.0
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.0, f)
    }
}

/// Deduplicating, thread-safe string pool.
///
/// Storage grows in pages and is never reclaimed: the pool's `Drop` leaks the
/// pages, which keeps every handed-out [`Name`] valid until process exit and
/// makes teardown trivial.
#[derive(Debug)]
pub struct StringPool {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    map: HashSet<&'static str>,
    buf: String,
    full: Vec<String>,
}

impl StringPool {
    /// Create an empty pool with a reasonable initial page.
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    /// Create an empty pool whose first page holds `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashSet::new(),
                buf: String::with_capacity(cap.max(1)),
                full: Vec::new(),
            }),
        }
    }

    /// Intern `s`, returning the shared handle for its content.
    pub fn intern(&self, s: &str) -> Name {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(&interned) = inner.map.get(s) {
            return Name(interned);
        }
        let interned = inner.alloc(s);
        inner.map.insert(interned);
        Name(interned)
    }
}

impl Inner {
    fn alloc(&mut self, s: &str) -> &'static str {
        let need = s.len();
        if self.buf.capacity() - self.buf.len() < need {
            let new_cap = (self.buf.capacity().max(need) + 1).next_power_of_two();
            let old = std::mem::replace(&mut self.buf, String::with_capacity(new_cap));
            self.full.push(old);
        }
        let start = self.buf.len();
        self.buf.push_str(s);
        // SAFETY: the returned reference points into `self.buf`, whose heap
        // block is never reallocated (the capacity check above rolls over to a
        // fresh page instead) and never freed (`full` only ever grows, and
        // `StringPool::drop` forgets all pages). The 'static lifetime is
        // therefore sound for the remainder of the process.
        unsafe { &*(&self.buf[start..] as *const str) }
    }
}

impl Drop for StringPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let inner = match inner {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        for page in inner.full.drain(..) {
            std::mem::forget(page);
        }
        std::mem::forget(std::mem::take(&mut inner.buf));
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn deduplication() {
        let pool = StringPool::new();
        let a = pool.intern("usr/lib/libm.so.6");
        let b = pool.intern("usr/lib/libm.so.6");
        let c = pool.intern("usr/lib/libc.so.6");
        assert_eq!(a, b);
        assert_eq!(a.as_str().as_ptr(), b.as_str().as_ptr());
        assert_ne!(a, c);
    }

    #[test]
    fn survives_page_rollover() {
        let pool = StringPool::with_capacity(8);
        let names: Vec<Name> = (0..100)
            .map(|i| pool.intern(&format!("usr/lib/lib{i}.so")))
            .collect();
        for (i, name) in names.iter().enumerate() {
            assert_eq!(name.as_str(), format!("usr/lib/lib{i}.so"));
        }
    }

    #[test]
    fn heterogeneous_lookup() {
        let pool = StringPool::new();
        let mut map: HashMap<Name, u32> = HashMap::new();
        map.insert(pool.intern("libz.so.1"), 1);
        assert_eq!(map.get("libz.so.1"), Some(&1));
        assert_eq!(map.get("libz.so.2"), None);
    }

    #[test]
    fn shared_across_threads() {
        let pool = StringPool::new();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for i in 0..50 {
                        let _ = pool.intern(&format!("lib{i}.so"));
                    }
                });
            }
        });
        assert_eq!(pool.intern("lib0.so"), pool.intern("lib0.so"));
    }
}
