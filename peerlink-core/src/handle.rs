//! Handle registry: opaque numeric tokens standing in for native values across the runtime boundary.
//!
//! Each entry records the concrete type it was created with; resolving against any other type
//! fails with [`HandleError::TypeMismatch`]. Tokens come from a monotonically increasing counter
//! and are never handed out twice, so a deleted handle can never alias a later one.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Opaque token for a registered native value. `0` is never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// Interpret a raw boundary value. Returns `None` for the `0` sentinel.
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Handle)
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Boundary-contract violations reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("unknown handle {0}")]
    Unknown(Handle),
    #[error("handle {handle} holds {found}, expected {expected}")]
    TypeMismatch {
        handle: Handle,
        expected: &'static str,
        found: &'static str,
    },
    #[error("handle space exhausted")]
    Exhausted,
}

struct Entry {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// Concurrent table of live handles. One instance per [`crate::Bridge`]; tests make their own.
pub struct Registry {
    next: AtomicUsize,
    entries: RwLock<HashMap<Handle, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `value` under a fresh handle.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) -> Result<Handle, HandleError> {
        self.insert_arc(Arc::new(value))
    }

    /// Register an already shared value under a fresh handle.
    pub fn insert_arc<T: Any + Send + Sync>(&self, value: Arc<T>) -> Result<Handle, HandleError> {
        let handle = self.allocate()?;
        let entry = Entry {
            type_name: type_name::<T>(),
            value,
        };
        self.write().insert(handle, entry);
        Ok(handle)
    }

    /// Resolve `handle` as a `T`.
    pub fn get<T: Any + Send + Sync>(&self, handle: Handle) -> Result<Arc<T>, HandleError> {
        let entries = self.read();
        let entry = entries.get(&handle).ok_or(HandleError::Unknown(handle))?;
        downcast(handle, entry)
    }

    /// Remove `handle` whatever it holds.
    pub fn remove(&self, handle: Handle) -> Result<(), HandleError> {
        self.write()
            .remove(&handle)
            .map(|_| ())
            .ok_or(HandleError::Unknown(handle))
    }

    /// Remove `handle` only if it holds a `T`, returning the value. A mismatch leaves the entry in place.
    pub fn take<T: Any + Send + Sync>(&self, handle: Handle) -> Result<Arc<T>, HandleError> {
        let mut entries = self.write();
        let entry = entries.get(&handle).ok_or(HandleError::Unknown(handle))?;
        let value = downcast(handle, entry)?;
        entries.remove(&handle);
        Ok(value)
    }

    /// Type recorded for `handle` at creation.
    pub fn type_name(&self, handle: Handle) -> Result<&'static str, HandleError> {
        self.read()
            .get(&handle)
            .map(|e| e.type_name)
            .ok_or(HandleError::Unknown(handle))
    }

    /// Whether `handle` is live and holds a `T`.
    pub fn holds<T: Any + Send + Sync>(&self, handle: Handle) -> bool {
        self.read()
            .get(&handle)
            .is_some_and(|e| e.value.is::<T>())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn allocate(&self) -> Result<Handle, HandleError> {
        let raw = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .map_err(|_| HandleError::Exhausted)?;
        Handle::from_raw(raw).ok_or(HandleError::Exhausted)
    }

    // A panic while holding the lock cannot leave the map half-updated, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Handle, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Handle, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<T: Any + Send + Sync>(handle: Handle, entry: &Entry) -> Result<Arc<T>, HandleError> {
    entry
        .value
        .clone()
        .downcast::<T>()
        .map_err(|_| HandleError::TypeMismatch {
            handle,
            expected: type_name::<T>(),
            found: entry.type_name,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct Token(u32);

    #[test]
    fn resolve_returns_inserted_value() {
        let reg = Registry::new();
        let a = reg.insert(Token(7)).unwrap();
        let b = reg.insert(String::from("peer")).unwrap();
        let c = reg.insert(vec![1u8, 2, 3]).unwrap();
        assert_eq!(*reg.get::<Token>(a).unwrap(), Token(7));
        assert_eq!(reg.get::<String>(b).unwrap().as_str(), "peer");
        assert_eq!(*reg.get::<Vec<u8>>(c).unwrap(), vec![1, 2, 3]);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn zero_is_not_a_handle() {
        assert!(Handle::from_raw(0).is_none());
        assert_eq!(Handle::from_raw(5).unwrap().as_raw(), 5);
    }

    #[test]
    fn deleted_handle_never_resolves() {
        let reg = Registry::new();
        let h = reg.insert(Token(1)).unwrap();
        reg.remove(h).unwrap();
        assert_eq!(reg.get::<Token>(h), Err(HandleError::Unknown(h)));
        assert_eq!(reg.get::<String>(h).unwrap_err(), HandleError::Unknown(h));
        assert_eq!(reg.remove(h), Err(HandleError::Unknown(h)));

        // A later insert gets a different token.
        let later = reg.insert(Token(2)).unwrap();
        assert_ne!(later, h);
        assert!(reg.get::<Token>(h).is_err());
    }

    #[test]
    fn wrong_type_is_rejected() {
        let reg = Registry::new();
        let h = reg.insert(Token(3)).unwrap();
        match reg.get::<String>(h) {
            Err(HandleError::TypeMismatch {
                handle,
                expected,
                found,
            }) => {
                assert_eq!(handle, h);
                assert_eq!(expected, type_name::<String>());
                assert_eq!(found, type_name::<Token>());
            }
            other => panic!("expected TypeMismatch, got {:?}", other),
        }
        // Still resolvable under the right type.
        assert_eq!(*reg.get::<Token>(h).unwrap(), Token(3));
    }

    #[test]
    fn take_checks_type_before_removing() {
        let reg = Registry::new();
        let h = reg.insert(Token(4)).unwrap();
        assert!(matches!(
            reg.take::<String>(h),
            Err(HandleError::TypeMismatch { .. })
        ));
        assert!(reg.holds::<Token>(h));
        assert_eq!(*reg.take::<Token>(h).unwrap(), Token(4));
        assert!(reg.is_empty());
        assert_eq!(reg.take::<Token>(h).unwrap_err(), HandleError::Unknown(h));
    }

    #[test]
    fn type_name_reports_creation_type() {
        let reg = Registry::new();
        let h = reg.insert(42u64).unwrap();
        assert_eq!(reg.type_name(h).unwrap(), "u64");
    }

    #[test]
    fn exhausted_counter_fails_instead_of_wrapping() {
        let reg = Registry::new();
        reg.next.store(usize::MAX, Ordering::Relaxed);
        assert_eq!(reg.insert(Token(0)), Err(HandleError::Exhausted));
    }

    #[test]
    fn concurrent_inserts_yield_distinct_handles() {
        let reg = Arc::new(Registry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                thread::spawn(move || {
                    (0..500)
                        .map(|i| reg.insert(Token(t * 1000 + i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for t in threads {
            for h in t.join().unwrap() {
                assert!(seen.insert(h), "duplicate handle {}", h);
            }
        }
        assert_eq!(seen.len(), 8 * 500);
        assert_eq!(reg.len(), 8 * 500);
    }

    #[test]
    fn concurrent_delete_and_resolve() {
        let reg = Arc::new(Registry::new());
        let handles: Vec<Handle> = (0..1000).map(|i| reg.insert(Token(i)).unwrap()).collect();
        let deleter = {
            let reg = reg.clone();
            let handles = handles.clone();
            thread::spawn(move || {
                for h in handles {
                    reg.remove(h).unwrap();
                }
            })
        };
        let reader = {
            let reg = reg.clone();
            let handles = handles.clone();
            thread::spawn(move || {
                for (i, h) in handles.into_iter().enumerate() {
                    match reg.get::<Token>(h) {
                        Ok(v) => assert_eq!(*v, Token(i as u32)),
                        Err(e) => assert_eq!(e, HandleError::Unknown(h)),
                    }
                }
            })
        };
        deleter.join().unwrap();
        reader.join().unwrap();
        assert!(reg.is_empty());
        for h in handles {
            assert!(reg.get::<Token>(h).is_err());
        }
    }
}
