//! The outcome of a single cache lookup.
//!
//! A lookup either finds nothing, finds a negative marker stored by an
//! earlier load that came back empty, or finds a value. Keeping the three
//! outcomes in one enum makes "data present iff the state is Present"
//! structural rather than a runtime check.

use crate::error::{CacheError, CacheResult};

/// Lookup state without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// No entry was found.
    Absent,
    /// A negative marker was found: the source has no value for the key.
    Negative,
    /// A value was found.
    Present,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot<T> {
    Absent,
    Negative,
    Present(T),
}

/// Immutable result of a cache lookup for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject<T> {
    key: String,
    slot: Slot<T>,
}

impl<T> CachedObject<T> {
    /// No entry for `key`.
    pub fn absent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            slot: Slot::Absent,
        }
    }

    /// Negative marker for `key`.
    pub fn negative(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            slot: Slot::Negative,
        }
    }

    /// A cached value for `key`.
    pub fn present(key: impl Into<String>, data: T) -> Self {
        Self {
            key: key.into(),
            slot: Slot::Present(data),
        }
    }

    /// Build from an optional raw value, recognising negative markers.
    pub fn from_raw<V>(
        key: impl Into<String>,
        raw: Option<V>,
        is_negative: impl FnOnce(&V) -> bool,
        convert: impl FnOnce(V) -> T,
    ) -> Self {
        match raw {
            None => Self::absent(key),
            Some(v) if is_negative(&v) => Self::negative(key),
            Some(v) => Self::present(key, convert(v)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> CacheState {
        match self.slot {
            Slot::Absent => CacheState::Absent,
            Slot::Negative => CacheState::Negative,
            Slot::Present(_) => CacheState::Present,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self.slot, Slot::Absent)
    }

    pub fn is_negative(&self) -> bool {
        matches!(self.slot, Slot::Negative)
    }

    pub fn is_present(&self) -> bool {
        matches!(self.slot, Slot::Present(_))
    }

    /// The cached value, only when present.
    pub fn data(&self) -> Option<&T> {
        match &self.slot {
            Slot::Present(data) => Some(data),
            _ => None,
        }
    }

    /// Consume the lookup and return the value, only when present.
    pub fn into_data(self) -> Option<T> {
        match self.slot {
            Slot::Present(data) => Some(data),
            _ => None,
        }
    }

    /// Transform the payload, keeping key and state.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CachedObject<U> {
        let slot = match self.slot {
            Slot::Absent => Slot::Absent,
            Slot::Negative => Slot::Negative,
            Slot::Present(data) => Slot::Present(f(data)),
        };
        CachedObject {
            key: self.key,
            slot,
        }
    }
}

/// Reject empty or whitespace-only keys.
pub fn validate_key(key: &str) -> CacheResult<()> {
    if key.trim().is_empty() {
        return Err(CacheError::invalid_argument(
            "key",
            "the key is null or empty",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent() {
        let obj: CachedObject<i32> = CachedObject::absent("a");
        assert_eq!(obj.key(), "a");
        assert_eq!(obj.state(), CacheState::Absent);
        assert!(obj.is_absent());
        assert!(obj.data().is_none());
    }

    #[test]
    fn test_negative_has_no_data() {
        let obj: CachedObject<i32> = CachedObject::negative("a");
        assert!(obj.is_negative());
        assert!(!obj.is_present());
        assert_eq!(obj.into_data(), None);
    }

    #[test]
    fn test_present() {
        let obj = CachedObject::present("a", 7);
        assert!(obj.is_present());
        assert_eq!(obj.data(), Some(&7));
        assert_eq!(obj.into_data(), Some(7));
    }

    #[test]
    fn test_from_raw_recognises_marker() {
        let marker = |v: &String| v == ".";
        let none: CachedObject<String> =
            CachedObject::from_raw("k", None::<String>, marker, |v| v);
        assert!(none.is_absent());

        let neg: CachedObject<String> =
            CachedObject::from_raw("k", Some(".".to_string()), marker, |v| v);
        assert!(neg.is_negative());

        let val: CachedObject<usize> =
            CachedObject::from_raw("k", Some("abc".to_string()), marker, |v| v.len());
        assert_eq!(val.data(), Some(&3));
    }

    #[test]
    fn test_map_keeps_state() {
        let neg: CachedObject<i32> = CachedObject::negative("k");
        assert!(neg.map(|v| v * 2).is_negative());
        let val = CachedObject::present("k", 2).map(|v| v * 2);
        assert_eq!(val.key(), "k");
        assert_eq!(val.data(), Some(&4));
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("order:1").is_ok());
        assert!(matches!(
            validate_key(""),
            Err(CacheError::InvalidArgument { .. })
        ));
        assert!(validate_key("   ").is_err());
    }
}
