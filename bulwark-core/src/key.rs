//! Separator-joined key construction.

/// Default separator between key parts.
pub const KEY_SEPARATOR: char = ':';

/// Builds compound keys such as `app:orders:42`, skipping empty parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    buf: String,
    separator: char,
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::with_separator(KEY_SEPARATOR)
    }

    pub fn with_separator(separator: char) -> Self {
        Self {
            buf: String::new(),
            separator,
        }
    }

    /// Append every non-empty part.
    pub fn build<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for part in parts {
            self = self.append(part.as_ref());
        }
        self
    }

    /// Append one part after a separator.
    pub fn append(mut self, part: &str) -> Self {
        if !part.is_empty() {
            if !self.buf.is_empty() {
                self.buf.push(self.separator);
            }
            self.buf.push_str(part);
        }
        self
    }

    /// Prepend one part before a separator.
    pub fn insert(mut self, part: &str) -> Self {
        if !part.is_empty() {
            if self.buf.is_empty() {
                self.buf.push_str(part);
            } else {
                let mut prefixed = String::with_capacity(part.len() + 1 + self.buf.len());
                prefixed.push_str(part);
                prefixed.push(self.separator);
                prefixed.push_str(&self.buf);
                self.buf = prefixed;
            }
        }
        self
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

impl std::fmt::Display for KeyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_build_joins_parts() {
        let key = KeyBuilder::new().build(["app", "orders", "42"]);
        assert_eq!(key.as_str(), "app:orders:42");
    }

    #[test]
    fn test_build_skips_empty_parts() {
        let key = KeyBuilder::new().build(["app", "", "42"]);
        assert_eq!(key.to_string(), "app:42");
    }

    #[test]
    fn test_append_and_insert() {
        let key = KeyBuilder::new()
            .append("orders")
            .append("42")
            .insert("app");
        assert_eq!(key.into_string(), "app:orders:42");
    }

    #[test]
    fn test_insert_into_empty() {
        assert_eq!(KeyBuilder::new().insert("app").as_str(), "app");
    }

    #[test]
    fn test_custom_separator() {
        let key = KeyBuilder::with_separator('/').build(["a", "b"]);
        assert_eq!(key.as_str(), "a/b");
    }

    proptest! {
        #[test]
        fn prop_parts_survive_split(parts in proptest::collection::vec("[a-z0-9]{1,8}", 1..6)) {
            let key = KeyBuilder::new().build(&parts).into_string();
            let split: Vec<&str> = key.split(KEY_SEPARATOR).collect();
            prop_assert_eq!(split, parts.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }
}
