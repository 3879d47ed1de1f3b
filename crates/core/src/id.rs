// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed entity ids.
//!
//! Ids are inline, NUL-padded byte arrays: `Copy`, allocation-free, and
//! cheap as map keys. Every minted id is a 4-char type prefix plus 20
//! random characters, which fills the capacity exactly; wire ids from
//! older rows may be shorter.

/// Inline capacity; minted ids fill it exactly.
pub const ID_CAPACITY: usize = 24;

/// NUL-padded inline id storage. Equality and hashing operate on the
/// whole array, which is consistent because the padding is canonical
/// (all zero bytes after the id).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawId([u8; ID_CAPACITY]);

impl RawId {
    pub const fn empty() -> Self {
        Self([0; ID_CAPACITY])
    }

    /// Wrap an id string. Oversized input is truncated (debug builds
    /// assert instead); NUL bytes would corrupt the padding and are
    /// rejected the same way.
    pub fn parse(s: &str) -> Self {
        debug_assert!(
            s.len() <= ID_CAPACITY,
            "id exceeds {ID_CAPACITY} bytes: {s:?}"
        );
        debug_assert!(!s.contains('\0'), "id contains NUL: {s:?}");
        let mut buf = [0u8; ID_CAPACITY];
        let len = s.len().min(ID_CAPACITY);
        buf[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(ID_CAPACITY);
        // Only constructed from &str; a truncated multi-byte tail reads
        // as empty rather than panicking.
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl std::fmt::Debug for RawId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl std::fmt::Display for RawId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for RawId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for RawId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.len() > ID_CAPACITY {
            return Err(serde::de::Error::custom(format!(
                "id exceeds {ID_CAPACITY} bytes: {s:?}"
            )));
        }
        Ok(RawId::parse(&s))
    }
}

/// Define a typed id over [`RawId`] with a 4-char type prefix.
///
/// Generates `new()` (mint a random id), `from_string()` (wrap a wire
/// id), `as_str()`, `is_empty()`, plus `Display`, `Default`, `From`
/// string conversions, `Deref<Target = str>`, and str comparisons.
///
/// ```ignore
/// entity_id! {
///     /// Doc comment for the id type.
///     pub struct LabId("lab-");
/// }
/// ```
#[macro_export]
macro_rules! entity_id {
    (
        $(#[$meta:meta])*
        pub struct $name:ident($prefix:literal);
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name($crate::id::RawId);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Mint a fresh random id: the 4-char type prefix plus 20
            /// random characters fills the inline capacity exactly.
            pub fn new() -> Self {
                Self($crate::id::RawId::parse(&format!(
                    "{}{}",
                    Self::PREFIX,
                    nanoid::nanoid!(20)
                )))
            }

            /// Wrap an existing wire id (parsing, test fixtures).
            pub fn from_string(id: impl AsRef<str>) -> Self {
                Self($crate::id::RawId::parse(id.as_ref()))
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::from_string(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::from_string(s)
            }
        }

        impl From<&String> for $name {
            fn from(s: &String) -> Self {
                Self::from_string(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.0.as_str()
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0.as_str() == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0.as_str() == *other
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                self.0.as_str()
            }
        }
    };
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
