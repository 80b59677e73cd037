//! NewType wrappers and shared scalar types.
//!
//! These types keep device identifiers and device-type tags from being mixed
//! up with layer names or object ids, which are all plain strings on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in time, in milliseconds.
///
/// The conductor never assumes an epoch; whatever the injected clock returns
/// is "now", and timeline objects are expressed in the same unit.
pub type Time = i64;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Identifier of a connected device (e.g. "mixer0").
    ///
    /// Mappings reference devices by this id; it is unique within one
    /// conductor.
    DeviceId
);

newtype_string!(
    /// Tag naming a kind of device (e.g. "abstract", "videomixer").
    ///
    /// The registry maps this tag to a factory, and a mapping must carry the
    /// same tag as the device it routes to.
    DeviceType
);

impl DeviceType {
    pub const ABSTRACT: &'static str = "abstract";
    pub const VIDEO_MIXER: &'static str = "videomixer";

    pub fn abstract_device() -> Self {
        Self::new(Self::ABSTRACT)
    }

    pub fn video_mixer() -> Self {
        Self::new(Self::VIDEO_MIXER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_creation() {
        let id = DeviceId::new("mixer0");
        assert_eq!(id.as_str(), "mixer0");
        assert_eq!(id.to_string(), "mixer0");
    }

    #[test]
    fn test_device_type_serde() {
        let ty = DeviceType::video_mixer();
        let json = serde_json::to_string(&ty).unwrap();
        assert_eq!(json, "\"videomixer\"");

        let parsed: DeviceType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ty);
    }

    #[test]
    fn test_borrow_lookup() {
        use std::collections::BTreeMap;

        let mut map = BTreeMap::new();
        map.insert(DeviceId::new("abstract0"), 1);
        assert_eq!(map.get("abstract0"), Some(&1));
    }
}
