//! Newtype wrappers for container and network identifiers.
//!
//! Both serialize as plain strings so the wire form of a configuration stays
//! a flat JSON object.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Stable identity of a managed container. Also the name of its state
    /// directory and the key under which its services are registered.
    ContainerId
);

string_newtype!(
    /// Name of a network binder instance (e.g. `"host"`, `"bridge0"`).
    NetworkName
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_display_and_compare() {
        let id = ContainerId::new("web1");
        assert_eq!(id.to_string(), "web1");
        assert_eq!(id, "web1");
        assert_eq!(id.as_str(), "web1");
    }

    #[test]
    fn network_name_serializes_as_plain_string() {
        let name = NetworkName::from("bridge0");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"bridge0\"");
        let back: NetworkName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }
}
