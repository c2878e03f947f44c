//! Client-generated entity identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new unique ID using UUID v7
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Get the string representation of this ID
            #[must_use]
            pub fn as_str(&self) -> String {
                self.0.to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

entity_id!(
    /// Identifier of an SOS alert, UUID v7 (time-sortable). Doubles as the
    /// idempotency key for pushes to the remote authority.
    AlertId
);

entity_id!(
    /// Identifier of a queued outbound message, UUID v7.
    MessageId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(AlertId::new(), AlertId::new());
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn id_parse_roundtrip() {
        let id = AlertId::new();
        let parsed: AlertId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<MessageId>().is_err());
    }

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let first = AlertId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = AlertId::new();
        assert!(first < second);
    }
}
