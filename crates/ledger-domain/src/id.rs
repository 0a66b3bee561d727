//! Prefixed opaque identifiers
//!
//! Every ledger record is addressed by a UUIDv7 rendered as a prefixed token,
//! e.g. `clm_0190f3a4c2b87c1e9d4a6b2f1e0d3c4b`. UUIDv7 gives:
//! - Chronological sortability (the top 48 bits are a millisecond timestamp)
//! - 128-bit uniqueness without coordination
//!
//! The prefix makes tokens self-describing on the wire; parsing rejects a token
//! whose prefix belongs to another record type.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing an identifier token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Token does not start with the expected `<prefix>_`
    #[error("expected '{expected}_' prefix in '{token}'")]
    WrongPrefix {
        /// Prefix the caller asked for
        expected: &'static str,
        /// The offending token
        token: String,
    },

    /// Token body is not 32 hexadecimal digits
    #[error("invalid identifier body in '{0}'")]
    InvalidBody(String),
}

fn parse_token(token: &str, prefix: &'static str) -> Result<u128, IdError> {
    let body = token
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(|| IdError::WrongPrefix {
            expected: prefix,
            token: token.to_string(),
        })?;

    if body.len() != 32 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IdError::InvalidBody(token.to_string()));
    }

    u128::from_str_radix(body, 16).map_err(|_| IdError::InvalidBody(token.to_string()))
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u128);

        impl $name {
            /// Token prefix for this identifier type
            pub const PREFIX: &'static str = $prefix;

            /// Generate a new UUIDv7-based identifier
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7().as_u128())
            }

            /// Create an identifier from a raw u128 value
            ///
            /// This is primarily for storage layer deserialization.
            pub fn from_value(value: u128) -> Self {
                Self(value)
            }

            /// Get the raw u128 value
            pub fn value(&self) -> u128 {
                self.0
            }

            /// Timestamp component of the UUIDv7 (milliseconds since Unix epoch)
            pub fn timestamp(&self) -> u64 {
                (self.0 >> 80) as u64
            }

            /// Parse a prefixed token
            pub fn parse(token: &str) -> Result<Self, IdError> {
                parse_token(token, $prefix).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{:032x}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let token = String::deserialize(deserializer)?;
                Self::parse(&token).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id!(
    /// Identifier of an [`Organism`](crate::Organism) (`org_`)
    OrganismId,
    "org"
);
define_id!(
    /// Identifier of a [`Claim`](crate::Claim) (`clm_`)
    ClaimId,
    "clm"
);
define_id!(
    /// Identifier of a [`Mutation`](crate::Mutation) (`mut_`)
    MutationId,
    "mut"
);
define_id!(
    /// Identifier of a [`Constraint`](crate::Constraint) (`cst_`)
    ConstraintId,
    "cst"
);
define_id!(
    /// Identifier of a [`Conflict`](crate::Conflict) (`cfl_`)
    ConflictId,
    "cfl"
);
define_id!(
    /// Identifier of a [`Projection`](crate::Projection) (`prj_`)
    ProjectionId,
    "prj"
);
define_id!(
    /// Identifier of a [`Lens`](crate::Lens) (`lns_`)
    LensId,
    "lns"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ordering() {
        let id1 = ClaimId::from_value(1000);
        let id2 = ClaimId::from_value(2000);

        assert!(id1 < id2);
        assert!(id2 > id1);
    }

    #[test]
    fn test_id_chronological() {
        let id1 = MutationId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = MutationId::new();

        assert!(id1 < id2, "Earlier UUIDv7 should be less than later UUIDv7");
        assert!(id1.timestamp() <= id2.timestamp());
    }

    #[test]
    fn test_display_carries_prefix() {
        let id = OrganismId::from_value(0xabc);
        assert_eq!(id.to_string(), "org_00000000000000000000000000000abc");
        assert_eq!(id.to_string().len(), 4 + 32);
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let claim = ClaimId::new().to_string();
        let err = MutationId::parse(&claim).unwrap_err();
        assert!(matches!(err, IdError::WrongPrefix { expected: "mut", .. }));
    }

    #[test]
    fn test_invalid_body_rejected() {
        assert!(ClaimId::parse("clm_").is_err());
        assert!(ClaimId::parse("clm_xyz").is_err());
        assert!(ClaimId::parse("clm_+0000000000000000000000000000ab").is_err());
        assert!(ClaimId::parse("").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let id = ConflictId::from_value(7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"cfl_00000000000000000000000000000007\"");

        let back: ConflictId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let wrong: Result<ClaimId, _> = serde_json::from_str(&json);
        assert!(wrong.is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: identifier ordering matches u128 ordering
        #[test]
        fn test_id_ordering_property(a: u128, b: u128) {
            let id_a = ClaimId::from_value(a);
            let id_b = ClaimId::from_value(b);

            prop_assert_eq!(id_a < id_b, a < b);
            prop_assert_eq!(id_a == id_b, a == b);
        }

        /// Property: round-trip through the token preserves the identifier
        #[test]
        fn test_token_roundtrip(value: u128) {
            let id = LensId::from_value(value);
            match LensId::parse(&id.to_string()) {
                Ok(parsed) => prop_assert_eq!(id, parsed),
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            }
        }
    }
}
