//! Server-assigned identifiers.
//!
//! Ids are exact: two entities are the same iff their ids are equal within the
//! same container. Names are the case-insensitive handle, ids are not.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<u32>()
                    .map($name)
                    .map_err(|_| Error::Protocol(format!("invalid {} id '{s}'", $label)))
            }
        }
    };
}

id_type!(
    /// Database identifier, unique per server.
    DatabaseId, "database"
);
id_type!(
    /// Dimension identifier, unique per database.
    DimensionId, "dimension"
);
id_type!(
    /// Cube identifier, unique per database.
    CubeId, "cube"
);
id_type!(
    /// Element identifier, unique per dimension.
    ElementId, "element"
);
id_type!(
    /// Rule identifier, unique per cube.
    RuleId, "rule"
);
id_type!(
    /// Lock identifier returned by a cube lock request.
    LockId, "lock"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: ElementId = " 42".parse().unwrap();
        assert_eq!(id, ElementId(42));
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_parse_rejects_negative() {
        let err = "-1".parse::<CubeId>().unwrap_err();
        assert!(matches!(err, Error::Protocol(msg) if msg.contains("cube")));
    }
}
