use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Decode a 16-byte blob as stored in the database.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
                Uuid::from_slice(bytes).map(Self).map_err(|_| {
                    CoreError::InvalidId(format!(
                        "{}: expected 16 bytes, got {}",
                        stringify!($name),
                        bytes.len()
                    ))
                })
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| CoreError::InvalidId(format!("{}: {e}", stringify!($name))))
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
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
    };
}

uuid_id!(WorkspaceId);
uuid_id!(CollectionId);
uuid_id!(EndpointId);
uuid_id!(ExampleId);
uuid_id!(BodyId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_by_creation() {
        let a = ExampleId::new();
        let b = ExampleId::new();
        assert!(a < b);
        assert!(a.as_bytes() < b.as_bytes());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not-an-id".parse::<BodyId>().is_err());
        let id = BodyId::new();
        let parsed: BodyId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(EndpointId::from_slice(&[1, 2, 3]).is_err());
        let id = EndpointId::new();
        assert_eq!(EndpointId::from_slice(id.as_bytes()).unwrap(), id);
    }
}
