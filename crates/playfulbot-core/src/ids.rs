use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

/// Branded id that can also be minted locally (`<prefix>_<uuid v7>`).
macro_rules! generated_id {
    ($name:ident, $prefix:expr) => {
        branded_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

// Assigned by the backend; never minted locally.
branded_id!(GameId);
// Runner address as handed out by the backend (`host:port`).
branded_id!(Endpoint);

generated_id!(SessionId, "sess");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn game_id_preserves_raw_value() {
        let id = GameId::from_raw("game0");
        assert_eq!(id.as_str(), "game0");
        assert_eq!(id.to_string(), "game0");
    }

    #[test]
    fn game_id_is_transparent_on_the_wire() {
        let id = GameId::from("game7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"game7\"");
        let parsed: GameId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn endpoint_parses_from_str() {
        let endpoint: Endpoint = "localhost:5001".parse().unwrap();
        assert_eq!(endpoint.as_ref(), "localhost:5001");
    }
}
