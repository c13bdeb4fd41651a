//! Session and device identifiers, and the base36 id scheme they share.

use crate::env::Environment;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Identifier used when no browser-like environment is present.
pub const SERVER_SIDE_ID: &str = "server-side-rendering";

/// Browsing-context session id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

/// Device fingerprint (persistent pseudo-identity).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceFingerprint(String);

macro_rules! id_type {
    ($name:ident) => {
        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
                ser.serialize_str(&self.0)
            }
        }
        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
                String::deserialize(de).map(Self)
            }
        }
    };
}
id_type!(SessionId);
id_type!(DeviceFingerprint);

/// Lowercase base36 rendering of an integer.
pub fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

/// `timestamp_base36 + random_base36`, the scheme for session ids and temporary
/// fingerprints.
pub fn time_random_id(env: &dyn Environment) -> String {
    format!("{}{}", base36(env.now_ms()), base36(env.random_u64()))
}
