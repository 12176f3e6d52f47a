//! NewType wrappers for strong typing throughout the client.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a source locator where a marker ID is expected).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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
    /// Stable identifier of a discovered marker (e.g., "mk_3f2a09c1d4e5b677").
    ///
    /// Derived from the marker's source locator and start line, so rescanning
    /// unchanged source yields the same id. Sent as `functionId` on the wire.
    MarkerId
);

newtype_string!(
    /// Where a piece of source text came from: a file path or an `http(s)` URL.
    SourceLocator
);

newtype_string!(
    /// Correlation id carried by every outbound frame and echoed by the executor.
    RequestId
);

impl MarkerId {
    /// Derive the id for a marker starting at `start_line` of `locator`.
    pub fn derive(locator: &SourceLocator, start_line: usize) -> Self {
        let digest = Sha256::digest(format!("{}:{}", locator, start_line).as_bytes());
        let hex = format!("{:x}", digest);
        Self(format!("mk_{}", &hex[..16]))
    }
}

impl RequestId {
    /// Generate a fresh id: millisecond timestamp plus a random suffix.
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{:x}-{}", millis, &suffix[..12]))
    }
}
