//! Macros for defining typed identity segments.

/// Macro to define a typed identity segment.
///
/// This generates a newtype wrapper around `String` with:
/// - A `LABEL` constant used in error messages
/// - `parse()` to validate from a string
/// - `as_str()` to borrow the raw value
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_segment!(HostId, "host");
///
/// let host: HostId = "compute-01".parse()?;
/// assert_eq!(host.as_str(), "compute-01");
/// ```
#[macro_export]
macro_rules! define_segment {
    ($name:ident, $label:literal) => {
        /// A validated identity segment.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Human-readable name of this segment.
            pub const LABEL: &'static str = $label;

            /// Parses a segment from a string.
            ///
            /// The string must be non-empty and must not contain `/`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty {
                        segment: Self::LABEL,
                    });
                }

                if s.contains('/') {
                    return Err($crate::IdError::InvalidCharacter {
                        segment: Self::LABEL,
                        character: '/',
                        actual: s.to_string(),
                    });
                }

                Ok(Self(s.to_string()))
            }

            /// Returns the raw segment value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
