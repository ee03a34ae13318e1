//! Types identifying resources and consumers.

use std::sync::Arc;

macro_rules! imp_str_newtype {
    ($i:ident, $d:literal) => {
        #[doc = $d]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $i(pub Arc<str>);

        impl std::ops::Deref for $i {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $i {
            fn fmt(
                &self,
                f: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                f.write_fmt(format_args!(
                    concat!(stringify!($i), "({})"),
                    &self.0
                ))
            }
        }

        impl std::fmt::Display for $i {
            fn fmt(
                &self,
                f: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $i {
            fn from(s: &str) -> Self {
                Self(s.into())
            }
        }

        impl From<String> for $i {
            fn from(s: String) -> Self {
                Self(s.into())
            }
        }

        impl From<Arc<str>> for $i {
            fn from(s: Arc<str>) -> Self {
                Self(s)
            }
        }

        impl serde::Serialize for $i {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $i {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s: String = serde::Deserialize::deserialize(deserializer)?;
                Ok(Self(s.into()))
            }
        }
    };
}

imp_str_newtype!(
    ResourceKey,
    "Identifies a logical, independently fetchable unit of data. \
     Two registrations with equal keys share one resource entry. \
     Keys are restricted to strings so lookup is cheap and well-defined."
);

imp_str_newtype!(
    ConsumerId,
    "Identifies an external entity registering interest in one or \
     more resources. Assigned by the embedding layer."
);

/// Process-unique identity of a live resource entry,
/// monotonically assigned by the registry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ResourceId(pub u64);

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("#{}", self.0))
    }
}
