// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use symbolic::debuginfo::Object;

/// Stable identifier correlating a binary image with its debug info.
///
/// Backed by the image's embedded debug identifier (GNU build id for ELF,
/// PDB GUID and age for PE). Images built without one get a content hash of
/// their bytes instead, so they can still key the cross-run analysis caches.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BuildId(String);

impl BuildId {
    pub fn from_image_data(data: &[u8]) -> Self {
        if let Ok(object) = Object::parse(data) {
            let id = object.debug_id();

            if !id.is_nil() {
                return Self(format!("{id}"));
            }
        }

        Self::content_hash(data)
    }

    pub fn content_hash(data: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);

        Self(format!("content-{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let data = b"\x7fELF-but-not-really";

        let a = BuildId::content_hash(data);
        let b = BuildId::content_hash(data);
        assert_eq!(a, b);

        let c = BuildId::content_hash(b"different bytes");
        assert_ne!(a, c);
    }

    #[test]
    fn test_unparseable_data_still_keys() {
        // Arbitrary non-object data must still produce a usable cache key.
        let id = BuildId::from_image_data(b"not an object file");
        assert!(id.as_str().starts_with("content-"));
    }
}
