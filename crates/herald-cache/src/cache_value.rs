use serde_json::Value;

use crate::cache_tiers::CacheError;

/// Default serialized size above which values are stored in wrapped form.
pub const DEFAULT_WRAP_THRESHOLD_BYTES: usize = 16 * 1024;

/// Stored representation of a cached value.
///
/// Small values stay as a parsed [`Value`]. Large values are kept as their
/// serialized text so the tier holds one contiguous allocation instead of a
/// deep tree. Callers never see this type; [`CachedValue::decode`] is the only
/// way back to a [`Value`].
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Raw(Value),
    Wrapped(Box<str>),
}

impl CachedValue {
    /// Encodes `value`, wrapping it when its serialized size exceeds `threshold_bytes`.
    ///
    /// Returns the stored form and the serialized size used for accounting.
    pub fn encode(value: Value, threshold_bytes: usize) -> Result<(Self, usize), CacheError> {
        let serialized = serde_json::to_string(&value).map_err(CacheError::Encode)?;
        let size = serialized.len();
        if size > threshold_bytes {
            Ok((Self::Wrapped(serialized.into_boxed_str()), size))
        } else {
            Ok((Self::Raw(value), size))
        }
    }

    pub fn decode(&self) -> Result<Value, CacheError> {
        match self {
            Self::Raw(value) => Ok(value.clone()),
            Self::Wrapped(serialized) => {
                serde_json::from_str(serialized).map_err(CacheError::Decode)
            }
        }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, Self::Wrapped(_))
    }
}
