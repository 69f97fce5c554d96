//! Admission key construction.

use std::fmt;

use super::classifier::EndpointType;
use crate::error::{ReadgateError, Result};

/// A key that uniquely identifies a throttled (category, caller) pair.
///
/// Serialized as `"<CATEGORY>:<caller>"`, e.g. `"GENERATION:session-a"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdmissionKey {
    /// The category this key throttles
    pub category: EndpointType,
    /// Caller identity (session, user or client address)
    pub caller: String,
}

impl AdmissionKey {
    /// Create a new admission key.
    ///
    /// An empty caller identity would collapse every anonymous caller onto one
    /// shared counter, so it is rejected.
    pub fn new(category: EndpointType, caller: &str) -> Result<Self> {
        if caller.is_empty() {
            return Err(ReadgateError::InvalidArgument(
                "caller identity must not be empty".to_string(),
            ));
        }

        Ok(Self {
            category,
            caller: caller.to_string(),
        })
    }

    /// The string form stored in the counter store.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.category.as_str(), self.caller)
    }
}

impl fmt::Display for AdmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category.as_str(), self.caller)
    }
}
