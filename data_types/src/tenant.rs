use std::borrow::Borrow;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use thiserror::Error;

/// Maximum length of a tenant identifier.
pub const MAX_TENANT_ID_LENGTH: usize = 150;

/// Errors validating a [`TenantId`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantIdError {
    /// The identifier is empty.
    #[error("tenant id cannot be empty")]
    Empty,

    /// The identifier exceeds [`MAX_TENANT_ID_LENGTH`].
    #[error("tenant id exceeds {MAX_TENANT_ID_LENGTH} characters")]
    TooLong,

    /// The identifier contains a character outside `[a-zA-Z0-9_-]`.
    #[error("tenant id contains invalid character {0:?}")]
    BadChar(char),
}

/// The opaque identifier of a tenant, present in every request.
///
/// Every limit and every ring subshard is keyed by it, so the charset is
/// restricted to characters that are safe in object-store paths and metric
/// attributes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(Arc<str>);

impl TenantId {
    /// Validate and create a tenant id.
    pub fn new(id: impl AsRef<str>) -> Result<Self, TenantIdError> {
        let id = id.as_ref();
        if id.is_empty() {
            return Err(TenantIdError::Empty);
        }
        if id.len() > MAX_TENANT_ID_LENGTH {
            return Err(TenantIdError::TooLong);
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(TenantIdError::BadChar(c));
        }
        Ok(Self(Arc::from(id)))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TenantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for TenantId {
    type Error = TenantIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
