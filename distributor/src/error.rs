use thiserror::Error;

use crate::client::IngesterError;
use crate::{HaTrackerError, InstanceLimitError, ValidationError};

/// Errors emitted by the push handler chain.
///
/// The variants map onto the response taxonomy: validation failures are
/// the client's fault (400), rate limits ask the client to slow down
/// (429), overload and quorum failures are retriable server errors (5xx),
/// and HA dedup is an accepted-but-dropped outcome (202).
#[derive(Debug, Error)]
pub enum PushError {
    /// The request failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A per-tenant rate limit rejected the request.
    #[error("request rate limited for tenant {tenant}")]
    RequestRateLimited {
        /// The rejected tenant.
        tenant: String,
    },

    /// The tenant's ingestion (samples/sec) limit rejected the request.
    #[error("ingestion rate limited for tenant {tenant}")]
    IngestionRateLimited {
        /// The rejected tenant.
        tenant: String,
    },

    /// An instance-wide protection limit rejected the request.
    #[error(transparent)]
    Overloaded(#[from] InstanceLimitError),

    /// The request came from a non-elected HA replica and was dropped.
    #[error("dropped by HA dedup: replica {replica} is not the elected replica of cluster {cluster}")]
    HaDeduped {
        /// The cluster label value.
        cluster: String,
        /// The non-elected replica.
        replica: String,
    },

    /// The HA tracker could not be consulted.
    #[error("ha tracker error: {0}")]
    HaTracker(#[from] HaTrackerError),

    /// An ingester rejected part of the write.
    #[error("ingester error: {0}")]
    Ingester(#[from] IngesterError),

    /// Fewer than a quorum of replicas acknowledged the write.
    #[error("write quorum not reached: {0}")]
    Quorum(String),
}

impl PushError {
    /// The HTTP status this error maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::RequestRateLimited { .. } | Self::IngestionRateLimited { .. } => 429,
            Self::Overloaded(_) => 500,
            // Accepted-but-deduped is deliberately a success status so HA
            // replicas don't retry their (duplicate) writes.
            Self::HaDeduped { .. } => 202,
            Self::HaTracker(_) => 500,
            Self::Ingester(e) => {
                if e.is_client_error() {
                    400
                } else {
                    500
                }
            }
            Self::Quorum(_) => 500,
        }
    }

    /// Whether the client may retry the request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::RequestRateLimited { .. }
                | Self::IngestionRateLimited { .. }
                | Self::Overloaded(_)
                | Self::HaTracker(_)
                | Self::Quorum(_)
        ) || matches!(self, Self::Ingester(e) if !e.is_client_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            PushError::Validation(ValidationError::MissingMetricName).http_status(),
            400
        );
        assert_eq!(
            PushError::RequestRateLimited {
                tenant: "t".into()
            }
            .http_status(),
            429
        );
        assert_eq!(
            PushError::HaDeduped {
                cluster: "c".into(),
                replica: "r".into()
            }
            .http_status(),
            202
        );
        assert_eq!(PushError::Quorum("boom".into()).http_status(), 500);
    }

    #[test]
    fn test_retriability() {
        assert!(!PushError::Validation(ValidationError::MissingMetricName).is_retriable());
        assert!(PushError::Quorum("boom".into()).is_retriable());
        assert!(PushError::IngestionRateLimited { tenant: "t".into() }.is_retriable());
    }
}
