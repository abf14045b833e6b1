//! The composable push handler chain.
//!
//! Each stage wraps the next and may transform the request on the way
//! down; the outermost stage is evaluated first. The production chain is
//! instance limits → receive metrics → HA dedup → relabel → validation →
//! dispatch.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use data_types::TenantId;

use crate::PushError;

mod dispatch;
mod ha_dedupe;
mod instance_limits;
mod receive_metrics;
mod relabel;
mod validation;

pub use dispatch::*;
pub use ha_dedupe::*;
pub use instance_limits::*;
pub use receive_metrics::*;
pub use relabel::*;
pub use validation::*;

/// A composable, abstract handler of push requests.
///
/// By allowing handlers to vary their input type, a chain of
/// implementations can transform the request as it progresses through the
/// pipeline.
#[async_trait]
pub trait PushHandler: Debug + Send + Sync {
    /// The input type this handler expects.
    type Input: Debug + Send + Sync + 'static;

    /// The (possibly transformed) output type produced by this handler.
    type Output: Debug + Send + Sync;

    /// Process `input` on behalf of `tenant`.
    async fn handle(
        &self,
        tenant: &TenantId,
        input: Self::Input,
    ) -> Result<Self::Output, PushError>;
}

#[async_trait]
impl<T> PushHandler for Arc<T>
where
    T: PushHandler,
{
    type Input = T::Input;
    type Output = T::Output;

    async fn handle(
        &self,
        tenant: &TenantId,
        input: Self::Input,
    ) -> Result<Self::Output, PushError> {
        (**self).handle(tenant, input).await
    }
}
