use std::collections::VecDeque;
use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;

use crate::{InstanceDesc, ReplicationSet};

/// Errors from [`do_until_quorum`].
#[derive(Debug, Error)]
pub enum QuorumError<E> {
    /// More replicas failed than the set's budget allows.
    #[error("replica call failed: {0}")]
    Call(E),

    /// All calls finished without reaching a quorum of responses.
    #[error("quorum of responses not reached")]
    Incomplete,
}

/// Invoke `f` on the replication set's instances and return as soon as a
/// quorum of results has arrived.
///
/// With `minimize_requests` only the minimum number of instances needed
/// for the quorum is queried upfront; laggards are spawned one by one as
/// earlier calls fail. Without it every instance is queried immediately.
/// Outstanding calls are cancelled (dropped) once the quorum is reached;
/// this is a read-path helper, so abandoning laggards is safe.
pub async fn do_until_quorum<T, E, F, Fut>(
    replication_set: &ReplicationSet,
    minimize_requests: bool,
    f: F,
) -> Result<Vec<T>, QuorumError<E>>
where
    F: Fn(InstanceDesc) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let required = replication_set.min_success();
    if replication_set.instances.is_empty() || required == 0 {
        return Ok(vec![]);
    }

    let initial: Vec<&InstanceDesc> = if minimize_requests {
        minimal_request_set(replication_set)
    } else {
        replication_set.instances.iter().collect()
    };
    let mut spare: VecDeque<&InstanceDesc> = replication_set
        .instances
        .iter()
        .filter(|i| !initial.iter().any(|s| s.id == i.id))
        .collect();

    let mut in_flight: FuturesUnordered<Fut> = initial.into_iter().map(|i| f(i.clone())).collect();

    let mut results = Vec::with_capacity(required);
    let mut last_error = None;
    while results.len() < required {
        match in_flight.next().await {
            Some(Ok(value)) => results.push(value),
            Some(Err(e)) => {
                last_error = Some(e);
                if let Some(next) = spare.pop_front() {
                    in_flight.push(f(next.clone()));
                }
            }
            None => {
                return Err(last_error.map(QuorumError::Call).unwrap_or(QuorumError::Incomplete));
            }
        }
    }

    Ok(results)
}

/// The smallest instance subset that can still satisfy the quorum.
///
/// For zone-aware sets this is every instance of the minimum number of
/// zones; otherwise the first `min_success` instances.
fn minimal_request_set(replication_set: &ReplicationSet) -> Vec<&InstanceDesc> {
    if replication_set.max_unavailable_zones > 0 {
        let zones: Vec<String> = replication_set.zones().into_iter().collect();
        let needed_zones = zones.len() - replication_set.max_unavailable_zones;
        let chosen: Vec<&str> = zones.iter().take(needed_zones).map(|z| z.as_str()).collect();
        replication_set
            .instances
            .iter()
            .filter(|i| chosen.contains(&i.zone.as_str()))
            .collect()
    } else {
        replication_set
            .instances
            .iter()
            .take(replication_set.min_success())
            .collect()
    }
}
