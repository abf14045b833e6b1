use std::collections::HashMap;
use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{InstanceDesc, Operation, Ring, RingError};

/// Errors from [`do_batch`].
#[derive(Debug, Error)]
pub enum DoBatchError<E> {
    /// A key could not be resolved against the ring.
    #[error(transparent)]
    Ring(RingError),

    /// A key exhausted its per-replica failure budget; carries the error
    /// that tipped it over.
    #[error("write quorum not reached: {0}")]
    Call(E),

    /// Every callback finished yet some key is missing its quorum
    /// (a callback task died without reporting).
    #[error("batch ended without a verdict for every key")]
    Incomplete,
}

/// Fan a batch of keys out to their replica instances and wait for a
/// write quorum on every key.
///
/// Keys are grouped by target instance and `f` is invoked once per
/// instance with the indexes of the keys routed to it. The batch succeeds
/// as soon as every key has been accepted by at least
/// `replication_factor - max_failures` instances, and fails as soon as any
/// key sees more than its failure budget of errors.
///
/// Callback tasks are spawned detached: once the verdict is known the
/// call returns without waiting for (or cancelling) laggards, so
/// replication to slow replicas still completes.
pub async fn do_batch<F, Fut, E>(
    ring: &Ring,
    op: Operation,
    keys: &[u32],
    f: F,
) -> Result<(), DoBatchError<E>>
where
    F: Fn(InstanceDesc, Vec<usize>) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Send + 'static,
{
    if keys.is_empty() {
        return Ok(());
    }

    let mut per_instance: HashMap<String, (InstanceDesc, Vec<usize>)> = HashMap::new();
    let mut min_success = vec![0_i64; keys.len()];
    let mut failure_budget = vec![0_i64; keys.len()];

    for (idx, key) in keys.iter().enumerate() {
        let set = ring.get(*key, op).map_err(DoBatchError::Ring)?;
        min_success[idx] = set.min_success() as i64;
        failure_budget[idx] = set.max_failures() as i64;
        for instance in set.instances {
            per_instance
                .entry(instance.id.clone())
                .or_insert_with(|| (instance, vec![]))
                .1
                .push(idx);
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (_, (instance, indexes)) in per_instance {
        let fut = f(instance, indexes.clone());
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = fut.await;
            let _ = tx.send((indexes, result));
        });
    }
    drop(tx);

    let mut done = vec![false; keys.len()];
    let mut completed = 0_usize;
    while let Some((indexes, result)) = rx.recv().await {
        match result {
            Ok(()) => {
                for idx in indexes {
                    if done[idx] {
                        continue;
                    }
                    min_success[idx] -= 1;
                    if min_success[idx] <= 0 {
                        done[idx] = true;
                        completed += 1;
                    }
                }
                if completed == keys.len() {
                    return Ok(());
                }
            }
            Err(e) => {
                for idx in &indexes {
                    failure_budget[*idx] -= 1;
                    if failure_budget[*idx] < 0 {
                        return Err(DoBatchError::Call(e));
                    }
                }
            }
        }
    }

    Err(DoBatchError::Incomplete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::test_util::{active_instance, ring_with};
    use crate::RingConfig;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn test_ring(replication_factor: usize) -> Ring {
        ring_with(
            RingConfig {
                replication_factor,
                ..Default::default()
            },
            [
                active_instance("i1", "a", vec![1_000_000_000]),
                active_instance("i2", "a", vec![2_000_000_000]),
                active_instance("i3", "a", vec![3_000_000_000]),
            ],
        )
    }

    #[tokio::test]
    async fn test_quorum_success() {
        let ring = test_ring(3);
        let calls: Arc<Mutex<Vec<(String, Vec<usize>)>>> = Default::default();

        let captured = Arc::clone(&calls);
        let got = do_batch::<_, _, std::io::Error>(
            &ring,
            Operation::Write,
            &[500_000_000, 2_500_000_000],
            move |instance, indexes| {
                captured.lock().push((instance.id, indexes));
                async { Ok(()) }
            },
        )
        .await;

        assert_matches!(got, Ok(()));
        // RF=3 over 3 instances: every instance received both keys.
        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        for (_, indexes) in calls.iter() {
            assert_eq!(indexes, &vec![0, 1]);
        }
    }

    #[tokio::test]
    async fn test_tolerates_single_failure() {
        let ring = test_ring(3);

        let got = do_batch(
            &ring,
            Operation::Write,
            &[500_000_000],
            |instance, _indexes| async move {
                if instance.id == "i2" {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "down"))
                } else {
                    Ok(())
                }
            },
        )
        .await;

        assert_matches!(got, Ok(()));
    }

    #[tokio::test]
    async fn test_fails_when_budget_exceeded() {
        let ring = test_ring(3);

        let got = do_batch(
            &ring,
            Operation::Write,
            &[500_000_000],
            |instance, _indexes| async move {
                if instance.id == "i1" {
                    Ok(())
                } else {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "down"))
                }
            },
        )
        .await;

        assert_matches!(got, Err(DoBatchError::Call(_)));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let ring = test_ring(3);
        let got = do_batch::<_, _, std::io::Error>(&ring, Operation::Write, &[], |_, _| async {
            Ok(())
        })
        .await;
        assert_matches!(got, Ok(()));
    }
}
