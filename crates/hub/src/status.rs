//! Conflict-safe status updates.
//!
//! `update_status` runs read → copy status → apply mutations → compare → write,
//! retrying the whole cycle when the write loses an optimistic-concurrency race.
//! Mutations must be pure functions of the status: a retry re-applies all of them
//! to the freshly read status.

use fleethub_core::conditions::{self, HasConditions};
use fleethub_core::{AddOn, ClusterSet, Condition, Error, Member, Object, ObjectKey, ObjectStore, Result};
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

/// A pure, re-appliable edit of a status value.
pub type StatusMutation<S> = Box<dyn Fn(&mut S) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate<S> {
    /// Status after the mutations; the stored status when a write happened.
    pub status: S,
    /// Whether a write reached the store.
    pub updated: bool,
}

/// Mutation that sets `desired` into the status' condition list.
pub fn set_condition<S: HasConditions + 'static>(desired: Condition) -> StatusMutation<S> {
    Box::new(move |status: &mut S| {
        conditions::set_condition(status.conditions_mut(), desired.clone());
        Ok(())
    })
}

/// Read-mutate-write the status of object `key`.
///
/// Returns `(status, updated=false)` without writing when the mutations leave
/// the status semantically unchanged. Write conflicts are retried per `policy`
/// and end in [`Error::ConflictExhausted`]; any other error is returned as is.
/// When `deadline` passes the call fails with [`Error::DeadlineExceeded`].
pub async fn update_status<T, S>(
    store: &S,
    key: &ObjectKey,
    mutations: &[StatusMutation<T::Status>],
    policy: &RetryPolicy,
    deadline: Option<Instant>,
) -> Result<StatusUpdate<T::Status>>
where
    T: Object,
    S: ObjectStore,
{
    let attempts = retry_on_conflict::<T, S>(store, key, mutations, policy);
    match deadline {
        Some(at) => tokio::time::timeout_at(at, attempts).await.map_err(|_| {
            counter!("status_update_deadline_total", 1u64);
            Error::DeadlineExceeded { kind: T::KIND, key: key.clone() }
        })?,
        None => attempts.await,
    }
}

async fn retry_on_conflict<T, S>(
    store: &S,
    key: &ObjectKey,
    mutations: &[StatusMutation<T::Status>],
    policy: &RetryPolicy,
) -> Result<StatusUpdate<T::Status>>
where
    T: Object,
    S: ObjectStore,
{
    let steps = policy.steps.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let mut obj: T = store.get(key).await?.ok_or_else(|| Error::not_found(T::KIND, key))?;

        let mut next = obj.status().clone();
        for mutate in mutations {
            mutate(&mut next)?;
        }
        if &next == obj.status() {
            debug!(kind = %T::KIND, key = %key, "status unchanged; skipping write");
            return Ok(StatusUpdate { status: next, updated: false });
        }

        *obj.status_mut() = next;
        match store.update_status(&obj).await {
            Ok(written) => {
                counter!("status_update_writes_total", 1u64);
                return Ok(StatusUpdate { status: written.status().clone(), updated: true });
            }
            Err(e) if e.is_conflict() => {
                counter!("status_update_conflicts_total", 1u64);
                if attempt >= steps {
                    warn!(kind = %T::KIND, key = %key, attempts = attempt, "status update conflicts exhausted");
                    return Err(Error::ConflictExhausted { kind: T::KIND, key: key.clone(), attempts: attempt });
                }
                let delay = policy.delay(attempt);
                debug!(kind = %T::KIND, key = %key, attempt, delay_ms = delay.as_millis() as u64, error = %e, "status write conflict; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Set one condition on a cluster set's status.
pub async fn update_cluster_set_condition<S: ObjectStore>(
    store: &S,
    name: &str,
    desired: Condition,
    policy: &RetryPolicy,
) -> Result<StatusUpdate<<ClusterSet as Object>::Status>> {
    update_status::<ClusterSet, S>(store, &ObjectKey::cluster(name), &[set_condition(desired)], policy, None).await
}

/// Set one condition on a managed cluster's status.
pub async fn update_member_condition<S: ObjectStore>(
    store: &S,
    name: &str,
    desired: Condition,
    policy: &RetryPolicy,
) -> Result<StatusUpdate<<Member as Object>::Status>> {
    update_status::<Member, S>(store, &ObjectKey::cluster(name), &[set_condition(desired)], policy, None).await
}

/// Set one condition on an add-on's status. Add-ons live in the namespace of
/// the managed cluster they are installed on.
pub async fn update_addon_condition<S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
    desired: Condition,
    policy: &RetryPolicy,
) -> Result<StatusUpdate<<AddOn as Object>::Status>> {
    update_status::<AddOn, S>(store, &ObjectKey::namespaced(namespace, name), &[set_condition(desired)], policy, None).await
}
