//! Pure decision logic for the SandboxWarmPool reconciler: partitioning
//! observed pool Pods by ownership, and deciding how many to create or
//! delete (and which ones) to converge on `spec.replicas`.

use chrono::{DateTime, Utc};

use crate::hash::name_hash;
use crate::labels;

/// A minimal view of a Pod sufficient to make pool-membership and
/// scale decisions, independent of the orchestrator client's types.
#[derive(Debug, Clone)]
pub struct PodView {
    pub name: String,
    pub controller_uid: Option<String>,
    pub controller_kind: Option<String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub ready: bool,
    pub creation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub owned: Vec<String>,
    pub orphaned: Vec<String>,
    pub foreign: Vec<String>,
    pub deleting: Vec<String>,
}

/// Partition pods already filtered by the pool's label selector, per
/// §4.3 step 4. `pool_uid` is the WarmPool's own uid.
pub fn partition(pods: &[PodView], pool_uid: &str) -> Partition {
    let mut result = Partition::default();
    for pod in pods {
        if pod.deletion_timestamp.is_some() {
            result.deleting.push(pod.name.clone());
            continue;
        }
        match (&pod.controller_kind, &pod.controller_uid) {
            (None, None) => result.orphaned.push(pod.name.clone()),
            (Some(kind), Some(uid)) if kind == "SandboxWarmPool" && uid == pool_uid => {
                result.owned.push(pod.name.clone())
            }
            _ => result.foreign.push(pod.name.clone()),
        }
    }
    result
}

/// The pool-membership label pair every pool Pod must carry.
pub fn pool_labels(pool_name: &str, template_name: &str) -> [(String, String); 2] {
    [
        (labels::POOL.to_string(), name_hash(pool_name)),
        (
            labels::SANDBOX_TEMPLATE_REF_HASH.to_string(),
            name_hash(template_name),
        ),
    ]
}

/// Decision for how many pods to create or delete this reconcile, per §4.3
/// steps 6-7. `owned_count` must already reflect adoption of any orphans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    CreateCount(i32),
    DeleteCount(i32),
    Steady,
}

pub fn scale_decision(owned_count: i32, desired: i32) -> ScaleDecision {
    if owned_count < desired {
        ScaleDecision::CreateCount(desired - owned_count)
    } else if owned_count > desired {
        ScaleDecision::DeleteCount(owned_count - desired)
    } else {
        ScaleDecision::Steady
    }
}

/// Choose which `count` owned pods to delete when scaling down: not-ready
/// pods first, then youngest (least-invested) among equally-ready pods.
pub fn choose_deletion_candidates(owned: &[PodView], count: usize) -> Vec<String> {
    let mut sorted: Vec<&PodView> = owned.iter().collect();
    sorted.sort_by(|a, b| {
        a.ready
            .cmp(&b.ready)
            .then_with(|| b.creation_timestamp.cmp(&a.creation_timestamp))
    });
    sorted
        .into_iter()
        .take(count)
        .map(|p| p.name.clone())
        .collect()
}
