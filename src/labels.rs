//! Stable label and annotation keys shared across all four controllers, plus
//! small helpers for building the selectors and owner references that bind
//! Pods/Services/PVCs to the CRD that owns them.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Resource;
use std::collections::BTreeMap;

/// On Pods and Services owned by a Sandbox: `NameHash(sandbox.name)`.
pub const SANDBOX_NAME_HASH: &str = "agents.x-k8s.io/sandbox-name-hash";

/// On Pods belonging to a WarmPool: `NameHash(pool.name)`.
pub const POOL: &str = "agents.x-k8s.io/pool";

/// On pool Pods: `NameHash(template.name)`. Enables adoption lookup by a
/// Claim controller without knowing which pool produced the pod.
pub const SANDBOX_TEMPLATE_REF_HASH: &str = "agents.x-k8s.io/sandbox-template-ref-hash";

/// On Pods fulfilled by a Claim: `claim.uid`. Drives NetworkPolicy selection.
pub const CLAIM_UID: &str = "agents.x-k8s.io/claim-uid";

/// On a Sandbox: binds it to a pre-warmed Pod adopted by its owning Claim.
pub const POD_NAME_ANNOTATION: &str = "agents.x-k8s.io/pod-name";

/// W3C-style trace parent, propagated Claim -> Sandbox -> Pod verbatim.
pub const TRACE_CONTEXT_ANNOTATION: &str = "agents.x-k8s.io/trace-context";

/// Build the selector string `"<key>=<value>"` used in `status.labelSelector`
/// and as the basis for list-by-label queries.
pub fn selector(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// Build an owner reference identifying `owner` as the sole controller of a
/// child object, with `blockOwnerDeletion=true` so the child cannot outlive
/// a parent that is still being finalized.
pub fn controller_owner_ref<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&())
}

/// True if `refs` contains a controller reference (controller=true) whose
/// `uid` matches `owner_uid`.
pub fn is_controlled_by(refs: Option<&Vec<OwnerReference>>, owner_uid: &str) -> bool {
    refs.is_some_and(|refs| {
        refs.iter()
            .any(|r| r.controller == Some(true) && r.uid == owner_uid)
    })
}

/// Returns the controller reference (controller=true), if any.
pub fn controller_ref(refs: Option<&Vec<OwnerReference>>) -> Option<&OwnerReference> {
    refs.and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/// Merge user-supplied labels with one derived label, favoring the derived
/// value if the user happened to set the same key (it shouldn't, but derived
/// identity must never be shadowed).
pub fn merge_labels(
    user: Option<&BTreeMap<String, String>>,
    extra: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    let mut merged = user.cloned().unwrap_or_default();
    for (k, v) in extra {
        merged.insert(k, v);
    }
    merged
}
