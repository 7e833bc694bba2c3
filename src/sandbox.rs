//! Pure decision logic for the Sandbox reconciler: what a Sandbox's Pod,
//! Service, and status *should* look like, given its spec and the presently
//! observed children. None of this touches the orchestrator client — the
//! wiring in `commands::run` fetches/applies, this module decides.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::conditions::{self, reasons};
use crate::crd::{SandboxSpec, SandboxVolumeClaimTemplate};
use crate::hash::name_hash;
use crate::labels;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

/// Whether `S.spec.shutdownTime` has passed, and if not, how long until it
/// does (used to schedule a requeue).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expiry {
    Unset,
    Pending { requeue_after: chrono::Duration },
    Expired,
}

pub fn evaluate_expiry(shutdown_time: Option<&DateTime<Utc>>, now: DateTime<Utc>) -> Expiry {
    match shutdown_time {
        None => Expiry::Unset,
        Some(t) if *t <= now => Expiry::Expired,
        Some(t) => Expiry::Pending {
            requeue_after: *t - now,
        },
    }
}

/// PVC name for one `volumeClaimTemplates` entry: `<template-name>-<sandbox-name>`.
pub fn pvc_name(template: &SandboxVolumeClaimTemplate, sandbox_name: &str) -> String {
    format!("{}-{}", template.name, sandbox_name)
}

/// Whether a Pod is desired for this Sandbox right now.
pub fn pod_desired(spec: &SandboxSpec, expired: bool) -> bool {
    !expired && spec.effective_replicas() != 0
}

/// Labels a Sandbox-owned Pod or Service must carry, merged over any
/// user-supplied labels from the pod template metadata. The hash label is
/// never shadowed by a user-supplied value of the same key.
pub fn child_labels(
    user_labels: Option<&BTreeMap<String, String>>,
    sandbox_name: &str,
) -> BTreeMap<String, String> {
    labels::merge_labels(
        user_labels,
        [(
            labels::SANDBOX_NAME_HASH.to_string(),
            name_hash(sandbox_name),
        )],
    )
}

/// The selector string recorded in `status.labelSelector` and used to build
/// the Service's selector.
pub fn selector(sandbox_name: &str) -> String {
    labels::selector(labels::SANDBOX_NAME_HASH, &name_hash(sandbox_name))
}

/// `status.serviceFQDN` for a Sandbox's headless Service.
pub fn service_fqdn(sandbox_name: &str, namespace: &str, cluster_domain: &str) -> String {
    format!("{sandbox_name}.{namespace}.svc.{cluster_domain}")
}

/// Outcome of deciding what to do about an already-existing Pod that isn't
/// controlled by this Sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignPodOutcome {
    /// Accept it: a warm-handoff annotation names exactly this pod.
    AdoptAsSandboxPod,
    /// Refuse: no handoff annotation matches, or it points elsewhere.
    Conflict,
}

/// Decide what to do when a Pod named `<sandbox-name>` exists but is not
/// controller-owned by this Sandbox. `pod_name_annotation` is
/// `agents.x-k8s.io/pod-name` read off the Sandbox, if set.
pub fn resolve_foreign_pod(
    pod_name_annotation: Option<&str>,
    existing_pod_name: &str,
) -> ForeignPodOutcome {
    match pod_name_annotation {
        Some(name) if name == existing_pod_name => ForeignPodOutcome::AdoptAsSandboxPod,
        _ => ForeignPodOutcome::Conflict,
    }
}

/// Inputs needed to compute a Sandbox's `Ready` condition and replica count.
pub struct ObservedChildren {
    /// Whether a pod is desired at all right now (`replicas != 0` and not expired).
    /// When false, a missing pod is not a readiness gap (scenario: replicas=0).
    pub pod_desired: bool,
    pub pod_exists: bool,
    pub pod_ready: bool,
    pub service_exists: bool,
}

pub struct SandboxStatusCompute {
    pub ready: Condition,
    pub replicas: i32,
}

/// Compute the `Ready` condition and observed replica count per §4.1 step 8.
pub fn compute_status(
    expired: bool,
    observed: &ObservedChildren,
    observed_generation: Option<i64>,
) -> SandboxStatusCompute {
    if expired {
        return SandboxStatusCompute {
            ready: conditions::ready_condition(
                false,
                reasons::SANDBOX_EXPIRED,
                "shutdownTime has passed; pod and service were removed",
                observed_generation,
            ),
            replicas: 0,
        };
    }

    let pod_ok = !observed.pod_desired || (observed.pod_exists && observed.pod_ready);

    if pod_ok && observed.service_exists {
        let message = if observed.pod_desired {
            "pod is ready and service exists"
        } else {
            "service exists; no pod desired (replicas=0)"
        };
        return SandboxStatusCompute {
            ready: conditions::ready_condition(
                true,
                reasons::DEPENDENCIES_READY,
                message,
                observed_generation,
            ),
            replicas: if observed.pod_exists && observed.pod_ready { 1 } else { 0 },
        };
    }

    let mut gaps = Vec::new();
    if observed.pod_desired {
        if !observed.pod_exists {
            gaps.push("pod does not exist");
        } else if !observed.pod_ready {
            gaps.push("pod is not ready");
        }
    }
    if !observed.service_exists {
        gaps.push("service does not exist");
    }
    let message = if gaps.is_empty() {
        "dependencies not ready".to_string()
    } else {
        gaps.join("; ")
    };

    SandboxStatusCompute {
        ready: conditions::ready_condition(
            false,
            reasons::DEPENDENCIES_NOT_READY,
            message,
            observed_generation,
        ),
        replicas: if observed.pod_exists && observed.pod_ready {
            1
        } else {
            0
        },
    }
}

/// A `ReconcilerError` status, used whenever an unexpected failure (or a
/// pod-name conflict) interrupts reconcile before status can be otherwise
/// computed.
pub fn error_status(message: impl Into<String>, observed_generation: Option<i64>) -> Condition {
    conditions::ready_condition(false, reasons::RECONCILER_ERROR, message, observed_generation)
}
