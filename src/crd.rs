//! Custom resource definitions for the sandbox control plane: `Sandbox`,
//! `SandboxTemplate`, `SandboxClaim`, and `SandboxWarmPool`.
//!
//! All four are namespaced. `Sandbox` lives under `agents.x-k8s.io/v1alpha1`;
//! the request/fulfillment layer (`SandboxTemplate`, `SandboxClaim`,
//! `SandboxWarmPool`) lives under `extensions.agents.x-k8s.io/v1alpha1`.

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PodTemplateSpec};
use k8s_openapi::api::networking::v1::{NetworkPolicyEgressRule, NetworkPolicyIngressRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= SANDBOX ============================= */

/// One entry of `spec.volumeClaimTemplates`. Each generates one PVC named
/// `<template-name>-<sandbox-name>`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxVolumeClaimTemplate {
    pub name: String,
    pub spec: PersistentVolumeClaimSpec,
}

/// Sandbox defines the singleton-workload primitive: one Pod, one headless
/// Service, and optional PVCs, with shutdown scheduling and replica gating.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "agents.x-k8s.io",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    shortname = "sandbox",
    status = "SandboxStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    pub pod_template: PodTemplateSpec,

    /// 0 or 1. Absent means 1. 0 means "exists but not running".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_templates: Option<Vec<SandboxVolumeClaimTemplate>>,

    /// Absolute timestamp; when reached, Pod and Service are deleted and
    /// status reports `SandboxExpired`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<Time>,
}

/// Observed state of a Sandbox, reported by the Sandbox controller on every
/// reconcile where it changed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_fqdn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl SandboxSpec {
    /// Effective replica target: absent spec.replicas means 1.
    pub fn effective_replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

/* ============================= TEMPLATE ============================= */

/// Ingress/egress rules a `SandboxClaim` should apply to its fulfilled
/// Sandbox. Copied verbatim onto a generated `NetworkPolicy`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SandboxNetworkPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<NetworkPolicyIngressRule>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<Vec<NetworkPolicyEgressRule>>,
}

/// SandboxTemplate is an immutable blueprint: a pod template plus an
/// optional network policy. It owns no child objects and has no status — it
/// exists purely as a typed, schema-validated record other controllers read.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extensions.agents.x-k8s.io",
    version = "v1alpha1",
    kind = "SandboxTemplate",
    plural = "sandboxtemplates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTemplateSpec {
    pub pod_template: PodTemplateSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<SandboxNetworkPolicySpec>,
}

/* ============================= CLAIM ============================= */

/// Which Template a Claim asks to be instantiated from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTemplateRef {
    pub name: String,
}

/// What should happen to the Sandbox when the Claim expires.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ShutdownPolicy {
    #[default]
    Retain,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClaimLifecycle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_policy: Option<ShutdownPolicy>,
}

impl ClaimLifecycle {
    pub fn effective_policy(&self) -> ShutdownPolicy {
        self.shutdown_policy.clone().unwrap_or_default()
    }
}

/// SandboxClaim is a request to instantiate a Template: either by adopting a
/// pre-warmed Pod from a WarmPool, or by creating a fresh Sandbox.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extensions.agents.x-k8s.io",
    version = "v1alpha1",
    kind = "SandboxClaim",
    plural = "sandboxclaims",
    status = "SandboxClaimStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxClaimSpec {
    pub sandbox_template_ref: SandboxTemplateRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<ClaimLifecycle>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSandboxRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<ClaimSandboxRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/* ============================= WARM POOL ============================= */

/// SandboxWarmPool keeps a pool of pre-warmed Pods (not Sandboxes) matching
/// one template, ready for a Claim to adopt.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extensions.agents.x-k8s.io",
    version = "v1alpha1",
    kind = "SandboxWarmPool",
    plural = "sandboxwarmpools",
    shortname = "swp",
    status = "SandboxWarmPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxWarmPoolSpec {
    pub replicas: i32,
    pub sandbox_template_ref: SandboxTemplateRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxWarmPoolStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/* ============================= TESTS ============================= */
