//! Wires the four reconcile loops to `kube::runtime::Controller` and serves
//! Prometheus metrics plus liveness/readiness probes. The decision logic
//! itself lives in `sandbox_operator::{sandbox, claim, warmpool, template,
//! conditions}` -- this module is cluster I/O and nothing else.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use prometheus::{Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use sandbox_operator::conditions::{self, reasons};
use sandbox_operator::crd::{
    Sandbox, SandboxClaim, SandboxClaimStatus, SandboxStatus, SandboxTemplate, SandboxWarmPool,
    SandboxWarmPoolStatus,
};
use sandbox_operator::hash::name_hash;
use sandbox_operator::{claim, labels, sandbox, warmpool};

const FIELD_MANAGER: &str = "sandbox-operator";
const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);
const CLUSTER_DOMAIN: &str = "cluster.local";

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let v = IntCounterVec::new(
        prometheus::Opts::new("sandbox_operator_reconcile_total", "Total reconcile cycles"),
        &["controller"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(v.clone()))
        .expect("metric not yet registered");
    v
});

static RECONCILE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let v = IntCounterVec::new(
        prometheus::Opts::new(
            "sandbox_operator_reconcile_errors_total",
            "Total reconcile errors",
        ),
        &["controller"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(v.clone()))
        .expect("metric not yet registered");
    v
});

static RECONCILE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    let v = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "sandbox_operator_reconcile_duration_seconds",
            "Duration of each reconcile cycle in seconds",
        ),
        &["controller"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(v.clone()))
        .expect("metric not yet registered");
    v
});

static ADOPTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let v = IntCounterVec::new(
        prometheus::Opts::new(
            "sandbox_operator_pod_adoptions_total",
            "Total warm pods adopted by a claim instead of cold-starting",
        ),
        &["namespace"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(v.clone()))
        .expect("metric not yet registered");
    v
});

/* ============================= STATE & CONTEXT ============================= */

pub(crate) struct ReconcileState {
    pub(crate) ready: bool,
}

struct OperatorContext {
    client: Client,
    reporter: Reporter,
}

impl OperatorContext {
    fn recorder_for<K: Resource<DynamicType = ()>>(&self, obj: &K) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone(), obj.object_ref(&()))
    }
}

/* ============================= ENTRY ============================= */

pub async fn run() -> Result<()> {
    println!("Starting sandbox operator...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let sandboxes: Api<Sandbox> = Api::all(client.clone());
    let templates: Api<SandboxTemplate> = Api::all(client.clone());
    let claims: Api<SandboxClaim> = Api::all(client.clone());
    let warmpools: Api<SandboxWarmPool> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let pvcs: Api<PersistentVolumeClaim> = Api::all(client.clone());
    let netpols: Api<NetworkPolicy> = Api::all(client.clone());

    let ctx = Arc::new(OperatorContext {
        client: client.clone(),
        reporter: "sandbox-operator".into(),
    });

    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&ADOPTIONS_TOTAL);

    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));
    println!("  Watching .................... Sandbox, SandboxTemplate, SandboxClaim, SandboxWarmPool");
    println!("  Metrics server .............. http://{addr}");
    println!("\nOperator running. Press Ctrl+C to stop.\n");

    info!("sandbox_operator_started");

    let reconcile_state = Arc::new(Mutex::new(ReconcileState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = reconcile_state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle =
        tokio::spawn(async move { start_metrics_server(http_state, http_shutdown, addr).await });

    let sandbox_state = reconcile_state.clone();
    let sandbox_ctx = ctx.clone();
    let sandbox_task = tokio::spawn(
        Controller::new(sandboxes, Default::default())
            .owns(pods.clone(), Default::default())
            .owns(services, Default::default())
            .owns(pvcs, Default::default())
            .run(reconcile_sandbox, error_policy_sandbox, sandbox_ctx)
            .for_each(move |result| {
                let state = sandbox_state.clone();
                async move {
                    mark_ready(&state).await;
                    log_dispatch_result("sandbox", result);
                }
            }),
    );

    let warmpool_state = reconcile_state.clone();
    let warmpool_ctx = ctx.clone();
    let warmpool_task = tokio::spawn(
        Controller::new(warmpools, Default::default())
            .owns(pods.clone(), Default::default())
            .run(reconcile_warmpool, error_policy_warmpool, warmpool_ctx)
            .for_each(move |result| {
                let state = warmpool_state.clone();
                async move {
                    mark_ready(&state).await;
                    log_dispatch_result("warmpool", result);
                }
            }),
    );

    let claim_state = reconcile_state.clone();
    let claim_ctx = ctx.clone();
    let claim_controller = Controller::new(claims, Default::default());
    let claim_store = claim_controller.store();
    let claim_task = tokio::spawn(
        claim_controller
            .owns(sandboxes.clone(), Default::default())
            .owns(netpols, Default::default())
            .watches(templates, Default::default(), move |t: SandboxTemplate| {
                let template_name = t.name_any();
                claim_store
                    .state()
                    .into_iter()
                    .filter(move |c| c.spec.sandbox_template_ref.name == template_name)
                    .map(|c| kube::runtime::reflector::ObjectRef::from_obj(c.as_ref()))
                    .collect::<Vec<_>>()
                    .into_iter()
            })
            .run(reconcile_claim, error_policy_claim, claim_ctx)
            .for_each(move |result| {
                let state = claim_state.clone();
                async move {
                    mark_ready(&state).await;
                    log_dispatch_result("claim", result);
                }
            }),
    );

    tokio::select! {
        _ = sandbox_task => info!("sandbox_controller_stream_ended"),
        _ = warmpool_task => info!("warmpool_controller_stream_ended"),
        _ = claim_task => info!("claim_controller_stream_ended"),
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\nShutdown signal received. Stopping operator...");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("sandbox_operator_stopped");
    println!("Operator stopped.");
    Ok(())
}

async fn mark_ready(state: &Arc<Mutex<ReconcileState>>) {
    let mut s = state.lock().await;
    if !s.ready {
        s.ready = true;
    }
}

fn log_dispatch_result<K>(
    controller: &str,
    result: std::result::Result<(kube::runtime::reflector::ObjectRef<K>, Action), kube::runtime::controller::Error<kube::Error, kube::runtime::watcher::Error>>,
) where
    K: kube::Resource,
{
    if let Err(e) = result {
        warn!(controller, error = %e, "reconcile_dispatch_error");
        eprintln!("[ERROR] {controller} reconcile dispatch: {e}");
    }
}

/* ============================= SANDBOX RECONCILER ============================= */

async fn reconcile_sandbox(
    sbx: Arc<Sandbox>,
    ctx: Arc<OperatorContext>,
) -> std::result::Result<Action, kube::Error> {
    RECONCILE_TOTAL.with_label_values(&["sandbox"]).inc();
    let _timer = RECONCILE_DURATION.with_label_values(&["sandbox"]).start_timer();

    let name = sbx.name_any();
    let namespace = sbx.namespace().unwrap_or_default();

    if sbx.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let client = &ctx.client;
    let name_hash_value = name_hash(&name);
    let now = Utc::now();
    let shutdown_time = sbx.spec.shutdown_time.as_ref().map(|t| t.0);
    let expiry = sandbox::evaluate_expiry(shutdown_time.as_ref(), now);
    let expired = matches!(expiry, sandbox::Expiry::Expired);

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &namespace);

    let owner_ref = labels::controller_owner_ref(sbx.as_ref());

    // PVC reconcile: never update, only create-if-absent, and never while expired.
    if !expired {
        if let Some(templates) = &sbx.spec.volume_claim_templates {
            for template in templates {
                let pvc_name = sandbox::pvc_name(template, &name);
                if pvcs.get_opt(&pvc_name).await?.is_none() {
                    let pvc = PersistentVolumeClaim {
                        metadata: ObjectMeta {
                            name: Some(pvc_name),
                            namespace: Some(namespace.clone()),
                            owner_references: owner_ref.clone().map(|r| vec![r]),
                            ..Default::default()
                        },
                        spec: Some(template.spec.clone()),
                        ..Default::default()
                    };
                    pvcs.create(&Default::default(), &pvc).await?;
                }
            }
        }
    }

    // Pod reconcile.
    let pod_desired = sandbox::pod_desired(&sbx.spec, expired);
    let existing_pod = pods.get_opt(&name).await?;
    let pod_name_annotation = sbx
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::POD_NAME_ANNOTATION))
        .cloned();

    // A pod handed off from a WarmPool keeps its `generateName`-derived name
    // (`<pool>-xxxxx`), never `<sandbox-name>` -- so when no pod named
    // `<sandbox-name>` exists yet, the pod-name annotation (if any) is the
    // only way to find the pod this Sandbox was bound to at creation time.
    let adopted_pod = if existing_pod.is_none() {
        match &pod_name_annotation {
            Some(pod_name) => pods.get_opt(pod_name).await?,
            None => None,
        }
    } else {
        None
    };
    let bound_pod_name = existing_pod
        .as_ref()
        .map(|p| p.name_any())
        .or_else(|| adopted_pod.as_ref().map(|p| p.name_any()));

    match (&existing_pod, pod_desired) {
        (Some(pod), _) if !labels::is_controlled_by(pod.owner_references(), &sbx.uid().unwrap_or_default()) => {
            match sandbox::resolve_foreign_pod(pod_name_annotation.as_deref(), &pod.name_any()) {
                sandbox::ForeignPodOutcome::AdoptAsSandboxPod => {
                    // Adopted Pod's owner-references were already cleared during
                    // the claim hand-off; nothing further to do here.
                }
                sandbox::ForeignPodOutcome::Conflict => {
                    let status = sandbox::error_status(
                        format!("pod '{name}' exists and is not controlled by this sandbox"),
                        sbx.metadata.generation,
                    );
                    patch_sandbox_status(client, &namespace, &name, vec![status], None).await?;
                    return Ok(Action::requeue(Duration::from_secs(60)));
                }
            }
        }
        (None, true) if adopted_pod.is_some() => {
            // The pod-name annotation resolved to a real, already-adopted
            // pod (hand-off cleared its owner-references, so it legitimately
            // carries no sandbox-name-matching name): accept it as the
            // sandbox's pod instead of creating a new one.
        }
        (None, true) => {
            let user_labels = sbx.spec.pod_template.metadata.as_ref().and_then(|m| m.labels.as_ref());
            let user_annotations = sbx.spec.pod_template.metadata.as_ref().and_then(|m| m.annotations.clone());
            let mut annotations = user_annotations.unwrap_or_default();
            if let Some(trace) = sbx
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(labels::TRACE_CONTEXT_ANNOTATION))
            {
                annotations.insert(labels::TRACE_CONTEXT_ANNOTATION.to_string(), trace.clone());
            }

            let mut pod_spec = sbx.spec.pod_template.spec.clone().unwrap_or_default();
            if let Some(templates) = &sbx.spec.volume_claim_templates {
                for template in templates {
                    let pvc_name = sandbox::pvc_name(template, &name);
                    pod_spec.volumes.get_or_insert_with(Vec::new).push(
                        k8s_openapi::api::core::v1::Volume {
                            name: template.name.clone(),
                            persistent_volume_claim: Some(
                                k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                                    claim_name: pvc_name,
                                    read_only: None,
                                },
                            ),
                            ..Default::default()
                        },
                    );
                }
            }

            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.clone()),
                    labels: Some(sandbox::child_labels(user_labels, &name)),
                    annotations: Some(annotations),
                    owner_references: owner_ref.clone().map(|r| vec![r]),
                    ..Default::default()
                },
                spec: Some(pod_spec),
                ..Default::default()
            };
            pods.create(&Default::default(), &pod).await?;
        }
        (Some(_), false) => {
            pods.delete(&name, &Default::default()).await.ok();
        }
        _ => {}
    }

    // Service reconcile.
    let service_exists = services.get_opt(&name).await?.is_some();
    if expired {
        if service_exists {
            services.delete(&name, &Default::default()).await.ok();
        }
    } else if !service_exists {
        let mut selector = BTreeMap::new();
        selector.insert(labels::SANDBOX_NAME_HASH.to_string(), name_hash_value.clone());
        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: owner_ref.clone().map(|r| vec![r]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        services.create(&Default::default(), &service).await.ok();
    }

    // Status compute. Re-fetch by whichever name the sandbox's pod is
    // actually bound to -- its own name, or the adopted warm pod's name when
    // that's what `bound_pod_name` resolved to above.
    let effective_pod_name = if pod_desired {
        bound_pod_name.or_else(|| Some(name.clone()))
    } else {
        None
    };
    let refreshed_pod = match &effective_pod_name {
        Some(pod_name) => pods.get_opt(pod_name).await?,
        None => None,
    };
    let observed = sandbox::ObservedChildren {
        pod_desired,
        pod_exists: refreshed_pod.is_some(),
        pod_ready: refreshed_pod.as_ref().is_some_and(pod_is_ready),
        service_exists: !expired && (services.get_opt(&name).await?.is_some()),
    };
    let computed = sandbox::compute_status(expired, &observed, sbx.metadata.generation);

    let mut conditions = sbx
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    conditions::set_condition(&mut conditions, computed.ready);

    let status = SandboxStatus {
        service: (!expired).then(|| name.clone()),
        service_fqdn: (!expired).then(|| sandbox::service_fqdn(&name, &namespace, CLUSTER_DOMAIN)),
        replicas: Some(computed.replicas),
        label_selector: (!expired).then(|| sandbox::selector(&name)),
        conditions: Some(conditions),
    };

    patch_sandbox_status_full(client, &namespace, &name, status, sbx.status.as_ref()).await?;

    match expiry {
        sandbox::Expiry::Pending { requeue_after } => {
            let secs = requeue_after.num_seconds().max(1) as u64;
            Ok(Action::requeue(Duration::from_secs(secs)))
        }
        _ => Ok(Action::requeue(REQUEUE_INTERVAL)),
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

async fn patch_sandbox_status(
    client: &Client,
    namespace: &str,
    name: &str,
    conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
    existing: Option<&SandboxStatus>,
) -> std::result::Result<(), kube::Error> {
    let mut merged = existing
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    for c in conditions {
        conditions::set_condition(&mut merged, c);
    }
    let status = SandboxStatus {
        conditions: Some(merged),
        ..existing.cloned().unwrap_or_default()
    };
    patch_sandbox_status_full(client, namespace, name, status, existing).await
}

async fn patch_sandbox_status_full(
    client: &Client,
    namespace: &str,
    name: &str,
    mut status: SandboxStatus,
    existing: Option<&SandboxStatus>,
) -> std::result::Result<(), kube::Error> {
    if let Some(conds) = status.conditions.as_mut() {
        conditions::sort_conditions(conds);
    }
    let mut existing = existing.cloned().unwrap_or_default();
    if let Some(conds) = existing.conditions.as_mut() {
        conditions::sort_conditions(conds);
    }
    if existing == status {
        return Ok(());
    }

    let api: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn error_policy_sandbox(
    _sbx: Arc<Sandbox>,
    error: &kube::Error,
    _ctx: Arc<OperatorContext>,
) -> Action {
    RECONCILE_ERRORS.with_label_values(&["sandbox"]).inc();
    warn!(controller = "sandbox", error = %error, "reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= WARMPOOL RECONCILER ============================= */

async fn reconcile_warmpool(
    pool: Arc<SandboxWarmPool>,
    ctx: Arc<OperatorContext>,
) -> std::result::Result<Action, kube::Error> {
    RECONCILE_TOTAL.with_label_values(&["warmpool"]).inc();
    let _timer = RECONCILE_DURATION.with_label_values(&["warmpool"]).start_timer();

    let name = pool.name_any();
    let namespace = pool.namespace().unwrap_or_default();
    let client = &ctx.client;

    if pool.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let templates: Api<SandboxTemplate> = Api::namespaced(client.clone(), &namespace);
    let template = templates.get_opt(&pool.spec.sandbox_template_ref.name).await?;
    let Some(template) = template else {
        return Ok(Action::requeue(Duration::from_secs(30)));
    };

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let pool_selector = labels::selector(labels::POOL, &name_hash(&name));
    let listed = pods
        .list(&kube::api::ListParams::default().labels(&pool_selector))
        .await?;

    let pool_uid = pool.uid().unwrap_or_default();
    let owner_ref = labels::controller_owner_ref(pool.as_ref());

    let views: Vec<warmpool::PodView> = listed
        .items
        .iter()
        .map(|p| {
            let controller = labels::controller_ref(p.owner_references());
            warmpool::PodView {
                name: p.name_any(),
                controller_uid: controller.map(|r| r.uid.clone()),
                controller_kind: controller.map(|r| r.kind.clone()),
                deletion_timestamp: p.metadata.deletion_timestamp.as_ref().map(|t| t.0),
                ready: pod_is_ready(p),
                creation_timestamp: p
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| t.0)
                    .unwrap_or_else(Utc::now),
            }
        })
        .collect();

    let partition = warmpool::partition(&views, &pool_uid);

    // Adopt orphans.
    for orphan_name in &partition.orphaned {
        if let Some(owner) = owner_ref.clone() {
            let patch = serde_json::json!({
                "metadata": { "ownerReferences": [owner] }
            });
            pods.patch(
                orphan_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        }
    }

    let owned_count = (partition.owned.len() + partition.orphaned.len()) as i32;
    let decision = warmpool::scale_decision(owned_count, pool.spec.replicas);

    match decision {
        warmpool::ScaleDecision::CreateCount(n) => {
            for _ in 0..n {
                let pod_labels: BTreeMap<String, String> = template
                    .spec
                    .pod_template
                    .metadata
                    .as_ref()
                    .and_then(|m| m.labels.clone())
                    .unwrap_or_default()
                    .into_iter()
                    .chain(warmpool::pool_labels(&name, &template.name_any()))
                    .collect();

                let new_pod = Pod {
                    metadata: ObjectMeta {
                        generate_name: Some(format!("{name}-")),
                        namespace: Some(namespace.clone()),
                        labels: Some(pod_labels),
                        owner_references: owner_ref.clone().map(|r| vec![r]),
                        ..Default::default()
                    },
                    spec: template.spec.pod_template.spec.clone(),
                    ..Default::default()
                };
                pods.create(&Default::default(), &new_pod).await?;
            }
        }
        warmpool::ScaleDecision::DeleteCount(n) => {
            let owned_views: Vec<warmpool::PodView> = views
                .iter()
                .filter(|v| partition.owned.contains(&v.name))
                .cloned()
                .collect();
            for victim in warmpool::choose_deletion_candidates(&owned_views, n as usize) {
                pods.delete(&victim, &Default::default()).await.ok();
            }
        }
        warmpool::ScaleDecision::Steady => {}
    }

    let status = SandboxWarmPoolStatus {
        replicas: Some(owned_count),
    };
    if pool.status.as_ref() != Some(&status) {
        let api: Api<SandboxWarmPool> = Api::namespaced(client.clone(), &namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
    }

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

fn error_policy_warmpool(
    _pool: Arc<SandboxWarmPool>,
    error: &kube::Error,
    _ctx: Arc<OperatorContext>,
) -> Action {
    RECONCILE_ERRORS.with_label_values(&["warmpool"]).inc();
    warn!(controller = "warmpool", error = %error, "reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= CLAIM RECONCILER ============================= */

async fn reconcile_claim(
    claim_obj: Arc<SandboxClaim>,
    ctx: Arc<OperatorContext>,
) -> std::result::Result<Action, kube::Error> {
    RECONCILE_TOTAL.with_label_values(&["claim"]).inc();
    let _timer = RECONCILE_DURATION.with_label_values(&["claim"]).start_timer();

    let name = claim_obj.name_any();
    let namespace = claim_obj.namespace().unwrap_or_default();
    let client = &ctx.client;

    if claim_obj.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let claim_uid = claim_obj.uid().unwrap_or_default();
    let now = Utc::now();
    let lifecycle = claim_obj.spec.lifecycle.clone().unwrap_or_default();
    let shutdown_time = lifecycle.shutdown_time.as_ref().map(|t| t.0);
    let expired = claim::is_expired(shutdown_time.as_ref(), now);

    let claims: Api<SandboxClaim> = Api::namespaced(client.clone(), &namespace);
    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);

    let existing_trace = claim_obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::TRACE_CONTEXT_ANNOTATION))
        .map(String::as_str);
    let current_trace_id = tracing::Span::current()
        .id()
        .map(|id| format!("{:016x}", id.into_u64()));
    if let Some(trace) = claim::trace_context_bootstrap(existing_trace, current_trace_id.as_deref()) {
        let mut annotations = serde_json::Map::new();
        annotations.insert(labels::TRACE_CONTEXT_ANNOTATION.to_string(), serde_json::Value::String(trace));
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        claims
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    match claim::expiry_action(expired, lifecycle.effective_policy()) {
        claim::ExpiryAction::SelfDelete => {
            claims.delete(&name, &Default::default()).await.ok();
            return Ok(Action::await_change());
        }
        claim::ExpiryAction::RetainAfterExpiry => {
            let was_already_expired = claim_obj
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .and_then(|c| conditions::find(c, conditions::READY))
                .is_some_and(|c| c.reason == reasons::CLAIM_EXPIRED);
            if sandboxes.get_opt(&name).await?.is_some() {
                sandboxes.delete(&name, &Default::default()).await.ok();
            }
            if !was_already_expired {
                ctx.recorder_for(claim_obj.as_ref())
                    .publish(&Event {
                        type_: EventType::Normal,
                        reason: "ClaimExpired".into(),
                        note: Some(format!("SandboxClaim '{name}' shutdown time reached")),
                        action: "Reconciling".into(),
                        secondary: None,
                    })
                    .await?;
            }
            let mut conditions = claim_obj
                .status
                .as_ref()
                .and_then(|s| s.conditions.clone())
                .unwrap_or_default();
            conditions::set_condition(
                &mut conditions,
                claim::compute_claim_ready(claim::ClaimStatusInput::Expired, claim_obj.metadata.generation),
            );
            let status = SandboxClaimStatus {
                sandbox: None,
                conditions: Some(conditions),
            };
            patch_claim_status(client, &namespace, &name, status, claim_obj.status.as_ref()).await?;
            return Ok(Action::requeue(REQUEUE_INTERVAL));
        }
        claim::ExpiryAction::RunActiveReconcile => {}
    }

    let templates: Api<SandboxTemplate> = Api::namespaced(client.clone(), &namespace);
    let template = templates
        .get_opt(&claim_obj.spec.sandbox_template_ref.name)
        .await?;

    // NetworkPolicy reconcile -- must precede Sandbox creation.
    let netpols: Api<NetworkPolicy> = Api::namespaced(client.clone(), &namespace);
    let netpol_name = claim::network_policy_name(&name);
    if let Some(t) = &template {
        if let Some(np_spec) = &t.spec.network_policy {
            let mut selector = BTreeMap::new();
            selector.insert(labels::CLAIM_UID.to_string(), claim_uid.clone());
            let desired = NetworkPolicy {
                metadata: ObjectMeta {
                    name: Some(netpol_name.clone()),
                    namespace: Some(namespace.clone()),
                    owner_references: labels::controller_owner_ref(claim_obj.as_ref()).map(|r| vec![r]),
                    ..Default::default()
                },
                spec: Some(NetworkPolicySpec {
                    pod_selector: k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
                        match_labels: Some(selector),
                        ..Default::default()
                    },
                    policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                    ingress: np_spec.ingress.clone(),
                    egress: np_spec.egress.clone(),
                }),
            };
            if netpols.get_opt(&netpol_name).await?.is_none() {
                netpols.create(&Default::default(), &desired).await?;
            } else {
                let patch = serde_json::json!({ "spec": desired.spec });
                netpols
                    .patch(&netpol_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
            }
        } else if netpols.get_opt(&netpol_name).await?.is_some() {
            netpols.delete(&netpol_name, &Default::default()).await.ok();
        }
    }

    let existing_sandbox = sandboxes.get_opt(&name).await?;
    let sandbox_controlled = existing_sandbox
        .as_ref()
        .is_some_and(|s| labels::is_controlled_by(s.owner_references(), &claim_uid));

    let disposition = claim::sandbox_disposition(
        existing_sandbox.is_some(),
        sandbox_controlled,
        template.is_some(),
    );

    match disposition {
        claim::SandboxDisposition::Conflict => {
            let mut conditions = claim_obj
                .status
                .as_ref()
                .and_then(|s| s.conditions.clone())
                .unwrap_or_default();
            conditions::set_condition(
                &mut conditions,
                claim::compute_claim_ready(
                    claim::ClaimStatusInput::ReconcilerError(&format!(
                        "sandbox '{name}' exists and is not controlled by this claim"
                    )),
                    claim_obj.metadata.generation,
                ),
            );
            let status = SandboxClaimStatus {
                sandbox: None,
                conditions: Some(conditions),
            };
            patch_claim_status(client, &namespace, &name, status, claim_obj.status.as_ref()).await?;
            return Ok(Action::requeue(Duration::from_secs(60)));
        }
        claim::SandboxDisposition::NoTemplateNoSandbox => {
            let mut conditions = claim_obj
                .status
                .as_ref()
                .and_then(|s| s.conditions.clone())
                .unwrap_or_default();
            conditions::set_condition(
                &mut conditions,
                claim::compute_claim_ready(
                    claim::ClaimStatusInput::NoTemplateNoSandbox,
                    claim_obj.metadata.generation,
                ),
            );
            let status = SandboxClaimStatus {
                sandbox: None,
                conditions: Some(conditions),
            };
            patch_claim_status(client, &namespace, &name, status, claim_obj.status.as_ref()).await?;
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
        claim::SandboxDisposition::CreateFromTemplate => {
            let t = template.as_ref().expect("template present for CreateFromTemplate");
            create_sandbox_from_template(&ctx, &namespace, &name, &claim_uid, claim_obj.as_ref(), t).await?;
        }
        claim::SandboxDisposition::UseExisting => {}
    }

    let refreshed_sandbox = sandboxes.get_opt(&name).await?;
    let ready_input = if let Some(s) = &refreshed_sandbox {
        let sandbox_ready = s
            .status
            .as_ref()
            .and_then(|st| st.conditions.as_ref())
            .and_then(|conds| conditions::find(conds, conditions::READY));
        match sandbox_ready {
            Some(c) if c.reason == reasons::SANDBOX_EXPIRED => claim::ClaimStatusInput::SandboxExpired,
            Some(c) => claim::ClaimStatusInput::MirrorSandbox { sandbox_ready: c },
            None => claim::ClaimStatusInput::NoTemplateNoSandbox,
        }
    } else {
        claim::ClaimStatusInput::NoTemplateNoSandbox
    };

    let mut conditions = claim_obj
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    conditions::set_condition(
        &mut conditions,
        claim::compute_claim_ready(ready_input, claim_obj.metadata.generation),
    );

    let status = SandboxClaimStatus {
        sandbox: refreshed_sandbox.as_ref().map(|s| sandbox_operator::crd::ClaimSandboxRef {
            name: s.name_any(),
        }),
        conditions: Some(conditions),
    };
    patch_claim_status(client, &namespace, &name, status, claim_obj.status.as_ref()).await?;

    match shutdown_time {
        Some(t) => {
            let secs = (t - now).num_seconds().max(1) as u64;
            Ok(Action::requeue(Duration::from_secs(secs)))
        }
        None => Ok(Action::requeue(REQUEUE_INTERVAL)),
    }
}

async fn create_sandbox_from_template(
    ctx: &OperatorContext,
    namespace: &str,
    claim_name: &str,
    claim_uid: &str,
    claim_obj: &SandboxClaim,
    template: &SandboxTemplate,
) -> std::result::Result<(), kube::Error> {
    let client = &ctx.client;
    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), namespace);

    let mut pod_template = template.spec.pod_template.clone();
    let mut pod_spec = pod_template.spec.clone().unwrap_or_default();
    pod_spec.automount_service_account_token = Some(claim::effective_automount_service_account_token(
        pod_spec.automount_service_account_token,
    ));
    pod_template.spec = Some(pod_spec);

    let mut pod_meta = pod_template.metadata.unwrap_or_default();
    let mut pod_labels = pod_meta.labels.unwrap_or_default();
    for (k, v) in claim::new_sandbox_pod_labels(claim_uid) {
        pod_labels.insert(k, v);
    }
    pod_meta.labels = Some(pod_labels);

    let mut pod_annotations = pod_meta.annotations.clone().unwrap_or_default();
    if let Some(trace) = claim_obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::TRACE_CONTEXT_ANNOTATION))
    {
        pod_annotations.insert(labels::TRACE_CONTEXT_ANNOTATION.to_string(), trace.clone());
    }
    pod_meta.annotations = Some(pod_annotations);
    pod_template.metadata = Some(pod_meta);

    // Pod adoption attempt: look for warm pool leftovers matching this template.
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let candidate_selector = claim::adoption_candidate_selector(&template.name_any());
    let listed = pods
        .list(&kube::api::ListParams::default().labels(&candidate_selector))
        .await?;

    let candidates: Vec<claim::AdoptionCandidate> = listed
        .items
        .iter()
        .map(|p| claim::AdoptionCandidate {
            name: p.name_any(),
            ready: pod_is_ready(p),
            creation_timestamp: p
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or_else(Utc::now),
            deletion_timestamp: p.metadata.deletion_timestamp.as_ref().map(|t| t.0),
            controller_kind: labels::controller_ref(p.owner_references()).map(|r| r.kind.clone()),
        })
        .collect();

    let mut adopted_pod_name = None;
    if let Some(chosen) = claim::select_adoption_candidate(&candidates) {
        let change = claim::handoff_label_change(claim_name, claim_uid);
        let mut remove_patch = serde_json::Map::new();
        for key in &change.remove {
            remove_patch.insert((*key).to_string(), serde_json::Value::Null);
        }
        let mut add_patch = serde_json::Map::new();
        for (k, v) in &change.add {
            add_patch.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        add_patch.extend(remove_patch);

        let patch = serde_json::json!({
            "metadata": {
                "labels": add_patch,
                "ownerReferences": null,
            }
        });

        match pods
            .patch(&chosen.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                ADOPTIONS_TOTAL.with_label_values(&[namespace]).inc();
                adopted_pod_name = Some(chosen.name.clone());
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                // Lost the race; fall back to cold-start this reconcile.
            }
            Err(e) => return Err(e),
        }
    }

    let mut annotations = BTreeMap::new();
    if let Some(trace) = claim_obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(labels::TRACE_CONTEXT_ANNOTATION))
    {
        annotations.insert(labels::TRACE_CONTEXT_ANNOTATION.to_string(), trace.clone());
    }
    if let Some(pod_name) = &adopted_pod_name {
        annotations.insert(labels::POD_NAME_ANNOTATION.to_string(), pod_name.clone());
    }

    let sandbox = Sandbox {
        metadata: ObjectMeta {
            name: Some(claim_name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(annotations),
            owner_references: labels::controller_owner_ref(claim_obj).map(|r| vec![r]),
            ..Default::default()
        },
        spec: sandbox_operator::crd::SandboxSpec {
            pod_template,
            replicas: Some(1),
            volume_claim_templates: None,
            shutdown_time: None,
        },
        status: None,
    };

    sandboxes.create(&Default::default(), &sandbox).await?;

    ctx.recorder_for(claim_obj)
        .publish(&Event {
            type_: EventType::Normal,
            reason: "SandboxProvisioned".into(),
            note: Some(format!("Sandbox '{claim_name}' created")),
            action: "Reconciling".into(),
            secondary: None,
        })
        .await?;

    Ok(())
}

async fn patch_claim_status(
    client: &Client,
    namespace: &str,
    name: &str,
    mut status: SandboxClaimStatus,
    existing: Option<&SandboxClaimStatus>,
) -> std::result::Result<(), kube::Error> {
    if let Some(conds) = status.conditions.as_mut() {
        conditions::sort_conditions(conds);
    }
    let mut existing = existing.cloned().unwrap_or_default();
    if let Some(conds) = existing.conditions.as_mut() {
        conditions::sort_conditions(conds);
    }
    if existing == status {
        return Ok(());
    }

    let api: Api<SandboxClaim> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn error_policy_claim(
    _claim: Arc<SandboxClaim>,
    error: &kube::Error,
    _ctx: Arc<OperatorContext>,
) -> Action {
    RECONCILE_ERRORS.with_label_values(&["claim"]).inc();
    warn!(controller = "claim", error = %error, "reconcile_error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= HTTP SERVER ============================= */

pub(crate) fn build_router(state: Arc<Mutex<ReconcileState>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn start_metrics_server(
    state: Arc<Mutex<ReconcileState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    info!(addr = %addr, "metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<ReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(ready: bool) -> Arc<Mutex<ReconcileState>> {
        Arc::new(Mutex::new(ReconcileState { ready }))
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let app = build_router(test_state(false));
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_not_ready_before_first_reconcile() {
        let app = build_router(test_state(false));
        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_ready_after_first_reconcile() {
        let app = build_router(test_state(true));
        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        RECONCILE_TOTAL.with_label_values(&["sandbox"]).inc();
        let app = build_router(test_state(true));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("sandbox_operator_reconcile_total"));
    }

    #[test]
    fn test_pod_is_ready_true() {
        use k8s_openapi::api::core::v1::PodCondition;
        let pod = Pod {
            status: Some(k8s_openapi::api::core::v1::PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(pod_is_ready(&pod));
    }

    #[test]
    fn test_pod_is_ready_false_without_status() {
        assert!(!pod_is_ready(&Pod::default()));
    }
}
