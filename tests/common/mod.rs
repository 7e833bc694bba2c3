use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Container, Pod, PodCondition, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

/// A minimal Pod fixture, optionally owned by a controller of the given
/// kind/uid and optionally Ready, aged by `age_secs`.
pub fn make_test_pod(
    name: &str,
    namespace: &str,
    owner_kind: Option<(&str, &str)>,
    ready: bool,
    age_secs: i64,
) -> Pod {
    let owner_references = owner_kind.map(|(kind, uid)| {
        vec![OwnerReference {
            api_version: "extensions.agents.x-k8s.io/v1alpha1".to_string(),
            kind: kind.to_string(),
            name: "owner".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references,
            creation_timestamp: Some(Time(Utc::now() - Duration::seconds(age_secs))),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                image: Some("pause".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            conditions: if ready {
                Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }])
            } else {
                None
            },
            ..Default::default()
        }),
    }
}

pub fn seconds_from_now(secs: i64) -> DateTime<Utc> {
    Utc::now() + Duration::seconds(secs)
}

pub fn seconds_ago(secs: i64) -> DateTime<Utc> {
    Utc::now() - Duration::seconds(secs)
}
