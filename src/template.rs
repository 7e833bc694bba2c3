//! SandboxTemplate is a read-only, schema-validated reference record. It
//! owns no child objects; the controller wiring in `commands::run` only
//! needs to exist so the kind is watched and its CRD gets installed — there
//! is no desired-state computation here beyond what `kube` already validates
//! via the OpenAPI schema on admission.

use crate::crd::SandboxTemplateSpec;

/// True if the template carries a network policy section a Claim should
/// apply to its fulfilled Sandbox.
pub fn has_network_policy(spec: &SandboxTemplateSpec) -> bool {
    spec.network_policy.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SandboxNetworkPolicySpec;

    #[test]
    fn test_has_network_policy_false_when_absent() {
        let spec = SandboxTemplateSpec {
            pod_template: Default::default(),
            network_policy: None,
        };
        assert!(!has_network_policy(&spec));
    }

    #[test]
    fn test_has_network_policy_true_when_present() {
        let spec = SandboxTemplateSpec {
            pod_template: Default::default(),
            network_policy: Some(SandboxNetworkPolicySpec::default()),
        };
        assert!(has_network_policy(&spec));
    }
}
