use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sandbox-operator")]
#[command(about = "Kubernetes control plane for isolated, stateful, singleton sandboxes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// List resources (pods, sandboxes, sandboxclaims, sandboxwarmpools)
    List {
        /// Resource type to list
        resource: String,
    },

    /// Manage the Sandbox/SandboxTemplate/SandboxClaim/SandboxWarmPool CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the sandbox operator (Sandbox, SandboxWarmPool, SandboxClaim reconcile loops)
    Run,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print all four CRD YAMLs to stdout
    Generate,

    /// Apply all four CRDs to the connected cluster
    Install,
}
