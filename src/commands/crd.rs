use anyhow::Result;
use kube::CustomResourceExt;

use sandbox_operator::crd::{Sandbox, SandboxClaim, SandboxTemplate, SandboxWarmPool};

/// Print all four CRD YAMLs to stdout for `kubectl apply -f`, separated by
/// the standard YAML document marker.
pub fn generate() -> Result<()> {
    println!("{}", serde_yaml::to_string(&Sandbox::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&SandboxTemplate::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&SandboxClaim::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&SandboxWarmPool::crd())?);
    Ok(())
}

/// Apply all four CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [
        Sandbox::crd(),
        SandboxTemplate::crd(),
        SandboxClaim::crd(),
        SandboxWarmPool::crd(),
    ] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => println!("CRD '{name}' installed successfully"),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists — skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
