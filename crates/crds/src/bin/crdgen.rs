//! Prints the fixed-ipam CRD manifests as a multi-document YAML stream.
//!
//! Usage: `cargo run --bin crdgen > config/crds.yaml`

use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let manifests = [
        serde_yaml::to_string(&crds::IPPool::crd())?,
        serde_yaml::to_string(&crds::IPPoolLedger::crd())?,
        serde_yaml::to_string(&crds::IPBinding::crd())?,
    ];
    for manifest in manifests {
        println!("---");
        print!("{manifest}");
    }
    Ok(())
}
