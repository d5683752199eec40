//! # CRD Generator
//!
//! Generates the CustomResourceDefinition YAML for `ServiceInstance`,
//! `ServiceBinding` and `ClusterServiceBroker` from the Rust type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Generate CRD YAML
//! cargo run --bin crdgen > config/crd/service-catalog.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;
use service_catalog_controller::crd::{ClusterServiceBroker, ServiceBinding, ServiceInstance};

fn main() {
    let crds = [
        ServiceInstance::crd(),
        ServiceBinding::crd(),
        ClusterServiceBroker::crd(),
    ];

    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    println!("#");
    for crd in &crds {
        match serde_yaml::to_string(crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("Failed to serialize CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
}
