//! Deterministic resource name derivation (C9).
//!
//! Every resource the core creates derives its name from `(cluster, pool,
//! index)` so that two runs against the same spec compute the same name and
//! `Ensure` finds the prior resource instead of creating a duplicate.

/// The mandatory ownership label key (spec §3, Resource invariant).
pub const CLUSTER_LABEL_KEY: &str = "cluster";

/// Label key the Kubernetes Cloud Controller Manager stamps on load
/// balancers it creates on the cluster's behalf (spec §4.2 step 4, CCM-
/// foreign-LB sweep). The CCM never applies [`CLUSTER_LABEL_KEY`], so these
/// load balancers are invisible to a `cluster=<name>` selector and must be
/// discovered by this label instead.
pub const CCM_SERVICE_UID_LABEL_KEY: &str = "kubernetes.io/service-uid";

#[must_use]
pub fn network(cluster: &str) -> String {
    format!("{cluster}-network")
}

#[must_use]
pub fn subnet(cluster: &str) -> String {
    format!("{cluster}-subnet")
}

#[must_use]
pub fn firewall(cluster: &str) -> String {
    format!("{cluster}-firewall")
}

#[must_use]
pub fn ssh_key(cluster: &str) -> String {
    format!("{cluster}-ssh-key")
}

#[must_use]
pub fn snapshot(cluster: &str, talos_version: &str) -> String {
    format!("{cluster}-talos-{talos_version}")
}

#[must_use]
pub fn load_balancer(cluster: &str) -> String {
    format!("{cluster}-kube-api")
}

/// Placement group name. `shard` distinguishes additional groups created
/// when a pool's replica count exceeds the cloud's per-placement-group
/// limit (spec §4.3 Up, step 5).
#[must_use]
pub fn placement_group(cluster: &str, pool: &str, shard: u32) -> String {
    if shard == 0 {
        format!("{cluster}-{pool}-pg")
    } else {
        format!("{cluster}-{pool}-pg-{shard}")
    }
}

#[must_use]
pub fn server(cluster: &str, pool: &str, index: u32) -> String {
    format!("{cluster}-{pool}-{index}")
}

/// Build the cluster-ownership label set every created resource carries.
#[must_use]
pub fn cluster_labels(cluster: &str) -> std::collections::BTreeMap<String, String> {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(CLUSTER_LABEL_KEY.to_string(), cluster.to_string());
    labels
}

/// Render a label map as the comma-joined `k=v` selector string the cloud's
/// list endpoints expect (spec GLOSSARY, "Label selector").
///
/// An empty map renders to the empty string, which the caller must refuse
/// to send to a list/delete endpoint (spec §8 boundary behaviour) since an
/// empty selector matches every resource in the project.
#[must_use]
pub fn build_label_selector(labels: &std::collections::BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_group_shard_zero_has_no_suffix() {
        assert_eq!(placement_group("prod", "workers", 0), "prod-workers-pg");
        assert_eq!(placement_group("prod", "workers", 1), "prod-workers-pg-1");
    }

    #[test]
    fn server_names_are_indexed() {
        assert_eq!(server("prod", "cp", 0), "prod-cp-0");
        assert_eq!(server("prod", "cp", 1), "prod-cp-1");
    }

    #[test]
    fn empty_label_map_selector_is_empty_string() {
        let labels = std::collections::BTreeMap::new();
        assert_eq!(build_label_selector(&labels), "");
    }

    #[test]
    fn cluster_labels_selector_round_trips() {
        let labels = cluster_labels("test-cluster");
        assert_eq!(build_label_selector(&labels), "cluster=test-cluster");
    }
}
