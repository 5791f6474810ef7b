//! Firewall ensure (spec §4.1.4 Firewall kind, spec §8 scenario S2).
//!
//! `Create` atomically attaches both the rule set and the label-selector
//! target in one call. `Update` diffs the rule set (rules are mutable, so
//! there is no Validate step here) and separately re-applies the label
//! selector if a prior run's Create never got that far — the two halves are
//! independent SDK calls and either can be left half-done by a crash.

use crate::cloud::{
    CloudClient, CreateFirewallOpts, Firewall, FirewallDirection, FirewallRule,
    UpdateFirewallOpts,
};
use crate::error::EnsureError;
use crate::naming;
use crate::spec::FirewallSpec;

use super::ensure::{ensure, BoxFuture, EnsureOp};

const API_PORT: &str = "6443";
const SSH_PORT: &str = "22";

fn desired_rules(spec: &FirewallSpec) -> Vec<FirewallRule> {
    let mut rules = vec![FirewallRule {
        direction: FirewallDirection::In,
        protocol: "tcp".to_string(),
        port: Some(API_PORT.to_string()),
        source_cidrs: spec.api_allow_cidrs.clone(),
    }];
    if !spec.ssh_allow_cidrs.is_empty() {
        rules.push(FirewallRule {
            direction: FirewallDirection::In,
            protocol: "tcp".to_string(),
            port: Some(SSH_PORT.to_string()),
            source_cidrs: spec.ssh_allow_cidrs.clone(),
        });
    }
    rules
}

fn rules_equal(a: &[FirewallRule], b: &[FirewallRule]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.direction == y.direction
                && x.protocol == y.protocol
                && x.port == y.port
                && x.source_cidrs == y.source_cidrs
        })
}

/// Ensure the cluster's kube-apiserver (and optionally SSH) firewall
/// exists, applied to every resource carrying the cluster label.
///
/// # Errors
/// See [`EnsureOp`].
pub async fn ensure_firewall<'a>(
    client: &'a dyn CloudClient,
    cluster_name: &str,
    firewall_spec: &FirewallSpec,
) -> Result<Firewall, EnsureError> {
    let name = naming::firewall(cluster_name);
    let labels = naming::cluster_labels(cluster_name);
    let selector = naming::build_label_selector(&labels);
    let rules = desired_rules(firewall_spec);

    let get_name = name.clone();
    let create_name = name.clone();
    let create_rules = rules.clone();
    let create_selector = selector.clone();
    let create_labels = labels.clone();
    let update_rules = rules.clone();
    let update_selector = selector.clone();

    let op: EnsureOp<'a, Firewall> = EnsureOp {
        name: name.clone(),
        get: Box::new(move || {
            let name = get_name.clone();
            Box::pin(async move { client.get_firewall_by_name(&name).await })
        }),
        create: Box::new(move || {
            let opts = CreateFirewallOpts {
                name: create_name.clone(),
                rules: create_rules.clone(),
                apply_to_label: Some(create_selector.clone()),
                labels: create_labels.clone(),
            };
            Box::pin(async move { client.create_firewall(opts).await })
        }),
        validate: None,
        update: Some(Box::new(move |firewall: &Firewall| {
            let needs_rules = !rules_equal(&firewall.rules, &update_rules);
            let needs_selector = firewall.applied_to_label_selector.is_none();
            if !needs_rules && !needs_selector {
                return None;
            }
            let firewall_id = firewall.id;
            let rules = update_rules.clone();
            let selector = update_selector.clone();
            Some(Box::pin(async move {
                let mut actions = Vec::new();
                if needs_rules {
                    actions.extend(
                        client
                            .set_firewall_rules(firewall_id, UpdateFirewallOpts { rules })
                            .await?,
                    );
                }
                if needs_selector {
                    actions.extend(
                        client
                            .apply_firewall_label_selector(firewall_id, &selector)
                            .await?,
                    );
                }
                Ok(actions)
            }) as BoxFuture<'a, _>)
        })),
    };

    ensure(&op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::{Call, MockCloudClient};

    fn spec() -> FirewallSpec {
        FirewallSpec {
            api_allow_cidrs: vec!["1.2.3.4/32".into()],
            ssh_allow_cidrs: vec![],
        }
    }

    #[tokio::test]
    async fn creates_firewall_with_rules_and_selector_in_one_call() {
        let client = MockCloudClient::new();
        let firewall = ensure_firewall(&client, "prod", &spec()).await.unwrap();
        assert_eq!(firewall.rules.len(), 1);
        assert!(firewall.applied_to_label_selector.is_some());
        assert_eq!(
            client.call_count(|c| matches!(c, Call::SetFirewallRules(_))).await,
            0
        );
    }

    #[tokio::test]
    async fn changing_allow_list_triggers_set_firewall_rules() {
        let client = MockCloudClient::new();
        ensure_firewall(&client, "prod", &spec()).await.unwrap();

        let mut changed = spec();
        changed.ssh_allow_cidrs = vec!["5.6.7.8/32".into()];
        let firewall = ensure_firewall(&client, "prod", &changed).await.unwrap();
        assert_eq!(firewall.rules.len(), 2);
        assert_eq!(
            client.call_count(|c| matches!(c, Call::SetFirewallRules(_))).await,
            1
        );
    }

    #[tokio::test]
    async fn idempotent_reconcile_issues_no_further_calls() {
        let client = MockCloudClient::new();
        ensure_firewall(&client, "prod", &spec()).await.unwrap();
        ensure_firewall(&client, "prod", &spec()).await.unwrap();
        assert_eq!(
            client.call_count(|c| matches!(c, Call::SetFirewallRules(_))).await,
            0
        );
        assert_eq!(
            client
                .call_count(|c| matches!(c, Call::ApplyFirewallLabelSelector(_)))
                .await,
            0
        );
    }
}
