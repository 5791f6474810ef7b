//! In-memory `CloudClient` test double (Design Note "Pluggable mock for
//! tests"). A stateful record rather than per-call function fields: with
//! ~30 capability methods a function-field record would be unreadable, so
//! this mock instead keeps a small in-memory project and a call log the
//! property tests in spec §8 assert against.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::*;
use crate::action::{Action, ActionState};
use crate::error::ProviderError;

/// Always-succeeds action used by the mock; nothing in tests needs a
/// multi-poll action, but the type still exercises the waiter machinery.
struct MockAction;

#[async_trait]
impl Action for MockAction {
    async fn poll(&self) -> Result<ActionState, ProviderError> {
        Ok(ActionState::Success)
    }

    fn description(&self) -> &str {
        "mock"
    }
}

fn mock_action() -> Box<dyn Action> {
    Box::new(MockAction)
}

/// Which capability was invoked, for call-count assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateNetwork(String),
    CreateFirewall(String),
    SetFirewallRules(i64),
    ApplyFirewallLabelSelector(i64),
    RemoveFirewallResources(i64),
    DeleteFirewall(i64),
    CreatePlacementGroup(String),
    DeletePlacementGroup(i64),
    CreateSshKey(String),
    CreateServer(String),
    DeleteServer(i64),
    DeleteVolume(i64),
    CreateLoadBalancer(String),
    AttachLoadBalancerToNetwork(i64),
    AddLoadBalancerService(i64),
    AddLoadBalancerTarget(i64),
}

#[derive(Default)]
struct Project {
    networks: Vec<Network>,
    firewalls: Vec<Firewall>,
    placement_groups: Vec<PlacementGroup>,
    ssh_keys: Vec<SshKey>,
    certificates: Vec<Certificate>,
    images: Vec<Image>,
    servers: Vec<Server>,
    volumes: Vec<Volume>,
    load_balancers: Vec<LoadBalancer>,
}

/// In-memory mock cloud backing the Ensure/Cleanup/Reconciler tests.
pub struct MockCloudClient {
    project: Mutex<Project>,
    pub calls: Mutex<Vec<Call>>,
    next_id: AtomicI64,
}

impl Default for MockCloudClient {
    fn default() -> Self {
        Self {
            project: Mutex::new(Project::default()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl MockCloudClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn record(&self, call: Call) {
        self.calls.lock().await.push(call);
    }

    pub async fn call_count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().await.iter().filter(|c| matches(c)).count()
    }

    /// Seed a server directly into project state, bypassing `create_server`
    /// (used to set up cleanup-test fixtures without polluting the call log).
    pub async fn seed_server(&self, server: Server) {
        self.project.lock().await.servers.push(server);
    }

    pub async fn seed_firewall(&self, firewall: Firewall) {
        self.project.lock().await.firewalls.push(firewall);
    }

    pub async fn seed_volume(&self, volume: Volume) {
        self.project.lock().await.volumes.push(volume);
    }

    pub async fn seed_load_balancer(&self, lb: LoadBalancer) {
        self.project.lock().await.load_balancers.push(lb);
    }
}

#[async_trait]
impl CloudClient for MockCloudClient {
    async fn get_network_by_name(&self, name: &str) -> Result<Option<Network>, ProviderError> {
        Ok(self
            .project
            .lock()
            .await
            .networks
            .iter()
            .find(|n| n.name == name)
            .cloned())
    }

    async fn create_network(
        &self,
        opts: CreateNetworkOpts,
    ) -> Result<CreationResult<Network>, ProviderError> {
        self.record(Call::CreateNetwork(opts.name.clone())).await;
        let network = Network {
            id: self.next_id(),
            name: opts.name,
            ip_range: opts.ip_range,
            subnets: opts.subnets,
            labels: opts.labels,
        };
        self.project.lock().await.networks.push(network.clone());
        Ok(CreationResult::without_action(network))
    }

    async fn add_subnet(
        &self,
        network_id: i64,
        subnet: Subnet,
    ) -> Result<Box<dyn Action>, ProviderError> {
        let mut project = self.project.lock().await;
        if let Some(n) = project.networks.iter_mut().find(|n| n.id == network_id) {
            n.subnets.push(subnet);
        }
        Ok(mock_action())
    }

    async fn delete_network(&self, id: i64) -> Result<(), ProviderError> {
        self.project.lock().await.networks.retain(|n| n.id != id);
        Ok(())
    }

    async fn get_firewall_by_name(&self, name: &str) -> Result<Option<Firewall>, ProviderError> {
        Ok(self
            .project
            .lock()
            .await
            .firewalls
            .iter()
            .find(|f| f.name == name)
            .cloned())
    }

    async fn create_firewall(
        &self,
        opts: CreateFirewallOpts,
    ) -> Result<CreationResult<Firewall>, ProviderError> {
        self.record(Call::CreateFirewall(opts.name.clone())).await;
        let firewall = Firewall {
            id: self.next_id(),
            name: opts.name,
            rules: opts.rules,
            applied_to_label_selector: opts.apply_to_label,
            labels: opts.labels,
        };
        self.project.lock().await.firewalls.push(firewall.clone());
        Ok(CreationResult::without_action(firewall))
    }

    async fn set_firewall_rules(
        &self,
        firewall_id: i64,
        opts: UpdateFirewallOpts,
    ) -> Result<Vec<Box<dyn Action>>, ProviderError> {
        self.record(Call::SetFirewallRules(firewall_id)).await;
        let mut project = self.project.lock().await;
        if let Some(f) = project.firewalls.iter_mut().find(|f| f.id == firewall_id) {
            f.rules = opts.rules;
        }
        Ok(vec![mock_action()])
    }

    async fn apply_firewall_label_selector(
        &self,
        firewall_id: i64,
        selector: &str,
    ) -> Result<Vec<Box<dyn Action>>, ProviderError> {
        self.record(Call::ApplyFirewallLabelSelector(firewall_id)).await;
        let mut project = self.project.lock().await;
        if let Some(f) = project.firewalls.iter_mut().find(|f| f.id == firewall_id) {
            f.applied_to_label_selector = Some(selector.to_string());
        }
        Ok(vec![mock_action()])
    }

    async fn remove_firewall_resources(
        &self,
        firewall_id: i64,
    ) -> Result<Vec<Box<dyn Action>>, ProviderError> {
        self.record(Call::RemoveFirewallResources(firewall_id)).await;
        let mut project = self.project.lock().await;
        if let Some(f) = project.firewalls.iter_mut().find(|f| f.id == firewall_id) {
            f.applied_to_label_selector = None;
        }
        Ok(vec![mock_action()])
    }

    async fn delete_firewall(&self, id: i64) -> Result<(), ProviderError> {
        self.record(Call::DeleteFirewall(id)).await;
        self.project.lock().await.firewalls.retain(|f| f.id != id);
        Ok(())
    }

    async fn get_placement_group_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PlacementGroup>, ProviderError> {
        Ok(self
            .project
            .lock()
            .await
            .placement_groups
            .iter()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn create_placement_group(
        &self,
        opts: CreatePlacementGroupOpts,
    ) -> Result<PlacementGroup, ProviderError> {
        self.record(Call::CreatePlacementGroup(opts.name.clone())).await;
        let pg = PlacementGroup {
            id: self.next_id(),
            name: opts.name,
            labels: opts.labels,
        };
        self.project.lock().await.placement_groups.push(pg.clone());
        Ok(pg)
    }

    async fn delete_placement_group(&self, id: i64) -> Result<(), ProviderError> {
        self.record(Call::DeletePlacementGroup(id)).await;
        self.project.lock().await.placement_groups.retain(|p| p.id != id);
        Ok(())
    }

    async fn get_ssh_key_by_name(&self, name: &str) -> Result<Option<SshKey>, ProviderError> {
        Ok(self
            .project
            .lock()
            .await
            .ssh_keys
            .iter()
            .find(|k| k.name == name)
            .cloned())
    }

    async fn create_ssh_key(&self, opts: CreateSshKeyOpts) -> Result<SshKey, ProviderError> {
        self.record(Call::CreateSshKey(opts.name.clone())).await;
        let key = SshKey {
            id: self.next_id(),
            name: opts.name,
            public_key: opts.public_key,
            labels: opts.labels,
        };
        self.project.lock().await.ssh_keys.push(key.clone());
        Ok(key)
    }

    async fn delete_ssh_key(&self, id: i64) -> Result<(), ProviderError> {
        self.project.lock().await.ssh_keys.retain(|k| k.id != id);
        Ok(())
    }

    async fn get_certificate_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Certificate>, ProviderError> {
        Ok(self
            .project
            .lock()
            .await
            .certificates
            .iter()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn create_certificate(
        &self,
        opts: CreateCertificateOpts,
    ) -> Result<Certificate, ProviderError> {
        let cert = Certificate {
            id: self.next_id(),
            name: opts.name,
            labels: opts.labels,
        };
        self.project.lock().await.certificates.push(cert.clone());
        Ok(cert)
    }

    async fn delete_certificate(&self, id: i64) -> Result<(), ProviderError> {
        self.project.lock().await.certificates.retain(|c| c.id != id);
        Ok(())
    }

    async fn get_image_by_name(&self, name: &str) -> Result<Option<Image>, ProviderError> {
        Ok(self
            .project
            .lock()
            .await
            .images
            .iter()
            .find(|i| i.name == name)
            .cloned())
    }

    async fn list_images_by_label(
        &self,
        _label_selector: &str,
        architecture: &str,
    ) -> Result<Vec<Image>, ProviderError> {
        let mut images: Vec<Image> = self
            .project
            .lock()
            .await
            .images
            .iter()
            .filter(|i| i.architecture == architecture)
            .cloned()
            .collect();
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(images)
    }

    async fn create_snapshot(
        &self,
        _server_id: i64,
        description: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<Image, ProviderError> {
        let image = Image {
            id: self.next_id(),
            name: description.to_string(),
            status: ImageStatus::Available,
            architecture: "x86".to_string(),
            created_at: chrono::Utc::now(),
            labels,
        };
        self.project.lock().await.images.push(image.clone());
        Ok(image)
    }

    async fn delete_image(&self, id: i64) -> Result<(), ProviderError> {
        self.project.lock().await.images.retain(|i| i.id != id);
        Ok(())
    }

    async fn get_server_type_by_name(&self, name: &str) -> Result<Option<ServerType>, ProviderError> {
        Ok(Some(ServerType {
            id: 1,
            name: name.to_string(),
            architecture: "x86".to_string(),
        }))
    }

    async fn get_default_server_type(&self, architecture: &str) -> Option<ServerType> {
        Some(ServerType {
            id: 1,
            name: "cx22".to_string(),
            architecture: architecture.to_string(),
        })
    }

    async fn get_location_by_name(&self, name: &str) -> Result<Option<Location>, ProviderError> {
        Ok(Some(Location {
            id: 1,
            name: name.to_string(),
        }))
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>, ProviderError> {
        Ok(self
            .project
            .lock()
            .await
            .servers
            .iter()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list_servers_by_label(&self, label_selector: &str) -> Result<Vec<Server>, ProviderError> {
        let labels = parse_selector(label_selector);
        Ok(self
            .project
            .lock()
            .await
            .servers
            .iter()
            .filter(|s| matches_labels(&s.labels, &labels))
            .cloned()
            .collect())
    }

    async fn create_server(
        &self,
        opts: CreateServerOpts,
    ) -> Result<CreationResult<Server>, ProviderError> {
        self.record(Call::CreateServer(opts.name.clone())).await;
        let server = Server {
            id: self.next_id(),
            name: opts.name,
            ipv4: Some("10.10.10.10".to_string()),
            ipv6_network: None,
            labels: opts.labels,
        };
        self.project.lock().await.servers.push(server.clone());
        Ok(CreationResult::without_action(server))
    }

    async fn attach_server_to_network(
        &self,
        _server_id: i64,
        _network_id: i64,
        _private_ip: Option<&str>,
    ) -> Result<Box<dyn Action>, ProviderError> {
        Ok(mock_action())
    }

    async fn power_on_server(&self, _server_id: i64) -> Result<Box<dyn Action>, ProviderError> {
        Ok(mock_action())
    }

    async fn power_off_server(&self, _server_id: i64) -> Result<Box<dyn Action>, ProviderError> {
        Ok(mock_action())
    }

    async fn reset_server(&self, _server_id: i64) -> Result<Box<dyn Action>, ProviderError> {
        Ok(mock_action())
    }

    async fn enable_rescue(
        &self,
        _server_id: i64,
        _ssh_key_ids: &[String],
    ) -> Result<(Box<dyn Action>, String), ProviderError> {
        Ok((mock_action(), "mock-root-password".to_string()))
    }

    async fn delete_server(&self, server_id: i64) -> Result<Box<dyn Action>, ProviderError> {
        self.record(Call::DeleteServer(server_id)).await;
        self.project.lock().await.servers.retain(|s| s.id != server_id);
        Ok(mock_action())
    }

    async fn list_volumes_by_label(&self, label_selector: &str) -> Result<Vec<Volume>, ProviderError> {
        let labels = parse_selector(label_selector);
        Ok(self
            .project
            .lock()
            .await
            .volumes
            .iter()
            .filter(|v| matches_labels(&v.labels, &labels))
            .cloned()
            .collect())
    }

    async fn delete_volume(&self, id: i64) -> Result<(), ProviderError> {
        self.record(Call::DeleteVolume(id)).await;
        self.project.lock().await.volumes.retain(|v| v.id != id);
        Ok(())
    }

    async fn get_load_balancer_type_by_name(
        &self,
        name: &str,
    ) -> Result<Option<LoadBalancerType>, ProviderError> {
        Ok(Some(LoadBalancerType {
            id: 1,
            name: name.to_string(),
        }))
    }

    async fn get_load_balancer_by_name(
        &self,
        name: &str,
    ) -> Result<Option<LoadBalancer>, ProviderError> {
        Ok(self
            .project
            .lock()
            .await
            .load_balancers
            .iter()
            .find(|lb| lb.name == name)
            .cloned())
    }

    async fn create_load_balancer(
        &self,
        opts: CreateLoadBalancerOpts,
    ) -> Result<CreationResult<LoadBalancer>, ProviderError> {
        self.record(Call::CreateLoadBalancer(opts.name.clone())).await;
        let id = self.next_id();
        let lb = LoadBalancer {
            id,
            name: opts.name,
            public_ip: Some(format!("203.0.113.{}", (id % 250) + 1)),
            attached_network_id: None,
            service_ports: Vec::new(),
            target_label_selectors: Vec::new(),
            labels: opts.labels,
        };
        self.project.lock().await.load_balancers.push(lb.clone());
        Ok(CreationResult::without_action(lb))
    }

    async fn attach_load_balancer_to_network(
        &self,
        lb_id: i64,
        network_id: i64,
        _ip: &str,
    ) -> Result<Box<dyn Action>, ProviderError> {
        self.record(Call::AttachLoadBalancerToNetwork(lb_id)).await;
        let mut project = self.project.lock().await;
        if let Some(lb) = project.load_balancers.iter_mut().find(|lb| lb.id == lb_id) {
            lb.attached_network_id = Some(network_id);
        }
        Ok(mock_action())
    }

    async fn add_load_balancer_service(
        &self,
        lb_id: i64,
        listen_port: u16,
    ) -> Result<Box<dyn Action>, ProviderError> {
        self.record(Call::AddLoadBalancerService(lb_id)).await;
        let mut project = self.project.lock().await;
        if let Some(lb) = project.load_balancers.iter_mut().find(|lb| lb.id == lb_id) {
            lb.service_ports.push(listen_port);
        }
        Ok(mock_action())
    }

    async fn add_load_balancer_target(
        &self,
        lb_id: i64,
        target: TargetType,
    ) -> Result<Box<dyn Action>, ProviderError> {
        self.record(Call::AddLoadBalancerTarget(lb_id)).await;
        let TargetType::LabelSelector { selector } = target;
        let mut project = self.project.lock().await;
        if let Some(lb) = project.load_balancers.iter_mut().find(|lb| lb.id == lb_id) {
            lb.target_label_selectors.push(selector);
        }
        Ok(mock_action())
    }

    async fn delete_load_balancer(&self, id: i64) -> Result<(), ProviderError> {
        self.project.lock().await.load_balancers.retain(|lb| lb.id != id);
        Ok(())
    }

    async fn list_load_balancers_by_label(
        &self,
        label_selector: &str,
    ) -> Result<Vec<LoadBalancer>, ProviderError> {
        let labels = parse_selector(label_selector);
        Ok(self
            .project
            .lock()
            .await
            .load_balancers
            .iter()
            .filter(|lb| matches_labels(&lb.labels, &labels))
            .cloned()
            .collect())
    }
}

fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn matches_labels(labels: &BTreeMap<String, String>, want: &BTreeMap<String, String>) -> bool {
    want.iter().all(|(k, v)| labels.get(k) == Some(v))
}
