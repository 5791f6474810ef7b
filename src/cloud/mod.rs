//! The `CloudClient` capability set (spec §6 External Interfaces).
//!
//! Grounded on the bare-metal provisioner's `Provider` trait
//! (`providers/traits.rs`) generalized from a single bare-metal server
//! resource to the full Hetzner-Cloud-shaped resource set spec §3 names:
//! network, subnet, firewall, placement group, SSH key, certificate,
//! snapshot, server, load balancer + service + target.
//!
//! This module defines the trait and the per-kind request/response shapes;
//! [`hetzner`] provides a concrete `reqwest`-based implementation, and
//! [`mock`] provides the function-field test double (Design Note
//! "Pluggable mock for tests").

pub mod hetzner;
pub mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::action::{Action, CreationResult};
use crate::error::ProviderError;

// ---------------------------------------------------------------------
// Resource shapes
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Network {
    pub id: i64,
    pub name: String,
    pub ip_range: String,
    pub subnets: Vec<Subnet>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub ip_range: String,
    pub zone: String,
}

#[derive(Debug, Clone)]
pub struct CreateNetworkOpts {
    pub name: String,
    pub ip_range: String,
    pub subnets: Vec<Subnet>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FirewallRule {
    pub direction: FirewallDirection,
    pub protocol: String,
    pub port: Option<String>,
    pub source_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallDirection {
    In,
    Out,
}

#[derive(Debug, Clone)]
pub struct Firewall {
    pub id: i64,
    pub name: String,
    pub rules: Vec<FirewallRule>,
    pub applied_to_label_selector: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateFirewallOpts {
    pub name: String,
    pub rules: Vec<FirewallRule>,
    pub apply_to_label: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct UpdateFirewallOpts {
    pub rules: Vec<FirewallRule>,
}

#[derive(Debug, Clone)]
pub struct PlacementGroup {
    pub id: i64,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreatePlacementGroupOpts {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SshKey {
    pub id: i64,
    pub name: String,
    pub public_key: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateSshKeyOpts {
    pub name: String,
    pub public_key: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Certificate {
    pub id: i64,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateCertificateOpts {
    pub name: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    Creating,
    Available,
}

#[derive(Debug, Clone)]
pub struct Image {
    pub id: i64,
    pub name: String,
    pub status: ImageStatus,
    pub architecture: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ServerType {
    pub id: i64,
    pub name: String,
    pub architecture: String,
}

#[derive(Debug, Clone)]
pub struct Location {
    pub id: i64,
    pub name: String,
}

/// Tri-state public-IP toggle (Design Note "Option structs with many
/// boolean toggles"): unset means cloud default, set means explicit.
#[derive(Debug, Clone, Copy, Default)]
pub enum PublicIpToggle {
    #[default]
    Default,
    On,
    Off,
}

#[derive(Debug, Clone)]
pub struct CreateServerOpts {
    pub name: String,
    pub server_type_id: i64,
    pub image_id: i64,
    pub location_id: i64,
    pub ssh_key_ids: Vec<i64>,
    pub labels: BTreeMap<String, String>,
    pub user_data: String,
    pub placement_group_id: Option<i64>,
    pub network_id: Option<i64>,
    pub private_ip: Option<String>,
    pub public_ipv4: PublicIpToggle,
    pub public_ipv6: PublicIpToggle,
    pub start_after_create: bool,
}

#[derive(Debug, Clone)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub ipv4: Option<String>,
    pub ipv6_network: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub id: i64,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LoadBalancerType {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    pub id: i64,
    pub name: String,
    pub public_ip: Option<String>,
    pub attached_network_id: Option<i64>,
    pub service_ports: Vec<u16>,
    pub target_label_selectors: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateLoadBalancerOpts {
    pub name: String,
    pub load_balancer_type_id: i64,
    pub location_id: i64,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum TargetType {
    LabelSelector { selector: String },
}

// ---------------------------------------------------------------------
// The capability trait
// ---------------------------------------------------------------------

/// Everything the core requires of the cloud SDK (spec §6). One
/// implementation ([`hetzner::HetznerClient`]) talks to the real API over
/// `reqwest`; [`mock::MockCloudClient`] backs the property tests in spec §8.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn get_network_by_name(&self, name: &str) -> Result<Option<Network>, ProviderError>;
    async fn create_network(
        &self,
        opts: CreateNetworkOpts,
    ) -> Result<CreationResult<Network>, ProviderError>;
    async fn add_subnet(
        &self,
        network_id: i64,
        subnet: Subnet,
    ) -> Result<Box<dyn Action>, ProviderError>;
    async fn delete_network(&self, id: i64) -> Result<(), ProviderError>;

    async fn get_firewall_by_name(&self, name: &str) -> Result<Option<Firewall>, ProviderError>;
    async fn create_firewall(
        &self,
        opts: CreateFirewallOpts,
    ) -> Result<CreationResult<Firewall>, ProviderError>;
    async fn set_firewall_rules(
        &self,
        firewall_id: i64,
        opts: UpdateFirewallOpts,
    ) -> Result<Vec<Box<dyn Action>>, ProviderError>;
    async fn apply_firewall_label_selector(
        &self,
        firewall_id: i64,
        selector: &str,
    ) -> Result<Vec<Box<dyn Action>>, ProviderError>;
    async fn remove_firewall_resources(
        &self,
        firewall_id: i64,
    ) -> Result<Vec<Box<dyn Action>>, ProviderError>;
    async fn delete_firewall(&self, id: i64) -> Result<(), ProviderError>;

    async fn get_placement_group_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PlacementGroup>, ProviderError>;
    async fn create_placement_group(
        &self,
        opts: CreatePlacementGroupOpts,
    ) -> Result<PlacementGroup, ProviderError>;
    async fn delete_placement_group(&self, id: i64) -> Result<(), ProviderError>;

    async fn get_ssh_key_by_name(&self, name: &str) -> Result<Option<SshKey>, ProviderError>;
    async fn create_ssh_key(&self, opts: CreateSshKeyOpts) -> Result<SshKey, ProviderError>;
    async fn delete_ssh_key(&self, id: i64) -> Result<(), ProviderError>;

    async fn get_certificate_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Certificate>, ProviderError>;
    async fn create_certificate(
        &self,
        opts: CreateCertificateOpts,
    ) -> Result<Certificate, ProviderError>;
    async fn delete_certificate(&self, id: i64) -> Result<(), ProviderError>;

    async fn get_image_by_name(&self, name: &str) -> Result<Option<Image>, ProviderError>;
    async fn list_images_by_label(
        &self,
        label_selector: &str,
        architecture: &str,
    ) -> Result<Vec<Image>, ProviderError>;
    async fn create_snapshot(
        &self,
        server_id: i64,
        description: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<Image, ProviderError>;
    async fn delete_image(&self, id: i64) -> Result<(), ProviderError>;

    async fn get_server_type_by_name(&self, name: &str) -> Result<Option<ServerType>, ProviderError>;
    async fn get_default_server_type(&self, architecture: &str) -> Option<ServerType>;
    async fn get_location_by_name(&self, name: &str) -> Result<Option<Location>, ProviderError>;

    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>, ProviderError>;
    async fn list_servers_by_label(&self, label_selector: &str) -> Result<Vec<Server>, ProviderError>;
    async fn create_server(
        &self,
        opts: CreateServerOpts,
    ) -> Result<CreationResult<Server>, ProviderError>;
    async fn attach_server_to_network(
        &self,
        server_id: i64,
        network_id: i64,
        private_ip: Option<&str>,
    ) -> Result<Box<dyn Action>, ProviderError>;
    async fn power_on_server(&self, server_id: i64) -> Result<Box<dyn Action>, ProviderError>;
    async fn power_off_server(&self, server_id: i64) -> Result<Box<dyn Action>, ProviderError>;
    async fn reset_server(&self, server_id: i64) -> Result<Box<dyn Action>, ProviderError>;
    async fn enable_rescue(
        &self,
        server_id: i64,
        ssh_key_ids: &[String],
    ) -> Result<(Box<dyn Action>, String), ProviderError>;
    async fn delete_server(&self, server_id: i64) -> Result<Box<dyn Action>, ProviderError>;

    async fn list_volumes_by_label(&self, label_selector: &str) -> Result<Vec<Volume>, ProviderError>;
    async fn delete_volume(&self, id: i64) -> Result<(), ProviderError>;

    async fn get_load_balancer_type_by_name(
        &self,
        name: &str,
    ) -> Result<Option<LoadBalancerType>, ProviderError>;
    async fn get_load_balancer_by_name(
        &self,
        name: &str,
    ) -> Result<Option<LoadBalancer>, ProviderError>;
    async fn create_load_balancer(
        &self,
        opts: CreateLoadBalancerOpts,
    ) -> Result<CreationResult<LoadBalancer>, ProviderError>;
    async fn attach_load_balancer_to_network(
        &self,
        lb_id: i64,
        network_id: i64,
        ip: &str,
    ) -> Result<Box<dyn Action>, ProviderError>;
    async fn add_load_balancer_service(
        &self,
        lb_id: i64,
        listen_port: u16,
    ) -> Result<Box<dyn Action>, ProviderError>;
    async fn add_load_balancer_target(
        &self,
        lb_id: i64,
        target: TargetType,
    ) -> Result<Box<dyn Action>, ProviderError>;
    async fn delete_load_balancer(&self, id: i64) -> Result<(), ProviderError>;
    async fn list_load_balancers_by_label(
        &self,
        label_selector: &str,
    ) -> Result<Vec<LoadBalancer>, ProviderError>;
}
