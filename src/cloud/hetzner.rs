//! Hetzner Cloud API client implementation.
//!
//! API Documentation: <https://docs.hetzner.cloud/>
//!
//! Grounded on the bare-metal provisioner's Robot API client
//! (`providers/hetzner/client.rs`) for the request/response plumbing style
//! (`Client`, `get`/`post`/`handle_response` helpers, `to_*` converters),
//! adapted from form-encoded Robot calls to the Hetzner Cloud REST+JSON API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{
    Certificate, CreateCertificateOpts, CreateFirewallOpts, CreateLoadBalancerOpts,
    CreateNetworkOpts, CreatePlacementGroupOpts, CreateServerOpts, CreateSshKeyOpts, Firewall,
    FirewallDirection, FirewallRule, Image, ImageStatus, Location, LoadBalancer, LoadBalancerType,
    Network, PlacementGroup, PublicIpToggle, Server, ServerType, Subnet, SshKey, TargetType,
    UpdateFirewallOpts, Volume,
};
use crate::action::{Action, ActionState, CreationResult};
use crate::error::ProviderError;

const API_BASE_URL: &str = "https://api.hetzner.cloud/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Hetzner Cloud provider.
#[derive(Clone)]
pub struct HetznerClient {
    client: Client,
    token: String,
}

impl HetznerClient {
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(token: impl Into<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            token: token.into(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = format!("{API_BASE_URL}{path}");
        debug!(url = %url, "GET request");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = format!("{API_BASE_URL}{path}");
        debug!(url = %url, "POST request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = format!("{API_BASE_URL}{path}");
        debug!(url = %url, "PUT request");
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let url = format!("{API_BASE_URL}{path}");
        debug!(url = %url, "DELETE request");
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::api_error(status, &text))
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(ProviderError::Serialization)
        } else if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(text))
        } else {
            Err(Self::api_error(status, &text))
        }
    }

    /// Hetzner Cloud wraps error bodies as `{"error": {"code": ..., "message": ...}}`.
    fn api_error(status: StatusCode, text: &str) -> ProviderError {
        let parsed: Option<Value> = serde_json::from_str(text).ok();
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or(text)
            .to_string();
        ProviderError::api(status.as_u16(), code, message)
    }
}

/// An in-flight Hetzner action, polled by its numeric id.
struct HetznerAction {
    client: HetznerClient,
    id: i64,
    description: String,
}

#[async_trait]
impl Action for HetznerAction {
    async fn poll(&self) -> Result<ActionState, ProviderError> {
        let body: Value = self.client.get(&format!("/actions/{}", self.id)).await?;
        let status = body
            .get("action")
            .and_then(|a| a.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("running");
        Ok(match status {
            "success" => ActionState::Success,
            "error" => ActionState::Error,
            _ => ActionState::Running,
        })
    }

    fn description(&self) -> &str {
        &self.description
    }
}

fn boxed_action(client: &HetznerClient, id: i64, description: &str) -> Box<dyn Action> {
    Box::new(HetznerAction {
        client: client.clone(),
        id,
        description: description.to_string(),
    })
}

fn labels_from_value(v: &Value) -> BTreeMap<String, String> {
    v.get("labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl super::CloudClient for HetznerClient {
    async fn get_network_by_name(&self, name: &str) -> Result<Option<Network>, ProviderError> {
        let body: Value = self.get(&format!("/networks?name={name}")).await?;
        let Some(n) = body.get("networks").and_then(Value::as_array).and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(Network {
            id: n["id"].as_i64().unwrap_or_default(),
            name: n["name"].as_str().unwrap_or_default().to_string(),
            ip_range: n["ip_range"].as_str().unwrap_or_default().to_string(),
            subnets: n["subnets"]
                .as_array()
                .map(|subnets| {
                    subnets
                        .iter()
                        .map(|s| Subnet {
                            ip_range: s["ip_range"].as_str().unwrap_or_default().to_string(),
                            zone: s["network_zone"].as_str().unwrap_or_default().to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            labels: labels_from_value(n),
        }))
    }

    async fn create_network(
        &self,
        opts: CreateNetworkOpts,
    ) -> Result<CreationResult<Network>, ProviderError> {
        let body = json!({
            "name": opts.name,
            "ip_range": opts.ip_range,
            "subnets": opts.subnets.iter().map(|s| json!({
                "type": "cloud",
                "ip_range": s.ip_range,
                "network_zone": s.zone,
            })).collect::<Vec<_>>(),
            "labels": opts.labels,
        });
        let resp: Value = self.post("/networks", &body).await?;
        let n = &resp["network"];
        let network = Network {
            id: n["id"].as_i64().unwrap_or_default(),
            name: n["name"].as_str().unwrap_or_default().to_string(),
            ip_range: n["ip_range"].as_str().unwrap_or_default().to_string(),
            subnets: Vec::new(),
            labels: labels_from_value(n),
        };
        Ok(CreationResult::without_action(network))
    }

    async fn add_subnet(
        &self,
        network_id: i64,
        subnet: Subnet,
    ) -> Result<Box<dyn Action>, ProviderError> {
        let body = json!({
            "type": "cloud",
            "ip_range": subnet.ip_range,
            "network_zone": subnet.zone,
        });
        let resp: Value = self
            .post(&format!("/networks/{network_id}/actions/add_subnet"), &body)
            .await?;
        let id = resp["action"]["id"].as_i64().unwrap_or_default();
        Ok(boxed_action(self, id, "add_subnet"))
    }

    async fn delete_network(&self, id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/networks/{id}")).await
    }

    async fn get_firewall_by_name(&self, name: &str) -> Result<Option<Firewall>, ProviderError> {
        let body: Value = self.get(&format!("/firewalls?name={name}")).await?;
        let Some(f) = body.get("firewalls").and_then(Value::as_array).and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(firewall_from_value(f)))
    }

    async fn create_firewall(
        &self,
        opts: CreateFirewallOpts,
    ) -> Result<CreationResult<Firewall>, ProviderError> {
        let mut body = json!({
            "name": opts.name,
            "rules": opts.rules.iter().map(rule_to_json).collect::<Vec<_>>(),
            "labels": opts.labels,
        });
        if let Some(selector) = &opts.apply_to_label {
            body["apply_to"] = json!([{"type": "label_selector", "label_selector": {"selector": selector}}]);
        }
        let resp: Value = self.post("/firewalls", &body).await?;
        let firewall = firewall_from_value(&resp["firewall"]);
        let actions: Vec<Box<dyn Action>> = resp["actions"]
            .as_array()
            .map(|actions| {
                actions
                    .iter()
                    .map(|a| boxed_action(self, a["id"].as_i64().unwrap_or_default(), "create_firewall"))
                    .collect()
            })
            .unwrap_or_default();
        Ok(CreationResult::with_actions(firewall, actions))
    }

    async fn set_firewall_rules(
        &self,
        firewall_id: i64,
        opts: UpdateFirewallOpts,
    ) -> Result<Vec<Box<dyn Action>>, ProviderError> {
        let body = json!({ "rules": opts.rules.iter().map(rule_to_json).collect::<Vec<_>>() });
        let resp: Value = self
            .post(&format!("/firewalls/{firewall_id}/actions/set_rules"), &body)
            .await?;
        Ok(actions_from_value(self, &resp, "set_rules"))
    }

    async fn apply_firewall_label_selector(
        &self,
        firewall_id: i64,
        selector: &str,
    ) -> Result<Vec<Box<dyn Action>>, ProviderError> {
        let body = json!({
            "apply_to": [{"type": "label_selector", "label_selector": {"selector": selector}}],
        });
        let resp: Value = self
            .post(&format!("/firewalls/{firewall_id}/actions/apply_to_resources"), &body)
            .await?;
        Ok(actions_from_value(self, &resp, "apply_to_resources"))
    }

    async fn remove_firewall_resources(
        &self,
        firewall_id: i64,
    ) -> Result<Vec<Box<dyn Action>>, ProviderError> {
        let firewall = self
            .get::<Value>(&format!("/firewalls/{firewall_id}"))
            .await?;
        let applied_to = firewall["firewall"]["applied_to"].clone();
        let body = json!({ "remove_from": applied_to });
        let resp: Value = self
            .post(
                &format!("/firewalls/{firewall_id}/actions/remove_from_resources"),
                &body,
            )
            .await?;
        Ok(actions_from_value(self, &resp, "remove_from_resources"))
    }

    async fn delete_firewall(&self, id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/firewalls/{id}")).await
    }

    async fn get_placement_group_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PlacementGroup>, ProviderError> {
        let body: Value = self.get(&format!("/placement_groups?name={name}")).await?;
        let Some(p) = body
            .get("placement_groups")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(PlacementGroup {
            id: p["id"].as_i64().unwrap_or_default(),
            name: p["name"].as_str().unwrap_or_default().to_string(),
            labels: labels_from_value(p),
        }))
    }

    async fn create_placement_group(
        &self,
        opts: CreatePlacementGroupOpts,
    ) -> Result<PlacementGroup, ProviderError> {
        let body = json!({ "name": opts.name, "type": "spread", "labels": opts.labels });
        let resp: Value = self.post("/placement_groups", &body).await?;
        let p = &resp["placement_group"];
        Ok(PlacementGroup {
            id: p["id"].as_i64().unwrap_or_default(),
            name: p["name"].as_str().unwrap_or_default().to_string(),
            labels: labels_from_value(p),
        })
    }

    async fn delete_placement_group(&self, id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/placement_groups/{id}")).await
    }

    async fn get_ssh_key_by_name(&self, name: &str) -> Result<Option<SshKey>, ProviderError> {
        let body: Value = self.get(&format!("/ssh_keys?name={name}")).await?;
        let Some(k) = body.get("ssh_keys").and_then(Value::as_array).and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(SshKey {
            id: k["id"].as_i64().unwrap_or_default(),
            name: k["name"].as_str().unwrap_or_default().to_string(),
            public_key: k["public_key"].as_str().unwrap_or_default().to_string(),
            labels: labels_from_value(k),
        }))
    }

    async fn create_ssh_key(&self, opts: CreateSshKeyOpts) -> Result<SshKey, ProviderError> {
        let body = json!({
            "name": opts.name,
            "public_key": opts.public_key,
            "labels": opts.labels,
        });
        let resp: Value = self.post("/ssh_keys", &body).await?;
        let k = &resp["ssh_key"];
        Ok(SshKey {
            id: k["id"].as_i64().unwrap_or_default(),
            name: k["name"].as_str().unwrap_or_default().to_string(),
            public_key: k["public_key"].as_str().unwrap_or_default().to_string(),
            labels: labels_from_value(k),
        })
    }

    async fn delete_ssh_key(&self, id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/ssh_keys/{id}")).await
    }

    async fn get_certificate_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Certificate>, ProviderError> {
        let body: Value = self.get(&format!("/certificates?name={name}")).await?;
        let Some(c) = body
            .get("certificates")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(Certificate {
            id: c["id"].as_i64().unwrap_or_default(),
            name: c["name"].as_str().unwrap_or_default().to_string(),
            labels: labels_from_value(c),
        }))
    }

    async fn create_certificate(
        &self,
        opts: CreateCertificateOpts,
    ) -> Result<Certificate, ProviderError> {
        let body = json!({
            "name": opts.name,
            "certificate": opts.certificate_pem,
            "private_key": opts.private_key_pem,
            "labels": opts.labels,
        });
        let resp: Value = self.post("/certificates", &body).await?;
        let c = &resp["certificate"];
        Ok(Certificate {
            id: c["id"].as_i64().unwrap_or_default(),
            name: c["name"].as_str().unwrap_or_default().to_string(),
            labels: labels_from_value(c),
        })
    }

    async fn delete_certificate(&self, id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/certificates/{id}")).await
    }

    async fn get_image_by_name(&self, name: &str) -> Result<Option<Image>, ProviderError> {
        let body: Value = self.get(&format!("/images?name={name}")).await?;
        let Some(i) = body.get("images").and_then(Value::as_array).and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(image_from_value(i)))
    }

    async fn list_images_by_label(
        &self,
        label_selector: &str,
        architecture: &str,
    ) -> Result<Vec<Image>, ProviderError> {
        let body: Value = self
            .get(&format!(
                "/images?type=snapshot&label_selector={label_selector}&architecture={architecture}&sort=created:desc"
            ))
            .await?;
        Ok(body
            .get("images")
            .and_then(Value::as_array)
            .map(|images| images.iter().map(image_from_value).collect())
            .unwrap_or_default())
    }

    async fn create_snapshot(
        &self,
        server_id: i64,
        description: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<Image, ProviderError> {
        let body = json!({
            "description": description,
            "type": "snapshot",
            "labels": labels,
        });
        let resp: Value = self
            .post(&format!("/servers/{server_id}/actions/create_image"), &body)
            .await?;
        Ok(image_from_value(&resp["image"]))
    }

    async fn delete_image(&self, id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/images/{id}")).await
    }

    async fn get_server_type_by_name(&self, name: &str) -> Result<Option<ServerType>, ProviderError> {
        let body: Value = self.get(&format!("/server_types?name={name}")).await?;
        let Some(t) = body
            .get("server_types")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(ServerType {
            id: t["id"].as_i64().unwrap_or_default(),
            name: t["name"].as_str().unwrap_or_default().to_string(),
            architecture: t["architecture"].as_str().unwrap_or("x86").to_string(),
        }))
    }

    async fn get_default_server_type(&self, architecture: &str) -> Option<ServerType> {
        let (name, arch) = match architecture {
            "arm" => ("cax11", "arm"),
            _ => ("cx22", "x86"),
        };
        Some(ServerType {
            id: 0,
            name: name.to_string(),
            architecture: arch.to_string(),
        })
    }

    async fn get_location_by_name(&self, name: &str) -> Result<Option<Location>, ProviderError> {
        let body: Value = self.get(&format!("/locations?name={name}")).await?;
        let Some(l) = body.get("locations").and_then(Value::as_array).and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(Location {
            id: l["id"].as_i64().unwrap_or_default(),
            name: l["name"].as_str().unwrap_or_default().to_string(),
        }))
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>, ProviderError> {
        let body: Value = self.get(&format!("/servers?name={name}")).await?;
        let Some(s) = body.get("servers").and_then(Value::as_array).and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(server_from_value(s)))
    }

    async fn list_servers_by_label(&self, label_selector: &str) -> Result<Vec<Server>, ProviderError> {
        let body: Value = self
            .get(&format!("/servers?label_selector={label_selector}"))
            .await?;
        Ok(body
            .get("servers")
            .and_then(Value::as_array)
            .map(|servers| servers.iter().map(server_from_value).collect())
            .unwrap_or_default())
    }

    async fn create_server(
        &self,
        opts: CreateServerOpts,
    ) -> Result<CreationResult<Server>, ProviderError> {
        let mut body = json!({
            "name": opts.name,
            "server_type": opts.server_type_id,
            "image": opts.image_id,
            "location": opts.location_id,
            "ssh_keys": opts.ssh_key_ids,
            "labels": opts.labels,
            "user_data": opts.user_data,
            "start_after_create": opts.start_after_create,
        });
        if let Some(pg) = opts.placement_group_id {
            body["placement_group"] = json!(pg);
        }
        if let Some(network_id) = opts.network_id {
            body["networks"] = json!([network_id]);
        }
        if !matches!(opts.public_ipv4, PublicIpToggle::Default)
            || !matches!(opts.public_ipv6, PublicIpToggle::Default)
        {
            body["public_net"] = json!({
                "enable_ipv4": !matches!(opts.public_ipv4, PublicIpToggle::Off),
                "enable_ipv6": !matches!(opts.public_ipv6, PublicIpToggle::Off),
            });
        }

        let resp: Value = self.post("/servers", &body).await?;
        let server = server_from_value(&resp["server"]);
        let actions: Vec<Box<dyn Action>> = resp["next_actions"]
            .as_array()
            .or_else(|| resp["actions"].as_array())
            .map(|actions| {
                actions
                    .iter()
                    .map(|a| boxed_action(self, a["id"].as_i64().unwrap_or_default(), "create_server"))
                    .collect()
            })
            .unwrap_or_default();
        if actions.is_empty() {
            if let Some(a) = resp.get("action") {
                return Ok(CreationResult::with_action(
                    server,
                    boxed_action(self, a["id"].as_i64().unwrap_or_default(), "create_server"),
                ));
            }
        }
        Ok(CreationResult::with_actions(server, actions))
    }

    async fn attach_server_to_network(
        &self,
        server_id: i64,
        network_id: i64,
        private_ip: Option<&str>,
    ) -> Result<Box<dyn Action>, ProviderError> {
        let mut body = json!({ "network": network_id });
        if let Some(ip) = private_ip {
            body["ip"] = json!(ip);
        }
        let resp: Value = self
            .post(&format!("/servers/{server_id}/actions/attach_to_network"), &body)
            .await?;
        Ok(boxed_action(self, resp["action"]["id"].as_i64().unwrap_or_default(), "attach_to_network"))
    }

    async fn power_on_server(&self, server_id: i64) -> Result<Box<dyn Action>, ProviderError> {
        let resp: Value = self
            .post(&format!("/servers/{server_id}/actions/poweron"), &json!({}))
            .await?;
        Ok(boxed_action(self, resp["action"]["id"].as_i64().unwrap_or_default(), "poweron"))
    }

    async fn power_off_server(&self, server_id: i64) -> Result<Box<dyn Action>, ProviderError> {
        let resp: Value = self
            .post(&format!("/servers/{server_id}/actions/poweroff"), &json!({}))
            .await?;
        Ok(boxed_action(self, resp["action"]["id"].as_i64().unwrap_or_default(), "poweroff"))
    }

    async fn reset_server(&self, server_id: i64) -> Result<Box<dyn Action>, ProviderError> {
        let resp: Value = self
            .post(&format!("/servers/{server_id}/actions/reset"), &json!({}))
            .await?;
        Ok(boxed_action(self, resp["action"]["id"].as_i64().unwrap_or_default(), "reset"))
    }

    async fn enable_rescue(
        &self,
        server_id: i64,
        ssh_key_ids: &[String],
    ) -> Result<(Box<dyn Action>, String), ProviderError> {
        let ids: Vec<i64> = ssh_key_ids.iter().filter_map(|s| s.parse().ok()).collect();
        let body = json!({ "type": "linux64", "ssh_keys": ids });
        let resp: Value = self
            .post(&format!("/servers/{server_id}/actions/enable_rescue"), &body)
            .await?;
        let action = boxed_action(self, resp["action"]["id"].as_i64().unwrap_or_default(), "enable_rescue");
        let password = resp["root_password"].as_str().unwrap_or_default().to_string();
        Ok((action, password))
    }

    async fn delete_server(&self, server_id: i64) -> Result<Box<dyn Action>, ProviderError> {
        let resp: Value = self.delete_returning_action(&format!("/servers/{server_id}")).await?;
        Ok(boxed_action(self, resp["action"]["id"].as_i64().unwrap_or_default(), "delete_server"))
    }

    async fn list_volumes_by_label(&self, label_selector: &str) -> Result<Vec<Volume>, ProviderError> {
        let body: Value = self.get(&format!("/volumes?label_selector={label_selector}")).await?;
        Ok(body
            .get("volumes")
            .and_then(Value::as_array)
            .map(|volumes| volumes.iter().map(volume_from_value).collect())
            .unwrap_or_default())
    }

    async fn delete_volume(&self, id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/volumes/{id}")).await
    }

    async fn get_load_balancer_type_by_name(
        &self,
        name: &str,
    ) -> Result<Option<LoadBalancerType>, ProviderError> {
        let body: Value = self.get(&format!("/load_balancer_types?name={name}")).await?;
        let Some(t) = body
            .get("load_balancer_types")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(LoadBalancerType {
            id: t["id"].as_i64().unwrap_or_default(),
            name: t["name"].as_str().unwrap_or_default().to_string(),
        }))
    }

    async fn get_load_balancer_by_name(
        &self,
        name: &str,
    ) -> Result<Option<LoadBalancer>, ProviderError> {
        let body: Value = self.get(&format!("/load_balancers?name={name}")).await?;
        let Some(lb) = body
            .get("load_balancers")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
        else {
            return Ok(None);
        };
        Ok(Some(load_balancer_from_value(lb)))
    }

    async fn create_load_balancer(
        &self,
        opts: CreateLoadBalancerOpts,
    ) -> Result<CreationResult<LoadBalancer>, ProviderError> {
        let body = json!({
            "name": opts.name,
            "load_balancer_type": opts.load_balancer_type_id,
            "location": opts.location_id,
            "labels": opts.labels,
        });
        let resp: Value = self.post("/load_balancers", &body).await?;
        let lb = load_balancer_from_value(&resp["load_balancer"]);
        let id = resp["action"]["id"].as_i64().unwrap_or_default();
        Ok(CreationResult::with_action(lb, boxed_action(self, id, "create_load_balancer")))
    }

    async fn attach_load_balancer_to_network(
        &self,
        lb_id: i64,
        network_id: i64,
        ip: &str,
    ) -> Result<Box<dyn Action>, ProviderError> {
        let body = json!({ "network": network_id, "ip": ip });
        let resp: Value = self
            .post(&format!("/load_balancers/{lb_id}/actions/attach_to_network"), &body)
            .await?;
        Ok(boxed_action(self, resp["action"]["id"].as_i64().unwrap_or_default(), "attach_to_network"))
    }

    async fn add_load_balancer_service(
        &self,
        lb_id: i64,
        listen_port: u16,
    ) -> Result<Box<dyn Action>, ProviderError> {
        let body = json!({
            "protocol": "tcp",
            "listen_port": listen_port,
            "destination_port": listen_port,
        });
        let resp: Value = self
            .post(&format!("/load_balancers/{lb_id}/actions/add_service"), &body)
            .await?;
        Ok(boxed_action(self, resp["action"]["id"].as_i64().unwrap_or_default(), "add_service"))
    }

    async fn add_load_balancer_target(
        &self,
        lb_id: i64,
        target: TargetType,
    ) -> Result<Box<dyn Action>, ProviderError> {
        let TargetType::LabelSelector { selector } = target;
        let body = json!({
            "type": "label_selector",
            "label_selector": { "selector": selector },
        });
        let resp: Value = self
            .post(&format!("/load_balancers/{lb_id}/actions/add_target"), &body)
            .await?;
        Ok(boxed_action(self, resp["action"]["id"].as_i64().unwrap_or_default(), "add_target"))
    }

    async fn delete_load_balancer(&self, id: i64) -> Result<(), ProviderError> {
        self.delete(&format!("/load_balancers/{id}")).await
    }

    async fn list_load_balancers_by_label(
        &self,
        label_selector: &str,
    ) -> Result<Vec<LoadBalancer>, ProviderError> {
        let body: Value = self
            .get(&format!("/load_balancers?label_selector={label_selector}"))
            .await?;
        Ok(body
            .get("load_balancers")
            .and_then(Value::as_array)
            .map(|lbs| lbs.iter().map(load_balancer_from_value).collect())
            .unwrap_or_default())
    }
}

impl HetznerClient {
    /// Hetzner's `DELETE /servers/{id}` returns `{"action": {...}}` rather
    /// than an empty body, unlike most other delete endpoints.
    async fn delete_returning_action(&self, path: &str) -> Result<Value, ProviderError> {
        let url = format!("{API_BASE_URL}{path}");
        let response = self.client.delete(&url).bearer_auth(&self.token).send().await?;
        self.handle_response(response).await
    }
}

fn rule_to_json(rule: &FirewallRule) -> Value {
    json!({
        "direction": match rule.direction {
            FirewallDirection::In => "in",
            FirewallDirection::Out => "out",
        },
        "protocol": rule.protocol,
        "port": rule.port,
        "source_ips": rule.source_cidrs,
    })
}

fn firewall_from_value(f: &Value) -> Firewall {
    let rules = f["rules"]
        .as_array()
        .map(|rules| {
            rules
                .iter()
                .map(|r| FirewallRule {
                    direction: if r["direction"].as_str() == Some("out") {
                        FirewallDirection::Out
                    } else {
                        FirewallDirection::In
                    },
                    protocol: r["protocol"].as_str().unwrap_or_default().to_string(),
                    port: r["port"].as_str().map(str::to_string),
                    source_cidrs: r["source_ips"]
                        .as_array()
                        .map(|ips| ips.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    let applied_to_label_selector = f["applied_to"].as_array().and_then(|a| {
        a.iter().find_map(|entry| {
            entry["label_selector"]["selector"].as_str().map(str::to_string)
        })
    });

    Firewall {
        id: f["id"].as_i64().unwrap_or_default(),
        name: f["name"].as_str().unwrap_or_default().to_string(),
        rules,
        applied_to_label_selector,
        labels: labels_from_value(f),
    }
}

fn image_from_value(i: &Value) -> Image {
    Image {
        id: i["id"].as_i64().unwrap_or_default(),
        name: i["name"].as_str().unwrap_or_default().to_string(),
        status: if i["status"].as_str() == Some("available") {
            ImageStatus::Available
        } else {
            ImageStatus::Creating
        },
        architecture: i["architecture"].as_str().unwrap_or("x86").to_string(),
        created_at: i["created"]
            .as_str()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now),
        labels: labels_from_value(i),
    }
}

fn server_from_value(s: &Value) -> Server {
    Server {
        id: s["id"].as_i64().unwrap_or_default(),
        name: s["name"].as_str().unwrap_or_default().to_string(),
        ipv4: s["public_net"]["ipv4"]["ip"].as_str().map(str::to_string),
        ipv6_network: s["public_net"]["ipv6"]["ip"].as_str().map(str::to_string),
        labels: labels_from_value(s),
    }
}

fn volume_from_value(v: &Value) -> Volume {
    Volume {
        id: v["id"].as_i64().unwrap_or_default(),
        name: v["name"].as_str().unwrap_or_default().to_string(),
        labels: labels_from_value(v),
    }
}

fn load_balancer_from_value(lb: &Value) -> LoadBalancer {
    LoadBalancer {
        id: lb["id"].as_i64().unwrap_or_default(),
        name: lb["name"].as_str().unwrap_or_default().to_string(),
        public_ip: lb["public_net"]["ipv4"]["ip"].as_str().map(str::to_string),
        attached_network_id: lb["private_net"]
            .as_array()
            .and_then(|nets| nets.first())
            .and_then(|n| n["network"].as_i64()),
        service_ports: lb["services"]
            .as_array()
            .map(|services| {
                services
                    .iter()
                    .filter_map(|s| s["listen_port"].as_u64().map(|p| p as u16))
                    .collect()
            })
            .unwrap_or_default(),
        target_label_selectors: lb["targets"]
            .as_array()
            .map(|targets| {
                targets
                    .iter()
                    .filter_map(|t| t["label_selector"]["selector"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        labels: labels_from_value(lb),
    }
}

fn actions_from_value(client: &HetznerClient, resp: &Value, description: &str) -> Vec<Box<dyn Action>> {
    resp["actions"]
        .as_array()
        .map(|actions| {
            actions
                .iter()
                .map(|a| boxed_action(client, a["id"].as_i64().unwrap_or_default(), description))
                .collect()
        })
        .unwrap_or_else(|| {
            resp.get("action")
                .map(|a| vec![boxed_action(client, a["id"].as_i64().unwrap_or_default(), description)])
                .unwrap_or_default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_parses_hetzner_error_shape() {
        let body = r#"{"error":{"code":"invalid_input","message":"bad request"}}"#;
        let err = HetznerClient::api_error(StatusCode::BAD_REQUEST, body);
        match err {
            ProviderError::Api { status, code, message } => {
                assert_eq!(status, 400);
                assert_eq!(code, "invalid_input");
                assert_eq!(message, "bad request");
            }
            _ => panic!("expected Api variant"),
        }
    }
}
