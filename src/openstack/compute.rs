//! Nova calls: keypairs, servers, flavors and interfaces.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use zeroize::Zeroizing;

use crate::control_plane::{
    BootRequest, ControlPlaneError, Flavor, Instance, InstanceStatus, Interface, Keypair,
    NicRequest,
};

use super::{OpenStackClient, check_status, decode_json, transport_error};

const MICROVERSION_HEADER: &str = "X-OpenStack-Nova-API-Version";
const TAGGED_NICS_MICROVERSION: &str = "2.32";

pub(super) async fn create_keypair(
    client: &OpenStackClient,
    name: &str,
) -> Result<Keypair, ControlPlaneError> {
    let (request, url) = client.compute(Method::POST, "os-keypairs");
    let response = request
        .json(&json!({"keypair": {"name": name}}))
        .send()
        .await
        .map_err(transport_error)?;
    let response = check_status(response, "keypair", name).await?;
    let body: KeypairEnvelope = decode_json(response, &url).await?;
    let private_key = body
        .keypair
        .private_key
        .ok_or_else(|| ControlPlaneError::InvalidResponse {
            endpoint: url,
            message: String::from("keypair response carries no private key"),
        })?;
    Ok(Keypair {
        name: body.keypair.name,
        private_key: Zeroizing::new(private_key),
    })
}

pub(super) async fn delete_keypair(
    client: &OpenStackClient,
    name: &str,
) -> Result<(), ControlPlaneError> {
    let (request, _) = client.compute(Method::DELETE, &format!("os-keypairs/{name}"));
    let response = request.send().await.map_err(transport_error)?;
    check_status(response, "keypair", name).await.map(drop)
}

pub(super) async fn boot_instance(
    client: &OpenStackClient,
    boot: &BootRequest,
) -> Result<Instance, ControlPlaneError> {
    let (mut request, url) = client.compute(Method::POST, "servers");
    if boot.nics.iter().any(|nic| nic.tag.is_some()) {
        request = request.header(MICROVERSION_HEADER, TAGGED_NICS_MICROVERSION);
    }
    let response = request
        .json(&server_body(boot))
        .send()
        .await
        .map_err(transport_error)?;
    let response = check_status(response, "server", &boot.name).await?;
    let body: CreatedServerEnvelope = decode_json(response, &url).await?;
    Ok(Instance {
        id: body.server.id,
        name: boot.name.clone(),
        status: InstanceStatus::Building,
        fault: None,
        image_id: Some(boot.image_id.clone()),
        networks: BTreeMap::new(),
    })
}

fn server_body(boot: &BootRequest) -> Value {
    let mut server = Map::new();
    server.insert(String::from("name"), json!(boot.name));
    server.insert(String::from("imageRef"), json!(boot.image_id));
    server.insert(String::from("flavorRef"), json!(boot.flavor_id));
    server.insert(String::from("key_name"), json!(boot.key_name));
    if !boot.nics.is_empty() {
        let networks: Vec<Value> = boot.nics.iter().map(nic_body).collect();
        server.insert(String::from("networks"), Value::Array(networks));
    }
    if boot.config_drive {
        server.insert(String::from("config_drive"), json!(true));
    }
    if let Some(user_data) = &boot.user_data {
        server.insert(String::from("user_data"), json!(STANDARD.encode(user_data)));
    }
    if let Some(zone) = &boot.availability_zone {
        server.insert(String::from("availability_zone"), json!(zone));
    }
    json!({ "server": server })
}

fn nic_body(nic: &NicRequest) -> Value {
    let mut entry = Map::new();
    let fields = [
        ("uuid", nic.net_id.as_ref()),
        ("fixed_ip", nic.fixed_ip()),
        ("port", nic.port_id.as_ref()),
        ("tag", nic.tag.as_ref()),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            entry.insert(key.to_owned(), json!(value));
        }
    }
    Value::Object(entry)
}

pub(super) async fn get_instance(
    client: &OpenStackClient,
    id: &str,
) -> Result<Instance, ControlPlaneError> {
    let (request, url) = client.compute(Method::GET, &format!("servers/{id}"));
    let response = request.send().await.map_err(transport_error)?;
    let response = check_status(response, "server", id).await?;
    let body: ServerEnvelope = decode_json(response, &url).await?;
    Ok(body.server.into_instance())
}

pub(super) async fn delete_instance(
    client: &OpenStackClient,
    id: &str,
) -> Result<(), ControlPlaneError> {
    let (request, _) = client.compute(Method::DELETE, &format!("servers/{id}"));
    let response = request.send().await.map_err(transport_error)?;
    check_status(response, "server", id).await.map(drop)
}

pub(super) async fn find_instances_by_name(
    client: &OpenStackClient,
    name: &str,
) -> Result<Vec<Instance>, ControlPlaneError> {
    let (request, url) = client.compute(Method::GET, "servers/detail");
    let pattern = format!("^{}$", regex::escape(name));
    let response = request
        .query(&[("name", pattern.as_str())])
        .send()
        .await
        .map_err(transport_error)?;
    let response = check_status(response, "server", name).await?;
    let body: ServerList = decode_json(response, &url).await?;
    Ok(body
        .servers
        .into_iter()
        .map(ServerBody::into_instance)
        .filter(|instance| instance.name == name)
        .collect())
}

pub(super) async fn images_in_use(
    client: &OpenStackClient,
) -> Result<BTreeSet<String>, ControlPlaneError> {
    let (first, mut url) = client.compute(Method::GET, "servers/detail");
    let mut request = first.query(&[("all_tenants", "1")]);
    let mut in_use = BTreeSet::new();
    loop {
        let response = request.send().await.map_err(transport_error)?;
        let response = check_status(response, "server", "servers").await?;
        let page: ServerList = decode_json(response, &url).await?;
        let next = page.next_link();
        in_use.extend(
            page.servers
                .into_iter()
                .filter_map(|server| server.into_instance().image_id),
        );
        let Some(link) = next else {
            return Ok(in_use);
        };
        url = link;
        request = client.authorised(Method::GET, &url);
    }
}

pub(super) async fn find_flavor_by_id(
    client: &OpenStackClient,
    id: &str,
) -> Result<Option<Flavor>, ControlPlaneError> {
    let (request, url) = client.compute(Method::GET, &format!("flavors/{id}"));
    let response = request.send().await.map_err(transport_error)?;
    let response = match check_status(response, "flavor", id).await {
        Ok(response) => response,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err),
    };
    let body: FlavorEnvelope = decode_json(response, &url).await?;
    let extra_specs = extra_specs(client, &body.flavor.id).await?;
    Ok(Some(body.flavor.into_flavor(extra_specs)))
}

pub(super) async fn find_flavor_by_name(
    client: &OpenStackClient,
    name: &str,
) -> Result<Vec<Flavor>, ControlPlaneError> {
    let (request, url) = client.compute(Method::GET, "flavors/detail");
    let response = request.send().await.map_err(transport_error)?;
    let response = check_status(response, "flavor", name).await?;
    let body: FlavorList = decode_json(response, &url).await?;

    let mut matches = Vec::new();
    for flavor in body.flavors.into_iter().filter(|flavor| flavor.name == name) {
        let extra_specs = extra_specs(client, &flavor.id).await?;
        matches.push(flavor.into_flavor(extra_specs));
    }
    Ok(matches)
}

async fn extra_specs(
    client: &OpenStackClient,
    flavor_id: &str,
) -> Result<BTreeMap<String, String>, ControlPlaneError> {
    let (request, url) = client.compute(Method::GET, &format!("flavors/{flavor_id}/os-extra_specs"));
    let response = request.send().await.map_err(transport_error)?;
    let response = check_status(response, "flavor", flavor_id).await?;
    let body: ExtraSpecs = decode_json(response, &url).await?;
    Ok(body
        .extra_specs
        .into_iter()
        .map(|(key, value)| (key, scalar_text(&value)))
        .collect())
}

pub(super) async fn list_interfaces(
    client: &OpenStackClient,
    instance_id: &str,
) -> Result<Vec<Interface>, ControlPlaneError> {
    let (request, url) = client.compute(Method::GET, &format!("servers/{instance_id}/os-interface"));
    let response = request.send().await.map_err(transport_error)?;
    let response = check_status(response, "server", instance_id).await?;
    let body: InterfaceList = decode_json(response, &url).await?;
    Ok(body
        .attachments
        .into_iter()
        .map(|attachment| Interface {
            port_id: attachment.port_id,
            net_id: attachment.net_id,
            mac_addr: attachment.mac_addr,
            port_state: attachment.port_state,
            fixed_ips: attachment
                .fixed_ips
                .into_iter()
                .map(|fixed| fixed.ip_address)
                .collect(),
        })
        .collect())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct KeypairEnvelope {
    keypair: KeypairBody,
}

#[derive(Deserialize)]
struct KeypairBody {
    name: String,
    #[serde(default)]
    private_key: Option<String>,
}

#[derive(Deserialize)]
struct CreatedServerEnvelope {
    server: CreatedServer,
}

#[derive(Deserialize)]
struct CreatedServer {
    id: String,
}

#[derive(Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<ServerBody>,
    #[serde(default)]
    servers_links: Vec<LinkBody>,
}

impl ServerList {
    fn next_link(&self) -> Option<String> {
        self.servers_links
            .iter()
            .find(|link| link.rel == "next")
            .map(|link| link.href.clone())
    }
}

#[derive(Deserialize)]
struct LinkBody {
    rel: String,
    href: String,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerBody,
}

#[derive(Deserialize)]
struct ServerBody {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    fault: Option<FaultBody>,
    #[serde(default)]
    image: Value,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<AddressBody>>,
}

#[derive(Deserialize)]
struct FaultBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct AddressBody {
    addr: String,
}

impl ServerBody {
    fn into_instance(self) -> Instance {
        let image_id = self
            .image
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Instance {
            id: self.id,
            name: self.name,
            status: InstanceStatus::from_provider(&self.status),
            fault: self.fault.and_then(|fault| fault.message),
            image_id,
            networks: self
                .addresses
                .into_iter()
                .map(|(network, addresses)| {
                    (network, addresses.into_iter().map(|entry| entry.addr).collect())
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct FlavorEnvelope {
    flavor: FlavorBody,
}

#[derive(Deserialize)]
struct FlavorList {
    flavors: Vec<FlavorBody>,
}

#[derive(Deserialize)]
struct FlavorBody {
    id: String,
    name: String,
    #[serde(default)]
    ram: u64,
    #[serde(default)]
    vcpus: u64,
    #[serde(default)]
    disk: u64,
}

impl FlavorBody {
    fn into_flavor(self, extra_specs: BTreeMap<String, String>) -> Flavor {
        Flavor {
            id: self.id,
            name: self.name,
            ram: self.ram,
            vcpus: self.vcpus,
            disk: self.disk,
            extra_specs,
        }
    }
}

#[derive(Deserialize)]
struct ExtraSpecs {
    #[serde(default)]
    extra_specs: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct InterfaceList {
    #[serde(rename = "interfaceAttachments", default)]
    attachments: Vec<AttachmentBody>,
}

#[derive(Deserialize)]
struct AttachmentBody {
    port_id: String,
    net_id: String,
    #[serde(default)]
    mac_addr: String,
    #[serde(default)]
    port_state: String,
    #[serde(default)]
    fixed_ips: Vec<FixedIpBody>,
}

#[derive(Deserialize)]
struct FixedIpBody {
    ip_address: String,
}
