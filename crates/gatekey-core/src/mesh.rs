//! Mesh hub/spoke controller (spec §4.4).

use std::net::IpAddr;
use std::time::Duration as StdDuration;

use ipnet::IpNet;
use uuid::Uuid;

use crate::model::{CryptoProfile, Id, MeshHub, MeshSpoke, NodeStatus, VpnProtocol};
use crate::pki;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid token")]
	InvalidToken,

	#[error("hub has no free tunnel IPs left in its subnet")]
	SubnetExhausted,

	#[error("duplicate name within hub: {0}")]
	DuplicateName(String),

	#[error("store unavailable: {0}")]
	StoreUnavailable(String),

	#[error(transparent)]
	Pki(#[from] crate::pki::Error),
}

impl Error {
	pub fn category(&self) -> crate::error::Category {
		use crate::error::Category;
		match self {
			Error::InvalidToken => Category::Authentication,
			Error::SubnetExhausted => Category::Conflict,
			Error::DuplicateName(_) => Category::Conflict,
			Error::StoreUnavailable(_) => Category::Network,
			Error::Pki(e) => e.category(),
		}
	}
}

type Result<T> = std::result::Result<T, Error>;

/// Allocates the lowest free host address in `subnet`, excluding network,
/// broadcast, and the `.1` hub address (§4.4 `CreateSpoke`).
pub fn allocate_tunnel_ip(subnet: IpNet, taken: &[IpAddr]) -> Result<IpAddr> {
	let network = subnet.network();
	let broadcast = subnet.broadcast();
	let hub_addr = first_host(subnet);

	for host in subnet.hosts() {
		if host == network || host == broadcast || host == hub_addr {
			continue;
		}
		if !taken.contains(&host) {
			return Ok(host);
		}
	}
	Err(Error::SubnetExhausted)
}

fn first_host(subnet: IpNet) -> IpAddr {
	subnet.hosts().next().unwrap_or(subnet.network())
}

/// A single per-spoke client-config-directory entry (§4.4): an `iroute` line
/// per advertised local network plus the `ifconfig-push` for its tunnel IP.
pub fn ccd_entry(tunnel_ip: IpAddr, netmask: IpAddr, local_networks: &[IpNet]) -> Vec<String> {
	let mut lines: Vec<String> = local_networks
		.iter()
		.map(|n| format!("iroute {} {}", n.network(), n.netmask()))
		.collect();
	lines.push(format!("ifconfig-push {tunnel_ip} {netmask}"));
	lines
}

/// Fresh random pre-shared TLS-auth key, hex-encoded (§4.4 `CreateHub`).
fn generate_tls_auth_key() -> String {
	let mut raw = [0u8; 32];
	rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
	hex::encode(raw)
}

#[derive(Debug, Clone)]
pub struct CreateHubRequest {
	pub name: String,
	pub public_endpoint: String,
	pub vpn_port: u16,
	pub vpn_protocol: VpnProtocol,
	pub vpn_subnet: IpNet,
	pub crypto_profile: CryptoProfile,
	pub tls_auth_enabled: bool,
	pub control_plane_url: String,
	pub local_networks: Vec<IpNet>,
	pub full_tunnel_mode: bool,
	pub push_dns: bool,
	pub dns_servers: Vec<IpAddr>,
}

pub struct CreatedHub {
	pub hub: MeshHub,
	/// One-time plaintext API token; only `hub.api_token_hash` is persisted.
	pub api_token: String,
}

/// `CreateHub` (§4.4): synthesizes the hub's private sub-CA off the platform
/// CA, issues its server certificate and a TLS-auth key, and mints a
/// one-time API token. DH parameters are left `None` for the hub's own
/// install script to generate, per the spec's "generated asynchronously"
/// note.
pub fn create_hub(
	platform_ca: &pki::CaKeyMaterial,
	req: CreateHubRequest,
	sub_ca_validity: StdDuration,
	server_cert_validity: StdDuration,
) -> Result<CreatedHub> {
	let sub_ca = pki::generate_sub_ca(platform_ca, &req.name, sub_ca_validity)?;
	let sub_ca_material = pki::CaKeyMaterial {
		cert_pem: sub_ca.cert_pem.clone(),
		key_pem: sub_ca.key_pem.clone(),
	};
	let server_cert = pki::issue_server_certificate(
		&sub_ca_material,
		&pki::CertRequest {
			common_name: req.name.clone(),
			email: None,
			dns_names: vec![req.public_endpoint.clone()],
			valid_for: server_cert_validity,
		},
		|_| false,
	)?;
	let tls_auth_key = generate_tls_auth_key();
	let config_version = crate::gateway::config_version(
		req.crypto_profile,
		req.vpn_port,
		req.vpn_protocol,
		req.vpn_subnet,
		req.tls_auth_enabled,
		Some(&tls_auth_key),
		&sub_ca.fingerprint,
	);
	let (api_token, token_hash) = crate::gateway::generate_token();

	let hub = MeshHub {
		id: Uuid::new_v4(),
		name: req.name,
		public_endpoint: req.public_endpoint,
		vpn_port: req.vpn_port,
		vpn_protocol: req.vpn_protocol,
		vpn_subnet: req.vpn_subnet,
		crypto_profile: req.crypto_profile,
		tls_auth_enabled: req.tls_auth_enabled,
		ca_cert_pem: sub_ca.cert_pem,
		ca_key_pem: sub_ca.key_pem,
		server_cert_pem: server_cert.cert_pem,
		server_key_pem: server_cert.key_pem,
		dh_params: None,
		tls_auth_key,
		api_token_hash: token_hash,
		control_plane_url: req.control_plane_url,
		status: NodeStatus::Pending,
		last_heartbeat: None,
		config_version,
		local_networks: req.local_networks,
		full_tunnel_mode: req.full_tunnel_mode,
		push_dns: req.push_dns,
		dns_servers: req.dns_servers,
	};
	Ok(CreatedHub { hub, api_token })
}

#[derive(Debug, Clone)]
pub struct CreateSpokeRequest {
	pub hub_id: Id,
	pub name: String,
	pub local_networks: Vec<IpNet>,
}

pub struct CreatedSpoke {
	pub spoke: MeshSpoke,
	/// One-time plaintext token; only `spoke.token_hash` is persisted.
	pub token: String,
}

/// `CreateSpoke` (§4.4): allocates the lowest free tunnel IP in the hub's
/// subnet and issues a client certificate off the hub's own sub-CA.
/// `existing_names` and `taken_ips` are the hub's other spokes, scoped by
/// the caller (§3 I3/I4: tunnel IPs and names are unique within one hub).
pub fn create_spoke(
	hub: &MeshHub,
	req: CreateSpokeRequest,
	existing_names: &[String],
	taken_ips: &[IpAddr],
	client_cert_validity: StdDuration,
) -> Result<CreatedSpoke> {
	if existing_names.iter().any(|n| n == &req.name) {
		return Err(Error::DuplicateName(req.name));
	}
	let tunnel_ip = allocate_tunnel_ip(hub.vpn_subnet, taken_ips)?;
	let hub_ca = pki::CaKeyMaterial {
		cert_pem: hub.ca_cert_pem.clone(),
		key_pem: hub.ca_key_pem.clone(),
	};
	let client_cert = pki::issue_client_certificate(
		&hub_ca,
		&pki::CertRequest {
			common_name: req.name.clone(),
			email: None,
			dns_names: vec![],
			valid_for: client_cert_validity,
		},
		|_| false,
	)?;
	let (token, token_hash) = crate::gateway::generate_token();

	let spoke = MeshSpoke {
		id: Uuid::new_v4(),
		hub_id: req.hub_id,
		name: req.name,
		local_networks: req.local_networks,
		tunnel_ip,
		client_cert_pem: client_cert.cert_pem,
		client_key_pem: client_cert.key_pem,
		token_hash,
		status: NodeStatus::Pending,
		bytes_sent: 0,
		bytes_recv: 0,
		remote_ip: None,
		last_seen: None,
	};
	Ok(CreatedSpoke { spoke, token })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocates_lowest_free_host_skipping_reserved() {
		let subnet: IpNet = "10.9.0.0/24".parse().unwrap();
		let taken = vec!["10.9.0.2".parse().unwrap()];
		let ip = allocate_tunnel_ip(subnet, &taken).unwrap();
		assert_eq!(ip, "10.9.0.3".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn first_allocation_skips_hub_address() {
		let subnet: IpNet = "10.9.0.0/24".parse().unwrap();
		let ip = allocate_tunnel_ip(subnet, &[]).unwrap();
		assert_eq!(ip, "10.9.0.2".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn exhausted_subnet_errors() {
		let subnet: IpNet = "10.9.0.0/30".parse().unwrap();
		let taken: Vec<IpAddr> = subnet.hosts().collect();
		let err = allocate_tunnel_ip(subnet, &taken).unwrap_err();
		assert!(matches!(err, Error::SubnetExhausted));
	}

	#[test]
	fn ccd_entry_includes_iroute_per_network_and_ifconfig_push() {
		let networks = vec!["192.168.50.0/24".parse().unwrap()];
		let lines = ccd_entry("10.9.0.3".parse().unwrap(), "255.255.255.0".parse().unwrap(), &networks);
		assert_eq!(lines.len(), 2);
		assert!(lines[0].starts_with("iroute 192.168.50.0"));
		assert!(lines[1].starts_with("ifconfig-push 10.9.0.3"));
	}
}
