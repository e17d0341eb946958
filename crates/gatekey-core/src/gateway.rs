//! Gateway provisioning & config-version protocol (spec §4.3).

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::{CryptoProfile, Gateway, Id, NodeStatus, VpnProtocol};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid token")]
	InvalidToken,

	#[error("gateway is deactivated")]
	GatewayDeactivated,

	#[error("config generation failed: {0}")]
	ConfigGeneration(String),

	#[error("store unavailable: {0}")]
	StoreUnavailable(String),
}

impl Error {
	pub fn category(&self) -> crate::error::Category {
		use crate::error::Category;
		match self {
			Error::InvalidToken => Category::Authentication,
			Error::GatewayDeactivated => Category::Authorization,
			Error::ConfigGeneration(_) => Category::ConfigGeneration,
			Error::StoreUnavailable(_) => Category::Network,
		}
	}
}

type Result<T> = std::result::Result<T, Error>;

/// `configVersion = hex(SHA-256(canonicalize(tuple)))` (§4.3 I2). The tuple
/// also folds in the issuing CA's fingerprint so a CA rotation is itself a
/// reprovision trigger (§4.3, §9 open question resolved in DESIGN.md).
pub fn config_version(
	crypto_profile: CryptoProfile,
	port: u16,
	protocol: VpnProtocol,
	subnet: IpNet,
	tls_auth_enabled: bool,
	tls_auth_key: Option<&str>,
	ca_fingerprint: &str,
) -> String {
	let canonical = format!(
		"{:?}|{}|{:?}|{}|{}|{}|{}",
		crypto_profile,
		port,
		protocol,
		subnet,
		tls_auth_enabled,
		tls_auth_key.unwrap_or(""),
		ca_fingerprint,
	);
	hex::encode(Sha256::digest(canonical.as_bytes()))
}

impl Gateway {
	pub fn recompute_config_version(&mut self, ca_fingerprint: &str) {
		self.config_version = config_version(
			self.crypto_profile,
			self.vpn_port,
			self.vpn_protocol,
			self.vpn_subnet,
			self.tls_auth_enabled,
			self.tls_auth_key.as_deref(),
			ca_fingerprint,
		);
	}

	/// Heartbeat-driven state transition (§4.3 state machine). `since` is the
	/// duration since `last_heartbeat`; `offline_after` is `3 * heartbeatInterval`.
	pub fn status_from_heartbeat_age(since: Duration, offline_after: Duration) -> NodeStatus {
		if since <= offline_after {
			NodeStatus::Online
		} else {
			NodeStatus::Offline
		}
	}
}

/// Fresh 32-byte registration token; transmitted once in cleartext and
/// stored only as its hash (§4.3 Registration).
pub fn generate_token() -> (String, [u8; 32]) {
	let mut raw = [0u8; 32];
	rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
	let token = hex::encode(raw);
	let hash = Sha256::digest(&raw).into();
	(token, hash)
}

pub fn hash_token(token: &str) -> Result<[u8; 32]> {
	let raw = hex::decode(token).map_err(|_| Error::InvalidToken)?;
	Ok(Sha256::digest(&raw).into())
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
	pub gateway_id: Id,
	pub token: String,
}

#[derive(Debug, Clone)]
pub struct ProvisionResponse {
	pub ca_cert: String,
	pub server_cert: String,
	pub server_key: String,
	pub tls_auth_key: Option<String>,
	pub dh_params: Option<String>,
	pub config_version: String,
	pub vpn_port: u16,
	pub vpn_protocol: VpnProtocol,
	pub crypto_profile: CryptoProfile,
}

#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
	pub token: String,
	pub status: NodeStatus,
	pub remote_ip: Option<IpAddr>,
	pub bytes_sent: u64,
	pub bytes_received: u64,
	pub config_version: String,
}

#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
	pub ok: bool,
	pub config_version: String,
	pub needs_reprovision: bool,
	pub tls_auth_enabled: bool,
}

/// Applies a heartbeat against a gateway's current stored state, per §4.3.
/// Does not touch the store; callers persist `last_heartbeat`/`status` and
/// the reported counters themselves.
pub fn apply_heartbeat(gateway: &Gateway, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
	if !gateway.is_active {
		return Err(Error::GatewayDeactivated);
	}
	let needs_reprovision = req.config_version != gateway.config_version;
	Ok(HeartbeatResponse {
		ok: true,
		config_version: gateway.config_version.clone(),
		needs_reprovision,
		tls_auth_enabled: gateway.tls_auth_enabled,
	})
}

pub fn new_gateway_id() -> Id {
	Uuid::new_v4()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn config_version_changes_when_tuple_changes() {
		let subnet: IpNet = "10.8.0.0/24".parse().unwrap();
		let v1 = config_version(CryptoProfile::Modern, 1194, VpnProtocol::Udp, subnet, true, Some("key"), "fp1");
		let v2 = config_version(CryptoProfile::Modern, 1195, VpnProtocol::Udp, subnet, true, Some("key"), "fp1");
		assert_ne!(v1, v2);
	}

	#[test]
	fn config_version_changes_on_ca_rotation() {
		let subnet: IpNet = "10.8.0.0/24".parse().unwrap();
		let v1 = config_version(CryptoProfile::Modern, 1194, VpnProtocol::Udp, subnet, true, Some("key"), "fp1");
		let v2 = config_version(CryptoProfile::Modern, 1194, VpnProtocol::Udp, subnet, true, Some("key"), "fp2");
		assert_ne!(v1, v2);
	}

	#[test]
	fn heartbeat_age_within_window_is_online() {
		let status = Gateway::status_from_heartbeat_age(Duration::from_secs(60), Duration::from_secs(90));
		assert_eq!(status, NodeStatus::Online);
	}

	#[test]
	fn heartbeat_age_past_window_is_offline() {
		let status = Gateway::status_from_heartbeat_age(Duration::from_secs(91), Duration::from_secs(90));
		assert_eq!(status, NodeStatus::Offline);
	}

	#[test]
	fn token_hash_is_stable_and_matches_registration() {
		let (token, hash) = generate_token();
		assert_eq!(hash_token(&token).unwrap(), hash);
	}

	#[test]
	fn heartbeat_rejects_deactivated_gateway() {
		let mut gw = sample_gateway();
		gw.is_active = false;
		let req = HeartbeatRequest {
			token: "t".into(),
			status: NodeStatus::Online,
			remote_ip: None,
			bytes_sent: 0,
			bytes_received: 0,
			config_version: gw.config_version.clone(),
		};
		let err = apply_heartbeat(&gw, &req).unwrap_err();
		assert!(matches!(err, Error::GatewayDeactivated));
	}

	#[test]
	fn heartbeat_flags_reprovision_on_version_mismatch() {
		let gw = sample_gateway();
		let req = HeartbeatRequest {
			token: "t".into(),
			status: NodeStatus::Online,
			remote_ip: None,
			bytes_sent: 0,
			bytes_received: 0,
			config_version: "stale".into(),
		};
		let resp = apply_heartbeat(&gw, &req).unwrap();
		assert!(resp.needs_reprovision);
	}

	fn sample_gateway() -> Gateway {
		Gateway {
			id: new_gateway_id(),
			name: "gw-1".into(),
			endpoint: "gw-1.example.com".into(),
			vpn_port: 1194,
			vpn_protocol: VpnProtocol::Udp,
			crypto_profile: CryptoProfile::Modern,
			vpn_subnet: "10.8.0.0/24".parse().unwrap(),
			tls_auth_enabled: true,
			tls_auth_key: Some("key".into()),
			config_version: "current".into(),
			is_active: true,
			last_heartbeat: None,
			status: NodeStatus::Pending,
			full_tunnel_mode: false,
			push_dns: false,
			dns_servers: vec![],
			token_hash: [0u8; 32],
		}
	}
}
