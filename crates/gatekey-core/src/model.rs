//! Shared entity types for the GateKey data model (spec §3).
//!
//! These are plain data structs; behavior lives in the owning modules
//! (`pki`, `policy`, `gateway`, `mesh`, `session`, `firewall`). Identifiers
//! are opaque 128-bit values (`uuid::Uuid`) unless otherwise noted.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Id = Uuid;

/// `KeyAlgorithm` is a closed set; unknown algorithms fail at the edge (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
	Rsa2048,
	Rsa4096,
	Ecdsa256,
	Ecdsa384,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaStatus {
	Active,
	Rotated,
	Revoked,
}

/// Singleton CA record, keyed by `id = "default"` in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ca {
	pub id: String,
	#[serde(skip)]
	pub cert_pem: String,
	#[serde(skip_serializing)]
	pub key_pem: String,
	pub serial: String,
	pub not_before: DateTime<Utc>,
	pub not_after: DateTime<Utc>,
	pub status: CaStatus,
	pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
	Unspecified,
	KeyCompromise,
	CaCompromise,
	AffiliationChanged,
	Superseded,
	CessationOfOperation,
	CertificateHold,
	PrivilegeWithdrawn,
}

impl RevocationReason {
	/// RFC 5280 CRLReason numeric code.
	pub fn rfc5280_code(self) -> u32 {
		match self {
			RevocationReason::Unspecified => 0,
			RevocationReason::KeyCompromise => 1,
			RevocationReason::CaCompromise => 2,
			RevocationReason::AffiliationChanged => 3,
			RevocationReason::Superseded => 4,
			RevocationReason::CessationOfOperation => 5,
			RevocationReason::CertificateHold => 6,
			RevocationReason::PrivilegeWithdrawn => 9,
		}
	}
}

/// Immutable except for the revocation fields (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
	pub serial: String,
	pub subject_cn: String,
	pub email: Option<String>,
	pub fingerprint: String,
	pub not_before: DateTime<Utc>,
	pub not_after: DateTime<Utc>,
	pub revoked: bool,
	pub revoked_at: Option<DateTime<Utc>>,
	pub reason: Option<RevocationReason>,
	pub owning_user: Option<Id>,
	pub issuing_session: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
	pub id: Id,
	pub external_id: String,
	pub provider: String,
	pub email: String,
	pub name: String,
	pub groups: HashSet<String>,
	pub is_admin: bool,
	pub is_active: bool,
	pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUser {
	pub id: Id,
	pub username: String,
	#[serde(skip_serializing)]
	pub password_hash: String,
	pub email: String,
	pub is_admin: bool,
}

/// An opaque bearer credential. Only the 32-byte hash is persisted; the
/// plaintext token is returned exactly once at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
	pub id: Id,
	pub owner: Id,
	#[serde(skip_serializing)]
	pub token_hash: [u8; 32],
	pub scopes: HashSet<String>,
	pub expires_at: Option<DateTime<Utc>>,
	pub revoked: bool,
	pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
	pub fn has_scope(&self, scope: &str) -> bool {
		self.scopes.contains("*") || self.scopes.contains(scope)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
	Udp,
	Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoProfile {
	Modern,
	Fips,
	Compatible,
}

impl CryptoProfile {
	/// `data-ciphers`/`ncp-ciphers` list for this profile (spec §6).
	pub fn cipher_list(self) -> &'static str {
		match self {
			CryptoProfile::Modern => "AES-256-GCM:CHACHA20-POLY1305",
			CryptoProfile::Fips => "AES-256-GCM:AES-128-GCM",
			CryptoProfile::Compatible => "AES-256-GCM:AES-128-GCM:AES-256-CBC:AES-128-CBC",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
	Pending,
	Provisioning,
	Online,
	Offline,
	Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
	pub id: Id,
	pub name: String,
	pub endpoint: String,
	pub vpn_port: u16,
	pub vpn_protocol: VpnProtocol,
	pub crypto_profile: CryptoProfile,
	pub vpn_subnet: IpNet,
	pub tls_auth_enabled: bool,
	pub tls_auth_key: Option<String>,
	pub config_version: String,
	pub is_active: bool,
	pub last_heartbeat: Option<DateTime<Utc>>,
	pub status: NodeStatus,
	pub full_tunnel_mode: bool,
	pub push_dns: bool,
	pub dns_servers: Vec<IpAddr>,
	#[serde(skip_serializing)]
	pub token_hash: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
	pub id: Id,
	pub name: String,
	pub cidr: IpNet,
	pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessRuleType {
	Ip,
	Cidr,
	Hostname,
	HostnameWildcard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Tcp,
	Udp,
	Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
	pub id: Id,
	pub name: String,
	pub rule_type: AccessRuleType,
	pub value: String,
	pub port_range: Option<(u16, u16)>,
	pub protocol: Protocol,
	pub network_id: Option<Id>,
	pub is_active: bool,
	pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshHub {
	pub id: Id,
	pub name: String,
	pub public_endpoint: String,
	pub vpn_port: u16,
	pub vpn_protocol: VpnProtocol,
	/// Default is a /16, see §3.
	pub vpn_subnet: IpNet,
	pub crypto_profile: CryptoProfile,
	pub tls_auth_enabled: bool,
	pub ca_cert_pem: String,
	#[serde(skip_serializing)]
	pub ca_key_pem: String,
	pub server_cert_pem: String,
	#[serde(skip_serializing)]
	pub server_key_pem: String,
	pub dh_params: Option<String>,
	pub tls_auth_key: String,
	#[serde(skip_serializing)]
	pub api_token_hash: [u8; 32],
	pub control_plane_url: String,
	pub status: NodeStatus,
	pub last_heartbeat: Option<DateTime<Utc>>,
	pub config_version: String,
	pub local_networks: Vec<IpNet>,
	pub full_tunnel_mode: bool,
	pub push_dns: bool,
	pub dns_servers: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSpoke {
	pub id: Id,
	pub hub_id: Id,
	pub name: String,
	pub local_networks: Vec<IpNet>,
	pub tunnel_ip: IpAddr,
	pub client_cert_pem: String,
	#[serde(skip_serializing)]
	pub client_key_pem: String,
	#[serde(skip_serializing)]
	pub token_hash: [u8; 32],
	pub status: NodeStatus,
	pub bytes_sent: u64,
	pub bytes_recv: u64,
	pub remote_ip: Option<IpAddr>,
	pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayRef {
	Gateway(Id),
	Hub(Id),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
	pub id: Id,
	pub user_id: Id,
	pub session_id: Option<Id>,
	pub certificate_serial: String,
	pub gateway_ref: GatewayRef,
	pub client_ip: IpAddr,
	pub vpn_address: IpAddr,
	pub connected_at: DateTime<Utc>,
	pub disconnected_at: Option<DateTime<Utc>>,
	pub disconnect_reason: Option<String>,
}

impl Connection {
	pub fn is_open(&self) -> bool {
		self.disconnected_at.is_none()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
	pub id: Id,
	pub timestamp: DateTime<Utc>,
	pub event: String,
	pub actor_id: Option<Id>,
	pub actor_email: Option<String>,
	pub actor_ip: Option<IpAddr>,
	pub resource_type: String,
	pub resource_id: String,
	pub details: serde_json::Value,
	pub success: bool,
}
