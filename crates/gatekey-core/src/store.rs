//! Repository traits and an in-memory reference implementation (§9
//! "Polymorphism": `CAStore`, `PolicyRepository` etc. as interface
//! abstractions). A process wires these against whatever persistence it
//! wants; `gatekey-app` defaults to the in-memory store below.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::model::{
	AccessRule, ApiKey, AuditLog, Ca, Connection, Gateway, Id, IssuedCertificate, LocalUser, MeshHub, MeshSpoke,
	Network, User,
};
use crate::policy::Policy;

#[async_trait]
pub trait CaStore: Send + Sync {
	async fn load(&self) -> Option<Ca>;
	/// Persists `ca` only if no CA is currently stored; returns the CA that
	/// ends up stored (the caller's if it won the race, the existing one
	/// otherwise) per §4.1 "first writer wins".
	async fn store_if_absent(&self, ca: Ca) -> Ca;
	async fn replace(&self, ca: Ca);
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
	async fn insert(&self, cert: IssuedCertificate);
	async fn get(&self, serial: &str) -> Option<IssuedCertificate>;
	async fn revoke(&self, serial: &str, reason: crate::model::RevocationReason) -> bool;
	async fn all_active(&self) -> Vec<IssuedCertificate>;
	async fn all_revoked(&self) -> Vec<IssuedCertificate>;
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
	async fn list_enabled(&self) -> Vec<Policy>;
	async fn upsert(&self, policy: Policy);
	async fn remove(&self, id: Id) -> bool;
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
	async fn insert(&self, gateway: Gateway) -> Result<(), StoreError>;
	async fn get(&self, id: Id) -> Option<Gateway>;
	async fn get_by_token_hash(&self, hash: [u8; 32]) -> Option<Gateway>;
	async fn update(&self, gateway: Gateway);
	async fn list(&self) -> Vec<Gateway>;
}

#[async_trait]
pub trait MeshStore: Send + Sync {
	async fn insert_hub(&self, hub: MeshHub) -> Result<(), StoreError>;
	async fn get_hub(&self, id: Id) -> Option<MeshHub>;
	async fn get_hub_by_token_hash(&self, hash: [u8; 32]) -> Option<MeshHub>;
	async fn update_hub(&self, hub: MeshHub);
	async fn list_hubs(&self) -> Vec<MeshHub>;
	async fn insert_spoke(&self, spoke: MeshSpoke) -> Result<(), StoreError>;
	async fn get_spoke(&self, id: Id) -> Option<MeshSpoke>;
	async fn get_spoke_by_token_hash(&self, hash: [u8; 32]) -> Option<MeshSpoke>;
	async fn spokes_for_hub(&self, hub_id: Id) -> Vec<MeshSpoke>;
	async fn update_spoke(&self, spoke: MeshSpoke);
	async fn remove_spoke(&self, id: Id) -> Option<MeshSpoke>;
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
	/// Opens a new connection, implicitly closing any existing open
	/// connection for the same certificate (§3 I6).
	async fn open(&self, conn: Connection);
	async fn close(&self, id: Id, reason: Option<String>);
	async fn open_for_certificate(&self, certificate_serial: &str) -> Option<Connection>;
	async fn get(&self, id: Id) -> Option<Connection>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
	async fn record(&self, entry: AuditLog);
	async fn recent(&self, limit: usize) -> Vec<AuditLog>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("duplicate name: {0}")]
	DuplicateName(String),
}

#[derive(Default)]
pub struct InMemoryStores {
	ca: RwLock<Option<Ca>>,
	certs: RwLock<HashMap<String, IssuedCertificate>>,
	/// Bumped on every revocation so callers (the CRL cache) can tell the
	/// revoked set changed without diffing it.
	revocation_generation: RwLock<u64>,
	policies: RwLock<HashMap<Id, Policy>>,
	gateways: RwLock<HashMap<Id, Gateway>>,
	hubs: RwLock<HashMap<Id, MeshHub>>,
	spokes: RwLock<HashMap<Id, MeshSpoke>>,
	connections: RwLock<HashMap<Id, Connection>>,
	audit: RwLock<Vec<AuditLog>>,
	users: RwLock<HashMap<Id, User>>,
	local_users: RwLock<HashMap<Id, LocalUser>>,
	api_keys: RwLock<HashMap<Id, ApiKey>>,
	networks: RwLock<HashMap<Id, Network>>,
	access_rules: RwLock<HashMap<Id, AccessRule>>,
}

impl InMemoryStores {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl CaStore for InMemoryStores {
	async fn load(&self) -> Option<Ca> {
		self.ca.read().unwrap().clone()
	}

	async fn store_if_absent(&self, ca: Ca) -> Ca {
		let mut guard = self.ca.write().unwrap();
		if let Some(existing) = guard.as_ref() {
			return existing.clone();
		}
		*guard = Some(ca.clone());
		ca
	}

	async fn replace(&self, ca: Ca) {
		*self.ca.write().unwrap() = Some(ca);
	}
}

#[async_trait]
impl CertificateStore for InMemoryStores {
	async fn insert(&self, cert: IssuedCertificate) {
		self.certs.write().unwrap().insert(cert.serial.clone(), cert);
	}

	async fn get(&self, serial: &str) -> Option<IssuedCertificate> {
		self.certs.read().unwrap().get(serial).cloned()
	}

	async fn revoke(&self, serial: &str, reason: crate::model::RevocationReason) -> bool {
		let mut certs = self.certs.write().unwrap();
		if let Some(cert) = certs.get_mut(serial) {
			cert.revoked = true;
			cert.revoked_at = Some(Utc::now());
			cert.reason = Some(reason);
			*self.revocation_generation.write().unwrap() += 1;
			true
		} else {
			false
		}
	}

	async fn all_active(&self) -> Vec<IssuedCertificate> {
		self.certs.read().unwrap().values().filter(|c| !c.revoked).cloned().collect()
	}

	async fn all_revoked(&self) -> Vec<IssuedCertificate> {
		self.certs.read().unwrap().values().filter(|c| c.revoked).cloned().collect()
	}
}

#[async_trait]
impl PolicyRepository for InMemoryStores {
	async fn list_enabled(&self) -> Vec<Policy> {
		self.policies.read().unwrap().values().filter(|p| p.is_enabled).cloned().collect()
	}

	async fn upsert(&self, policy: Policy) {
		self.policies.write().unwrap().insert(policy.id, policy);
	}

	async fn remove(&self, id: Id) -> bool {
		self.policies.write().unwrap().remove(&id).is_some()
	}
}

#[async_trait]
impl GatewayStore for InMemoryStores {
	async fn insert(&self, gateway: Gateway) -> Result<(), StoreError> {
		let mut gateways = self.gateways.write().unwrap();
		if gateways.values().any(|g| g.name == gateway.name) {
			return Err(StoreError::DuplicateName(gateway.name));
		}
		gateways.insert(gateway.id, gateway);
		Ok(())
	}

	async fn get(&self, id: Id) -> Option<Gateway> {
		self.gateways.read().unwrap().get(&id).cloned()
	}

	async fn get_by_token_hash(&self, hash: [u8; 32]) -> Option<Gateway> {
		self.gateways.read().unwrap().values().find(|g| g.token_hash == hash).cloned()
	}

	async fn update(&self, gateway: Gateway) {
		self.gateways.write().unwrap().insert(gateway.id, gateway);
	}

	async fn list(&self) -> Vec<Gateway> {
		self.gateways.read().unwrap().values().cloned().collect()
	}
}

#[async_trait]
impl MeshStore for InMemoryStores {
	async fn insert_hub(&self, hub: MeshHub) -> Result<(), StoreError> {
		let mut hubs = self.hubs.write().unwrap();
		if hubs.values().any(|h| h.name == hub.name) {
			return Err(StoreError::DuplicateName(hub.name));
		}
		hubs.insert(hub.id, hub);
		Ok(())
	}

	async fn get_hub(&self, id: Id) -> Option<MeshHub> {
		self.hubs.read().unwrap().get(&id).cloned()
	}

	async fn get_hub_by_token_hash(&self, hash: [u8; 32]) -> Option<MeshHub> {
		self.hubs.read().unwrap().values().find(|h| h.api_token_hash == hash).cloned()
	}

	async fn update_hub(&self, hub: MeshHub) {
		self.hubs.write().unwrap().insert(hub.id, hub);
	}

	async fn list_hubs(&self) -> Vec<MeshHub> {
		self.hubs.read().unwrap().values().cloned().collect()
	}

	async fn insert_spoke(&self, spoke: MeshSpoke) -> Result<(), StoreError> {
		let mut spokes = self.spokes.write().unwrap();
		if spokes.values().any(|s| s.hub_id == spoke.hub_id && s.name == spoke.name) {
			return Err(StoreError::DuplicateName(spoke.name));
		}
		spokes.insert(spoke.id, spoke);
		Ok(())
	}

	async fn get_spoke(&self, id: Id) -> Option<MeshSpoke> {
		self.spokes.read().unwrap().get(&id).cloned()
	}

	async fn get_spoke_by_token_hash(&self, hash: [u8; 32]) -> Option<MeshSpoke> {
		self.spokes.read().unwrap().values().find(|s| s.token_hash == hash).cloned()
	}

	async fn spokes_for_hub(&self, hub_id: Id) -> Vec<MeshSpoke> {
		self.spokes.read().unwrap().values().filter(|s| s.hub_id == hub_id).cloned().collect()
	}

	async fn update_spoke(&self, spoke: MeshSpoke) {
		self.spokes.write().unwrap().insert(spoke.id, spoke);
	}

	async fn remove_spoke(&self, id: Id) -> Option<MeshSpoke> {
		self.spokes.write().unwrap().remove(&id)
	}
}

#[async_trait]
impl ConnectionStore for InMemoryStores {
	async fn open(&self, conn: Connection) {
		let mut connections = self.connections.write().unwrap();
		let stale_ids: Vec<Id> = connections
			.values()
			.filter(|c| c.certificate_serial == conn.certificate_serial && c.is_open())
			.map(|c| c.id)
			.collect();
		for id in stale_ids {
			if let Some(prior) = connections.get_mut(&id) {
				prior.disconnected_at = Some(Utc::now());
				prior.disconnect_reason = Some("superseded by reconnect".to_string());
			}
		}
		connections.insert(conn.id, conn);
	}

	async fn close(&self, id: Id, reason: Option<String>) {
		if let Some(conn) = self.connections.write().unwrap().get_mut(&id) {
			conn.disconnected_at = Some(Utc::now());
			conn.disconnect_reason = reason;
		}
	}

	async fn open_for_certificate(&self, certificate_serial: &str) -> Option<Connection> {
		self.connections
			.read()
			.unwrap()
			.values()
			.find(|c| c.certificate_serial == certificate_serial && c.is_open())
			.cloned()
	}

	async fn get(&self, id: Id) -> Option<Connection> {
		self.connections.read().unwrap().get(&id).cloned()
	}
}

#[async_trait]
impl AuditSink for InMemoryStores {
	async fn record(&self, entry: AuditLog) {
		self.audit.write().unwrap().push(entry);
	}

	async fn recent(&self, limit: usize) -> Vec<AuditLog> {
		let audit = self.audit.read().unwrap();
		audit.iter().rev().take(limit).cloned().collect()
	}
}

impl InMemoryStores {
	/// Current revocation generation (§10.6 CRL caching: callers regenerate
	/// their cached CRL when this no longer matches the generation it was
	/// built under).
	pub fn revocation_generation(&self) -> u64 {
		*self.revocation_generation.read().unwrap()
	}

	pub async fn upsert_user(&self, user: User) {
		self.users.write().unwrap().insert(user.id, user);
	}

	pub async fn get_user(&self, id: Id) -> Option<User> {
		self.users.read().unwrap().get(&id).cloned()
	}

	pub async fn upsert_local_user(&self, user: LocalUser) {
		self.local_users.write().unwrap().insert(user.id, user);
	}

	pub async fn get_local_user_by_username(&self, username: &str) -> Option<LocalUser> {
		self.local_users.read().unwrap().values().find(|u| u.username == username).cloned()
	}

	pub async fn upsert_api_key(&self, key: ApiKey) {
		self.api_keys.write().unwrap().insert(key.id, key);
	}

	pub async fn get_api_key_by_hash(&self, hash: &[u8; 32]) -> Option<ApiKey> {
		self.api_keys.read().unwrap().values().find(|k| &k.token_hash == hash).cloned()
	}

	pub async fn upsert_network(&self, network: Network) {
		self.networks.write().unwrap().insert(network.id, network);
	}

	pub async fn list_networks(&self) -> Vec<Network> {
		self.networks.read().unwrap().values().cloned().collect()
	}

	pub async fn upsert_access_rule(&self, rule: AccessRule) {
		self.access_rules.write().unwrap().insert(rule.id, rule);
	}

	pub async fn list_access_rules(&self) -> Vec<AccessRule> {
		self.access_rules.read().unwrap().values().cloned().collect()
	}
}

/// Constructs an `AuditLog` entry the way every mutating handler should
/// (§10.6 supplemented feature: audit on every mutating op).
pub fn audit_entry(
	event: &str,
	actor_id: Option<Id>,
	actor_email: Option<String>,
	resource_type: &str,
	resource_id: impl ToString,
	details: serde_json::Value,
	success: bool,
) -> AuditLog {
	AuditLog {
		id: Uuid::new_v4(),
		timestamp: Utc::now(),
		event: event.to_string(),
		actor_id,
		actor_email,
		actor_ip: None,
		resource_type: resource_type.to_string(),
		resource_id: resource_id.to_string(),
		details,
		success,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{CaStatus, GatewayRef};
	use std::net::IpAddr;

	fn sample_ca() -> Ca {
		Ca {
			id: "default".into(),
			cert_pem: "cert".into(),
			key_pem: "key".into(),
			serial: "1".into(),
			not_before: Utc::now(),
			not_after: Utc::now() + chrono::Duration::days(365),
			status: CaStatus::Active,
			fingerprint: "fp".into(),
		}
	}

	#[tokio::test]
	async fn ca_store_if_absent_is_first_writer_wins() {
		let store = InMemoryStores::new();
		let first = store.store_if_absent(sample_ca()).await;
		let mut other = sample_ca();
		other.serial = "2".into();
		let second = store.store_if_absent(other).await;
		assert_eq!(first.serial, second.serial);
	}

	#[tokio::test]
	async fn opening_connection_supersedes_prior_open_connection_for_same_cert() {
		let store = InMemoryStores::new();
		let conn1 = Connection {
			id: Uuid::new_v4(),
			user_id: Uuid::new_v4(),
			session_id: None,
			certificate_serial: "abc".into(),
			gateway_ref: GatewayRef::Gateway(Uuid::new_v4()),
			client_ip: "1.2.3.4".parse::<IpAddr>().unwrap(),
			vpn_address: "10.8.0.2".parse::<IpAddr>().unwrap(),
			connected_at: Utc::now(),
			disconnected_at: None,
			disconnect_reason: None,
		};
		let conn1_id = conn1.id;
		store.open(conn1).await;

		let conn2 = Connection {
			id: Uuid::new_v4(),
			certificate_serial: "abc".into(),
			..store.get(conn1_id).await.unwrap()
		};
		store.open(conn2).await;

		let prior = store.get(conn1_id).await.unwrap();
		assert!(!prior.is_open());
	}

	#[tokio::test]
	async fn gateway_insert_rejects_duplicate_name() {
		let store = InMemoryStores::new();
		let gw = Gateway {
			id: Uuid::new_v4(),
			name: "gw-1".into(),
			endpoint: "e".into(),
			vpn_port: 1194,
			vpn_protocol: crate::model::VpnProtocol::Udp,
			crypto_profile: crate::model::CryptoProfile::Modern,
			vpn_subnet: "10.8.0.0/24".parse().unwrap(),
			tls_auth_enabled: false,
			tls_auth_key: None,
			config_version: "v".into(),
			is_active: true,
			last_heartbeat: None,
			status: crate::model::NodeStatus::Pending,
			full_tunnel_mode: false,
			push_dns: false,
			dns_servers: vec![],
			token_hash: [0u8; 32],
		};
		GatewayStore::insert(&store, gw.clone()).await.unwrap();
		let mut dup = gw;
		dup.id = Uuid::new_v4();
		let err = GatewayStore::insert(&store, dup).await.unwrap_err();
		assert!(matches!(err, StoreError::DuplicateName(_)));
	}
}
