use std::net::IpAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use gatekey_core::gateway::{self, HeartbeatRequest, HeartbeatResponse};
use gatekey_core::hooks;
use gatekey_core::model::{CryptoProfile, GatewayRef, Id, NodeStatus, VpnProtocol};
use gatekey_core::policy::PortSpec;
use gatekey_core::store::{AuditSink, CaStore, CertificateStore, ConnectionStore, GatewayStore, MeshStore};
use gatekey_core::{firewall, mesh, pki, Error};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state::{AppState, CachedCrl};
use crate::ws;

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/api/v1/gateway/provision", post(provision_gateway))
		.route("/api/v1/gateway/heartbeat", post(gateway_heartbeat))
		.route("/api/v1/mesh-hub", post(create_mesh_hub))
		.route("/api/v1/mesh-hub/provision", post(provision_mesh_hub))
		.route("/api/v1/mesh-hub/heartbeat", post(mesh_hub_heartbeat))
		.route("/api/v1/mesh-spoke", post(create_mesh_spoke))
		.route("/api/v1/mesh-spoke/provision", post(provision_mesh_spoke))
		.route("/api/v1/mesh-spoke/heartbeat", post(mesh_spoke_heartbeat))
		.route("/api/v1/hooks/verify-token", post(hooks_verify_token))
		.route("/api/v1/hooks/client-connect", post(hooks_client_connect))
		.route("/api/v1/hooks/client-disconnect", post(hooks_client_disconnect))
		.route("/api/v1/ca/crl", get(get_crl))
		.route("/ws/agent", get(ws::agent_socket))
		.route("/ws/admin", get(ws::admin_socket))
		.with_state(state)
}

/// Minimal router for `Config::admin_addr` — just `/health`, bound to its own
/// listener in `main` so health checks don't share a port with the
/// provisioning/WebSocket surface.
pub fn admin_router(state: AppState) -> Router {
	Router::new().route("/health", get(health)).with_state(state)
}

async fn health() -> &'static str {
	"ok"
}

/// Serves the current CRL as PEM (spec §4.1 `GenerateCRL`). Cached until
/// `next_update` or until a revocation lands, matching `CaClient::get_identity`'s
/// refresh-on-demand style (§10.6) rather than regenerating on every poll.
async fn get_crl(State(state): State<AppState>) -> Result<String, ApiError> {
	let current_generation = state.stores.revocation_generation();
	{
		let cache = state.crl_cache.read().await;
		if let Some(cached) = cache.as_ref() {
			if cached.revocation_generation == current_generation && Utc::now() < cached.next_update {
				return Ok(cached.pem.clone());
			}
		}
	}

	let ca = state
		.stores
		.load()
		.await
		.ok_or_else(|| Error::Fatal("CA not bootstrapped".into()))?;
	let ca_material = pki::CaKeyMaterial {
		cert_pem: ca.cert_pem,
		key_pem: ca.key_pem,
	};
	let revoked: Vec<pki::RevokedEntry> = state
		.stores
		.all_revoked()
		.await
		.into_iter()
		.filter_map(|cert| {
			Some(pki::RevokedEntry {
				serial_hex: cert.serial,
				reason: cert.reason?,
				revoked_at: cert.revoked_at?,
			})
		})
		.collect();
	let crl_number = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_nanos() as u64;
	let crl_pem = pki::generate_crl(&ca_material, &revoked, state.config.crl_validity, crl_number)?;

	let mut cache = state.crl_cache.write().await;
	*cache = Some(CachedCrl {
		pem: crl_pem.clone(),
		next_update: Utc::now() + chrono::Duration::from_std(state.config.crl_validity).unwrap_or(chrono::Duration::hours(24)),
		revocation_generation: current_generation,
	});
	Ok(crl_pem)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionRequestBody {
	token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionResponseBody {
	ca_cert: String,
	server_cert: String,
	server_key: String,
	tls_auth_key: Option<String>,
	config_version: String,
	vpn_port: u16,
}

async fn provision_gateway(
	State(state): State<AppState>,
	Json(body): Json<ProvisionRequestBody>,
) -> Result<Json<ProvisionResponseBody>, ApiError> {
	let hash = gateway::hash_token(&body.token)?;
	let gw = state
		.stores
		.get_by_token_hash(hash)
		.await
		.ok_or(gatekey_core::gateway::Error::InvalidToken)?;
	if !gw.is_active {
		return Err(gatekey_core::gateway::Error::GatewayDeactivated.into());
	}

	let ca = state
		.stores
		.load()
		.await
		.ok_or_else(|| Error::Fatal("CA not bootstrapped".into()))?;

	let req = pki::CertRequest {
		common_name: gw.name.clone(),
		email: None,
		dns_names: vec![gw.endpoint.clone()],
		valid_for: state.config.client_cert_validity,
	};
	let ca_material = pki::CaKeyMaterial {
		cert_pem: ca.cert_pem.clone(),
		key_pem: ca.key_pem.clone(),
	};
	let issued = pki::issue_server_certificate(&ca_material, &req, |_| false)?;

	info!(gateway = %gw.name, "provisioned gateway server certificate");
	state
		.stores
		.record(gatekey_core::store::audit_entry(
			"certificate_issued",
			None,
			None,
			"gateway",
			gw.id,
			serde_json::json!({"commonName": gw.name, "serial": issued.serial}),
			true,
		))
		.await;

	Ok(Json(ProvisionResponseBody {
		ca_cert: ca.cert_pem,
		server_cert: issued.cert_pem,
		server_key: issued.key_pem,
		tls_auth_key: gw.tls_auth_key.clone(),
		config_version: gw.config_version.clone(),
		vpn_port: gw.vpn_port,
	}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequestBody {
	token: String,
	/// Accepted for wire compatibility; the server derives the authoritative
	/// `online`/`offline` status from heartbeat recency, not from what the
	/// agent self-reports (§4.3 state machine).
	status: NodeStatus,
	bytes_sent: u64,
	bytes_received: u64,
	config_version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatResponseBody {
	ok: bool,
	config_version: String,
	needs_reprovision: bool,
	tls_auth_enabled: bool,
}

impl From<HeartbeatResponse> for HeartbeatResponseBody {
	fn from(r: HeartbeatResponse) -> Self {
		HeartbeatResponseBody {
			ok: r.ok,
			config_version: r.config_version,
			needs_reprovision: r.needs_reprovision,
			tls_auth_enabled: r.tls_auth_enabled,
		}
	}
}

async fn gateway_heartbeat(
	State(state): State<AppState>,
	Json(body): Json<HeartbeatRequestBody>,
) -> Result<Json<HeartbeatResponseBody>, ApiError> {
	let hash = gateway::hash_token(&body.token)?;
	let mut gw = state
		.stores
		.get_by_token_hash(hash)
		.await
		.ok_or(gatekey_core::gateway::Error::InvalidToken)?;

	let req = HeartbeatRequest {
		token: body.token,
		status: body.status,
		remote_ip: None,
		bytes_sent: body.bytes_sent,
		bytes_received: body.bytes_received,
		config_version: body.config_version,
	};
	let resp = gateway::apply_heartbeat(&gw, &req)?;

	gw.last_heartbeat = Some(chrono::Utc::now());
	gw.status = if resp.needs_reprovision { gw.status } else { NodeStatus::Online };
	state.stores.update(gw).await;

	if resp.needs_reprovision {
		warn!("gateway reported stale configVersion, flagging reprovision");
	}

	Ok(Json(resp.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeshProvisionRequestBody {
	token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeshHubProvisionResponseBody {
	ca_cert: String,
	server_cert: String,
	server_key: String,
	tls_auth_key: String,
	dh_params: Option<String>,
	config_version: String,
	vpn_port: u16,
	vpn_protocol: VpnProtocol,
	crypto_profile: CryptoProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMeshHubBody {
	name: String,
	public_endpoint: String,
	vpn_port: u16,
	vpn_protocol: VpnProtocol,
	vpn_subnet: IpNet,
	crypto_profile: CryptoProfile,
	tls_auth_enabled: bool,
	control_plane_url: String,
	#[serde(default)]
	local_networks: Vec<IpNet>,
	#[serde(default)]
	full_tunnel_mode: bool,
	#[serde(default)]
	push_dns: bool,
	#[serde(default)]
	dns_servers: Vec<IpAddr>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateMeshHubResponseBody {
	id: Id,
	name: String,
	api_token: String,
}

/// `CreateHub` (§4.4), exposed as an operator-facing provisioning call: builds
/// the hub's sub-CA and server certificate off the platform CA, then persists
/// the record so the hub can later self-provision over `/mesh-hub/provision`
/// with the returned one-time `apiToken`.
async fn create_mesh_hub(
	State(state): State<AppState>,
	Json(body): Json<CreateMeshHubBody>,
) -> Result<Json<CreateMeshHubResponseBody>, ApiError> {
	let ca = state
		.stores
		.load()
		.await
		.ok_or_else(|| Error::Fatal("CA not bootstrapped".into()))?;
	let platform_ca = pki::CaKeyMaterial {
		cert_pem: ca.cert_pem,
		key_pem: ca.key_pem,
	};

	let created = mesh::create_hub(
		&platform_ca,
		mesh::CreateHubRequest {
			name: body.name,
			public_endpoint: body.public_endpoint,
			vpn_port: body.vpn_port,
			vpn_protocol: body.vpn_protocol,
			vpn_subnet: body.vpn_subnet,
			crypto_profile: body.crypto_profile,
			tls_auth_enabled: body.tls_auth_enabled,
			control_plane_url: body.control_plane_url,
			local_networks: body.local_networks,
			full_tunnel_mode: body.full_tunnel_mode,
			push_dns: body.push_dns,
			dns_servers: body.dns_servers,
		},
		state.config.ca_validity,
		state.config.client_cert_validity,
	)?;

	state
		.stores
		.insert_hub(created.hub.clone())
		.await
		.map_err(|e| Error::Conflict(e.to_string()))?;

	info!(hub_id = %created.hub.id, name = %created.hub.name, "mesh hub created");
	Ok(Json(CreateMeshHubResponseBody {
		id: created.hub.id,
		name: created.hub.name,
		api_token: created.api_token,
	}))
}

async fn provision_mesh_hub(
	State(state): State<AppState>,
	Json(body): Json<MeshProvisionRequestBody>,
) -> Result<Json<MeshHubProvisionResponseBody>, ApiError> {
	let hash = gateway::hash_token(&body.token)?;
	let hub = state
		.stores
		.get_hub_by_token_hash(hash)
		.await
		.ok_or(mesh::Error::InvalidToken)?;

	Ok(Json(MeshHubProvisionResponseBody {
		ca_cert: hub.ca_cert_pem,
		server_cert: hub.server_cert_pem,
		server_key: hub.server_key_pem,
		tls_auth_key: hub.tls_auth_key,
		dh_params: hub.dh_params,
		config_version: hub.config_version,
		vpn_port: hub.vpn_port,
		vpn_protocol: hub.vpn_protocol,
		crypto_profile: hub.crypto_profile,
	}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeshHeartbeatRequestBody {
	token: String,
	/// Accepted for wire compatibility; see `HeartbeatRequestBody::status`.
	status: NodeStatus,
	bytes_sent: u64,
	bytes_received: u64,
	config_version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeshHeartbeatResponseBody {
	ok: bool,
	config_version: String,
	needs_reprovision: bool,
	tls_auth_enabled: bool,
}

async fn mesh_hub_heartbeat(
	State(state): State<AppState>,
	Json(body): Json<MeshHeartbeatRequestBody>,
) -> Result<Json<MeshHeartbeatResponseBody>, ApiError> {
	let hash = gateway::hash_token(&body.token)?;
	let mut hub = state
		.stores
		.get_hub_by_token_hash(hash)
		.await
		.ok_or(mesh::Error::InvalidToken)?;

	let needs_reprovision = body.config_version != hub.config_version;
	hub.last_heartbeat = Some(chrono::Utc::now());
	hub.status = if needs_reprovision { hub.status } else { NodeStatus::Online };
	let response = MeshHeartbeatResponseBody {
		ok: true,
		config_version: hub.config_version.clone(),
		needs_reprovision,
		tls_auth_enabled: hub.tls_auth_enabled,
	};
	state.stores.update_hub(hub).await;
	if needs_reprovision {
		warn!("mesh hub reported stale configVersion, flagging reprovision");
	}
	Ok(Json(response))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeshSpokeProvisionResponseBody {
	ca_cert: String,
	client_cert: String,
	client_key: String,
	tls_auth_key: String,
	config_version: String,
	vpn_port: u16,
	vpn_protocol: VpnProtocol,
	crypto_profile: CryptoProfile,
	tunnel_ip: IpAddr,
	local_networks: Vec<IpNet>,
	gateway_name: String,
	hub_endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMeshSpokeBody {
	hub_id: Id,
	name: String,
	#[serde(default)]
	local_networks: Vec<IpNet>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateMeshSpokeResponseBody {
	id: Id,
	name: String,
	tunnel_ip: IpAddr,
	token: String,
}

/// `CreateSpoke` (§4.4), exposed as an operator-facing provisioning call:
/// allocates the next free tunnel IP in the hub's subnet and issues a client
/// certificate off the hub's own sub-CA.
async fn create_mesh_spoke(
	State(state): State<AppState>,
	Json(body): Json<CreateMeshSpokeBody>,
) -> Result<Json<CreateMeshSpokeResponseBody>, ApiError> {
	let hub = state
		.stores
		.get_hub(body.hub_id)
		.await
		.ok_or_else(|| Error::NotFound(format!("hub {}", body.hub_id)))?;
	let siblings = state.stores.spokes_for_hub(hub.id).await;
	let existing_names: Vec<String> = siblings.iter().map(|s| s.name.clone()).collect();
	let taken_ips: Vec<IpAddr> = siblings.iter().map(|s| s.tunnel_ip).collect();

	let created = mesh::create_spoke(
		&hub,
		mesh::CreateSpokeRequest {
			hub_id: hub.id,
			name: body.name,
			local_networks: body.local_networks,
		},
		&existing_names,
		&taken_ips,
		state.config.client_cert_validity,
	)?;

	state
		.stores
		.insert_spoke(created.spoke.clone())
		.await
		.map_err(|e| Error::Conflict(e.to_string()))?;

	info!(spoke_id = %created.spoke.id, hub_id = %hub.id, name = %created.spoke.name, "mesh spoke created");
	Ok(Json(CreateMeshSpokeResponseBody {
		id: created.spoke.id,
		name: created.spoke.name,
		tunnel_ip: created.spoke.tunnel_ip,
		token: created.token,
	}))
}

async fn provision_mesh_spoke(
	State(state): State<AppState>,
	Json(body): Json<MeshProvisionRequestBody>,
) -> Result<Json<MeshSpokeProvisionResponseBody>, ApiError> {
	let hash = gateway::hash_token(&body.token)?;
	let spoke = state
		.stores
		.get_spoke_by_token_hash(hash)
		.await
		.ok_or(mesh::Error::InvalidToken)?;
	let hub = state
		.stores
		.get_hub(spoke.hub_id)
		.await
		.ok_or_else(|| Error::NotFound(format!("hub {}", spoke.hub_id)))?;

	Ok(Json(MeshSpokeProvisionResponseBody {
		ca_cert: hub.ca_cert_pem,
		client_cert: spoke.client_cert_pem,
		client_key: spoke.client_key_pem,
		tls_auth_key: hub.tls_auth_key,
		config_version: hub.config_version,
		vpn_port: hub.vpn_port,
		vpn_protocol: hub.vpn_protocol,
		crypto_profile: hub.crypto_profile,
		tunnel_ip: spoke.tunnel_ip,
		local_networks: spoke.local_networks,
		gateway_name: hub.name,
		hub_endpoint: hub.public_endpoint,
	}))
}

async fn mesh_spoke_heartbeat(
	State(state): State<AppState>,
	Json(body): Json<MeshHeartbeatRequestBody>,
) -> Result<Json<MeshHeartbeatResponseBody>, ApiError> {
	let hash = gateway::hash_token(&body.token)?;
	let mut spoke = state
		.stores
		.get_spoke_by_token_hash(hash)
		.await
		.ok_or(mesh::Error::InvalidToken)?;
	let hub = state
		.stores
		.get_hub(spoke.hub_id)
		.await
		.ok_or_else(|| Error::NotFound(format!("hub {}", spoke.hub_id)))?;

	let needs_reprovision = body.config_version != hub.config_version;
	spoke.last_seen = Some(chrono::Utc::now());
	spoke.bytes_sent = body.bytes_sent;
	spoke.bytes_recv = body.bytes_received;
	spoke.status = if needs_reprovision { spoke.status } else { NodeStatus::Online };
	let response = MeshHeartbeatResponseBody {
		ok: true,
		config_version: hub.config_version,
		needs_reprovision,
		tls_auth_enabled: hub.tls_auth_enabled,
	};
	state.stores.update_spoke(spoke).await;
	if needs_reprovision {
		warn!("mesh spoke reported stale configVersion, flagging reprovision");
	}
	Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyTokenBody {
	token: String,
	user_id: Id,
	gateway_id: Id,
}

/// `auth-user-pass-verify` backing call (§4.6): checks the ephemeral auth
/// token against the stored API key without touching certificates — the
/// cert side of the double-check happens at the OpenVPN TLS layer itself.
async fn hooks_verify_token(State(state): State<AppState>, Json(body): Json<VerifyTokenBody>) -> Result<(), ApiError> {
	let hash = gateway::hash_token(&body.token).map_err(|_| gatekey_core::hooks::Error::InvalidToken)?;
	let key = state
		.stores
		.get_api_key_by_hash(&hash)
		.await
		.ok_or(gatekey_core::hooks::Error::InvalidToken)?;

	hooks::verify_auth_token(
		key.revoked,
		key.owner,
		body.user_id,
		body.gateway_id,
		parse_gateway_scope(&key.scopes).unwrap_or(body.gateway_id),
	)?;
	Ok(())
}

fn parse_gateway_scope(scopes: &std::collections::HashSet<String>) -> Option<Id> {
	scopes.iter().find_map(|s| s.strip_prefix("gateway:").and_then(|id| id.parse().ok()))
}

/// A bare port number with no range is a single-port rule; a spec with
/// neither `port` nor `from_port`/`to_port` set carries no port restriction
/// and is dropped (the network-level accept in `apply_rules` already
/// covers it).
fn port_spec_to_rule(spec: &PortSpec) -> Option<firewall::PortRule> {
	let (from, to) = match (spec.port, spec.from_port, spec.to_port) {
		(Some(p), _, _) => (p, p),
		(None, Some(from), Some(to)) => (from, to),
		_ => return None,
	};
	Some(firewall::PortRule {
		protocol: spec.protocol.unwrap_or(gatekey_core::model::Protocol::Both),
		from_port: from,
		to_port: to,
	})
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientConnectBody {
	user_id: Id,
	gateway_id: Id,
	certificate_serial: String,
	client_ip: IpAddr,
	vpn_address: IpAddr,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientConnectResponseBody {
	directives: Vec<String>,
}

async fn hooks_client_connect(
	State(state): State<AppState>,
	Json(body): Json<ClientConnectBody>,
) -> Result<Json<ClientConnectResponseBody>, ApiError> {
	let gw = state
		.stores
		.get(body.gateway_id)
		.await
		.ok_or_else(|| Error::NotFound(format!("gateway {}", body.gateway_id)))?;
	let user = state
		.stores
		.get_user(body.user_id)
		.await
		.ok_or_else(|| Error::NotFound(format!("user {}", body.user_id)))?;

	let allowed = state.policy.allowed_networks(user.id, &user.email, &user.groups, Some(gw.id));
	let directives = hooks::client_connect_directives(&allowed, &gw.dns_servers, gw.push_dns, gw.full_tunnel_mode);

	let existing = state.stores.open_for_certificate(&body.certificate_serial).await;
	if let Some(conn) = hooks::open_connection_if_absent(
		existing.as_ref(),
		body.user_id,
		body.certificate_serial.clone(),
		GatewayRef::Gateway(gw.id),
		body.client_ip,
		body.vpn_address,
	) {
		let ports = state.policy.allowed_ports(user.id, &user.email, &user.groups, Some(gw.id));
		let port_rules: Vec<firewall::PortRule> = ports.iter().filter_map(port_spec_to_rule).collect();
		state.firewall.apply_rules(conn.id, body.client_ip, &allowed, &port_rules)?;
		state.stores.open(conn).await;
	}

	state
		.stores
		.record(gatekey_core::store::audit_entry(
			"client_connect",
			Some(body.user_id),
			Some(user.email.clone()),
			"gateway",
			gw.id,
			serde_json::json!({"certificateSerial": body.certificate_serial}),
			true,
		))
		.await;

	Ok(Json(ClientConnectResponseBody { directives }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientDisconnectBody {
	certificate_serial: String,
	reason: Option<String>,
}

async fn hooks_client_disconnect(State(state): State<AppState>, Json(body): Json<ClientDisconnectBody>) -> Result<(), ApiError> {
	let Some(conn) = state.stores.open_for_certificate(&body.certificate_serial).await else {
		// Idempotent: a second disconnect for an already-closed connection is a no-op (§4.6).
		return Ok(());
	};
	state.stores.close(conn.id, body.reason.clone()).await;
	state.firewall.forget(conn.id)?;
	state
		.stores
		.record(gatekey_core::store::audit_entry(
			"client_disconnect",
			Some(conn.user_id),
			None,
			"connection",
			conn.id,
			serde_json::json!({"reason": body.reason}),
			true,
		))
		.await;
	Ok(())
}

/// Uniform HTTP error mapping driven by [`gatekey_core::Error::category`].
struct ApiError(Error);

impl<E: Into<Error>> From<E> for ApiError {
	fn from(e: E) -> Self {
		ApiError(e.into())
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		use gatekey_core::Category;
		let status = match self.0.category() {
			Category::Authentication => StatusCode::UNAUTHORIZED,
			Category::Authorization => StatusCode::FORBIDDEN,
			Category::Validation => StatusCode::BAD_REQUEST,
			Category::NotFound => StatusCode::NOT_FOUND,
			Category::Conflict => StatusCode::CONFLICT,
			Category::ConfigGeneration => StatusCode::INTERNAL_SERVER_ERROR,
			Category::Network => StatusCode::SERVICE_UNAVAILABLE,
			Category::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
		};
		(status, self.0.to_string()).into_response()
	}
}

#[cfg(test)]
mod tests {
	use axum::body::Body;
	use axum::http::{Request, StatusCode};
	use gatekey_core::model::{Ca, CaStatus, CryptoProfile, Gateway, NodeStatus, VpnProtocol};
	use http_body_util::BodyExt;
	use tower::ServiceExt;

	use super::*;
	use crate::state::AppState;

	async fn bootstrapped_state() -> AppState {
		let state = AppState::new(gatekey_core::config::Config::default());
		let material = pki::bootstrap_ca(
			state.config.ca_key_algorithm,
			&state.config.ca_organization,
			state.config.ca_validity,
		)
		.unwrap();
		let ca = Ca {
			id: "default".into(),
			cert_pem: material.cert_pem,
			key_pem: material.key_pem,
			serial: material.serial,
			not_before: material.not_before,
			not_after: material.not_after,
			status: CaStatus::Active,
			fingerprint: material.fingerprint,
		};
		state.stores.store_if_absent(ca).await;
		state
	}

	fn sample_gateway(token_hash: [u8; 32]) -> Gateway {
		Gateway {
			id: Id::new_v4(),
			name: "gw-1".into(),
			endpoint: "gw-1.example.com".into(),
			vpn_port: 1194,
			vpn_protocol: VpnProtocol::Udp,
			crypto_profile: CryptoProfile::Modern,
			vpn_subnet: "10.8.0.0/24".parse().unwrap(),
			tls_auth_enabled: true,
			tls_auth_key: Some("tls-auth-key".into()),
			config_version: "v1".into(),
			is_active: true,
			last_heartbeat: None,
			status: NodeStatus::Pending,
			full_tunnel_mode: false,
			push_dns: false,
			dns_servers: vec![],
			token_hash,
		}
	}

	#[tokio::test]
	async fn health_returns_ok() {
		let state = bootstrapped_state().await;
		let app = router(state);
		let resp = app
			.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn provision_gateway_rejects_unknown_token() {
		let state = bootstrapped_state().await;
		let app = router(state);
		let body = serde_json::json!({ "token": "deadbeef" }).to_string();
		let resp = app
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/api/v1/gateway/provision")
					.header("content-type", "application/json")
					.body(Body::from(body))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	}

	#[tokio::test]
	async fn provision_gateway_issues_certificate_for_known_token() {
		let state = bootstrapped_state().await;
		let (token, hash) = gateway::generate_token();
		state.stores.insert(sample_gateway(hash)).await.unwrap();
		let app = router(state);

		let body = serde_json::json!({ "token": token }).to_string();
		let resp = app
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/api/v1/gateway/provision")
					.header("content-type", "application/json")
					.body(Body::from(body))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);

		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert!(parsed["serverCert"].as_str().unwrap().contains("BEGIN CERTIFICATE"));
		assert_eq!(parsed["vpnPort"], 1194);
	}

	#[tokio::test]
	async fn create_mesh_hub_then_spoke_issues_certs_and_allocates_tunnel_ip() {
		let state = bootstrapped_state().await;
		let app = router(state);

		let hub_body = serde_json::json!({
			"name": "hub-1",
			"publicEndpoint": "hub-1.example.com",
			"vpnPort": 1194,
			"vpnProtocol": "udp",
			"vpnSubnet": "10.9.0.0/24",
			"cryptoProfile": "modern",
			"tlsAuthEnabled": true,
			"controlPlaneUrl": "https://cp.example.com",
		})
		.to_string();
		let resp = app
			.clone()
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/api/v1/mesh-hub")
					.header("content-type", "application/json")
					.body(Body::from(hub_body))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		let hub: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		let hub_id = hub["id"].as_str().unwrap().to_string();
		assert!(hub["apiToken"].as_str().unwrap().len() > 0);

		let spoke_body = serde_json::json!({
			"hubId": hub_id,
			"name": "spoke-1",
		})
		.to_string();
		let resp = app
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/api/v1/mesh-spoke")
					.header("content-type", "application/json")
					.body(Body::from(spoke_body))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		let spoke: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(spoke["tunnelIp"], "10.9.0.2");
		assert!(spoke["token"].as_str().unwrap().len() > 0);
	}

	#[tokio::test]
	async fn create_mesh_spoke_rejects_unknown_hub() {
		let state = bootstrapped_state().await;
		let app = router(state);
		let body = serde_json::json!({ "hubId": Id::new_v4(), "name": "spoke-1" }).to_string();
		let resp = app
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/api/v1/mesh-spoke")
					.header("content-type", "application/json")
					.body(Body::from(body))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn crl_endpoint_serves_pem_before_any_revocation() {
		let state = bootstrapped_state().await;
		let app = router(state);
		let resp = app
			.oneshot(Request::builder().uri("/api/v1/ca/crl").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		assert!(String::from_utf8_lossy(&bytes).contains("BEGIN X509 CRL"));
	}
}
