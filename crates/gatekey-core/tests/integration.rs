//! End-to-end exercises across module boundaries: a gateway's full
//! provision → heartbeat → reprovision cycle, and a round trip through the
//! remote session multiplexer.

use gatekey_core::gateway::{self, HeartbeatRequest};
use gatekey_core::model::{Ca, CaStatus, CryptoProfile, Gateway, KeyAlgorithm, NodeStatus, VpnProtocol};
use gatekey_core::session::{Envelope, NodeKind, SessionManager};
use gatekey_core::store::{CaStore, GatewayStore, InMemoryStores};
use gatekey_core::{mesh, pki};
use tokio::sync::mpsc;
use uuid::Uuid;

fn provisioned_gateway(token_hash: [u8; 32], ca_fingerprint: &str) -> Gateway {
	let mut gw = Gateway {
		id: gateway::new_gateway_id(),
		name: "edge-1".into(),
		endpoint: "edge-1.example.com".into(),
		vpn_port: 1194,
		vpn_protocol: VpnProtocol::Udp,
		crypto_profile: CryptoProfile::Modern,
		vpn_subnet: "10.8.0.0/24".parse().unwrap(),
		tls_auth_enabled: true,
		tls_auth_key: Some("static-key".into()),
		config_version: String::new(),
		is_active: true,
		last_heartbeat: None,
		status: NodeStatus::Pending,
		full_tunnel_mode: false,
		push_dns: true,
		dns_servers: vec![],
		token_hash,
	};
	gw.recompute_config_version(ca_fingerprint);
	gw
}

#[tokio::test]
async fn gateway_provision_then_heartbeat_then_reprovision_cycle() {
	let stores = InMemoryStores::new();

	let material = pki::bootstrap_ca(KeyAlgorithm::Ecdsa256, "GateKey Test", std::time::Duration::from_secs(3600)).unwrap();
	let ca = Ca {
		id: "default".into(),
		cert_pem: material.cert_pem,
		key_pem: material.key_pem,
		serial: material.serial,
		not_before: material.not_before,
		not_after: material.not_after,
		status: CaStatus::Active,
		fingerprint: material.fingerprint.clone(),
	};
	let ca = stores.store_if_absent(ca).await;

	let (token, hash) = gateway::generate_token();
	let gw = provisioned_gateway(hash, &ca.fingerprint);
	let provisioned_version = gw.config_version.clone();
	stores.insert(gw).await.unwrap();

	// A heartbeat reporting the version we just provisioned needs no reprovision.
	let current = stores.get_by_token_hash(gateway::hash_token(&token).unwrap()).await.unwrap();
	let resp = gateway::apply_heartbeat(
		&current,
		&HeartbeatRequest {
			token: token.clone(),
			status: NodeStatus::Online,
			remote_ip: None,
			bytes_sent: 1024,
			bytes_received: 2048,
			config_version: provisioned_version.clone(),
		},
	)
	.unwrap();
	assert!(!resp.needs_reprovision);

	// The platform CA rotates; recomputing the config version against the
	// new fingerprint must diverge from what the gateway still reports.
	let mut rotated = current.clone();
	rotated.recompute_config_version("rotated-fingerprint");
	stores.update(rotated.clone()).await;

	let resp = gateway::apply_heartbeat(
		&rotated,
		&HeartbeatRequest {
			token,
			status: NodeStatus::Online,
			remote_ip: None,
			bytes_sent: 1024,
			bytes_received: 2048,
			config_version: provisioned_version.clone(),
		},
	)
	.unwrap();
	assert!(resp.needs_reprovision);
	assert_eq!(resp.config_version, rotated.config_version);
	assert_ne!(resp.config_version, provisioned_version);
}

#[tokio::test]
async fn mesh_spoke_gets_lowest_free_tunnel_ip_in_hub_subnet() {
	let subnet = "10.9.0.0/29".parse().unwrap();
	let taken = vec!["10.9.0.1".parse().unwrap()];
	let next = mesh::allocate_tunnel_ip(subnet, &taken).unwrap();
	assert_eq!(next.to_string(), "10.9.0.2");
}

#[tokio::test]
async fn session_round_trip_delivers_synchronous_command_output() {
	let manager = SessionManager::new();
	let (tx, mut rx) = mpsc::channel(8);
	let agent_id = manager
		.register_agent(NodeKind::Gateway, Uuid::new_v4(), "edge-1".into(), tx)
		.await;

	// Simulate the gateway-side loop: read the Command frame, reply with Output.
	manager
		.send_to_agent(
			agent_id,
			Envelope::Command {
				id: Some(Uuid::new_v4()),
				command: "tail -n 20 openvpn.log".into(),
			},
		)
		.await
		.unwrap();
	let Envelope::Command { id: Some(msg_id), .. } = rx.recv().await.unwrap() else {
		panic!("expected command envelope");
	};

	let (admin_tx, mut admin_rx) = mpsc::channel(8);
	manager.register_pending(msg_id, admin_tx.clone()).await;
	manager
		.route_output(
			agent_id,
			Envelope::Output {
				id: Some(msg_id),
				output: "connection established\n".into(),
				is_stderr: false,
				exit_code: Some(0),
				done: true,
			},
		)
		.await;

	let delivered = admin_rx.recv().await.unwrap();
	assert!(matches!(delivered, Envelope::Output { done: true, .. }));
	manager.unregister_agent(agent_id).await;
	assert!(manager.list_agents().await.is_empty());
}
