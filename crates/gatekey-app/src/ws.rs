//! `/ws/agent` and `/ws/admin` endpoints for the remote session multiplexer
//! (spec §4.5). Agents (hubs, gateways, spokes) dial in and authenticate with
//! an `auth` envelope; admins dial in to list and attach to connected agents.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use gatekey_core::session::{
	AgentSummary, Envelope, NodeKind, ADMIN_MAX_MESSAGE_BYTES, AGENT_MAX_MESSAGE_BYTES, AUTH_TIMEOUT, MAX_MISSED_PONGS,
	PING_INTERVAL, WRITE_TIMEOUT,
};
use gatekey_core::store::{GatewayStore, MeshStore};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::AppState;

pub async fn agent_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
	ws.max_message_size(AGENT_MAX_MESSAGE_BYTES)
		.max_frame_size(AGENT_MAX_MESSAGE_BYTES)
		.on_upgrade(move |socket| handle_agent(socket, state))
}

pub async fn admin_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
	ws.max_message_size(ADMIN_MAX_MESSAGE_BYTES)
		.max_frame_size(ADMIN_MAX_MESSAGE_BYTES)
		.on_upgrade(move |socket| handle_admin(socket, state))
}

async fn handle_agent(mut socket: WebSocket, state: AppState) {
	let auth = match tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await {
		Ok(Some(Ok(Message::Text(raw)))) => serde_json::from_str::<Envelope>(&raw).ok(),
		_ => None,
	};
	let Some(Envelope::Auth {
		id,
		token,
		node_type,
		node_id,
		node_name,
	}) = auth
	else {
		let _ = send_envelope(&mut socket, &Envelope::Error {
			id: None,
			message: "expected auth envelope within timeout".into(),
		})
		.await;
		return;
	};

	if !authenticate_agent(&state, &token, node_type, node_id).await {
		let _ = send_envelope(&mut socket, &Envelope::AuthResponse {
			id,
			success: false,
			message: Some("invalid token".into()),
			agent_id: None,
		})
		.await;
		return;
	}

	let (tx, mut rx) = mpsc::channel::<Envelope>(gatekey_core::session::SEND_QUEUE_DEPTH);
	let agent_id = state.sessions.register_agent(node_type, node_id, node_name, tx).await;
	tracing::info!(%agent_id, %node_id, ?node_type, "agent authenticated");

	if send_envelope(
		&mut socket,
		&Envelope::AuthResponse {
			id,
			success: true,
			message: None,
			agent_id: Some(agent_id),
		},
	)
	.await
	.is_err()
	{
		state.sessions.unregister_agent(agent_id).await;
		return;
	}

	let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
	ping_ticker.tick().await; // first tick fires immediately, skip it
	let mut missed_pongs: u32 = 0;

	loop {
		tokio::select! {
			_ = ping_ticker.tick() => {
				if missed_pongs >= MAX_MISSED_PONGS {
					tracing::warn!(%agent_id, missed_pongs, "agent missed too many pongs, closing");
					break;
				}
				if send_envelope(&mut socket, &Envelope::Ping { id: None }).await.is_err() {
					break;
				}
				missed_pongs += 1;
			}
			outbound = rx.recv() => {
				match outbound {
					Some(envelope) => {
						if send_envelope(&mut socket, &envelope).await.is_err() {
							break;
						}
					}
					None => break,
				}
			}
			inbound = socket.recv() => {
				match inbound {
					Some(Ok(Message::Text(raw))) => {
						match serde_json::from_str::<Envelope>(&raw) {
							Ok(Envelope::Pong { .. }) => missed_pongs = 0,
							Ok(envelope) => state.sessions.route_output(agent_id, envelope).await,
							Err(_) => {}
						}
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(_)) => break,
				}
			}
		}
	}
	state.sessions.unregister_agent(agent_id).await;
	tracing::info!(%agent_id, "agent disconnected");
}

/// Admins get a one-shot `agent_list` on connect, then forward `connect_agent`
/// and `command` frames to the chosen agent (§4.5 "forward to all admin
/// sessions whose `connectedTo == agentId`" — single-attach variant).
async fn handle_admin(mut socket: WebSocket, state: AppState) {
	let admin_id = Uuid::new_v4();
	let agents: Vec<AgentSummary> = state.sessions.list_agents().await;
	if send_envelope(&mut socket, &Envelope::AgentList { id: None, agents }).await.is_err() {
		return;
	}

	let mut attached: Option<Uuid> = None;
	let (admin_tx, mut admin_rx) = mpsc::channel::<Envelope>(gatekey_core::session::SEND_QUEUE_DEPTH);

	let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
	ping_ticker.tick().await; // first tick fires immediately, skip it
	let mut missed_pongs: u32 = 0;

	loop {
		tokio::select! {
			_ = ping_ticker.tick() => {
				if missed_pongs >= MAX_MISSED_PONGS {
					tracing::warn!(%admin_id, missed_pongs, "admin missed too many pongs, closing");
					break;
				}
				if send_envelope(&mut socket, &Envelope::Ping { id: None }).await.is_err() {
					break;
				}
				missed_pongs += 1;
			}
			outbound = admin_rx.recv() => {
				match outbound {
					Some(envelope) => {
						if send_envelope(&mut socket, &envelope).await.is_err() {
							break;
						}
					}
					None => break,
				}
			}
			inbound = socket.recv() => {
				match inbound {
					Some(Ok(Message::Text(raw))) => {
						let Ok(envelope) = serde_json::from_str::<Envelope>(&raw) else { continue };
						match envelope {
							Envelope::Pong { .. } => missed_pongs = 0,
							Envelope::ConnectAgent { id, agent_id } => {
								if let Some(prev) = attached.take() {
									state.sessions.unregister_admin(prev, admin_id).await;
								}
								if state
									.sessions
									.register_admin(agent_id, admin_id, admin_tx.clone())
									.await
									.is_ok()
								{
									attached = Some(agent_id);
									let _ = send_envelope(&mut socket, &Envelope::AgentConnected { id, agent_id }).await;
								} else {
									let _ = send_envelope(&mut socket, &Envelope::Error { id, message: "unknown agent".into() }).await;
								}
							}
							Envelope::Command { id, command } => {
								let Some(agent_id) = attached else { continue };
								if let Err(err) = state
									.sessions
									.send_to_agent(agent_id, Envelope::Command { id, command })
									.await
								{
									let _ = send_envelope(&mut socket, &Envelope::Error { id, message: err.to_string() }).await;
								}
							}
							_ => {}
						}
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(_)) => break,
				}
			}
		}
	}
	if let Some(agent_id) = attached {
		state.sessions.unregister_admin(agent_id, admin_id).await;
	}
}

/// Writes `envelope` under the §5 10s per-frame deadline; a stalled peer
/// looks the same as a closed one to the caller.
async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), axum::Error> {
	let raw = serde_json::to_string(envelope).unwrap_or_default();
	match tokio::time::timeout(WRITE_TIMEOUT, socket.send(Message::Text(raw.into()))).await {
		Ok(result) => result,
		Err(_) => Err(axum::Error::new(std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded"))),
	}
}

/// Validates an agent's `auth` token against the token store for the node
/// kind it claims to be (§4.5 `auth`: `nodeType ∈ {hub,gateway,spoke}`).
async fn authenticate_agent(state: &AppState, token: &str, node_type: NodeKind, node_id: gatekey_core::model::Id) -> bool {
	let Ok(hash) = gatekey_core::gateway::hash_token(token) else {
		return false;
	};
	match node_type {
		NodeKind::Gateway => match state.stores.get_by_token_hash(hash).await {
			Some(gw) => gw.id == node_id && gw.is_active,
			None => false,
		},
		NodeKind::Hub => match state.stores.get_hub_by_token_hash(hash).await {
			Some(hub) => hub.id == node_id,
			None => false,
		},
		NodeKind::Spoke => match state.stores.get_spoke_by_token_hash(hash).await {
			Some(spoke) => spoke.id == node_id,
			None => false,
		},
	}
}
