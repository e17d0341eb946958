//! Remote session multiplexer (spec §4.5).
//!
//! The control plane brokers two kinds of WebSocket peers — agents (hubs,
//! gateways, spokes) dialing out from behind NAT, and admins dialing in to
//! reach them. `SessionManager` mirrors the shape of `mcp::session::SessionManager`:
//! a single `RwLock<HashMap<...>>` registry plus a bounded `mpsc` channel per
//! peer for outbound frames.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::model::Id;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("unknown agent: {0}")]
	UnknownAgent(Id),

	#[error("agent send queue is full, message dropped")]
	QueueFull,

	#[error("command timed out")]
	Timeout,

	#[error("authentication failed")]
	AuthFailed,
}

type Result<T> = std::result::Result<T, Error>;

pub const SEND_QUEUE_DEPTH: usize = 256;
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const MAX_OUTPUT_LINE: usize = 64 * 1024;
pub const MAX_OUTPUT_BUFFER: usize = 1024 * 1024;
pub const RECONNECT_MIN: Duration = Duration::from_secs(5);
pub const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// §5 keepalive: server pings every 30s, closes after three consecutive
/// misses, and allows 10s for any single frame write to land.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_MISSED_PONGS: u32 = 3;
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// §5 read-size ceilings: agents carry command output so get a larger
/// allowance than admin control frames.
pub const AGENT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const ADMIN_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
	Hub,
	Gateway,
	Spoke,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
	Auth {
		id: Option<Uuid>,
		token: String,
		#[serde(rename = "nodeType")]
		node_type: NodeKind,
		#[serde(rename = "nodeId")]
		node_id: Id,
		#[serde(rename = "nodeName")]
		node_name: String,
	},
	AuthResponse {
		id: Option<Uuid>,
		success: bool,
		message: Option<String>,
		#[serde(rename = "agentId")]
		agent_id: Option<Uuid>,
	},
	Ping {
		id: Option<Uuid>,
	},
	Pong {
		id: Option<Uuid>,
	},
	AgentList {
		id: Option<Uuid>,
		agents: Vec<AgentSummary>,
	},
	ConnectAgent {
		id: Option<Uuid>,
		#[serde(rename = "agentId")]
		agent_id: Uuid,
	},
	AgentConnected {
		id: Option<Uuid>,
		#[serde(rename = "agentId")]
		agent_id: Uuid,
	},
	Command {
		id: Option<Uuid>,
		command: String,
	},
	Output {
		id: Option<Uuid>,
		output: String,
		#[serde(rename = "isStderr")]
		is_stderr: bool,
		#[serde(rename = "exitCode")]
		exit_code: Option<i32>,
		done: bool,
	},
	Disconnect {
		id: Option<Uuid>,
	},
	Error {
		id: Option<Uuid>,
		message: String,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
	pub agent_id: Uuid,
	pub node_type: NodeKind,
	pub node_id: Id,
	pub node_name: String,
	pub connected: bool,
}

struct AgentHandle {
	node_type: NodeKind,
	node_id: Id,
	node_name: String,
	sender: mpsc::Sender<Envelope>,
	connected_admins: HashMap<Uuid, mpsc::Sender<Envelope>>,
}

/// Server-side registry: `agents: nodeId → agent` and
/// `pendingCommands: messageId → outputChannel` (§4.5 Server side).
pub struct SessionManager {
	agents: RwLock<HashMap<Uuid, AgentHandle>>,
	by_node: RwLock<HashMap<Id, Uuid>>,
	pending: RwLock<HashMap<Uuid, mpsc::Sender<Envelope>>>,
}

impl Default for SessionManager {
	fn default() -> Self {
		Self::new()
	}
}

impl SessionManager {
	pub fn new() -> Self {
		SessionManager {
			agents: RwLock::new(HashMap::new()),
			by_node: RwLock::new(HashMap::new()),
			pending: RwLock::new(HashMap::new()),
		}
	}

	/// Registers a freshly authenticated agent, closing any prior connection
	/// for the same `node_id` first (§4.5: "if the same nodeId reconnects,
	/// close the previous agent's connection first").
	pub async fn register_agent(
		&self,
		node_type: NodeKind,
		node_id: Id,
		node_name: String,
		sender: mpsc::Sender<Envelope>,
	) -> Uuid {
		let agent_id = Uuid::new_v4();
		let mut by_node = self.by_node.write().await;
		let mut agents = self.agents.write().await;
		if let Some(prev) = by_node.get(&node_id).copied() {
			if let Some(prev_handle) = agents.remove(&prev) {
				let _ = prev_handle.sender.try_send(Envelope::Disconnect { id: None });
			}
		}
		agents.insert(
			agent_id,
			AgentHandle {
				node_type,
				node_id,
				node_name,
				sender,
				connected_admins: HashMap::new(),
			},
		);
		by_node.insert(node_id, agent_id);
		agent_id
	}

	pub async fn unregister_agent(&self, agent_id: Uuid) {
		let mut agents = self.agents.write().await;
		if let Some(handle) = agents.remove(&agent_id) {
			let mut by_node = self.by_node.write().await;
			if by_node.get(&handle.node_id) == Some(&agent_id) {
				by_node.remove(&handle.node_id);
			}
		}
	}

	pub async fn list_agents(&self) -> Vec<AgentSummary> {
		let agents = self.agents.read().await;
		agents
			.iter()
			.map(|(id, h)| AgentSummary {
				agent_id: *id,
				node_type: h.node_type,
				node_id: h.node_id,
				node_name: h.node_name.clone(),
				connected: true,
			})
			.collect()
	}

	/// Forwards `envelope` to `agent_id`'s bounded send queue; drops with a
	/// warning on overflow rather than blocking the caller (§4.5 concurrency
	/// contract: "bounded... and drops on overflow").
	pub async fn send_to_agent(&self, agent_id: Uuid, envelope: Envelope) -> Result<()> {
		let agents = self.agents.read().await;
		let handle = agents.get(&agent_id).ok_or(Error::UnknownAgent(agent_id))?;
		match handle.sender.try_send(envelope) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => {
				tracing::warn!(%agent_id, "agent send queue full, dropping message");
				Err(Error::QueueFull)
			}
			Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::UnknownAgent(agent_id)),
		}
	}

	pub async fn register_admin(&self, agent_id: Uuid, admin_id: Uuid, sender: mpsc::Sender<Envelope>) -> Result<()> {
		let mut agents = self.agents.write().await;
		let handle = agents.get_mut(&agent_id).ok_or(Error::UnknownAgent(agent_id))?;
		handle.connected_admins.insert(admin_id, sender);
		Ok(())
	}

	pub async fn unregister_admin(&self, agent_id: Uuid, admin_id: Uuid) {
		let mut agents = self.agents.write().await;
		if let Some(handle) = agents.get_mut(&agent_id) {
			handle.connected_admins.remove(&admin_id);
		}
	}

	/// Registers an output channel awaiting a single `done` frame for a
	/// synchronous command (§4.5 `pendingCommands`).
	pub async fn register_pending(&self, message_id: Uuid, out: mpsc::Sender<Envelope>) {
		self.pending.write().await.insert(message_id, out);
	}

	pub async fn take_pending(&self, message_id: Uuid) -> Option<mpsc::Sender<Envelope>> {
		self.pending.write().await.remove(message_id)
	}

	/// Routes an inbound `output` frame from `agent_id`: deliver to a known
	/// pending id (single consumer), otherwise forward to every admin session
	/// attached to that agent (§4.5: "forward to all admin sessions whose
	/// `connectedTo == agentId`").
	pub async fn route_output(&self, agent_id: Uuid, envelope: Envelope) {
		if let Envelope::Output { id: Some(msg_id), .. } = &envelope {
			if let Some(sender) = self.take_pending(*msg_id).await {
				let _ = sender.send(envelope).await;
				return;
			}
		}
		let agents = self.agents.read().await;
		if let Some(handle) = agents.get(&agent_id) {
			for admin_sender in handle.connected_admins.values() {
				let _ = admin_sender.try_send(envelope.clone());
			}
		}
	}
}

/// `ExecuteCommandSync(nodeId, command, timeout)` (§4.5 command-sync helper):
/// dispatches a command to the agent owning `node_id` and collects `output`
/// frames until `done` or timeout.
pub async fn execute_command_sync(
	manager: &Arc<SessionManager>,
	node_id: Id,
	command: String,
	timeout: Duration,
) -> Result<(String, Option<i32>)> {
	let agent_id = {
		let by_node = manager.by_node.read().await;
		*by_node.get(&node_id).ok_or(Error::UnknownAgent(Uuid::nil()))?
	};

	let message_id = Uuid::new_v4();
	let (tx, mut rx) = mpsc::channel(SEND_QUEUE_DEPTH);
	manager.register_pending(message_id, tx).await;

	manager
		.send_to_agent(
			agent_id,
			Envelope::Command {
				id: Some(message_id),
				command,
			},
		)
		.await?;

	let mut collected = String::new();
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
		if remaining.is_zero() {
			manager.take_pending(message_id).await;
			return Err(Error::Timeout);
		}
		match tokio::time::timeout(remaining, rx.recv()).await {
			Ok(Some(Envelope::Output { output, done, exit_code, .. })) => {
				collected.push_str(&output);
				if done {
					return Ok((collected, exit_code));
				}
			}
			Ok(Some(_)) | Ok(None) => return Ok((collected, None)),
			Err(_) => {
				manager.take_pending(message_id).await;
				return Err(Error::Timeout);
			}
		}
	}
}

/// Exponential backoff schedule used by agents reconnecting to the control
/// plane (§4.5: "5s→60s on any disconnect").
pub fn next_backoff(current: Duration) -> Duration {
	let doubled = current.checked_mul(2).unwrap_or(RECONNECT_MAX);
	doubled.min(RECONNECT_MAX).max(RECONNECT_MIN)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn register_then_reconnect_closes_previous_handle() {
		let manager = SessionManager::new();
		let node_id = Id::new_v4();
		let (tx1, mut rx1) = mpsc::channel(4);
		let first = manager.register_agent(NodeKind::Gateway, node_id, "gw".into(), tx1).await;

		let (tx2, _rx2) = mpsc::channel(4);
		let second = manager.register_agent(NodeKind::Gateway, node_id, "gw".into(), tx2).await;
		assert_ne!(first, second);

		let msg = rx1.recv().await.unwrap();
		assert!(matches!(msg, Envelope::Disconnect { .. }));
	}

	#[tokio::test]
	async fn list_agents_reflects_registrations() {
		let manager = SessionManager::new();
		let (tx, _rx) = mpsc::channel(4);
		manager.register_agent(NodeKind::Hub, Id::new_v4(), "hub-1".into(), tx).await;
		assert_eq!(manager.list_agents().await.len(), 1);
	}

	#[tokio::test]
	async fn send_to_unknown_agent_errors() {
		let manager = SessionManager::new();
		let err = manager
			.send_to_agent(Uuid::new_v4(), Envelope::Ping { id: None })
			.await
			.unwrap_err();
		assert!(matches!(err, Error::UnknownAgent(_)));
	}

	#[tokio::test]
	async fn route_output_delivers_to_pending_by_id() {
		let manager = SessionManager::new();
		let (tx, _rx) = mpsc::channel(4);
		let agent_id = manager.register_agent(NodeKind::Gateway, Id::new_v4(), "gw".into(), tx).await;

		let message_id = Uuid::new_v4();
		let (pending_tx, mut pending_rx) = mpsc::channel(4);
		manager.register_pending(message_id, pending_tx).await;

		manager
			.route_output(
				agent_id,
				Envelope::Output {
					id: Some(message_id),
					output: "hi\n".into(),
					is_stderr: false,
					exit_code: Some(0),
					done: true,
				},
			)
			.await;

		let delivered = pending_rx.recv().await.unwrap();
		assert!(matches!(delivered, Envelope::Output { done: true, .. }));
	}

	#[tokio::test]
	async fn route_output_without_pending_id_broadcasts_to_attached_admins() {
		let manager = SessionManager::new();
		let (tx, _rx) = mpsc::channel(4);
		let agent_id = manager.register_agent(NodeKind::Gateway, Id::new_v4(), "gw".into(), tx).await;

		let (admin_tx, mut admin_rx) = mpsc::channel(4);
		manager.register_admin(agent_id, Uuid::new_v4(), admin_tx).await.unwrap();

		manager
			.route_output(
				agent_id,
				Envelope::Output {
					id: None,
					output: "unsolicited\n".into(),
					is_stderr: false,
					exit_code: None,
					done: false,
				},
			)
			.await;

		let delivered = admin_rx.recv().await.unwrap();
		assert!(matches!(delivered, Envelope::Output { .. }));
	}

	#[test]
	fn backoff_doubles_up_to_ceiling() {
		let mut backoff = RECONNECT_MIN;
		for _ in 0..10 {
			backoff = next_backoff(backoff);
		}
		assert_eq!(backoff, RECONNECT_MAX);
	}
}
