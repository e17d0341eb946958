//! Policy evaluation engine (spec §4.2).
//!
//! The live rule set is held behind an [`arc_swap::ArcSwap`] so evaluation
//! never blocks on a refresh and a refresh never blocks a concurrent
//! evaluator — the same atomic-snapshot-swap shape `agentgateway` uses for
//! its hot-path config (`core::arc::Atomic`).

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::model::{Id, Protocol};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("malformed policy document: {0}")]
	Malformed(String),

	#[error("store unavailable: {0}")]
	StoreUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
	#[default]
	Strict,
	Permissive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
	Allow,
	Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
	Everyone { everyone: bool },
	Principals {
		#[serde(default)]
		users: Vec<String>,
		#[serde(default)]
		groups: Vec<String>,
	},
}

impl Subject {
	/// `user_id` participates as a case-sensitive id match; `email` and
	/// `groups` are matched case-insensitively (§4.2).
	pub fn matches(&self, user_id: &str, email: &str, groups: &HashSet<String>) -> bool {
		match self {
			Subject::Everyone { everyone } => *everyone,
			Subject::Principals { users, groups: want_groups } => {
				let email_lower = email.to_lowercase();
				let id_or_email_match = users.iter().any(|u| u == user_id || u.to_lowercase() == email_lower);
				let group_match = want_groups
					.iter()
					.any(|wg| groups.iter().any(|g| g.eq_ignore_ascii_case(wg)));
				id_or_email_match || group_match
			}
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PortSpec {
	pub port: Option<u16>,
	pub from_port: Option<u16>,
	pub to_port: Option<u16>,
	#[serde(default)]
	pub protocol: Option<Protocol>,
}

impl PortSpec {
	fn matches(&self, port: u16, protocol: Protocol) -> bool {
		let port_ok = if let Some(p) = self.port {
			p == port
		} else if let (Some(from), Some(to)) = (self.from_port, self.to_port) {
			(from..=to).contains(&port)
		} else {
			true
		};
		let proto_ok = match self.protocol {
			None => true,
			Some(Protocol::Both) => true,
			Some(want) => want == protocol || protocol == Protocol::Both,
		};
		port_ok && proto_ok
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Resource {
	#[serde(default)]
	pub gateways: Vec<Id>,
	#[serde(default)]
	pub networks: Vec<IpNet>,
	#[serde(default)]
	pub ports: Vec<PortSpec>,
	#[serde(default)]
	pub services: Vec<String>,
}

impl Resource {
	fn gateway_matches(&self, gateway: Option<Id>) -> bool {
		self.gateways.is_empty() || gateway.is_some_and(|g| self.gateways.contains(&g))
	}

	fn network_matches(&self, target: IpAddr) -> bool {
		self.networks.is_empty() || self.networks.iter().any(|n| n.contains(&target))
	}

	fn port_matches(&self, port: Option<u16>, protocol: Protocol) -> bool {
		match port {
			None => true,
			Some(p) => self.ports.is_empty() || self.ports.iter().any(|spec| spec.matches(p, protocol)),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
	/// Three-letter, case-insensitive day prefixes, e.g. `"mon"`.
	pub days: Vec<String>,
	pub start_time: String,
	pub end_time: String,
	#[serde(default = "default_tz")]
	pub timezone: String,
}

fn default_tz() -> String {
	"UTC".to_string()
}

impl TimeWindow {
	fn matches(&self, at: DateTime<Utc>) -> bool {
		let tz: Tz = self.timezone.parse().unwrap_or(chrono_tz::UTC);
		let local = at.with_timezone(&tz);
		let day = local.format("%a").to_string().to_lowercase();
		let day_ok = self
			.days
			.iter()
			.any(|d| day.starts_with(&d.to_lowercase()[..d.len().min(3)]));
		if !day_ok {
			return false;
		}
		let hhmm = local.format("%H:%M").to_string();
		self.start_time <= hhmm && hhmm <= self.end_time
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Conditions {
	#[serde(default)]
	pub time_windows: Vec<TimeWindow>,
	#[serde(default)]
	pub source_ips: Vec<IpNet>,
}

impl Conditions {
	fn matches(&self, source_ip: Option<IpAddr>, at: DateTime<Utc>) -> bool {
		let time_ok = self.time_windows.is_empty() || self.time_windows.iter().any(|w| w.matches(at));
		let ip_ok = self.source_ips.is_empty()
			|| source_ip.is_some_and(|ip| self.source_ips.iter().any(|n| n.contains(&ip)));
		time_ok && ip_ok
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
	pub id: Id,
	pub action: Action,
	pub subject: Subject,
	pub resource: Resource,
	#[serde(default)]
	pub conditions: Conditions,
	pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
	pub id: Id,
	pub name: String,
	pub priority: i32,
	pub is_enabled: bool,
	pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone)]
pub struct EvalRequest {
	pub user_id: Id,
	pub user_email: String,
	pub user_groups: HashSet<String>,
	pub gateway: Option<Id>,
	pub network: Option<IpAddr>,
	pub port: Option<u16>,
	pub protocol: Protocol,
	pub source_ip: Option<IpAddr>,
	pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
	pub allowed: bool,
	pub matched_policy: Option<Id>,
	pub matched_rule: Option<Id>,
	pub reason: String,
	pub applied_rules: Vec<Id>,
}

/// Source of truth for the current policy set; `refresh` swaps in a new
/// snapshot atomically while `evaluate` always reads a consistent one.
pub struct PolicyEngine {
	snapshot: ArcSwap<Vec<Policy>>,
	mode: EvaluationMode,
}

impl PolicyEngine {
	pub fn new(mode: EvaluationMode) -> Self {
		PolicyEngine {
			snapshot: ArcSwap::from_pointee(Vec::new()),
			mode,
		}
	}

	/// Stable-sorts by policy priority then rule priority, both ascending
	/// (lower wins), and drops disabled policies (§4.2 `Refresh`).
	pub fn refresh(&self, mut policies: Vec<Policy>) {
		policies.retain(|p| p.is_enabled);
		policies.sort_by_key(|p| p.priority);
		for p in &mut policies {
			p.rules.sort_by_key(|r| r.priority);
		}
		self.snapshot.store(Arc::new(policies));
	}

	pub fn evaluate(&self, req: &EvalRequest) -> EvalResult {
		let policies = self.snapshot.load();
		let user_id_str = req.user_id.to_string();
		let mut applied = Vec::new();

		for policy in policies.iter() {
			for rule in &policy.rules {
				applied.push(rule.id);
				let subject_ok = rule.subject.matches(&user_id_str, &req.user_email, &req.user_groups);
				if !subject_ok {
					continue;
				}
				let gateway_ok = rule.resource.gateway_matches(req.gateway);
				let network_ok = req.network.is_none_or(|n| rule.resource.network_matches(n));
				let port_ok = rule.resource.port_matches(req.port, req.protocol);
				let conditions_ok = rule.conditions.matches(req.source_ip, req.at);
				if gateway_ok && network_ok && port_ok && conditions_ok {
					return EvalResult {
						allowed: rule.action == Action::Allow,
						matched_policy: Some(policy.id),
						matched_rule: Some(rule.id),
						reason: format!("matched rule {} in policy {}", rule.id, policy.name),
						applied_rules: applied,
					};
				}
			}
		}

		let allowed = matches!(self.mode, EvaluationMode::Permissive);
		if !allowed {
			tracing::debug!(user = %req.user_id, gateway = ?req.gateway, mode = ?self.mode, "policy evaluation denied, no rule matched");
		}
		EvalResult {
			allowed,
			matched_policy: None,
			matched_rule: None,
			reason: format!("no rule matched, default mode is {:?}", self.mode),
			applied_rules: applied,
		}
	}

	/// Projection of every network reachable by `user` on `gateway` through
	/// an `allow` rule (§4.2 `GetAllowedNetworks`). Duplicates are preserved;
	/// ordering matches policy/rule order.
	pub fn allowed_networks(&self, user_id: Id, email: &str, groups: &HashSet<String>, gateway: Option<Id>) -> Vec<IpNet> {
		let policies = self.snapshot.load();
		let user_id_str = user_id.to_string();
		let mut out = Vec::new();
		for policy in policies.iter() {
			for rule in &policy.rules {
				if rule.action != Action::Allow {
					continue;
				}
				if !rule.subject.matches(&user_id_str, email, groups) {
					continue;
				}
				if !rule.resource.gateway_matches(gateway) {
					continue;
				}
				out.extend(rule.resource.networks.iter().copied());
			}
		}
		out
	}

	/// Projection of every port restriction attached to an `allow` rule
	/// reachable by `user` on `gateway`; empty means "no port restriction"
	/// (the firewall backend installs a blanket accept for the network).
	pub fn allowed_ports(&self, user_id: Id, email: &str, groups: &HashSet<String>, gateway: Option<Id>) -> Vec<PortSpec> {
		let policies = self.snapshot.load();
		let user_id_str = user_id.to_string();
		let mut out = Vec::new();
		for policy in policies.iter() {
			for rule in &policy.rules {
				if rule.action != Action::Allow {
					continue;
				}
				if !rule.subject.matches(&user_id_str, email, groups) {
					continue;
				}
				if !rule.resource.gateway_matches(gateway) {
					continue;
				}
				out.extend(rule.resource.ports.iter().cloned());
			}
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn everyone_allow(network: &str) -> Policy {
		Policy {
			id: Id::new_v4(),
			name: "default".into(),
			priority: 10,
			is_enabled: true,
			rules: vec![PolicyRule {
				id: Id::new_v4(),
				action: Action::Allow,
				subject: Subject::Everyone { everyone: true },
				resource: Resource {
					gateways: vec![],
					networks: vec![network.parse().unwrap()],
					ports: vec![],
					services: vec![],
				},
				conditions: Conditions::default(),
				priority: 0,
			}],
		}
	}

	fn req(network: IpAddr) -> EvalRequest {
		EvalRequest {
			user_id: Id::new_v4(),
			user_email: "a@example.com".into(),
			user_groups: HashSet::new(),
			gateway: None,
			network: Some(network),
			port: Some(443),
			protocol: Protocol::Tcp,
			source_ip: None,
			at: Utc::now(),
		}
	}

	#[test]
	fn strict_mode_denies_with_no_policies() {
		let engine = PolicyEngine::new(EvaluationMode::Strict);
		let result = engine.evaluate(&req("10.0.0.5".parse().unwrap()));
		assert!(!result.allowed);
	}

	#[test]
	fn permissive_mode_allows_with_no_policies() {
		let engine = PolicyEngine::new(EvaluationMode::Permissive);
		let result = engine.evaluate(&req("10.0.0.5".parse().unwrap()));
		assert!(result.allowed);
	}

	#[test]
	fn matching_allow_rule_short_circuits() {
		let engine = PolicyEngine::new(EvaluationMode::Strict);
		engine.refresh(vec![everyone_allow("10.0.0.0/24")]);
		let result = engine.evaluate(&req("10.0.0.5".parse().unwrap()));
		assert!(result.allowed);
		assert!(result.matched_rule.is_some());
	}

	#[test]
	fn non_matching_network_falls_through_to_default() {
		let engine = PolicyEngine::new(EvaluationMode::Strict);
		engine.refresh(vec![everyone_allow("10.0.0.0/24")]);
		let result = engine.evaluate(&req("192.168.1.1".parse().unwrap()));
		assert!(!result.allowed);
	}

	#[test]
	fn disabled_policy_is_dropped_on_refresh() {
		let engine = PolicyEngine::new(EvaluationMode::Strict);
		let mut policy = everyone_allow("10.0.0.0/24");
		policy.is_enabled = false;
		engine.refresh(vec![policy]);
		let result = engine.evaluate(&req("10.0.0.5".parse().unwrap()));
		assert!(!result.allowed);
	}
}
