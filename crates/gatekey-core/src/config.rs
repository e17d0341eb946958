//! Process-wide configuration (spec §10.4). Deserializable with `serde` so
//! `gatekey-app` can load it from TOML/YAML and override fields from the
//! CLI; every field here has a spec-stated or reasonable default so a
//! bare `Config::default()` is a usable dev configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::KeyAlgorithm;
use crate::policy::EvaluationMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// CA key algorithm used by `BootstrapCA` (§4.1).
	pub ca_key_algorithm: KeyAlgorithm,
	/// Organization name embedded in issued certificates.
	pub ca_organization: String,
	/// CA validity period at bootstrap.
	#[serde(with = "humantime_serde")]
	pub ca_validity: Duration,
	/// Default client certificate lifetime (§4.1 `validFor`).
	#[serde(with = "humantime_serde")]
	pub client_cert_validity: Duration,
	/// `nextUpdate - thisUpdate` for freshly generated CRLs (§4.1 `GenerateCRL`).
	#[serde(with = "humantime_serde")]
	pub crl_validity: Duration,
	/// Policy engine default-deny/allow mode (§4.2).
	pub policy_mode: EvaluationMode,
	/// Interval agents are expected to heartbeat at (§4.3).
	#[serde(with = "humantime_serde")]
	pub heartbeat_interval: Duration,
	/// HTTP listen address for the provisioning/heartbeat/admin-session surface.
	pub http_addr: SocketAddr,
	/// `/health` and metrics listen address, kept separate from the main
	/// provisioning/WebSocket surface.
	pub admin_addr: SocketAddr,
	/// Override for the reported remote IP on agents (`PUBLIC_IP` env var, §6).
	pub public_ip_override: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			ca_key_algorithm: KeyAlgorithm::Ecdsa256,
			ca_organization: "GateKey".to_string(),
			ca_validity: Duration::from_secs(5 * 365 * 24 * 3600),
			client_cert_validity: Duration::from_secs(12 * 3600),
			crl_validity: Duration::from_secs(24 * 3600),
			policy_mode: EvaluationMode::Strict,
			heartbeat_interval: Duration::from_secs(30),
			http_addr: "0.0.0.0:8443".parse().unwrap(),
			admin_addr: "127.0.0.1:9090".parse().unwrap(),
			public_ip_override: std::env::var("PUBLIC_IP").ok(),
		}
	}
}

impl Config {
	/// Three consecutive missed heartbeats transition a node to `offline` (§4.3, §7).
	pub fn offline_after(&self) -> Duration {
		self.heartbeat_interval * 3
	}
}

mod humantime_serde {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&humantime::format_duration(*d).to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let s = String::deserialize(d)?;
		humantime::parse_duration(&s).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_strict_and_modern() {
		let cfg = Config::default();
		assert_eq!(cfg.policy_mode, EvaluationMode::Strict);
		assert_eq!(cfg.offline_after(), cfg.heartbeat_interval * 3);
	}

	#[test]
	fn roundtrips_through_yaml() {
		let cfg = Config::default();
		let yaml = serde_yaml::to_string(&cfg).unwrap();
		let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
		assert_eq!(parsed.heartbeat_interval, cfg.heartbeat_interval);
	}
}
