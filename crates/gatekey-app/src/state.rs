use std::sync::Arc;

use chrono::{DateTime, Utc};
use gatekey_core::config::Config;
use gatekey_core::firewall::{FirewallController, NoopBackend};
use gatekey_core::policy::PolicyEngine;
use gatekey_core::session::SessionManager;
use gatekey_core::store::InMemoryStores;
use tokio::sync::RwLock;

/// Shared server state, handed to every handler as `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
	pub config: Arc<Config>,
	pub stores: Arc<InMemoryStores>,
	pub policy: Arc<PolicyEngine>,
	pub sessions: Arc<SessionManager>,
	pub firewall: Arc<FirewallController<NoopBackend>>,
	pub crl_cache: Arc<RwLock<Option<CachedCrl>>>,
}

/// Last CRL built by `gatekey-app::routes::get_crl`, reused until it's past
/// `next_update` or the revoked set has grown (§10.6 CRL caching).
pub struct CachedCrl {
	pub pem: String,
	pub next_update: DateTime<Utc>,
	pub revocation_generation: u64,
}

impl AppState {
	pub fn new(config: Config) -> Self {
		let policy = Arc::new(PolicyEngine::new(config.policy_mode));
		AppState {
			config: Arc::new(config),
			stores: Arc::new(InMemoryStores::new()),
			policy,
			sessions: Arc::new(SessionManager::new()),
			firewall: Arc::new(FirewallController::new(NoopBackend)),
			crl_cache: Arc::new(RwLock::new(None)),
		}
	}
}
