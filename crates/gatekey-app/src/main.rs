mod routes;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use gatekey_core::config::Config;
use gatekey_core::model::{Ca, CaStatus};
use gatekey_core::pki;
use gatekey_core::store::CaStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "gatekeyd", about = "GateKey control-plane server")]
struct Args {
	/// Optional YAML config file; unset fields fall back to `Config::default()`.
	#[arg(long)]
	config: Option<PathBuf>,

	#[arg(long)]
	listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with(tracing_subscriber::fmt::layer())
		.init();

	let args = Args::parse();
	let mut config = match &args.config {
		Some(path) => {
			let raw = std::fs::read_to_string(path)?;
			serde_yaml::from_str(&raw)?
		}
		None => Config::default(),
	};
	if let Some(listen) = args.listen {
		config.http_addr = listen;
	}

	let state = AppState::new(config);
	bootstrap_ca(&state).await?;

	tokio::spawn(offline_sweep(state.clone()));

	let admin_addr = state.config.admin_addr;
	let admin_app = routes::admin_router(state.clone());
	tokio::spawn(async move {
		let listener = match tokio::net::TcpListener::bind(admin_addr).await {
			Ok(listener) => listener,
			Err(err) => {
				tracing::error!(%admin_addr, %err, "failed to bind admin/health listener");
				return;
			}
		};
		tracing::info!(%admin_addr, "gatekeyd health listener up");
		if let Err(err) = axum::serve(listener, admin_app).with_graceful_shutdown(shutdown_signal()).await {
			tracing::error!(%err, "admin/health listener exited");
		}
	});

	let addr = state.config.http_addr;
	let app = routes::router(state);

	tracing::info!(%addr, "gatekeyd listening");
	let listener = tokio::net::TcpListener::bind(addr).await?;
	axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
	Ok(())
}

/// Waits for SIGINT or SIGTERM so the heartbeat/offline-sweep loop and every
/// in-flight request get a chance to finish (§5 "clean shutdown on
/// SIGINT/SIGTERM").
async fn shutdown_signal() {
	let ctrl_c = async {
		tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
	};
	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {}
		_ = terminate => {}
	}
	tracing::info!("shutdown signal received, draining");
}

/// `BootstrapCA` (§4.1): load the stored CA or generate and persist a fresh
/// one, first-writer-wins.
async fn bootstrap_ca(state: &AppState) -> anyhow::Result<()> {
	if state.stores.load().await.is_some() {
		return Ok(());
	}
	let material = pki::bootstrap_ca(
		state.config.ca_key_algorithm,
		&state.config.ca_organization,
		state.config.ca_validity,
	)?;
	let ca = Ca {
		id: "default".to_string(),
		cert_pem: material.cert_pem,
		key_pem: material.key_pem,
		serial: material.serial,
		not_before: material.not_before,
		not_after: material.not_after,
		status: CaStatus::Active,
		fingerprint: material.fingerprint,
	};
	let stored = state.stores.store_if_absent(ca).await;
	tracing::info!(fingerprint = %stored.fingerprint, "CA ready");
	Ok(())
}

/// Periodically flips gateways/hubs/spokes to `offline` once they've missed
/// three heartbeats (§4.3 state machine); heartbeat handlers only ever move a
/// node back to `online`, so this loop is the only path to `offline`.
async fn offline_sweep(state: AppState) {
	use gatekey_core::model::NodeStatus;
	use gatekey_core::store::{GatewayStore, MeshStore};

	let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
	let offline_after = state.config.offline_after();
	loop {
		ticker.tick().await;
		let now = chrono::Utc::now();

		for mut gw in state.stores.list().await {
			let Some(last) = gw.last_heartbeat else { continue };
			if gw.status == NodeStatus::Offline {
				continue;
			}
			let since = (now - last).to_std().unwrap_or_default();
			if gatekey_core::model::Gateway::status_from_heartbeat_age(since, offline_after) == NodeStatus::Offline {
				gw.status = NodeStatus::Offline;
				tracing::warn!(gateway = %gw.name, "gateway missed heartbeats, marking offline");
				state.stores.update(gw).await;
			}
		}

		for mut hub in state.stores.list_hubs().await {
			let Some(last) = hub.last_heartbeat else { continue };
			if hub.status == NodeStatus::Offline {
				continue;
			}
			let since = (now - last).to_std().unwrap_or_default();
			if gatekey_core::model::Gateway::status_from_heartbeat_age(since, offline_after) == NodeStatus::Offline {
				hub.status = NodeStatus::Offline;
				tracing::warn!(hub = %hub.name, "mesh hub missed heartbeats, marking offline");
				let spokes = state.stores.spokes_for_hub(hub.id).await;
				state.stores.update_hub(hub).await;
				for mut spoke in spokes {
					if spoke.status != NodeStatus::Offline {
						spoke.status = NodeStatus::Offline;
						state.stores.update_spoke(spoke).await;
					}
				}
				continue;
			}

			for mut spoke in state.stores.spokes_for_hub(hub.id).await {
				let Some(seen) = spoke.last_seen else { continue };
				if spoke.status == NodeStatus::Offline {
					continue;
				}
				let since = (now - seen).to_std().unwrap_or_default();
				if gatekey_core::model::Gateway::status_from_heartbeat_age(since, offline_after) == NodeStatus::Offline {
					spoke.status = NodeStatus::Offline;
					tracing::warn!(spoke = %spoke.name, "mesh spoke missed heartbeats, marking offline");
					state.stores.update_spoke(spoke).await;
				}
			}
		}
	}
}
