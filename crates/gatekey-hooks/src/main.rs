//! `gatekey-hook`: OpenVPN hook-script entry point (spec §4.6). OpenVPN
//! invokes this binary once per hook under `script-security 3`; exit status
//! is how OpenVPN learns accept/reject.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "gatekey-hook")]
struct Args {
	/// Base URL of the control plane, e.g. https://control.example.com.
	#[arg(long, env = "GATEKEY_CONTROL_PLANE_URL")]
	control_plane_url: String,

	/// This gateway's id, baked into the gateway's OpenVPN server config.
	#[arg(long, env = "GATEKEY_GATEWAY_ID")]
	gateway_id: Uuid,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Invoked as `auth-user-pass-verify`; reads `username`/`password` from
	/// the environment the way OpenVPN passes them.
	AuthUserPassVerify,
	/// Invoked as `client-connect <tmpfile>`; writes push directives to `tmpfile`.
	ClientConnect { directives_file: PathBuf },
	/// Invoked as `client-disconnect`.
	ClientDisconnect,
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
		.init();

	let args = Args::parse();
	let client = reqwest::Client::new();

	let result = match args.command {
		Command::AuthUserPassVerify => auth_user_pass_verify(&client, &args).await,
		Command::ClientConnect { directives_file } => client_connect(&client, &args, &directives_file).await,
		Command::ClientDisconnect => client_disconnect(&client, &args).await,
	};

	match result {
		Ok(()) => std::process::exit(0),
		Err(err) => {
			tracing::error!(%err, "hook rejected");
			std::process::exit(1);
		}
	}
}

fn env_var(name: &str) -> anyhow::Result<String> {
	std::env::var(name).map_err(|_| anyhow::anyhow!("missing OpenVPN environment variable {name}"))
}

async fn auth_user_pass_verify(client: &reqwest::Client, args: &Args) -> anyhow::Result<()> {
	let username = env_var("username")?;
	let password = env_var("password")?;
	let user_id: Uuid = username
		.parse()
		.map_err(|_| anyhow::anyhow!("username is not a recognized user id: {username}"))?;

	let body = serde_json::json!({
		"token": password,
		"userId": user_id,
		"gatewayId": args.gateway_id,
	});
	let resp = client
		.post(format!("{}/api/v1/hooks/verify-token", args.control_plane_url))
		.json(&body)
		.send()
		.await?;
	if !resp.status().is_success() {
		anyhow::bail!("control plane rejected auth token: {}", resp.status());
	}
	Ok(())
}

async fn client_connect(client: &reqwest::Client, args: &Args, directives_file: &PathBuf) -> anyhow::Result<()> {
	let common_name = env_var("common_name")?;
	let user_id: Uuid = common_name
		.parse()
		.map_err(|_| anyhow::anyhow!("common_name is not a recognized user id: {common_name}"))?;
	let client_ip = env_var("trusted_ip")?;
	let vpn_address = env_var("ifconfig_pool_remote_ip")?;
	let certificate_serial = env_var("tls_serial_0").unwrap_or_default();

	let body = serde_json::json!({
		"userId": user_id,
		"gatewayId": args.gateway_id,
		"certificateSerial": certificate_serial,
		"clientIp": client_ip,
		"vpnAddress": vpn_address,
	});
	let resp = client
		.post(format!("{}/api/v1/hooks/client-connect", args.control_plane_url))
		.json(&body)
		.send()
		.await?;
	if !resp.status().is_success() {
		anyhow::bail!("control plane rejected client-connect: {}", resp.status());
	}
	#[derive(serde::Deserialize)]
	struct Resp {
		directives: Vec<String>,
	}
	let parsed: Resp = resp.json().await?;

	let mut file = std::fs::File::create(directives_file)?;
	for line in parsed.directives {
		writeln!(file, "{line}")?;
	}
	Ok(())
}

async fn client_disconnect(client: &reqwest::Client, args: &Args) -> anyhow::Result<()> {
	let certificate_serial = env_var("tls_serial_0").unwrap_or_default();
	let body = serde_json::json!({
		"certificateSerial": certificate_serial,
		"reason": "client-disconnect",
	});
	let resp = client
		.post(format!("{}/api/v1/hooks/client-disconnect", args.control_plane_url))
		.json(&body)
		.send()
		.await?;
	if !resp.status().is_success() {
		anyhow::bail!("control plane rejected client-disconnect: {}", resp.status());
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn env_var_reads_whatever_openvpn_set() {
		std::env::set_var("GATEKEY_HOOK_TEST_VAR", "hello");
		assert_eq!(env_var("GATEKEY_HOOK_TEST_VAR").unwrap(), "hello");
		std::env::remove_var("GATEKEY_HOOK_TEST_VAR");
	}

	#[test]
	fn env_var_errors_on_missing_openvpn_var() {
		std::env::remove_var("GATEKEY_HOOK_TEST_MISSING");
		let err = env_var("GATEKEY_HOOK_TEST_MISSING").unwrap_err();
		assert!(err.to_string().contains("GATEKEY_HOOK_TEST_MISSING"));
	}

	#[test]
	fn args_parse_from_cli_flags_and_subcommand() {
		let args = Args::parse_from([
			"gatekey-hook",
			"--control-plane-url",
			"https://control.example.com",
			"--gateway-id",
			"9b1deb4d-3b7d-4bad-9bdd-2b0d7b3dcb6d",
			"auth-user-pass-verify",
		]);
		assert_eq!(args.control_plane_url, "https://control.example.com");
		assert!(matches!(args.command, Command::AuthUserPassVerify));
	}

	#[test]
	fn client_connect_subcommand_captures_directives_path() {
		let args = Args::parse_from([
			"gatekey-hook",
			"--control-plane-url",
			"https://control.example.com",
			"--gateway-id",
			"9b1deb4d-3b7d-4bad-9bdd-2b0d7b3dcb6d",
			"client-connect",
			"/tmp/ccd-out",
		]);
		match args.command {
			Command::ClientConnect { directives_file } => {
				assert_eq!(directives_file, PathBuf::from("/tmp/ccd-out"));
			}
			other => panic!("expected ClientConnect, got {other:?}"),
		}
	}
}
