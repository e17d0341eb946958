//! OpenVPN hook logic (spec §4.6), invoked by `gatekey-hooks` as scripts run
//! under `script-security 3`. This module contains the pure decision logic;
//! the binary owns environment-variable parsing and file I/O.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::model::{Connection, GatewayRef, Id};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("auth token is invalid or revoked")]
	InvalidToken,

	#[error("token is not bound to this user")]
	UserMismatch,

	#[error("token is not bound to this gateway")]
	GatewayMismatch,
}

type Result<T> = std::result::Result<T, Error>;

/// `auth-user-pass-verify` (§4.6). `stored_user_id`/`stored_gateway_id` are
/// what the ephemeral token resolves to; `presented_*` is what OpenVPN
/// passed in the environment. Exit code mapping is the binary's job.
pub fn verify_auth_token(
	token_revoked: bool,
	stored_user_id: Id,
	presented_user_id: Id,
	stored_gateway_id: Id,
	presented_gateway_id: Id,
) -> Result<()> {
	if token_revoked {
		return Err(Error::InvalidToken);
	}
	if stored_user_id != presented_user_id {
		return Err(Error::UserMismatch);
	}
	if stored_gateway_id != presented_gateway_id {
		return Err(Error::GatewayMismatch);
	}
	Ok(())
}

/// Builds the `client-connect` directive file contents (§4.6).
pub fn client_connect_directives(
	allowed_networks: &[IpNet],
	dns_servers: &[IpAddr],
	push_dns: bool,
	full_tunnel_mode: bool,
) -> Vec<String> {
	let mut lines = Vec::new();
	for net in allowed_networks {
		lines.push(format!("push \"route {} {}\"", net.network(), net.netmask()));
	}
	if push_dns {
		for dns in dns_servers {
			lines.push(format!("push \"dhcp-option DNS {dns}\""));
		}
	}
	if full_tunnel_mode {
		lines.push("push \"redirect-gateway def1\"".to_string());
	}
	lines
}

/// Opens a `Connection` record for a successful `client-connect`, unless one
/// is already open for this certificate — hooks are idempotent per
/// connection id (§4.6).
pub fn open_connection_if_absent(
	existing_open: Option<&Connection>,
	user_id: Id,
	certificate_serial: String,
	gateway_ref: GatewayRef,
	client_ip: IpAddr,
	vpn_address: IpAddr,
) -> Option<Connection> {
	if existing_open.is_some() {
		return None;
	}
	Some(Connection {
		id: Id::new_v4(),
		user_id,
		session_id: None,
		certificate_serial,
		gateway_ref,
		client_ip,
		vpn_address,
		connected_at: chrono::Utc::now(),
		disconnected_at: None,
		disconnect_reason: None,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn revoked_token_is_rejected() {
		let id = Id::new_v4();
		let err = verify_auth_token(true, id, id, id, id).unwrap_err();
		assert!(matches!(err, Error::InvalidToken));
	}

	#[test]
	fn mismatched_user_is_rejected() {
		let err = verify_auth_token(false, Id::new_v4(), Id::new_v4(), Id::new_v4(), Id::new_v4()).unwrap_err();
		assert!(matches!(err, Error::UserMismatch));
	}

	#[test]
	fn directives_respect_push_dns_and_full_tunnel_flags() {
		let networks = vec!["10.0.0.0/24".parse().unwrap()];
		let dns = vec!["1.1.1.1".parse().unwrap()];
		let lines = client_connect_directives(&networks, &dns, true, true);
		assert!(lines.iter().any(|l| l.starts_with("push \"route 10.0.0.0")));
		assert!(lines.iter().any(|l| l.contains("dhcp-option DNS 1.1.1.1")));
		assert!(lines.iter().any(|l| l.contains("redirect-gateway def1")));
	}

	#[test]
	fn second_connect_for_same_cert_is_a_noop() {
		let existing = Connection {
			id: Id::new_v4(),
			user_id: Id::new_v4(),
			session_id: None,
			certificate_serial: "abc".into(),
			gateway_ref: GatewayRef::Gateway(Id::new_v4()),
			client_ip: "1.2.3.4".parse().unwrap(),
			vpn_address: "10.8.0.2".parse().unwrap(),
			connected_at: chrono::Utc::now(),
			disconnected_at: None,
			disconnect_reason: None,
		};
		let result = open_connection_if_absent(
			Some(&existing),
			existing.user_id,
			"abc".into(),
			existing.gateway_ref,
			"1.2.3.4".parse().unwrap(),
			"10.8.0.2".parse().unwrap(),
		);
		assert!(result.is_none());
	}
}
