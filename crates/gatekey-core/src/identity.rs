//! Narrow `Identity` port (§1): SSO/OIDC/SAML adapters are an external
//! collaborator out of scope for this crate, but every module that needs a
//! user's external identity talks to one through this trait rather than to
//! a concrete provider.

use async_trait::async_trait;

use crate::model::User;

#[derive(Debug, Clone)]
pub struct IdentityClaims {
	pub external_id: String,
	pub provider: String,
	pub email: String,
	pub name: String,
	pub groups: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("identity provider error: {0}")]
	Provider(String),

	#[error("claims could not be mapped to a user: {0}")]
	InvalidClaims(String),
}

/// Resolves externally-verified claims (from an OIDC/SAML adapter, a local
/// password check, or an API-key lookup) into a [`User`] record. Concrete
/// adapters live outside this crate; local-password and API-key auth are
/// implemented in-crate since they touch no external collaborator.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
	async fn resolve(&self, claims: IdentityClaims) -> Result<User, Error>;
}

/// Merges fresh claims into a (possibly new) `User`, the way any concrete
/// `IdentityProvider` is expected to before persisting.
pub fn merge_claims(existing: Option<User>, claims: IdentityClaims) -> User {
	let mut user = existing.unwrap_or_else(|| User {
		id: uuid::Uuid::new_v4(),
		external_id: claims.external_id.clone(),
		provider: claims.provider.clone(),
		email: claims.email.clone(),
		name: claims.name.clone(),
		groups: Default::default(),
		is_admin: false,
		is_active: true,
		last_login: None,
	});
	user.email = claims.email;
	user.name = claims.name;
	user.groups = claims.groups.into_iter().collect();
	user.last_login = Some(chrono::Utc::now());
	user
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAuthError {
	UnknownUser,
	BadPassword,
	Inactive,
}

/// Verifies a username/password pair against a stored bcrypt hash (local
/// auth is in-scope; it never touches an external collaborator).
pub fn verify_local_password(password_hash: &str, candidate: &str) -> Result<bool, bcrypt::BcryptError> {
	bcrypt::verify(candidate, password_hash)
}

pub fn hash_local_password(password: &str) -> Result<String, bcrypt::BcryptError> {
	bcrypt::hash(password, bcrypt::DEFAULT_COST)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn merge_claims_populates_a_fresh_user() {
		let claims = IdentityClaims {
			external_id: "ext-1".into(),
			provider: "okta".into(),
			email: "alice@example.com".into(),
			name: "Alice".into(),
			groups: vec!["eng".into()],
		};
		let user = merge_claims(None, claims);
		assert_eq!(user.email, "alice@example.com");
		assert!(user.groups.contains("eng"));
		assert!(user.last_login.is_some());
	}

	#[test]
	fn local_password_roundtrips() {
		let hash = hash_local_password("correct horse battery staple").unwrap();
		assert!(verify_local_password(&hash, "correct horse battery staple").unwrap());
		assert!(!verify_local_password(&hash, "wrong").unwrap());
	}
}
