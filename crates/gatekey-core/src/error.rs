//! Error taxonomy (spec §7). Each subsystem owns a `thiserror`-derived enum
//! (see `pki::Error`, `policy::Error`, `gateway::Error`, `mesh::Error`,
//! `session::Error`, `firewall::Error`); this module aggregates them into
//! the top-level [`Error`] that HTTP handlers and hook binaries match
//! against to pick a status code / exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("authentication failed: {0}")]
	Authentication(String),

	#[error("not authorized: {0}")]
	Authorization(String),

	#[error("validation error: {field}: {message}")]
	Validation { field: String, message: String },

	#[error("not found: {0}")]
	NotFound(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("configuration generation failed: {0}")]
	ConfigGeneration(String),

	#[error("transient network/storage error: {0}")]
	Network(String),

	#[error("fatal error: {0}")]
	Fatal(String),

	#[error(transparent)]
	Pki(#[from] crate::pki::Error),

	#[error(transparent)]
	Policy(#[from] crate::policy::Error),

	#[error(transparent)]
	Gateway(#[from] crate::gateway::Error),

	#[error(transparent)]
	Mesh(#[from] crate::mesh::Error),

	#[error(transparent)]
	Session(#[from] crate::session::Error),

	#[error(transparent)]
	Firewall(#[from] crate::firewall::Error),

	#[error(transparent)]
	Hooks(#[from] crate::hooks::Error),
}

/// Category used by transport layers (HTTP status, process exit code) to
/// render an [`Error`] without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
	Authentication,
	Authorization,
	Validation,
	NotFound,
	Conflict,
	ConfigGeneration,
	Network,
	Fatal,
}

impl Error {
	pub fn category(&self) -> Category {
		match self {
			Error::Authentication(_) => Category::Authentication,
			Error::Authorization(_) => Category::Authorization,
			Error::Validation { .. } => Category::Validation,
			Error::NotFound(_) => Category::NotFound,
			Error::Conflict(_) => Category::Conflict,
			Error::ConfigGeneration(_) => Category::ConfigGeneration,
			Error::Network(_) => Category::Network,
			Error::Fatal(_) => Category::Fatal,
			Error::Pki(e) => e.category(),
			Error::Policy(_) => Category::Validation,
			Error::Gateway(e) => e.category(),
			Error::Mesh(e) => e.category(),
			Error::Session(_) => Category::Network,
			Error::Firewall(_) => Category::ConfigGeneration,
			Error::Hooks(_) => Category::Authentication,
		}
	}

	pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
		Error::Validation {
			field: field.into(),
			message: message.into(),
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
