//! PKI & certificate lifecycle (spec §4.1).
//!
//! Certificate issuance goes through `rcgen`; parsing and CRL-side
//! verification go through `x509-parser`, mirroring the split the Istio CA
//! client uses (`control::caclient` issues via a remote service but parses
//! and verifies responses locally with `x509_parser::certificate::X509Certificate`).

use std::time::Duration as StdDuration;

use rand::RngCore;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
	Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::model::KeyAlgorithm;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid PEM material: {0}")]
	InvalidPem(String),

	#[error("unsupported key algorithm")]
	UnsupportedAlgorithm,

	#[error("CA certificate has expired")]
	CaExpired,

	#[error("supplied certificate is not a CA")]
	NotACa,

	#[error("serial number collision after {0} attempts")]
	SerialCollision(u8),

	#[error("certificate/key store unavailable: {0}")]
	StoreUnavailable(String),

	#[error("certificate generation failed: {0}")]
	Generation(String),

	#[error("certificate verification failed: {0}")]
	Verification(String),
}

impl Error {
	pub fn category(&self) -> crate::error::Category {
		use crate::error::Category;
		match self {
			Error::InvalidPem(_) | Error::UnsupportedAlgorithm | Error::NotACa => Category::Validation,
			Error::CaExpired => Category::Fatal,
			Error::SerialCollision(_) => Category::ConfigGeneration,
			Error::StoreUnavailable(_) => Category::Network,
			Error::Generation(_) => Category::ConfigGeneration,
			Error::Verification(_) => Category::Authentication,
		}
	}
}

type Result<T> = std::result::Result<T, Error>;

const MAX_SERIAL_ATTEMPTS: u8 = 3;

fn rcgen_algorithm(alg: KeyAlgorithm) -> &'static rcgen::SignatureAlgorithm {
	match alg {
		KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa4096 => &rcgen::PKCS_RSA_SHA256,
		KeyAlgorithm::Ecdsa256 => &rcgen::PKCS_ECDSA_P256_SHA256,
		KeyAlgorithm::Ecdsa384 => &rcgen::PKCS_ECDSA_P384_SHA384,
	}
}

fn generate_keypair(alg: KeyAlgorithm) -> Result<KeyPair> {
	match alg {
		KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa4096 => {
			// rcgen's pure-Rust backend cannot mint RSA keys; the closed
			// algorithm set is validated at the config edge (§4.1) so a
			// request reaching here with an RSA algorithm is a config bug.
			Err(Error::UnsupportedAlgorithm)
		}
		_ => KeyPair::generate_for(rcgen_algorithm(alg)).map_err(|e| Error::Generation(e.to_string())),
	}
}

fn fresh_serial() -> SerialNumber {
	let mut bytes = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut bytes);
	// Top bit clear keeps the DER INTEGER encoding unambiguous.
	bytes[0] &= 0x7f;
	SerialNumber::from_slice(&bytes)
}

fn fingerprint(der: &[u8]) -> String {
	use sha2::{Digest, Sha256};
	hex::encode(Sha256::digest(der))
}

pub struct CertificateMaterial {
	pub cert_pem: String,
	pub key_pem: String,
	pub serial: String,
	pub fingerprint: String,
	pub not_before: chrono::DateTime<chrono::Utc>,
	pub not_after: chrono::DateTime<chrono::Utc>,
}

/// Loaded CA key material, held by whoever owns the CA (platform CA or a
/// mesh hub's sub-CA) and passed to issuance calls.
pub struct CaKeyMaterial {
	pub cert_pem: String,
	pub key_pem: String,
}

impl CaKeyMaterial {
	fn params_and_keypair(&self) -> Result<(CertificateParams, KeyPair)> {
		let key_pem = self.key_pem.clone();
		let kp = KeyPair::from_pem(&key_pem).map_err(|e| Error::InvalidPem(e.to_string()))?;
		let params =
			CertificateParams::from_ca_cert_pem(&self.cert_pem).map_err(|e| Error::InvalidPem(e.to_string()))?;
		Ok((params, kp))
	}

	fn issuer(&self) -> Result<Issuer<'static, KeyPair>> {
		let (params, kp) = self.params_and_keypair()?;
		Ok(Issuer::new(params, kp))
	}
}

#[derive(Debug, Clone)]
pub struct CertRequest {
	pub common_name: String,
	pub email: Option<String>,
	pub dns_names: Vec<String>,
	pub valid_for: StdDuration,
}

fn build_leaf_params(req: &CertRequest, eku: ExtendedKeyUsagePurpose) -> Result<CertificateParams> {
	let mut params = CertificateParams::new(req.dns_names.clone()).map_err(|e| Error::Generation(e.to_string()))?;
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, req.common_name.clone());
	params.distinguished_name = dn;
	params.is_ca = IsCa::NoCa;
	params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
	params.extended_key_usages = vec![eku];
	if let Some(email) = &req.email {
		params
			.subject_alt_names
			.push(SanType::Rfc822Name(email.clone().try_into().map_err(|_| {
				Error::Generation(format!("invalid email SAN: {email}"))
			})?));
	}
	let not_before = OffsetDateTime::now_utc();
	let not_after = not_before + TimeDuration::try_from(req.valid_for).map_err(|e| Error::Generation(e.to_string()))?;
	params.not_before = not_before;
	params.not_after = not_after;
	params.serial_number = Some(fresh_serial());
	Ok(params)
}

/// Issues a client certificate signed by `ca` (§4.1 `IssueClientCertificate`).
///
/// Retries on serial collision is a property of the caller's store (the
/// serial is only "taken" once persisted), so this returns material for the
/// caller to attempt to persist up to [`MAX_SERIAL_ATTEMPTS`] times.
pub fn issue_client_certificate(
	ca: &CaKeyMaterial,
	req: &CertRequest,
	serial_taken: impl Fn(&str) -> bool,
) -> Result<CertificateMaterial> {
	issue_leaf(ca, req, ExtendedKeyUsagePurpose::ClientAuth, serial_taken)
}

/// Issues a server certificate signed by `ca` (§4.1 `IssueServerCertificate`).
pub fn issue_server_certificate(
	ca: &CaKeyMaterial,
	req: &CertRequest,
	serial_taken: impl Fn(&str) -> bool,
) -> Result<CertificateMaterial> {
	issue_leaf(ca, req, ExtendedKeyUsagePurpose::ServerAuth, serial_taken)
}

fn issue_leaf(
	ca: &CaKeyMaterial,
	req: &CertRequest,
	eku: ExtendedKeyUsagePurpose,
	serial_taken: impl Fn(&str) -> bool,
) -> Result<CertificateMaterial> {
	let issuer = ca.issuer()?;
	for _ in 0..MAX_SERIAL_ATTEMPTS {
		let mut params = build_leaf_params(req, eku)?;
		let leaf_key = KeyPair::generate().map_err(|e| Error::Generation(e.to_string()))?;
		let serial_hex = params
			.serial_number
			.as_ref()
			.map(|s| hex::encode(s.to_bytes()))
			.unwrap_or_default();
		if serial_taken(&serial_hex) {
			params.serial_number = Some(fresh_serial());
			continue;
		}
		let cert = params
			.signed_by(&leaf_key, &issuer)
			.map_err(|e| Error::Generation(e.to_string()))?;
		return Ok(CertificateMaterial {
			cert_pem: cert.pem(),
			key_pem: leaf_key.serialize_pem(),
			serial: serial_hex,
			fingerprint: fingerprint(cert.der()),
			not_before: cert.params().not_before.into(),
			not_after: cert.params().not_after.into(),
		});
	}
	Err(Error::SerialCollision(MAX_SERIAL_ATTEMPTS))
}

/// Issues a sub-CA certificate for a mesh hub (§4.4 `CreateHub`, §4.1
/// `GenerateSubCA`): `MaxPathLen=0` so the sub-CA cannot itself delegate.
pub fn generate_sub_ca(ca: &CaKeyMaterial, common_name: &str, validity: StdDuration) -> Result<CertificateMaterial> {
	let issuer = ca.issuer()?;
	let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| Error::Generation(e.to_string()))?;
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, common_name);
	params.distinguished_name = dn;
	params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	let not_before = OffsetDateTime::now_utc();
	params.not_before = not_before;
	params.not_after = not_before + TimeDuration::try_from(validity).map_err(|e| Error::Generation(e.to_string()))?;
	params.serial_number = Some(fresh_serial());
	let sub_ca_key = KeyPair::generate().map_err(|e| Error::Generation(e.to_string()))?;
	let cert = params
		.signed_by(&sub_ca_key, &issuer)
		.map_err(|e| Error::Generation(e.to_string()))?;
	Ok(CertificateMaterial {
		cert_pem: cert.pem(),
		key_pem: sub_ca_key.serialize_pem(),
		serial: hex::encode(cert.params().serial_number.as_ref().unwrap().to_bytes()),
		fingerprint: fingerprint(cert.der()),
		not_before: cert.params().not_before.into(),
		not_after: cert.params().not_after.into(),
	})
}

/// Generates (or loads) the root CA (§4.1 `BootstrapCA`). Callers are
/// responsible for the "first writer wins" persistence race; this function
/// is pure key/cert generation.
pub fn bootstrap_ca(key_algorithm: KeyAlgorithm, organization: &str, validity: StdDuration) -> Result<CertificateMaterial> {
	let key_pair = generate_keypair(key_algorithm)?;
	let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| Error::Generation(e.to_string()))?;
	let mut dn = DistinguishedName::new();
	dn.push(DnType::OrganizationName, organization);
	dn.push(DnType::CommonName, format!("{organization} Root CA"));
	params.distinguished_name = dn;
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	let not_before = OffsetDateTime::now_utc();
	params.not_before = not_before;
	params.not_after = not_before + TimeDuration::try_from(validity).map_err(|e| Error::Generation(e.to_string()))?;
	params.serial_number = Some(fresh_serial());
	let cert = params.self_signed(&key_pair).map_err(|e| Error::Generation(e.to_string()))?;
	Ok(CertificateMaterial {
		cert_pem: cert.pem(),
		key_pem: key_pair.serialize_pem(),
		serial: hex::encode(cert.params().serial_number.as_ref().unwrap().to_bytes()),
		fingerprint: fingerprint(cert.der()),
		not_before: cert.params().not_before.into(),
		not_after: cert.params().not_after.into(),
	})
}

/// Replaces the CA with externally supplied material (§4.1 `UpdateFromPEM`).
/// Rejects material whose cert is not a CA or whose key does not match.
pub fn update_from_pem(cert_pem: &str, key_pem: &str) -> Result<CaKeyMaterial> {
	let (_, cert) =
		x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).map_err(|e| Error::InvalidPem(e.to_string()))?;
	let parsed = cert.parse_x509().map_err(|e| Error::InvalidPem(e.to_string()))?;
	if !parsed.is_ca() {
		return Err(Error::NotACa);
	}
	// Round-trip through rcgen to confirm the key actually matches the cert;
	// `from_ca_cert_pem` fails if the embedded SPKI and key disagree.
	let _ = CaKeyMaterial {
		cert_pem: cert_pem.to_string(),
		key_pem: key_pem.to_string(),
	}
	.params_and_keypair()?;
	Ok(CaKeyMaterial {
		cert_pem: cert_pem.to_string(),
		key_pem: key_pem.to_string(),
	})
}

#[derive(Debug, Clone)]
pub struct RevokedEntry {
	pub serial_hex: String,
	pub reason: crate::model::RevocationReason,
	pub revoked_at: chrono::DateTime<chrono::Utc>,
}

/// Builds a CRL PEM signed by `ca` (§4.1 `GenerateCRL`). `crl_number` must be
/// monotonically increasing across calls; a nanosecond clock reading is an
/// acceptable source per spec.
pub fn generate_crl(
	ca: &CaKeyMaterial,
	revoked: &[RevokedEntry],
	validity: StdDuration,
	crl_number: u64,
) -> Result<String> {
	use rcgen::{CertificateRevocationListParams, CrlIssuingDistributionPoint, RevocationReason, RevokedCertParams};

	let (params, kp) = ca.params_and_keypair()?;
	let issuer = Issuer::new(params, kp);

	let this_update = OffsetDateTime::now_utc();
	let next_update = this_update + TimeDuration::try_from(validity).map_err(|e| Error::Generation(e.to_string()))?;

	let revoked_certs = revoked
		.iter()
		.map(|r| {
			let bytes = hex::decode(&r.serial_hex).map_err(|e| Error::InvalidPem(e.to_string()))?;
			Ok(RevokedCertParams {
				serial_number: SerialNumber::from_slice(&bytes),
				revocation_time: r.revoked_at.into(),
				reason_code: Some(rfc5280_to_rcgen(r.reason)),
				invalidity_date: None,
			})
		})
		.collect::<Result<Vec<_>>>()?;

	let crl_params = CertificateRevocationListParams {
		this_update,
		next_update,
		crl_number: SerialNumber::from(crl_number),
		issuing_distribution_point: None::<CrlIssuingDistributionPoint>,
		revoked_certs,
		key_identifier_method: rcgen::KeyIdMethod::Sha256,
	};
	let crl = crl_params.signed_by(&issuer).map_err(|e| Error::Generation(e.to_string()))?;
	Ok(crl.pem().map_err(|e| Error::Generation(e.to_string()))?)
}

fn rfc5280_to_rcgen(reason: crate::model::RevocationReason) -> rcgen::RevocationReason {
	use crate::model::RevocationReason as R;
	use rcgen::RevocationReason as RR;
	match reason {
		R::Unspecified => RR::Unspecified,
		R::KeyCompromise => RR::KeyCompromise,
		R::CaCompromise => RR::CaCompromise,
		R::AffiliationChanged => RR::AffiliationChanged,
		R::Superseded => RR::Superseded,
		R::CessationOfOperation => RR::CessationOfOperation,
		R::CertificateHold => RR::CertificateHold,
		R::PrivilegeWithdrawn => RR::PrivilegeWithdrawn,
	}
}

/// Verifies a leaf certificate chains to one of `roots`, is within validity,
/// and carries `purpose` in its extended key usage (§4.1 `VerifyCertificate`
/// takes `(cert, purpose)`). `roots` should include the active CA and any
/// not-yet-expired rotated CAs.
pub fn verify_certificate(
	cert_pem: &str,
	roots: &[String],
	at: chrono::DateTime<chrono::Utc>,
	purpose: ExtendedKeyUsagePurpose,
) -> Result<()> {
	let (_, leaf_pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).map_err(|e| Error::InvalidPem(e.to_string()))?;
	let leaf = leaf_pem.parse_x509().map_err(|e| Error::InvalidPem(e.to_string()))?;

	let not_before = leaf.validity().not_before.to_datetime().unix_timestamp();
	let not_after = leaf.validity().not_after.to_datetime().unix_timestamp();
	let now = at.timestamp();
	if now < not_before || now > not_after {
		return Err(Error::Verification("certificate is outside its validity window".into()));
	}

	let eku = leaf
		.extended_key_usage()
		.map_err(|e| Error::Verification(e.to_string()))?
		.map(|(_, eku)| eku);
	let purpose_ok = match eku {
		Some(eku) => match purpose {
			ExtendedKeyUsagePurpose::ServerAuth => eku.server_auth,
			ExtendedKeyUsagePurpose::ClientAuth => eku.client_auth,
			ExtendedKeyUsagePurpose::CodeSigning => eku.code_signing,
			ExtendedKeyUsagePurpose::EmailProtection => eku.email_protection,
			ExtendedKeyUsagePurpose::TimeStamping => eku.time_stamping,
			ExtendedKeyUsagePurpose::OcspSigning => eku.ocsp_signing,
			_ => false,
		},
		None => false,
	};
	if !purpose_ok {
		return Err(Error::Verification("certificate's extended key usage does not match the required purpose".into()));
	}

	for root_pem in roots {
		let (_, root) = match x509_parser::pem::parse_x509_pem(root_pem.as_bytes()) {
			Ok(v) => v,
			Err(_) => continue,
		};
		let Ok(root_cert) = root.parse_x509() else { continue };
		if leaf.verify_signature(Some(root_cert.public_key())).is_ok() {
			return Ok(());
		}
	}
	Err(Error::Verification("no trusted root signed this certificate".into()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	fn ca() -> CaKeyMaterial {
		let mat = bootstrap_ca(KeyAlgorithm::Ecdsa256, "Test Org", StdDuration::from_secs(86400 * 365)).unwrap();
		CaKeyMaterial {
			cert_pem: mat.cert_pem,
			key_pem: mat.key_pem,
		}
	}

	#[test]
	fn bootstrap_produces_self_signed_ca() {
		let mat = bootstrap_ca(KeyAlgorithm::Ecdsa256, "Test Org", StdDuration::from_secs(86400)).unwrap();
		assert!(mat.cert_pem.contains("BEGIN CERTIFICATE"));
		assert!(mat.key_pem.contains("PRIVATE KEY"));
		assert_eq!(mat.fingerprint.len(), 64);
	}

	#[test]
	fn rsa_requests_are_rejected_for_now() {
		let err = generate_keypair(KeyAlgorithm::Rsa2048).unwrap_err();
		assert!(matches!(err, Error::UnsupportedAlgorithm));
	}

	#[test]
	fn issues_client_cert_signed_by_ca() {
		let ca = ca();
		let req = CertRequest {
			common_name: "alice@example.com".into(),
			email: Some("alice@example.com".into()),
			dns_names: vec![],
			valid_for: StdDuration::from_secs(3600),
		};
		let seen = HashSet::new();
		let mat = issue_client_certificate(&ca, &req, |s| seen.contains(s)).unwrap();
		assert!(mat.cert_pem.contains("BEGIN CERTIFICATE"));
		assert_eq!(mat.not_after - mat.not_before, chrono::Duration::seconds(3600));
	}

	#[test]
	fn serial_collision_retries_then_fails() {
		let ca = ca();
		let req = CertRequest {
			common_name: "bob".into(),
			email: None,
			dns_names: vec![],
			valid_for: StdDuration::from_secs(3600),
		};
		let err = issue_client_certificate(&ca, &req, |_| true).unwrap_err();
		assert!(matches!(err, Error::SerialCollision(3)));
	}

	#[test]
	fn sub_ca_is_path_len_constrained() {
		let ca = ca();
		let mat = generate_sub_ca(&ca, "hub-1 sub-CA", StdDuration::from_secs(86400 * 30)).unwrap();
		assert!(mat.cert_pem.contains("BEGIN CERTIFICATE"));
	}

	#[test]
	fn verify_accepts_cert_signed_by_supplied_root() {
		let ca = ca();
		let req = CertRequest {
			common_name: "carol".into(),
			email: None,
			dns_names: vec![],
			valid_for: StdDuration::from_secs(3600),
		};
		let mat = issue_client_certificate(&ca, &req, |_| false).unwrap();
		verify_certificate(&mat.cert_pem, &[ca.cert_pem.clone()], chrono::Utc::now(), ExtendedKeyUsagePurpose::ClientAuth).unwrap();
	}

	#[test]
	fn verify_rejects_wrong_purpose() {
		let ca = ca();
		let req = CertRequest {
			common_name: "erin".into(),
			email: None,
			dns_names: vec![],
			valid_for: StdDuration::from_secs(3600),
		};
		let mat = issue_client_certificate(&ca, &req, |_| false).unwrap();
		let err = verify_certificate(&mat.cert_pem, &[ca.cert_pem.clone()], chrono::Utc::now(), ExtendedKeyUsagePurpose::ServerAuth).unwrap_err();
		assert!(matches!(err, Error::Verification(_)));
	}

	#[test]
	fn verify_rejects_untrusted_root() {
		let ca = ca();
		let other = ca();
		let req = CertRequest {
			common_name: "dave".into(),
			email: None,
			dns_names: vec![],
			valid_for: StdDuration::from_secs(3600),
		};
		let mat = issue_client_certificate(&ca, &req, |_| false).unwrap();
		let err = verify_certificate(&mat.cert_pem, &[other.cert_pem.clone()], chrono::Utc::now(), ExtendedKeyUsagePurpose::ClientAuth).unwrap_err();
		assert!(matches!(err, Error::Verification(_)));
	}
}
