//! Authentication realms and header-value computation.
//!
//! Basic and Digest values are computed in place; the stateful NTLM and
//! SPNEGO/Kerberos handshakes are consumed as capabilities via the
//! [`NtlmEngine`] and [`SpnegoEngine`] traits.

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::error::{BoxError, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Authentication scheme of a [`Realm`].
pub enum AuthScheme {
    Basic,
    Digest,
    Ntlm,
    Kerberos,
    Spnego,
    None,
}

#[derive(Debug, Clone)]
/// Credentials plus scheme-specific parameters for one protection space.
pub struct Realm {
    pub scheme: AuthScheme,
    pub principal: String,
    pub password: String,
    /// Compute and attach the `Authorization` header up front,
    /// without waiting for a challenge.
    pub preemptive: bool,
    pub realm_name: Option<String>,
    /// Server nonce, required for a (preemptive) Digest computation.
    pub nonce: Option<String>,
    pub qop: Option<String>,
    pub nc: String,
    pub cnonce: Option<String>,
    /// Request URI the Digest response is computed over.
    pub uri: Option<String>,
    pub method: Option<String>,
    pub ntlm_domain: Option<String>,
    pub ntlm_host: Option<String>,
}

impl Realm {
    pub fn basic(principal: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(AuthScheme::Basic, principal, password)
    }

    pub fn new(
        scheme: AuthScheme,
        principal: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            scheme,
            principal: principal.into(),
            password: password.into(),
            preemptive: false,
            realm_name: None,
            nonce: None,
            qop: None,
            nc: "00000001".to_owned(),
            cnonce: None,
            uri: None,
            method: None,
            ntlm_domain: None,
            ntlm_host: None,
        }
    }

    #[must_use]
    pub fn with_preemptive(mut self, preemptive: bool) -> Self {
        self.preemptive = preemptive;
        self
    }

    #[must_use]
    pub fn with_realm_name(mut self, name: impl Into<String>) -> Self {
        self.realm_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}

/// Stateful NTLM message generation, keyed by domain + host.
pub trait NtlmEngine: Send + Sync + 'static {
    fn generate_type1_msg(&self, domain: &str, host: &str) -> Result<String, BoxError>;

    fn generate_type3_msg(
        &self,
        principal: &str,
        password: &str,
        domain: &str,
        host: &str,
        challenge: &str,
    ) -> Result<String, BoxError>;
}

/// SPNEGO / Kerberos token generation for a target server.
pub trait SpnegoEngine: Send + Sync + 'static {
    fn generate_token(&self, server: &str) -> Result<String, BoxError>;
}

/// Compute a `Basic` credential value from principal + password.
pub fn compute_basic_authentication(principal: &str, password: &str) -> String {
    let credentials = format!("{principal}:{password}");
    format!("Basic {}", STANDARD.encode(credentials.as_bytes()))
}

/// Compute a `Digest` credential value (RFC 2617, MD5).
///
/// Requires a non-empty server nonce on the realm.
pub fn compute_digest_authentication(realm: &Realm) -> Result<String, Error> {
    let nonce = realm
        .nonce
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::Configuration("digest realm without server nonce".to_owned()))?;

    let realm_name = realm.realm_name.as_deref().unwrap_or_default();
    let uri = realm.uri.as_deref().unwrap_or("/");
    let method = realm.method.as_deref().unwrap_or("GET");

    let ha1 = md5_hex(format!("{}:{realm_name}:{}", realm.principal, realm.password).as_bytes());
    let ha2 = md5_hex(format!("{method}:{uri}").as_bytes());

    let response = match (realm.qop.as_deref(), realm.cnonce.as_deref()) {
        (Some(qop), Some(cnonce)) if !qop.is_empty() => md5_hex(
            format!("{ha1}:{nonce}:{}:{cnonce}:{qop}:{ha2}", realm.nc).as_bytes(),
        ),
        _ => md5_hex(format!("{ha1}:{nonce}:{ha2}").as_bytes()),
    };

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{realm_name}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\"",
        realm.principal
    );
    if let (Some(qop), Some(cnonce)) = (realm.qop.as_deref(), realm.cnonce.as_deref()) {
        if !qop.is_empty() {
            header.push_str(&format!(
                ", qop={qop}, nc={}, cnonce=\"{cnonce}\"",
                realm.nc
            ));
        }
    }
    Ok(header)
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
