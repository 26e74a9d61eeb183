//! Header -> [`SecurityContext`] parsing.
//!
//! spec.md §4.10 names an "auth-method byte" without pinning it to a wire
//! offset; this parser reads it from the IRM's `sync_flags` byte (bits
//! `0x01` passticket, `0x02` kerberos, `0x04` certificate, else password),
//! the one IRM field the header layout in §6 leaves otherwise unused for
//! send-receive/send-only traffic. Recorded as an open-question resolution
//! in `DESIGN.md`.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use crate::codec::frame::IrmHeader;
use crate::error::SecurityError;

const PASSTICKET_BIT: u8 = 0x01;
const KERBEROS_BIT: u8 = 0x02;
const CERTIFICATE_BIT: u8 = 0x04;

const PASSWORD_TTL: Duration = Duration::from_secs(8 * 3600);
const PASSTICKET_TTL: Duration = Duration::from_secs(10 * 60);

/// Baseline authority every successfully parsed token carries; required by
/// [`super::validator::SecurityValidator::validate_minimum`].
pub const CONNECT_AUTHORITY: &str = "IMS.CONNECT";

/// The authentication method an IRM header's `sync_flags` byte named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// RACF user id + password.
    RacfPassword,
    /// RACF passticket (short-lived, single-use in practice).
    RacfPasticket,
    /// Kerberos ticket carried in the password field.
    Kerberos,
    /// X.509 client certificate, validated by the transport layer.
    Certificate,
    /// A `sync_flags` pattern this parser does not recognize.
    Unsupported(u8),
}

impl AuthMethod {
    fn from_sync_flags(byte: u8) -> Self {
        if byte & CERTIFICATE_BIT != 0 {
            AuthMethod::Certificate
        } else if byte & KERBEROS_BIT != 0 {
            AuthMethod::Kerberos
        } else if byte & PASSTICKET_BIT != 0 {
            AuthMethod::RacfPasticket
        } else {
            AuthMethod::RacfPassword
        }
    }
}

/// Which kind of token a [`SecurityContext`] was synthesized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// RACF user id + password.
    RacfPassword,
    /// RACF passticket.
    RacfPassticket,
    /// Kerberos.
    Kerberos,
    /// A caller-supplied token kind outside the four built-in ones.
    Custom,
    /// X.509 client certificate.
    Certificate,
}

/// An authenticated principal's identity and granted authorities.
///
/// Authorities are plain dot-separated strings, optionally ending in `*`
/// (a trailing-wildcard prefix grant); matching is performed by
/// [`SecurityValidator`](super::validator::SecurityValidator).
#[derive(Debug, Clone)]
pub struct SecurityContext {
    /// The authenticated user id. Never empty for a validly parsed context.
    pub user_id: String,
    /// The user's primary RACF group.
    pub primary_group: String,
    /// Every RACF group the user belongs to (includes `primary_group`).
    pub group_set: HashSet<String>,
    /// Authority strings granted to this principal.
    pub authorities: HashSet<String>,
    /// When this token was issued.
    pub issued_at: SystemTime,
    /// When this token expires, if it does.
    pub expires_at: Option<SystemTime>,
    /// The entity that issued this token (e.g. `"RACF"`).
    pub issuer: String,
    /// The kind of token this context was synthesized from.
    pub token_kind: TokenKind,
}

impl SecurityContext {
    /// Whether this context's token has expired as of `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

fn authorities_for_group(group: &str) -> HashSet<String> {
    let mut authorities = match group.to_ascii_uppercase().as_str() {
        "BANKOPER" => [
            "IMS.TXN.BALINQ",
            "IMS.TXN.TRANSFER",
            "IMS.TXN.DEPOSIT",
            "IMS.TXN.WITHDRAW",
        ]
        .into_iter()
        .map(str::to_string)
        .collect::<HashSet<_>>(),
        "BANKADMIN" => ["IMS.TXN.*", "IMS.ADMIN.*"].into_iter().map(str::to_string).collect(),
        "READONLY" => {
            ["IMS.TXN.BALINQ", "IMS.TXN.INQUIRY"].into_iter().map(str::to_string).collect()
        }
        _ => ["IMS.TXN.BALINQ"].into_iter().map(str::to_string).collect(),
    };
    authorities.insert(CONNECT_AUTHORITY.to_string());
    authorities
}

fn apply_user_prefix_rules(user_id: &str, authorities: &mut HashSet<String>) {
    let upper = user_id.to_ascii_uppercase();
    if upper.starts_with("ADMIN") {
        authorities.insert("IMS.ADMIN.*".to_string());
    } else if upper.starts_with("OPER") {
        authorities.insert("IMS.TXN.TRANSFER".to_string());
        authorities.insert("BANKING.TRANSFER".to_string());
    } else if upper.starts_with("READ") {
        authorities.insert("IMS.TXN.INQUIRY".to_string());
    }
}

/// Synthesizes a [`SecurityContext`] from an IRM header's auth-relevant
/// fields, per spec.md §4.10. Fails with [`SecurityError::UnsupportedAuth`]
/// for an auth method this parser does not implement, or
/// [`SecurityError::TokenParse`] if the chosen method's required fields are
/// missing.
pub fn parse(irm: &IrmHeader) -> Result<SecurityContext, SecurityError> {
    match AuthMethod::from_sync_flags(irm.sync_flags) {
        AuthMethod::RacfPassword => {
            if irm.user_id.trim().is_empty() || irm.password.trim().is_empty() {
                return Err(SecurityError::TokenParse {
                    reason: "password auth requires both a user id and a password".to_string(),
                });
            }
            let mut authorities = authorities_for_group(&irm.group_id);
            apply_user_prefix_rules(&irm.user_id, &mut authorities);
            let issued_at = SystemTime::now();
            Ok(SecurityContext {
                user_id: irm.user_id.clone(),
                primary_group: irm.group_id.clone(),
                group_set: [irm.group_id.clone()].into_iter().collect(),
                authorities,
                issued_at,
                expires_at: Some(issued_at + PASSWORD_TTL),
                issuer: "RACF".to_string(),
                token_kind: TokenKind::RacfPassword,
            })
        }
        AuthMethod::RacfPasticket => {
            if irm.user_id.trim().is_empty() {
                return Err(SecurityError::TokenParse {
                    reason: "passticket auth requires a user id".to_string(),
                });
            }
            let mut authorities = authorities_for_group(&irm.group_id);
            apply_user_prefix_rules(&irm.user_id, &mut authorities);
            let issued_at = SystemTime::now();
            Ok(SecurityContext {
                user_id: irm.user_id.clone(),
                primary_group: irm.group_id.clone(),
                group_set: [irm.group_id.clone()].into_iter().collect(),
                authorities,
                issued_at,
                expires_at: Some(issued_at + PASSTICKET_TTL),
                issuer: "RACF".to_string(),
                token_kind: TokenKind::RacfPassticket,
            })
        }
        AuthMethod::Kerberos | AuthMethod::Certificate => Err(SecurityError::UnsupportedAuth {
            method: irm.sync_flags,
        }),
        AuthMethod::Unsupported(method) => Err(SecurityError::UnsupportedAuth { method }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{ArchitectureLevel, LtermName, TxnCode};

    fn sample_irm(user_id: &str, group_id: &str, password: &str, sync_flags: u8) -> IrmHeader {
        IrmHeader {
            architecture: ArchitectureLevel::try_from(0).expect("valid"),
            comm_flags: 0,
            irm_id: "IRMID001".to_string(),
            nak_reason: 0,
            input_flags: 0x01,
            timeout_byte: 0,
            conn_type: 0,
            encoding: 0,
            client_id: None,
            user_flags1: 0,
            commit_mode: 0,
            sync_flags,
            msg_type: 0x40,
            txn_code: TxnCode::try_new("BALINQ").expect("valid"),
            destination: String::new(),
            lterm: LtermName::try_new("LTERM001").expect("valid"),
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
            password: password.to_string(),
            application_name: String::new(),
            reroute_name: String::new(),
            tag_adapter: String::new(),
            tag_map: String::new(),
            mod_name: String::new(),
        }
    }

    #[test]
    fn password_auth_with_empty_password_should_fail() {
        let irm = sample_irm("ALICE", "BANKOPER", "", 0);
        assert!(matches!(parse(&irm), Err(SecurityError::TokenParse { .. })));
    }

    #[test]
    fn bankoper_group_should_grant_teller_authorities() {
        let irm = sample_irm("ALICE", "BANKOPER", "secret", 0);
        let ctx = parse(&irm).expect("parses");
        assert!(ctx.authorities.contains("IMS.TXN.TRANSFER"));
        assert!(ctx.authorities.contains(CONNECT_AUTHORITY));
        assert_eq!(ctx.token_kind, TokenKind::RacfPassword);
    }

    #[test]
    fn admin_prefixed_user_should_gain_admin_wildcard() {
        let irm = sample_irm("ADMIN01", "READONLY", "secret", 0);
        let ctx = parse(&irm).expect("parses");
        assert!(ctx.authorities.contains("IMS.ADMIN.*"));
    }

    #[test]
    fn passticket_auth_should_expire_sooner_than_password() {
        let irm = sample_irm("ALICE", "BANKOPER", "", PASSTICKET_BIT);
        let ctx = parse(&irm).expect("parses");
        let issued = ctx.issued_at;
        let expires = ctx.expires_at.expect("passticket expires");
        assert!(expires.duration_since(issued).expect("monotonic") <= PASSWORD_TTL);
    }

    #[test]
    fn kerberos_should_be_reported_unsupported() {
        let irm = sample_irm("ALICE", "BANKOPER", "secret", KERBEROS_BIT);
        assert!(matches!(parse(&irm), Err(SecurityError::UnsupportedAuth { .. })));
    }
}
