//! Authority gating over a [`SecurityContext`] (C10).
//!
//! Resolution order per spec.md §4.10: exact match, prefix-wildcard match,
//! the `IMS.ADMIN.*` administrative override, group-derived business rules,
//! then (if configured) an external collaborator. The first three collapse
//! into one check, since a stored `IMS.ADMIN.*` authority is itself just
//! another entry in the authority set that [`authority_matches`] will match
//! against any `IMS.*` resource.

use std::time::SystemTime;

use crate::domain_types::TxnCode;
use crate::error::SecurityError;
use crate::security::token::{SecurityContext, CONNECT_AUTHORITY};

const ADMIN_OVERRIDE: &str = "IMS.ADMIN.*";

/// A requested authority string matches a granted one if they're equal, or
/// the granted one ends in `*` and the requested one starts with the
/// stripped prefix (`"IMS.TXN.*"` matches `"IMS.TXN.BALINQ"`).
#[must_use]
pub fn authority_matches(granted: &str, requested: &str) -> bool {
    if granted == requested {
        return true;
    }
    granted.strip_suffix('*').is_some_and(|prefix| requested.starts_with(prefix))
}

fn is_ims_admin_resource(resource: &str) -> bool {
    resource.starts_with("IMS.")
}

/// External validation collaborator (e.g. a live RACF call), consulted last
/// if configured. Out of scope per spec.md §1; this crate only defines the
/// seam.
#[async_trait::async_trait]
pub trait ExternalAuthority: Send + Sync {
    /// Returns whether `ctx` is authorized for `resource` by the external
    /// system's own rules.
    async fn validate(&self, ctx: &SecurityContext, resource: &str) -> bool;
}

/// Gates transactions, accounts, and operations against a
/// [`SecurityContext`]'s authority set.
pub struct SecurityValidator {
    external: Option<Box<dyn ExternalAuthority>>,
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityValidator {
    /// A validator with no external collaborator; authority resolution stops
    /// at the group-derived business rules step.
    #[must_use]
    pub fn new() -> Self {
        Self { external: None }
    }

    /// A validator that falls back to `external` when local authority
    /// resolution does not grant access.
    #[must_use]
    pub fn with_external(external: Box<dyn ExternalAuthority>) -> Self {
        Self { external: Some(external) }
    }

    fn has_authority(ctx: &SecurityContext, resource: &str) -> bool {
        ctx.authorities.iter().any(|granted| authority_matches(granted, resource))
            || (is_ims_admin_resource(resource) && ctx.authorities.contains(ADMIN_OVERRIDE))
    }

    async fn authorized(&self, ctx: &SecurityContext, resource: &str) -> bool {
        if Self::has_authority(ctx, resource) {
            return true;
        }
        if let Some(external) = &self.external {
            return external.validate(ctx, resource).await;
        }
        false
    }

    /// Whether `ctx` may execute transaction `code`, i.e. holds
    /// `IMS.TXN.<code>` exactly, via a wildcard prefix, or via the admin
    /// override.
    pub async fn can_execute_transaction(&self, ctx: &SecurityContext, code: &TxnCode) -> bool {
        let resource = format!("IMS.TXN.{}", code.as_ref());
        self.authorized(ctx, &resource).await
    }

    /// Whether `ctx` may access `account`. Accounts are gated under the
    /// `IMS.ACCOUNT.<account>` namespace, same matching rules as
    /// transactions.
    pub async fn can_access_account(&self, ctx: &SecurityContext, account: &str) -> bool {
        let resource = format!("IMS.ACCOUNT.{account}");
        self.authorized(ctx, &resource).await
    }

    /// Whether `ctx` may perform `operation` on `resource`. The `"transfer"`
    /// operation additionally requires membership in an operator group
    /// (`BANKOPER`) and an explicit `BANKING.TRANSFER` grant, per spec.md's
    /// "group-derived business rules" resolution step.
    pub async fn can_perform_operation(
        &self,
        ctx: &SecurityContext,
        operation: &str,
        resource: &str,
    ) -> bool {
        if operation.eq_ignore_ascii_case("transfer") {
            let has_operator_group = ctx.group_set.iter().any(|g| g.eq_ignore_ascii_case("BANKOPER"));
            let has_transfer_grant =
                ctx.authorities.iter().any(|granted| authority_matches(granted, "BANKING.TRANSFER"));
            if has_operator_group && has_transfer_grant {
                return true;
            }
        }
        let qualified = format!("IMS.OP.{operation}.{resource}");
        self.authorized(ctx, &qualified).await
    }

    /// Minimum gate every request must pass regardless of transaction:
    /// `ctx` must not be expired and must hold `IMS.CONNECT`.
    pub fn validate_minimum(&self, ctx: &SecurityContext) -> Result<(), SecurityError> {
        if ctx.is_expired_at(SystemTime::now()) {
            return Err(SecurityError::TokenExpired);
        }
        if !ctx.authorities.contains(CONNECT_AUTHORITY) {
            return Err(SecurityError::UnauthorizedResource {
                user_id: ctx.user_id.clone(),
                resource: CONNECT_AUTHORITY.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::token::TokenKind;
    use std::collections::HashSet;
    use std::time::Duration;

    fn ctx(authorities: &[&str], groups: &[&str]) -> SecurityContext {
        SecurityContext {
            user_id: "ALICE".to_string(),
            primary_group: groups.first().copied().unwrap_or_default().to_string(),
            group_set: groups.iter().map(|g| (*g).to_string()).collect(),
            authorities: authorities.iter().map(|a| (*a).to_string()).collect::<HashSet<_>>(),
            issued_at: SystemTime::now(),
            expires_at: Some(SystemTime::now() + Duration::from_secs(3600)),
            issuer: "RACF".to_string(),
            token_kind: TokenKind::RacfPassword,
        }
    }

    #[tokio::test]
    async fn exact_authority_should_grant_execution() {
        let validator = SecurityValidator::new();
        let context = ctx(&["IMS.TXN.BALINQ", CONNECT_AUTHORITY], &["READONLY"]);
        let code = TxnCode::try_new("BALINQ").expect("valid");
        assert!(validator.can_execute_transaction(&context, &code).await);
    }

    #[tokio::test]
    async fn wildcard_authority_should_grant_execution() {
        let validator = SecurityValidator::new();
        let context = ctx(&["IMS.TXN.*", CONNECT_AUTHORITY], &["BANKADMIN"]);
        let code = TxnCode::try_new("WITHDRAW").expect("valid");
        assert!(validator.can_execute_transaction(&context, &code).await);
    }

    #[tokio::test]
    async fn admin_override_should_grant_any_ims_resource() {
        let validator = SecurityValidator::new();
        let context = ctx(&["IMS.ADMIN.*", CONNECT_AUTHORITY], &["BANKADMIN"]);
        let code = TxnCode::try_new("WITHDRAW").expect("valid");
        assert!(validator.can_execute_transaction(&context, &code).await);
    }

    #[tokio::test]
    async fn missing_authority_should_deny() {
        let validator = SecurityValidator::new();
        let context = ctx(&[CONNECT_AUTHORITY], &["READONLY"]);
        let code = TxnCode::try_new("WITHDRAW").expect("valid");
        assert!(!validator.can_execute_transaction(&context, &code).await);
    }

    #[tokio::test]
    async fn transfer_requires_operator_group_and_explicit_grant() {
        let validator = SecurityValidator::new();
        let operator = ctx(&["BANKING.TRANSFER", CONNECT_AUTHORITY], &["BANKOPER"]);
        assert!(validator.can_perform_operation(&operator, "transfer", "ACCT001").await);

        let non_operator = ctx(&["BANKING.TRANSFER", CONNECT_AUTHORITY], &["READONLY"]);
        assert!(!validator.can_perform_operation(&non_operator, "transfer", "ACCT001").await);
    }

    #[test]
    fn validate_minimum_should_reject_expired_tokens() {
        let validator = SecurityValidator::new();
        let mut context = ctx(&[CONNECT_AUTHORITY], &["READONLY"]);
        context.expires_at = Some(SystemTime::now() - Duration::from_secs(1));
        assert!(matches!(validator.validate_minimum(&context), Err(SecurityError::TokenExpired)));
    }

    #[test]
    fn validate_minimum_should_reject_missing_connect_authority() {
        let validator = SecurityValidator::new();
        let context = ctx(&["IMS.TXN.BALINQ"], &["READONLY"]);
        assert!(matches!(
            validator.validate_minimum(&context),
            Err(SecurityError::UnauthorizedResource { .. })
        ));
    }
}
