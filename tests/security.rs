//! Crate-level integration coverage of C10: parsing a `SecurityContext` off
//! a decoded IRM header and gating it through `SecurityValidator`, the way
//! `Dispatcher::authenticate` chains the two in production.

use ims_connect_gateway::codec::frame::IrmHeader;
use ims_connect_gateway::domain_types::{ArchitectureLevel, LtermName, TxnCode};
use ims_connect_gateway::error::SecurityError;
use ims_connect_gateway::security::token::{self, TokenKind};
use ims_connect_gateway::security::validator::authority_matches;
use ims_connect_gateway::security::SecurityValidator;

fn irm(user_id: &str, group_id: &str, password: &str, txn_code: &str) -> IrmHeader {
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
        sync_flags: 0,
        msg_type: 0x40,
        txn_code: TxnCode::try_new(txn_code).expect("valid"),
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

#[tokio::test]
async fn a_teller_can_execute_their_granted_transaction_but_not_a_transfer() {
    let irm = irm("ALICE", "BANKOPER", "secret", "BALINQ");
    let ctx = token::parse(&irm).expect("parses");
    assert_eq!(ctx.token_kind, TokenKind::RacfPassword);

    let validator = SecurityValidator::new();
    validator.validate_minimum(&ctx).expect("holds IMS.CONNECT and is unexpired");

    let balinq = TxnCode::try_new("BALINQ").expect("valid");
    assert!(validator.can_execute_transaction(&ctx, &balinq).await);

    assert!(
        !validator.can_perform_operation(&ctx, "transfer", "ACCT001").await,
        "a teller without the BANKING.TRANSFER grant must not be able to transfer"
    );
}

#[tokio::test]
async fn a_bank_admin_holds_the_wildcard_and_passes_any_ims_resource_check() {
    let irm = irm("ADMIN01", "BANKADMIN", "secret", "WITHDRAW");
    let ctx = token::parse(&irm).expect("parses");

    let validator = SecurityValidator::new();
    let withdraw = TxnCode::try_new("WITHDRAW").expect("valid");
    assert!(validator.can_execute_transaction(&ctx, &withdraw).await);
    assert!(validator.can_access_account(&ctx, "ACCT999").await, "IMS.ADMIN.* covers IMS.ACCOUNT.* too");
}

#[tokio::test]
async fn a_readonly_user_cannot_execute_a_transaction_outside_their_grants() {
    let irm = irm("READER1", "READONLY", "secret", "WITHDRAW");
    let ctx = token::parse(&irm).expect("parses");

    let validator = SecurityValidator::new();
    let withdraw = TxnCode::try_new("WITHDRAW").expect("valid");
    assert!(!validator.can_execute_transaction(&ctx, &withdraw).await);

    let balinq = TxnCode::try_new("BALINQ").expect("valid");
    assert!(validator.can_execute_transaction(&ctx, &balinq).await, "READONLY still grants BALINQ");
}

#[test]
fn password_auth_requires_a_non_empty_user_id_and_password() {
    let irm = irm("", "BANKOPER", "", "BALINQ");
    assert!(matches!(token::parse(&irm), Err(SecurityError::TokenParse { .. })));
}

#[test]
fn a_passticket_flagged_request_expires_no_later_than_a_password_token() {
    let mut passticket_irm = irm("ALICE", "BANKOPER", "", "BALINQ");
    passticket_irm.sync_flags = 0x01;
    let passticket_ctx = token::parse(&passticket_irm).expect("parses");
    assert_eq!(passticket_ctx.token_kind, TokenKind::RacfPassticket);

    let password_ctx = token::parse(&irm("ALICE", "BANKOPER", "secret", "BALINQ")).expect("parses");
    let passticket_life = passticket_ctx.expires_at.expect("expires").duration_since(passticket_ctx.issued_at).expect("monotonic");
    let password_life = password_ctx.expires_at.expect("expires").duration_since(password_ctx.issued_at).expect("monotonic");
    assert!(passticket_life <= password_life, "a passticket should not outlive a password credential");
}

#[test]
fn an_unsupported_auth_method_is_reported_rather_than_silently_downgraded() {
    let mut irm = irm("ALICE", "BANKOPER", "secret", "BALINQ");
    irm.sync_flags = 0x02;
    assert!(matches!(token::parse(&irm), Err(SecurityError::UnsupportedAuth { .. })));
}

#[test]
fn wildcard_prefix_matching_is_exposed_as_a_standalone_predicate() {
    assert!(authority_matches("IMS.TXN.*", "IMS.TXN.BALINQ"));
    assert!(!authority_matches("IMS.TXN.*", "IMS.ADMIN.RESET"));
    assert!(authority_matches("IMS.CONNECT", "IMS.CONNECT"));
}
