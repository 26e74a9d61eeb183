//! Crate-level dispatcher coverage beyond its own inline unit tests: the S6
//! timeout-to-error-frame wiring (`Dispatcher::spawn_timeout_listener`) and
//! `CANCEL_TIMER` actually preventing a later firing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ims_connect_gateway::codec::frame::{decode_frame, DecodedFrame, IrmHeader};
use ims_connect_gateway::codec::segment::{segment_payload, SegmentKind};
use ims_connect_gateway::conversation::ConversationManager;
use ims_connect_gateway::dispatcher::handler::{HandlerContext, HandlerRegistry, TransactionHandler};
use ims_connect_gateway::dispatcher::{msg_type, DispatchOutcome, Dispatcher};
use ims_connect_gateway::domain_types::{
    ArchitectureLevel, ClientId, ConversationHistoryCap, LtermName, MaxConversations, MaxSegmentSize, QueueCapacity,
    TxnCode,
};
use ims_connect_gateway::security::SecurityValidator;
use ims_connect_gateway::session::SessionManager;
use ims_connect_gateway::transaction::{ResponseMsg, TransactionManager};
use tokio_util::sync::CancellationToken;

struct NeverRespondsHandler;

#[async_trait]
impl TransactionHandler for NeverRespondsHandler {
    fn can_handle(&self, txn_code: &TxnCode) -> bool {
        txn_code.as_ref() == "SLOW0001"
    }
    fn requires_security(&self) -> bool {
        false
    }
    async fn handle(&self, _ctx: &HandlerContext) -> Result<ResponseMsg, String> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(ResponseMsg { payload: b"too late".to_vec(), last: true })
    }
}

fn build_dispatcher() -> (Arc<Dispatcher>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let (sessions, timeout_events) = SessionManager::spawn(QueueCapacity::default(), 30, 3600, shutdown.clone());
    let conversations =
        ConversationManager::spawn(MaxConversations::default(), ConversationHistoryCap::default(), shutdown.clone());
    let transactions = TransactionManager::new(conversations);
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(NeverRespondsHandler));
    let dispatcher =
        Dispatcher::new(sessions, transactions, SecurityValidator::new(), handlers, MaxSegmentSize::default());
    dispatcher.spawn_timeout_listener(timeout_events);
    (dispatcher, shutdown)
}

fn irm(msg_type: u8, txn_code: &str, client_id: &str, comm_flags: u8, timeout_byte: u8) -> IrmHeader {
    IrmHeader {
        architecture: ArchitectureLevel::try_from(0).expect("valid"),
        comm_flags,
        irm_id: "IRMID001".to_string(),
        nak_reason: 0,
        input_flags: 0x01,
        timeout_byte,
        conn_type: 0,
        encoding: 0,
        client_id: Some(ClientId::try_new(client_id).expect("valid")),
        user_flags1: 0,
        commit_mode: 0,
        sync_flags: 0,
        msg_type,
        txn_code: TxnCode::try_new(txn_code).expect("valid"),
        destination: String::new(),
        lterm: LtermName::try_new("LTERM001").expect("valid"),
        user_id: String::new(),
        group_id: String::new(),
        password: String::new(),
        application_name: String::new(),
        reroute_name: String::new(),
        tag_adapter: String::new(),
        tag_map: String::new(),
        mod_name: String::new(),
    }
}

fn frame_for(irm: IrmHeader, payload: &[u8]) -> DecodedFrame {
    let segments = segment_payload(payload, MaxSegmentSize::default(), SegmentKind::Input);
    DecodedFrame { irm, otma: None, segments }
}

#[tokio::test]
async fn a_transaction_whose_handler_never_returns_in_time_gets_a_408_queued() {
    let (dispatcher, shutdown) = build_dispatcher();
    let connection_id = dispatcher.sessions().open_session();
    let client_id = ClientId::try_new("COBOL777").expect("valid");

    let frame = frame_for(irm(msg_type::SEND_RECEIVE, "SLOW0001", "COBOL777", 0, 1), b"");
    let dispatch_dispatcher = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        let _ = dispatch_dispatcher.dispatch(connection_id, frame).await;
    });

    let message = tokio::time::timeout(Duration::from_secs(4), async {
        loop {
            if let Some(message) = dispatcher.sessions().queue.poll(&client_id, Duration::ZERO).await {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("a timeout error frame should have been queued within 4 seconds");

    let decoded = decode_frame(&message.response_payload).expect("decodes");
    let payload = &decoded.segments[0].data[8..];
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 408);
    assert_eq!(u16::from_be_bytes([payload[2], payload[3]]), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn cancel_timer_prevents_a_later_timeout_firing() {
    let (dispatcher, shutdown) = build_dispatcher();
    let connection_id = dispatcher.sessions().open_session();
    let client_id = ClientId::try_new("COBOL778").expect("valid");

    let frame = frame_for(irm(msg_type::SEND_RECEIVE, "SLOW0001", "COBOL778", 0, 1), b"");
    let dispatch_dispatcher = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        let _ = dispatch_dispatcher.dispatch(connection_id, frame).await;
    });

    // Give the handler time to register its timer, then cancel it before it fires.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancel_frame = frame_for(irm(msg_type::CANCEL_TIMER, "SLOW0001", "COBOL778", 0, 0), b"");
    let outcome = dispatcher.dispatch(connection_id, cancel_frame).await;
    assert!(matches!(outcome, DispatchOutcome::Reply(_)));

    let result = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if dispatcher.sessions().queue.poll(&client_id, Duration::ZERO).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_err(), "cancelling the timer should prevent the 408 from ever being queued");

    shutdown.cancel();
}
