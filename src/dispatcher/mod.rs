//! The dispatcher (C11): classifies each decoded frame's message-type byte
//! into an [`InputKind`] and runs the routing table from spec.md §4.11,
//! wiring together the session manager (C4/C5/C6), the transaction manager
//! (C9, which itself owns C8), the security validator (C10), and the
//! handler registry.
//!
//! Grounded on the teacher's `MessageRouter::route` dispatch loop: a single
//! entry point that classifies, authenticates, selects a handler, and maps
//! every outcome - success or failure - onto a response the caller can send
//! back without itself touching any subsystem directly.

pub mod handler;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{instrument, warn};

use crate::codec::frame::DecodedFrame;
use crate::codec::response::{self, ResponseParams};
use crate::codec::segment::reassemble;
use crate::dispatcher::handler::{HandlerContext, HandlerRegistry};
use crate::domain_types::{ClientId, ConnectionId, ConvId, MaxSegmentSize};
use crate::error::{GatewayError, SecurityError, TransactionError};
use crate::security::token::{self, SecurityContext};
use crate::security::validator::SecurityValidator;
use crate::session::manager::SessionManager;
use crate::session::timeout_manager::TimeoutEvent;
use crate::transaction::manager::{MessageType, ResponseMsg, StartRequest, TransactionManager};

/// Message-type byte values this dispatcher assigns to each wire input kind.
///
/// spec.md §4.11 names the routing table by input kind but never pins the
/// header's message-type byte to concrete values; this table is this
/// crate's resolution of that gap, recorded in `DESIGN.md`. `0x40` matches
/// the `SEND_RECEIVE` value already exercised by the codec's own fixtures.
pub mod msg_type {
    /// Synchronous request/response.
    pub const SEND_RECEIVE: u8 = 0x40;
    /// Asynchronous request; reply is queued for a later `RECV_ONLY`.
    pub const SEND_ONLY: u8 = 0x41;
    /// Non-blocking poll of the client's queue.
    pub const RECV_ONLY: u8 = 0x42;
    /// Resumes a previously held conversational pipe; polls like `RECV_ONLY`.
    pub const RESUME_TPIPE: u8 = 0x43;
    /// Acknowledges the most recently delivered ack-required message.
    pub const ACK: u8 = 0x44;
    /// Negatively acknowledges the most recently delivered message.
    pub const NAK: u8 = 0x45;
    /// Releases the client id and closes the channel.
    pub const DEALLOCATE: u8 = 0x46;
    /// Cancels every pending C6 timer for the client.
    pub const CANCEL_TIMER: u8 = 0x47;
}

/// Bit `0x01` of `comm_flags`: the caller wants any existing holder of its
/// client id evicted rather than rejected. Resolution of spec.md S2's
/// "IRMF3CANCID-equivalent flag", recorded in `DESIGN.md`.
const CANCEL_ID_BIT: u8 = 0x01;
/// Bit `0x02` of `comm_flags` on a `NAK`: retain the message at the head of
/// its queue for immediate redelivery.
const NAK_RETAIN_BIT: u8 = 0x02;

/// The input kind a frame's message-type byte classifies into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Synchronous request/response.
    SendReceive,
    /// Asynchronous, queued reply.
    SendOnly,
    /// Non-blocking poll.
    RecvOnly,
    /// Resumes a held pipe; behaves like `RecvOnly`.
    ResumeTpipe,
    /// Acknowledges a delivered message.
    Ack,
    /// Negatively acknowledges a delivered message.
    Nak,
    /// Closes the channel after a success reply.
    Deallocate,
    /// Cancels a client's pending timers.
    CancelTimer,
    /// A message-type byte this dispatcher does not recognize.
    Unknown,
}

impl InputKind {
    fn from_msg_type(byte: u8) -> Self {
        match byte {
            msg_type::SEND_RECEIVE => InputKind::SendReceive,
            msg_type::SEND_ONLY => InputKind::SendOnly,
            msg_type::RECV_ONLY => InputKind::RecvOnly,
            msg_type::RESUME_TPIPE => InputKind::ResumeTpipe,
            msg_type::ACK => InputKind::Ack,
            msg_type::NAK => InputKind::Nak,
            msg_type::DEALLOCATE => InputKind::Deallocate,
            msg_type::CANCEL_TIMER => InputKind::CancelTimer,
            _ => InputKind::Unknown,
        }
    }
}

/// What the caller (the connection's write half) should do with a
/// dispatched frame's outcome.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Write this frame back to the client.
    Reply(Vec<u8>),
    /// Write this frame back, then close the connection (`DEALLOCATE`).
    ReplyThenClose(Vec<u8>),
    /// No response is owed on this connection (`ACK`/`NAK`).
    NoReply,
}

fn conversational_hint(frame: &DecodedFrame) -> bool {
    frame.otma.as_ref().is_some_and(|otma| otma.conv_id != 0 || otma.flags.first())
}

fn conv_id_from_otma(frame: &DecodedFrame) -> Option<ConvId> {
    frame.otma.as_ref().filter(|otma| otma.conv_id != 0).and_then(|otma| ConvId::try_new(u64::from(otma.conv_id)).ok())
}

/// Owns the subsystems a decoded frame is routed through and implements the
/// per-input-kind dispatch table.
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    transactions: TransactionManager,
    security: SecurityValidator,
    handlers: HandlerRegistry,
    max_segment_size: MaxSegmentSize,
}

impl Dispatcher {
    /// Builds a dispatcher over already-constructed subsystems, ready to be
    /// shared (via `Arc`) across every connection's task.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        transactions: TransactionManager,
        security: SecurityValidator,
        handlers: HandlerRegistry,
        max_segment_size: MaxSegmentSize,
    ) -> Arc<Self> {
        Arc::new(Self { sessions, transactions, security, handlers, max_segment_size })
    }

    /// The session manager (C4/C5/C6/C7) this dispatcher routes through,
    /// exposed so the connection-handling loop can open/close sessions
    /// around it.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Routes one decoded frame from `connection_id` to its input-kind
    /// handler, per spec.md §4.11's table.
    #[instrument(skip(self, frame), fields(msg_type = frame.irm.msg_type, txn_code = %frame.irm.txn_code.as_ref()))]
    pub async fn dispatch(self: &Arc<Self>, connection_id: ConnectionId, frame: DecodedFrame) -> DispatchOutcome {
        self.sessions.record_activity(connection_id);
        match InputKind::from_msg_type(frame.irm.msg_type) {
            InputKind::SendReceive => self.handle_send_receive(connection_id, frame).await,
            InputKind::SendOnly => self.handle_send_only(connection_id, frame).await,
            InputKind::RecvOnly | InputKind::ResumeTpipe => self.handle_recv_only(connection_id, &frame).await,
            InputKind::Ack => self.handle_ack(connection_id),
            InputKind::Nak => self.handle_nak(connection_id, &frame).await,
            InputKind::Deallocate => self.handle_deallocate(&frame),
            InputKind::CancelTimer => self.handle_cancel_timer(connection_id, &frame).await,
            InputKind::Unknown => {
                DispatchOutcome::Reply(response::error(&frame.irm, frame.otma.as_ref(), 12, 1, "Unsupported transaction type"))
            }
        }
    }

    fn error_reply(&self, frame: &DecodedFrame, err: &GatewayError) -> DispatchOutcome {
        let reason = err.return_reason();
        DispatchOutcome::Reply(response::error(
            &frame.irm,
            frame.otma.as_ref(),
            reason.return_code,
            reason.reason_code,
            &err.user_message(),
        ))
    }

    fn authenticate(&self, frame: &DecodedFrame) -> Result<SecurityContext, GatewayError> {
        let ctx = token::parse(&frame.irm)?;
        self.security.validate_minimum(&ctx)?;
        Ok(ctx)
    }

    /// Resolves the effective client id for a request carrying (or not
    /// carrying) a client id, handling the duplicate-kill flow. Returns the
    /// id to report back via `*GENCID*` (only when freshly generated) and
    /// the id to run the request under.
    fn resolve_client_id(&self, connection_id: ConnectionId, frame: &DecodedFrame) -> (Option<ClientId>, ClientId) {
        let cancel_existing = frame.irm.comm_flags & CANCEL_ID_BIT != 0;
        if let Some(client_id) = &frame.irm.client_id {
            match self.sessions.client_ids().handle_duplicate(client_id.clone(), connection_id, cancel_existing) {
                Ok(_evicted) => {
                    self.sessions.bind_client_id(connection_id, client_id.clone());
                    return (None, client_id.clone());
                }
                Err(_) => {
                    warn!(%client_id, "duplicate client id rejected; issuing a fresh one");
                }
            }
        }
        let generated = self.sessions.client_ids().generate();
        let _ = self.sessions.client_ids().register(generated.clone(), connection_id);
        self.sessions.bind_client_id(connection_id, generated.clone());
        (Some(generated.clone()), generated)
    }

    #[instrument(skip(self, frame), fields(txn_code = %frame.irm.txn_code.as_ref()))]
    async fn handle_send_receive(self: &Arc<Self>, connection_id: ConnectionId, frame: DecodedFrame) -> DispatchOutcome {
        let conversational = conversational_hint(&frame);
        let Some(selected) = self.handlers.select(&frame.irm.txn_code, &frame.irm.lterm, conversational) else {
            return self.error_reply(
                &frame,
                &GatewayError::Transaction(TransactionError::HandlerNotFound(frame.irm.txn_code.as_ref().to_string())),
            );
        };

        let security = if selected.requires_security() {
            match self.authenticate(&frame) {
                Ok(ctx) => Some(ctx),
                Err(err) => return self.error_reply(&frame, &err),
            }
        } else {
            None
        };
        if let Some(ctx) = &security {
            if !self.security.can_execute_transaction(ctx, &frame.irm.txn_code).await {
                let err = GatewayError::Security(SecurityError::UnauthorizedResource {
                    user_id: ctx.user_id.clone(),
                    resource: format!("IMS.TXN.{}", frame.irm.txn_code.as_ref()),
                });
                return self.error_reply(&frame, &err);
            }
        }

        let (generated_client_id, effective_client_id) = self.resolve_client_id(connection_id, &frame);
        let payload = reassemble(&frame.segments);
        let message_type = if conversational { MessageType::Conversational } else { MessageType::Transaction };

        let start_request = StartRequest {
            client_id: effective_client_id.clone(),
            txn_code: frame.irm.txn_code.clone(),
            lterm: frame.irm.lterm.clone(),
            message_type,
            conv_id: conv_id_from_otma(&frame),
            request_msg: payload.clone(),
            request_irm: frame.irm.clone(),
            request_otma: frame.otma.clone(),
        };
        let txn_state = match self.transactions.start(start_request) {
            Ok(state) => state,
            Err(err) => return self.error_reply(&frame, &err),
        };

        self.sessions.timeouts.start(txn_state.txn_id.clone(), effective_client_id.clone(), frame.irm.timeout_byte);
        let ctx = HandlerContext {
            client_id: effective_client_id,
            lterm: frame.irm.lterm.clone(),
            txn_code: frame.irm.txn_code.clone(),
            payload,
            conv_id: txn_state.conv_id,
            security,
        };
        let outcome = selected.handle(&ctx).await;
        self.sessions.timeouts.cancel(txn_state.txn_id.clone());

        match outcome {
            Ok(response) => {
                if let Err(err) = self.transactions.complete(&txn_state.txn_id, response.clone()) {
                    return self.error_reply(&frame, &err);
                }
                let generated = if frame.irm.client_id_requested() { generated_client_id } else { None };
                let params = ResponseParams { generated_client_id: generated, mod_name: None, data: vec![response.payload] };
                DispatchOutcome::Reply(response::success(&frame.irm, frame.otma.as_ref(), &params, self.max_segment_size))
            }
            Err(reason) => {
                let _ = self.transactions.abort(&txn_state.txn_id, reason.clone());
                DispatchOutcome::Reply(response::error(&frame.irm, frame.otma.as_ref(), 16, 1, &reason))
            }
        }
    }

    #[instrument(skip(self, frame), fields(txn_code = %frame.irm.txn_code.as_ref()))]
    async fn handle_send_only(self: &Arc<Self>, connection_id: ConnectionId, frame: DecodedFrame) -> DispatchOutcome {
        let conversational = conversational_hint(&frame);
        let Some(selected) = self.handlers.select(&frame.irm.txn_code, &frame.irm.lterm, conversational) else {
            return self.error_reply(
                &frame,
                &GatewayError::Transaction(TransactionError::HandlerNotFound(frame.irm.txn_code.as_ref().to_string())),
            );
        };

        let (generated_client_id, effective_client_id) = self.resolve_client_id(connection_id, &frame);
        let ack_client_id = if frame.irm.client_id_requested() { generated_client_id.as_ref() } else { None };
        let ack = response::ack(&frame.irm, frame.otma.as_ref(), ack_client_id);

        let dispatcher = Arc::clone(self);
        let irm = frame.irm.clone();
        let otma = frame.otma.clone();
        let payload = reassemble(&frame.segments);
        let conv_id = conv_id_from_otma(&frame);
        let message_type = if conversational { MessageType::Conversational } else { MessageType::Transaction };

        tokio::spawn(async move {
            let security = if selected.requires_security() {
                match token::parse(&irm).and_then(|ctx| dispatcher.security.validate_minimum(&ctx).map(|()| ctx)) {
                    Ok(ctx) => Some(ctx),
                    Err(err) => {
                        let err = GatewayError::Security(err);
                        let reason = err.return_reason();
                        let frame_bytes =
                            response::error(&irm, otma.as_ref(), reason.return_code, reason.reason_code, &err.user_message());
                        let _ = dispatcher.sessions.queue.enqueue(&effective_client_id, frame_bytes, true).await;
                        return;
                    }
                }
            } else {
                None
            };
            if let Some(ctx) = &security {
                if !dispatcher.security.can_execute_transaction(ctx, &irm.txn_code).await {
                    let err = GatewayError::Security(SecurityError::UnauthorizedResource {
                        user_id: ctx.user_id.clone(),
                        resource: format!("IMS.TXN.{}", irm.txn_code.as_ref()),
                    });
                    let reason = err.return_reason();
                    let frame_bytes =
                        response::error(&irm, otma.as_ref(), reason.return_code, reason.reason_code, &err.user_message());
                    let _ = dispatcher.sessions.queue.enqueue(&effective_client_id, frame_bytes, true).await;
                    return;
                }
            }

            let start_request = StartRequest {
                client_id: effective_client_id.clone(),
                txn_code: irm.txn_code.clone(),
                lterm: irm.lterm.clone(),
                message_type,
                conv_id,
                request_msg: payload.clone(),
                request_irm: irm.clone(),
                request_otma: otma.clone(),
            };
            let txn_state = match dispatcher.transactions.start(start_request) {
                Ok(state) => state,
                Err(err) => {
                    let reason = err.return_reason();
                    let frame_bytes =
                        response::error(&irm, otma.as_ref(), reason.return_code, reason.reason_code, &err.user_message());
                    let _ = dispatcher.sessions.queue.enqueue(&effective_client_id, frame_bytes, true).await;
                    return;
                }
            };

            let ctx = HandlerContext {
                client_id: effective_client_id.clone(),
                lterm: irm.lterm.clone(),
                txn_code: irm.txn_code.clone(),
                payload,
                conv_id: txn_state.conv_id,
                security,
            };
            let frame_bytes = match selected.handle(&ctx).await {
                Ok(response) => {
                    let _ = dispatcher.transactions.complete(&txn_state.txn_id, response.clone());
                    let params = ResponseParams { data: vec![response.payload], ..Default::default() };
                    response::success(&irm, otma.as_ref(), &params, dispatcher.max_segment_size)
                }
                Err(reason) => {
                    let _ = dispatcher.transactions.abort(&txn_state.txn_id, reason.clone());
                    response::error(&irm, otma.as_ref(), 16, 1, &reason)
                }
            };
            if let Err(err) = dispatcher.sessions.queue.enqueue(&effective_client_id, frame_bytes, true).await {
                warn!(%err, "failed to enqueue send-only result");
            }
        });

        DispatchOutcome::Reply(ack)
    }

    #[instrument(skip(self, frame))]
    async fn handle_recv_only(&self, connection_id: ConnectionId, frame: &DecodedFrame) -> DispatchOutcome {
        let Some(client_id) = self.sessions.session(connection_id).and_then(|session| session.client_id) else {
            return DispatchOutcome::Reply(response::empty_trailer(&frame.irm));
        };
        match self.sessions.queue.poll(&client_id, std::time::Duration::ZERO).await {
            Some(message) => {
                if message.requires_ack {
                    self.sessions.record_delivery(connection_id, message.msg_id, message.response_payload.clone());
                }
                DispatchOutcome::Reply(message.response_payload)
            }
            None => DispatchOutcome::Reply(response::empty_trailer(&frame.irm)),
        }
    }

    #[instrument(skip(self))]
    fn handle_ack(&self, connection_id: ConnectionId) -> DispatchOutcome {
        if let Some((msg_id, _payload)) = self.sessions.take_pending_ack(connection_id) {
            self.sessions.queue.ack(msg_id);
        }
        DispatchOutcome::NoReply
    }

    #[instrument(skip(self, frame))]
    async fn handle_nak(&self, connection_id: ConnectionId, frame: &DecodedFrame) -> DispatchOutcome {
        let retain = frame.irm.comm_flags & NAK_RETAIN_BIT != 0;
        if let Some(client_id) = self.sessions.session(connection_id).and_then(|session| session.client_id) {
            if let Some((msg_id, payload)) = self.sessions.take_pending_ack(connection_id) {
                self.sessions.queue.nak(msg_id, &client_id, retain, payload).await;
            }
        }
        DispatchOutcome::NoReply
    }

    #[instrument(skip(self, frame))]
    fn handle_deallocate(&self, frame: &DecodedFrame) -> DispatchOutcome {
        let params = ResponseParams::default();
        let reply = response::success(&frame.irm, frame.otma.as_ref(), &params, self.max_segment_size);
        DispatchOutcome::ReplyThenClose(reply)
    }

    #[instrument(skip(self, frame))]
    async fn handle_cancel_timer(&self, connection_id: ConnectionId, frame: &DecodedFrame) -> DispatchOutcome {
        if let Some(client_id) = self.sessions.session(connection_id).and_then(|session| session.client_id) {
            self.sessions.timeouts.cancel_client(client_id).await;
        }
        let params = ResponseParams::default();
        DispatchOutcome::Reply(response::success(&frame.irm, frame.otma.as_ref(), &params, self.max_segment_size))
    }

    /// Drains `events` (the C6 timer wheel's fired-timeout stream) for the
    /// lifetime of the dispatcher, turning each firing into a framed 408/1
    /// error queued for the owning client's next poll, per spec.md S6. The
    /// originating IRM/OTMA headers come from the transaction's own retained
    /// copy, since the firing carries only the transaction and client id.
    pub fn spawn_timeout_listener(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TimeoutEvent>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Ok(state) = dispatcher.transactions.get(&event.txn_id) else { continue };
                let frame_bytes =
                    response::error(&state.request_irm, state.request_otma.as_ref(), 408, 1, "transaction timed out");
                if let Err(err) = dispatcher.transactions.abort(&event.txn_id, "transaction timed out") {
                    warn!(%err, txn_id = %event.txn_id, "failed to abort timed-out transaction");
                }
                if let Err(err) = dispatcher.sessions.queue.enqueue(&event.client, frame_bytes, true).await {
                    warn!(%err, client = %event.client, "failed to enqueue timeout error frame");
                }
            }
        });
    }
}
