//! Method call forwarding.
//!
//! Inbound invocations on the façade are re-issued against the real service
//! on the source bus. Each forwarded call is recorded as a pending call until
//! its reply, error, or timeout settles it; the invocation is answered exactly
//! once, from whichever of those happens first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};
use zbus::{Connection, Message};

use crate::endpoint::ServiceDescriptor;
use crate::error::{ForwardError, Result};
use crate::message::{error_names, ErrorBuilder, MessageExt, MethodReturnBuilder, Payload};

/// Identifier of an in-flight forwarded call.
pub type CallId = u64;

/// Information about a forwarded method call awaiting its outcome.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Who invoked the façade.
    pub caller: Option<String>,
    /// The serial number the caller used.
    pub caller_serial: u32,
    pub interface: String,
    pub member: String,
    /// When the call was forwarded.
    pub issued: Instant,
}

/// Correlates forwarded calls with the invocations they answer.
#[derive(Debug, Default)]
pub struct PendingCalls {
    pending: HashMap<CallId, PendingCall>,
    next_id: CallId,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending call and return its id.
    pub fn insert(&mut self, call: PendingCall) -> CallId {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(id, call);
        id
    }

    /// Remove a pending call.
    ///
    /// Only the first resolution of an id returns the record; every later
    /// attempt gets `None`.
    pub fn resolve(&mut self, id: CallId) -> Option<PendingCall> {
        self.pending.remove(&id)
    }

    /// Get the number of pending calls.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if there are no pending calls.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Await `call`, giving up after `timeout` if one is set.
pub async fn with_timeout<F, T>(
    timeout: Option<Duration>,
    call: F,
) -> std::result::Result<T, ForwardError>
where
    F: Future<Output = zbus::Result<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(ForwardError::from),
            Err(_) => Err(ForwardError::Timeout(limit)),
        },
        None => call.await.map_err(ForwardError::from),
    }
}

fn lock(pending: &Mutex<PendingCalls>) -> MutexGuard<'_, PendingCalls> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drive one forwarded call to its outcome and resolve its pending record.
///
/// Returns `None` if the record had already been resolved, in which case the
/// outcome must not be delivered.
pub async fn settle<F>(
    pending: &Mutex<PendingCalls>,
    id: CallId,
    timeout: Option<Duration>,
    call: F,
) -> Option<(PendingCall, std::result::Result<Message, ForwardError>)>
where
    F: Future<Output = zbus::Result<Message>>,
{
    let outcome = with_timeout(timeout, call).await;
    let record = lock(pending).resolve(id)?;
    Some((record, outcome))
}

/// Build the error reply that answers `invocation` for a failed relay.
///
/// Errors from the source service keep their name and body.
pub fn error_reply(invocation: &Message, error: &ForwardError) -> Result<Message> {
    match error {
        ForwardError::Remote { name, reply, .. } => {
            ErrorBuilder::new(invocation, name.as_str()).build_payload(&Payload::of(reply))
        }
        ForwardError::Timeout(limit) => ErrorBuilder::new(invocation, error_names::TIMEOUT)
            .build(&format!("Forwarded call timed out after {} ms", limit.as_millis())),
        ForwardError::Transport(e) => {
            ErrorBuilder::new(invocation, error_names::FAILED).build(&e.to_string())
        }
    }
}

/// Build the reply that answers `invocation` for a relay outcome.
pub fn reply_for(
    invocation: &Message,
    outcome: &std::result::Result<Message, ForwardError>,
) -> Result<Message> {
    match outcome {
        Ok(reply) => MethodReturnBuilder::new(invocation).build_payload(&Payload::of(reply)),
        Err(e) => error_reply(invocation, e),
    }
}

/// Relays façade method calls to the source service.
#[derive(Debug, Clone)]
pub struct CallForwarder {
    service: ServiceDescriptor,
    source: Connection,
    target: Connection,
    timeout: Option<Duration>,
    pending: Arc<Mutex<PendingCalls>>,
}

impl CallForwarder {
    pub fn new(
        service: ServiceDescriptor,
        source: Connection,
        target: Connection,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            service,
            source,
            target,
            timeout,
            pending: Arc::new(Mutex::new(PendingCalls::new())),
        }
    }

    /// Number of forwarded calls still awaiting an outcome.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Forward `invocation` to the source service.
    ///
    /// Returns immediately; the reply is sent on the target bus from a
    /// separate task once the forwarded call settles.
    pub fn forward(&self, invocation: Message, interface: String, member: String) -> CallId {
        let id = lock(&self.pending).insert(PendingCall {
            caller: invocation.sender_str(),
            caller_serial: invocation.serial(),
            interface: interface.clone(),
            member: member.clone(),
            issued: Instant::now(),
        });

        debug!(
            call_id = id,
            interface = %interface,
            member = %member,
            caller = ?invocation.sender_str(),
            service = %self.service.name,
            "Forwarding method call"
        );

        let forwarder = self.clone();
        tokio::spawn(async move {
            let payload = Payload::of(&invocation);
            let call = payload.call(
                &forwarder.source,
                &forwarder.service.name,
                &forwarder.service.object_path,
                Some(interface.as_str()),
                &member,
            );
            let Some((record, outcome)) =
                settle(&forwarder.pending, id, forwarder.timeout, call).await
            else {
                return;
            };
            forwarder.complete(id, record, &invocation, outcome).await;
        });

        id
    }

    async fn complete(
        &self,
        id: CallId,
        record: PendingCall,
        invocation: &Message,
        outcome: std::result::Result<Message, ForwardError>,
    ) {
        match &outcome {
            Ok(_) => trace!(
                call_id = id,
                member = %record.member,
                elapsed_ms = record.issued.elapsed().as_millis() as u64,
                "Forwarded call succeeded"
            ),
            Err(e) => warn!(
                call_id = id,
                interface = %record.interface,
                member = %record.member,
                error = %e,
                "Forwarded call failed"
            ),
        }

        if !invocation.expects_reply() {
            trace!(call_id = id, "Caller expects no reply");
            return;
        }

        let reply = match reply_for(invocation, &outcome) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(call_id = id, error = %e, "Failed to relay reply body");
                match ErrorBuilder::new(invocation, error_names::FAILED)
                    .build(&format!("Failed to relay reply: {}", e))
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(call_id = id, error = %e, "Failed to create error reply");
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.target.send(&reply).await {
            warn!(call_id = id, caller = ?record.caller, error = %e, "Failed to send reply to caller");
        }
    }
}
