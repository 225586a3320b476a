//! Per-connection outbound task

use super::Subscriber;
use futures::{Sink, SinkExt};
use ridealert_common::CorrectedFix;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Why [`forward_to_sink`] stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardEnd {
    /// The hub removed the subscription
    Unsubscribed,
    /// The sink failed; the peer is gone
    SinkClosed(String),
    /// One send took longer than the timeout
    SendTimeout,
}

/// Drain `subscriber` into `sink` until either side goes away
///
/// Each send is bounded by `send_timeout`; a stalled peer ends the task
/// instead of holding the queue. `encode` turns a fix into a sink item,
/// returning `None` to skip it. The subscription is removed from the hub on
/// return.
pub async fn forward_to_sink<S, M, F>(
    mut subscriber: Subscriber,
    mut sink: S,
    send_timeout: Duration,
    mut encode: F,
) -> ForwardEnd
where
    S: Sink<M> + Unpin,
    S::Error: fmt::Display,
    F: FnMut(&CorrectedFix) -> Option<M>,
{
    let connection_id = subscriber.handle().connection();

    let end = loop {
        let Some(fix) = subscriber.recv().await else {
            break ForwardEnd::Unsubscribed;
        };
        let Some(item) = encode(&fix) else {
            continue;
        };

        match tokio::time::timeout(send_timeout, sink.send(item)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => break ForwardEnd::SinkClosed(e.to_string()),
            Err(_) => break ForwardEnd::SendTimeout,
        }
    };

    match &end {
        ForwardEnd::SendTimeout => warn!(
            connection_id = %connection_id,
            timeout_ms = send_timeout.as_millis() as u64,
            "Send to subscriber timed out, disconnecting"
        ),
        ForwardEnd::SinkClosed(reason) => {
            debug!(connection_id = %connection_id, reason = %reason, "Subscriber sink closed")
        }
        ForwardEnd::Unsubscribed => {
            debug!(connection_id = %connection_id, "Subscription ended")
        }
    }

    drop(subscriber);
    end
}
