// src/connection/handler.rs

//! Per-connection I/O worker. Reads exactly one request frame, authenticates
//! the peer, hands the request to the scheduler, then waits for the
//! scheduler to push back a reply — possibly a `203` continuation followed
//! later by a terminal frame, if the request blocked.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::core::errors::QManagerError;
use crate::core::identity;
use crate::core::protocol::{Frame, FrameCodec, Value, Verb};
use crate::core::session::{SchedulerMessage, Session};

/// Entry point spawned by the accept loop for every connection. Logs and
/// swallows errors: a misbehaving client must never take down the server.
pub async fn handle_connection(
    stream: UnixStream,
    session_id: u64,
    scheduler_tx: mpsc::UnboundedSender<SchedulerMessage>,
) {
    if let Err(e) = run(stream, session_id, scheduler_tx).await {
        warn!(session_id, error = %e, "connection handler exited with an error");
    }
}

async fn run(
    stream: UnixStream,
    session_id: u64,
    scheduler_tx: mpsc::UnboundedSender<SchedulerMessage>,
) -> Result<(), QManagerError> {
    let peer = identity::peer_credentials(&stream)?;
    let mut framed = Framed::new(stream, FrameCodec);

    let Some(frame_result) = framed.next().await else {
        debug!(session_id, "client disconnected before sending a request");
        return Ok(());
    };
    let frame = frame_result?;

    let proxied_uid = frame.get("uid").and_then(Value::as_str);
    let proxied_gids = frame.get("gids").and_then(Value::as_string_list);
    let principal = identity::apply_root_proxy(peer, proxied_uid, proxied_gids.as_deref())?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let session = Session {
        id: session_id,
        principal,
        out_tx,
    };

    if scheduler_tx
        .send(SchedulerMessage::Request { session, frame })
        .is_err()
    {
        return Err(QManagerError::Internal("scheduler is not running".into()));
    }

    loop {
        tokio::select! {
            biased;
            reply = out_rx.recv() => {
                let Some(reply) = reply else {
                    return Ok(());
                };
                let keep_waiting = matches!(reply.verb, Verb::Status(203));
                framed.send(reply).await?;
                if !keep_waiting {
                    return Ok(());
                }
            }
            next = framed.next() => {
                match next {
                    None | Some(Err(_)) => {
                        debug!(session_id, "client disconnected while its job was blocked");
                        let _ = scheduler_tx.send(SchedulerMessage::Cancel { session_id });
                        return Ok(());
                    }
                    Some(Ok(_)) => {
                        debug!(session_id, "ignoring unexpected frame on a blocked connection");
                    }
                }
            }
        }
    }
}
