//! Per-session pump between the bounded queues and the channel.
//!
//! Two loops run as siblings: egress drains the outbound queue into the
//! channel, ingress feeds decoded packets into the inbound queue. The first
//! loop to fail cancels the other through the session's token; a clean end
//! on one side (half-close) leaves the other running.
//!
//! The first error is latched into a slot shared with the session handle,
//! where the next `recv` picks it up.

use std::io::ErrorKind;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use strand_wire::{CodecError, Packet, PacketCodec};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::transport::BoxedChannel;
use crate::{Error, Result};

pub(crate) type FailureSlot = Arc<Mutex<Option<Error>>>;

pub(crate) fn spawn(
    name: String,
    channel: BoxedChannel,
    outbound: mpsc::Receiver<Packet>,
    inbound: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    failure: FailureSlot,
) {
    drop(tokio::spawn(run(
        name, channel, outbound, inbound, cancel, failure,
    )));
}

async fn run(
    name: String,
    channel: BoxedChannel,
    outbound: mpsc::Receiver<Packet>,
    inbound: mpsc::Sender<Packet>,
    cancel: CancellationToken,
    failure: FailureSlot,
) {
    let (reader, writer) = tokio::io::split(channel);

    let mut tasks = JoinSet::new();

    let _handle = {
        let cancel = cancel.clone();
        tasks.spawn(egress(
            FramedWrite::new(writer, PacketCodec::new()),
            outbound,
            cancel,
        ))
    };
    let _handle = {
        let cancel = cancel.clone();
        tasks.spawn(ingress(
            FramedRead::new(reader, PacketCodec::new()),
            inbound,
            cancel,
        ))
    };

    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|err| Err(Error::Io(std::io::Error::other(err))));

        if let Err(err) = result {
            error!(session = %name, %err, "session stream failed");

            {
                let mut slot = failure.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(err);
                }
            }

            // Latched before the cancel so a waiter woken by the token
            // finds the error in place. Whichever loop fails first takes
            // its sibling down with it.
            cancel.cancel();
        }
    }
}

async fn egress(
    mut sink: FramedWrite<WriteHalf<BoxedChannel>, PacketCodec>,
    mut outbound: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ignored = sink.close().await;
                return Ok(());
            }
            maybe = outbound.recv() => match maybe {
                Some(packet) => {
                    if let Err(err) = sink.send(packet).await {
                        if peer_hung_up(&err) {
                            debug!("write channel is closed");
                            return Ok(());
                        }
                        return Err(Error::Wire(err));
                    }
                }
                None => {
                    // Queue closed and drained; half-close so the peer sees
                    // end-of-stream.
                    let _ignored = sink.close().await;
                    return Ok(());
                }
            }
        }
    }
}

async fn ingress(
    mut stream: FramedRead<ReadHalf<BoxedChannel>, PacketCodec>,
    inbound: mpsc::Sender<Packet>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            maybe = stream.next() => match maybe {
                Some(Ok(packet)) => {
                    // A send failure means the consumer is gone; not an error.
                    if inbound.send(packet).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Err(err)) => return Err(Error::Wire(err)),
                None => {
                    debug!("read channel is closed");
                    return Ok(());
                }
            }
        }
    }
}

/// A peer tearing its end down mid-write is an ordinary end of the
/// conversation, not a failure worth surfacing.
fn peer_hung_up(err: &CodecError) -> bool {
    match err {
        CodecError::Io(io) => matches!(
            io.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::NotConnected
                | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}
