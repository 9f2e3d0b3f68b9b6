use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::broker::session::{ConnId, Outbound};
use crate::broker::Broker;
use crate::protocol::codec::{encode_packet, FrameDecoder};
use crate::protocol::command::Magic;
use crate::protocol::packet::Packet;
use crate::server::{admin, handler, ControlEvent};

/// Drive one connection: decode inbound frames and apply them to the broker,
/// while a writer task drains the connection's outbound FIFO. Returns once
/// the peer hangs up, the stream desynchronizes, or the server shuts down;
/// session teardown (requeue, ignore-marking) happens on every exit path.
pub(crate) async fn run_connection(
    broker: Arc<Mutex<Broker>>,
    control: mpsc::UnboundedSender<ControlEvent>,
    conn: ConnId,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    broker.lock().await.add_session(conn, peer, tx.clone());
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let mut decoder = FrameDecoder::new();
    'read: loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_buf(decoder.buffer_mut()) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(conn, error = %err, "Connection read failed");
                break;
            }
        }

        loop {
            match decoder.decode() {
                Ok(Some(packet)) => dispatch(&broker, &control, conn, packet).await,
                Ok(None) => break,
                Err(err) => {
                    // The stream can no longer be parsed; report and close
                    // once the reply has flushed.
                    tracing::debug!(conn, error = %err, "Closing desynchronized connection");
                    let broker = broker.lock().await;
                    broker.send_to(
                        conn,
                        Outbound::Packet(Packet::error("invalid_packet", &err.to_string())),
                    );
                    broker.send_to(conn, Outbound::Shutdown);
                    break 'read;
                }
            }
        }
    }

    broker.lock().await.remove_session(conn);
    drop(tx);
    let _ = writer_task.await;
    tracing::debug!(conn, %peer, "Connection closed");
}

async fn dispatch(
    broker: &Arc<Mutex<Broker>>,
    control: &mpsc::UnboundedSender<ControlEvent>,
    conn: ConnId,
    packet: Packet,
) {
    let mut broker = broker.lock().await;
    if packet.magic == Magic::Text {
        if let Some(event) = admin::handle_line(&mut broker, conn, &packet) {
            let _ = control.send(event);
        }
    } else {
        handler::handle_packet(&mut broker, conn, packet);
    }
}

/// Serialize the outbound FIFO onto the socket. `Shutdown` closes the
/// connection after everything queued before it has been written.
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            Outbound::Packet(packet) => writer.write_all(&encode_packet(&packet)).await,
            Outbound::Raw(bytes) => writer.write_all(&bytes).await,
            Outbound::Shutdown => break,
        };
        if result.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
