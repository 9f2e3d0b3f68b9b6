use bytes::Bytes;

use crate::broker::session::{ConnId, Outbound};
use crate::broker::Broker;
use crate::protocol::packet::Packet;
use crate::server::ControlEvent;

/// Handle one administrative text line. The response is queued on the
/// originating connection; a shutdown request is returned so the caller can
/// surface it to the server loop.
pub fn handle_line(broker: &mut Broker, conn: ConnId, packet: &Packet) -> Option<ControlEvent> {
    let command = packet.arg(0).to_ascii_lowercase();
    let mut event = None;

    let response = match command.as_slice() {
        b"workers" => {
            let mut out = String::new();
            for (id, peer, client_id, functions) in broker.worker_rows() {
                out.push_str(&format!("{} {} {} :", id, peer, client_id));
                for function in functions {
                    out.push(' ');
                    out.push_str(&function);
                }
                out.push('\n');
            }
            out.push_str(".\n");
            out
        }
        b"status" => {
            let mut out = String::new();
            for (name, total, running, workers) in broker.function_status() {
                out.push_str(&format!("{}\t{}\t{}\t{}\n", name, total, running, workers));
            }
            out.push_str(".\n");
            out
        }
        b"maxqueue" => {
            if packet.args.len() < 2 {
                "ERR incomplete_args Missing+function+name\n".to_string()
            } else {
                let size = std::str::from_utf8(packet.arg(2))
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .unwrap_or(0);
                // Non-positive resets the function to unbounded.
                let size = if size > 0 { size as u32 } else { 0 };
                broker.set_max_queue(packet.args[1].clone(), size);
                "OK\n".to_string()
            }
        }
        b"shutdown" => {
            event = Some(if packet.arg(1) == b"graceful" {
                ControlEvent::ShutdownGraceful
            } else {
                ControlEvent::Shutdown
            });
            "OK\n".to_string()
        }
        b"version" => format!("{}\n", env!("CARGO_PKG_VERSION")),
        _ => "ERR unknown_command Unknown+server+command\n".to_string(),
    };

    broker.send_to(conn, Outbound::Raw(Bytes::from(response.into_bytes())));
    event
}
