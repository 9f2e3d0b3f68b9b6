use crate::broker::job::Priority;
use crate::broker::session::{ConnId, Outbound};
use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::protocol::command::Command;
use crate::protocol::packet::Packet;

/// Apply one inbound binary frame to the broker. Replies and forwarded
/// frames are queued on the relevant connections' outbound FIFOs; the
/// caller holds the broker lock, so the whole effect is atomic with respect
/// to broker state.
pub fn handle_packet(broker: &mut Broker, conn: ConnId, packet: Packet) {
    use Command::*;

    match packet.command {
        SubmitJob => submit(broker, conn, &packet, Priority::Normal, true),
        SubmitJobBg => submit(broker, conn, &packet, Priority::Normal, false),
        SubmitJobHigh => submit(broker, conn, &packet, Priority::High, true),
        SubmitJobHighBg => submit(broker, conn, &packet, Priority::High, false),
        SubmitJobLow => submit(broker, conn, &packet, Priority::Low, true),
        SubmitJobLowBg => submit(broker, conn, &packet, Priority::Low, false),
        SubmitJobSched | SubmitJobEpoch => reply(
            broker,
            conn,
            Packet::error("server_error", "Scheduled submission is not implemented"),
        ),

        GrabJob => grab(broker, conn, false),
        GrabJobUniq => grab(broker, conn, true),
        PreSleep => broker.pre_sleep(conn),

        CanDo => broker.can_do(conn, packet.args[0].clone(), 0),
        CanDoTimeout => {
            let timeout = parse_u32(packet.arg(1));
            broker.can_do(conn, packet.args[0].clone(), timeout);
        }
        CantDo => broker.cant_do(conn, packet.arg(0)),
        ResetAbilities => broker.reset_abilities(conn),

        WorkData | WorkWarning => work(broker, conn, &packet, Broker::work_progress),
        WorkStatus => work(broker, conn, &packet, Broker::work_status),
        WorkException => work(broker, conn, &packet, Broker::work_exception),
        WorkComplete | WorkFail => work(broker, conn, &packet, Broker::work_terminal),

        GetStatus => {
            let (known, running, num, den) = broker.job_status(packet.arg(0));
            reply(
                broker,
                conn,
                Packet::status_res(packet.arg(0), known, running, num, den),
            );
        }
        EchoReq => reply(broker, conn, Packet::echo_res(packet.args[0].clone())),
        SetClientId => broker.set_client_id(conn, packet.arg(0)),
        OptionReq => {
            if broker.set_option(conn, packet.arg(0)) {
                reply(broker, conn, Packet::option_res(packet.args[0].clone()));
            } else {
                reply(
                    broker,
                    conn,
                    Packet::error("unknown_option", "Server option not recognized"),
                );
            }
        }

        // Reserved for worker affinity; accepted without effect.
        AllYours => {}

        _ => reply(
            broker,
            conn,
            Packet::error("unknown_command", "Server does not handle this command"),
        ),
    }
}

fn submit(broker: &mut Broker, conn: ConnId, packet: &Packet, priority: Priority, fg: bool) {
    let client = fg.then_some(conn);
    let result = broker.job_add(
        packet.args[0].clone(),
        packet.args[1].clone(),
        packet.args[2].clone(),
        priority,
        client,
    );

    match result {
        Ok(submitted) => reply(broker, conn, Packet::job_created(&submitted.handle)),
        Err(BrokerError::QueueFull(_)) => {
            reply(broker, conn, Packet::error("queue_full", "Job queue is full"));
        }
        Err(err) => {
            tracing::error!(conn, error = %err, "Job submission failed");
            reply(
                broker,
                conn,
                Packet::error("queue_error", "Failed to store job"),
            );
        }
    }
}

fn grab(broker: &mut Broker, conn: ConnId, uniq: bool) {
    let assignment = broker.grab_job(conn).and_then(|job_id| {
        let job = broker.job(job_id)?;
        Some(if uniq {
            Packet::job_assign_uniq(
                &job.handle,
                job.function.clone(),
                job.unique.clone(),
                job.data.clone(),
            )
        } else {
            Packet::job_assign(&job.handle, job.function.clone(), job.data.clone())
        })
    });

    match assignment {
        Some(packet) => reply(broker, conn, packet),
        None => reply(broker, conn, Packet::no_job()),
    }
}

fn work(
    broker: &mut Broker,
    conn: ConnId,
    packet: &Packet,
    apply: fn(&mut Broker, ConnId, &Packet) -> Result<()>,
) {
    if let Err(err) = apply(broker, conn, packet) {
        tracing::debug!(conn, command = %packet.command, error = %err, "Rejected work frame");
        reply(
            broker,
            conn,
            Packet::error("job_not_found", "Job given in work result not found"),
        );
    }
}

fn reply(broker: &Broker, conn: ConnId, packet: Packet) {
    broker.send_to(conn, Outbound::Packet(packet));
}

fn parse_u32(bytes: &[u8]) -> u32 {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
