use bytes::Bytes;
use tokio::sync::mpsc;

use jobqd::broker::job::Priority;
use jobqd::broker::session::{ConnId, Outbound};
use jobqd::broker::Broker;
use jobqd::config::BrokerConfig;
use jobqd::protocol::command::Command;
use jobqd::protocol::packet::Packet;

fn test_broker() -> Broker {
    let config = BrokerConfig::default().with_handle_prefix("H:test");
    Broker::new(&config, None)
}

fn connect(broker: &mut Broker, conn: ConnId) -> mpsc::UnboundedReceiver<Outbound> {
    let (tx, rx) = mpsc::unbounded_channel();
    broker.add_session(conn, "127.0.0.1:1".parse().unwrap(), tx);
    rx
}

fn sent_packets(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Packet> {
    let mut packets = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Packet(packet) = item {
            packets.push(packet);
        }
    }
    packets
}

fn submit(broker: &mut Broker, function: &str, unique: &str, data: &str) -> String {
    broker
        .job_add(
            Bytes::copy_from_slice(function.as_bytes()),
            Bytes::copy_from_slice(unique.as_bytes()),
            Bytes::copy_from_slice(data.as_bytes()),
            Priority::Normal,
            None,
        )
        .unwrap()
        .handle
}

#[test]
fn test_handles_are_prefix_and_counter() {
    let mut broker = test_broker();
    assert_eq!(submit(&mut broker, "f", "a", "1"), "H:test:1");
    assert_eq!(submit(&mut broker, "f", "b", "2"), "H:test:2");
}

#[test]
fn test_duplicate_unique_returns_existing_job() {
    let mut broker = test_broker();

    let first = broker
        .job_add(
            Bytes::from_static(b"f"),
            Bytes::from_static(b"u"),
            Bytes::from_static(b"A"),
            Priority::Normal,
            None,
        )
        .unwrap();
    let second = broker
        .job_add(
            Bytes::from_static(b"f"),
            Bytes::from_static(b"u"),
            Bytes::from_static(b"B"),
            Priority::Normal,
            None,
        )
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.handle, second.handle);
    // The duplicate keeps the original payload.
    let job = broker.job_by_handle(&first.handle).unwrap();
    assert_eq!(job.data.as_ref(), b"A");
    assert_eq!(broker.function(b"f").unwrap().job_total, 1);
}

#[test]
fn test_unique_dedup_is_scoped_to_the_function() {
    let mut broker = test_broker();
    let a = submit(&mut broker, "f", "u", "A");
    let b = submit(&mut broker, "g", "u", "A");
    assert_ne!(a, b);
}

#[test]
fn test_dash_unique_dedups_on_payload_bytes() {
    let mut broker = test_broker();
    let first = submit(&mut broker, "f", "-", "payload");
    let same = submit(&mut broker, "f", "-", "payload");
    let other = submit(&mut broker, "f", "-", "different");

    assert_eq!(first, same);
    assert_ne!(first, other);
    assert_eq!(broker.function(b"f").unwrap().job_total, 2);
}

#[test]
fn test_empty_unique_never_dedups() {
    let mut broker = test_broker();
    let a = submit(&mut broker, "f", "", "same");
    let b = submit(&mut broker, "f", "", "same");
    assert_ne!(a, b);
    assert_eq!(broker.function(b"f").unwrap().job_total, 2);
}

#[test]
fn test_max_queue_size_rejects_excess_submissions() {
    let mut broker = test_broker();
    broker.set_max_queue(Bytes::from_static(b"f"), 2);

    submit(&mut broker, "f", "a", "1");
    submit(&mut broker, "f", "b", "2");
    let result = broker.job_add(
        Bytes::from_static(b"f"),
        Bytes::from_static(b"c"),
        Bytes::from_static(b"3"),
        Priority::Normal,
        None,
    );

    assert!(matches!(
        result,
        Err(jobqd::error::BrokerError::QueueFull(_))
    ));
    assert_eq!(broker.function(b"f").unwrap().job_total, 2);
}

#[test]
fn test_grab_follows_priority_order() {
    let mut broker = test_broker();
    let worker = 1;
    let _rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);

    for (unique, priority) in [
        ("l", Priority::Low),
        ("n", Priority::Normal),
        ("h", Priority::High),
    ] {
        broker
            .job_add(
                Bytes::from_static(b"f"),
                Bytes::copy_from_slice(unique.as_bytes()),
                Bytes::new(),
                priority,
                None,
            )
            .unwrap();
    }

    let order: Vec<Priority> = std::iter::from_fn(|| {
        broker
            .grab_job(worker)
            .map(|id| broker.job(id).unwrap().priority)
    })
    .take(3)
    .collect();
    assert_eq!(order, [Priority::High, Priority::Normal, Priority::Low]);
}

#[test]
fn test_grab_walks_capabilities_in_declaration_order() {
    let mut broker = test_broker();
    let worker = 1;
    let _rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"first"), 0);
    broker.can_do(worker, Bytes::from_static(b"second"), 0);

    submit(&mut broker, "second", "s", "");
    submit(&mut broker, "first", "f", "");

    let job = broker.grab_job(worker).unwrap();
    assert_eq!(broker.job(job).unwrap().function.as_ref(), b"first");
}

#[test]
fn test_grab_without_work_returns_none() {
    let mut broker = test_broker();
    let worker = 1;
    let _rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);
    assert!(broker.grab_job(worker).is_none());
}

#[test]
fn test_submission_wakes_sleeping_worker_once() {
    let mut broker = test_broker();
    let worker = 1;
    let mut rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);
    broker.pre_sleep(worker);
    assert!(sent_packets(&mut rx).is_empty());

    submit(&mut broker, "f", "a", "");
    let packets = sent_packets(&mut rx);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].command, Command::Noop);

    // A second submission while the NOOP is still pending stays quiet.
    submit(&mut broker, "f", "b", "");
    assert!(sent_packets(&mut rx).is_empty());
}

#[test]
fn test_awake_workers_are_not_woken() {
    let mut broker = test_broker();
    let worker = 1;
    let mut rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);

    submit(&mut broker, "f", "a", "");
    assert!(sent_packets(&mut rx).is_empty());
}

#[test]
fn test_pre_sleep_with_pending_work_wakes_immediately() {
    let mut broker = test_broker();
    let worker = 1;
    let mut rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);
    submit(&mut broker, "f", "a", "");

    broker.pre_sleep(worker);
    let packets = sent_packets(&mut rx);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].command, Command::Noop);
}

#[test]
fn test_worker_wakeup_limits_the_herd() {
    let config = BrokerConfig::default()
        .with_handle_prefix("H:test")
        .with_worker_wakeup(1);
    let mut broker = Broker::new(&config, None);

    let mut receivers = Vec::new();
    for conn in 1..=3 {
        let rx = connect(&mut broker, conn);
        broker.can_do(conn, Bytes::from_static(b"f"), 0);
        broker.pre_sleep(conn);
        receivers.push(rx);
    }

    submit(&mut broker, "f", "a", "");
    let woken: usize = receivers.iter_mut().map(|rx| sent_packets(rx).len()).sum();
    assert_eq!(woken, 1);
}

#[test]
fn test_abandoned_foreground_job_is_reaped_on_grab() {
    let mut broker = test_broker();
    let client = 1;
    let worker = 2;
    let _client_rx = connect(&mut broker, client);
    let _worker_rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);

    let submitted = broker
        .job_add(
            Bytes::from_static(b"f"),
            Bytes::from_static(b"u"),
            Bytes::from_static(b"secret"),
            Priority::Normal,
            Some(client),
        )
        .unwrap();

    broker.remove_session(client);
    assert!(broker.grab_job(worker).is_none());
    assert!(broker.job_by_handle(&submitted.handle).is_none());
    assert_eq!(broker.function(b"f").unwrap().job_total, 0);
}

#[test]
fn test_worker_disconnect_requeues_its_assignment() {
    let mut broker = test_broker();
    let lost = 1;
    let other = 2;
    let _lost_rx = connect(&mut broker, lost);
    let _other_rx = connect(&mut broker, other);
    broker.can_do(lost, Bytes::from_static(b"f"), 0);
    broker.can_do(other, Bytes::from_static(b"f"), 0);

    let handle = submit(&mut broker, "f", "u", "work");
    let job = broker.grab_job(lost).unwrap();
    assert_eq!(broker.function(b"f").unwrap().job_running, 1);

    broker.remove_session(lost);
    {
        let requeued = broker.job_by_handle(&handle).unwrap();
        assert!(requeued.worker.is_none());
        assert_eq!(broker.function(b"f").unwrap().job_running, 0);
    }

    assert_eq!(broker.grab_job(other), Some(job));
}

#[test]
fn test_cant_do_requeues_running_jobs_of_that_function() {
    let mut broker = test_broker();
    let worker = 1;
    let _rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);

    let handle = submit(&mut broker, "f", "u", "");
    broker.grab_job(worker).unwrap();
    broker.cant_do(worker, b"f");

    let job = broker.job_by_handle(&handle).unwrap();
    assert!(job.worker.is_none());
    assert_eq!(
        broker.function(b"f").unwrap().queued_jobs(Priority::Normal),
        1
    );
    // The worker no longer qualifies for it.
    assert!(broker.grab_job(worker).is_none());
}

#[test]
fn test_work_status_updates_and_forwards() {
    let mut broker = test_broker();
    let client = 1;
    let worker = 2;
    let mut client_rx = connect(&mut broker, client);
    let _worker_rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);

    let submitted = broker
        .job_add(
            Bytes::from_static(b"f"),
            Bytes::from_static(b"u"),
            Bytes::new(),
            Priority::Normal,
            Some(client),
        )
        .unwrap();
    sent_packets(&mut client_rx);
    broker.grab_job(worker).unwrap();

    let status = Packet::request(
        Command::WorkStatus,
        vec![
            Bytes::copy_from_slice(submitted.handle.as_bytes()),
            Bytes::from_static(b"3"),
            Bytes::from_static(b"10"),
        ],
    );
    broker.work_status(worker, &status).unwrap();

    let forwarded = sent_packets(&mut client_rx);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].command, Command::WorkStatus);
    assert_eq!(forwarded[0].arg(1), b"3");
    assert_eq!(forwarded[0].arg(2), b"10");

    let (known, running, num, den) = broker.job_status(submitted.handle.as_bytes());
    assert!(known);
    assert!(running);
    assert_eq!((num, den), (3, 10));
}

#[test]
fn test_work_complete_forwards_and_frees_the_job() {
    let mut broker = test_broker();
    let client = 1;
    let worker = 2;
    let mut client_rx = connect(&mut broker, client);
    let _worker_rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);

    let submitted = broker
        .job_add(
            Bytes::from_static(b"f"),
            Bytes::from_static(b"u"),
            Bytes::from_static(b"hello"),
            Priority::Normal,
            Some(client),
        )
        .unwrap();
    sent_packets(&mut client_rx);
    broker.grab_job(worker).unwrap();

    let complete = Packet::request(
        Command::WorkComplete,
        vec![
            Bytes::copy_from_slice(submitted.handle.as_bytes()),
            Bytes::from_static(b"olleh"),
        ],
    );
    broker.work_terminal(worker, &complete).unwrap();

    let forwarded = sent_packets(&mut client_rx);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].command, Command::WorkComplete);
    assert_eq!(forwarded[0].arg(1), b"olleh");

    assert!(broker.job_by_handle(&submitted.handle).is_none());
    let function = broker.function(b"f").unwrap();
    assert_eq!(function.job_total, 0);
    assert_eq!(function.job_running, 0);
}

#[test]
fn test_work_frames_from_the_wrong_worker_are_rejected() {
    let mut broker = test_broker();
    let worker = 1;
    let intruder = 2;
    let _worker_rx = connect(&mut broker, worker);
    let _intruder_rx = connect(&mut broker, intruder);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);
    broker.can_do(intruder, Bytes::from_static(b"f"), 0);

    let handle = submit(&mut broker, "f", "u", "");
    broker.grab_job(worker).unwrap();

    let complete = Packet::request(
        Command::WorkComplete,
        vec![Bytes::copy_from_slice(handle.as_bytes()), Bytes::new()],
    );
    assert!(broker.work_terminal(intruder, &complete).is_err());
    assert!(broker.job_by_handle(&handle).is_some());
}

#[test]
fn test_work_exception_reaches_only_subscribed_clients() {
    let mut broker = test_broker();
    let plain = 1;
    let subscribed = 2;
    let worker = 3;
    let mut plain_rx = connect(&mut broker, plain);
    let mut subscribed_rx = connect(&mut broker, subscribed);
    let _worker_rx = connect(&mut broker, worker);
    assert!(broker.set_option(subscribed, b"exceptions"));
    assert!(!broker.set_option(subscribed, b"bogus"));
    broker.can_do(worker, Bytes::from_static(b"f"), 0);

    let submitted = broker
        .job_add(
            Bytes::from_static(b"f"),
            Bytes::from_static(b"u"),
            Bytes::new(),
            Priority::Normal,
            Some(plain),
        )
        .unwrap();
    broker.register_client(submitted.job, subscribed);
    broker.grab_job(worker).unwrap();

    let exception = Packet::request(
        Command::WorkException,
        vec![
            Bytes::copy_from_slice(submitted.handle.as_bytes()),
            Bytes::from_static(b"boom"),
        ],
    );
    broker.work_exception(worker, &exception).unwrap();

    assert!(sent_packets(&mut plain_rx)
        .iter()
        .all(|p| p.command != Command::WorkException));
    assert!(sent_packets(&mut subscribed_rx)
        .iter()
        .any(|p| p.command == Command::WorkException));
}

#[test]
fn test_counters_match_queue_contents() {
    let mut broker = test_broker();
    let worker = 1;
    let _rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"f"), 0);

    broker
        .job_add(
            Bytes::from_static(b"f"),
            Bytes::from_static(b"a"),
            Bytes::new(),
            Priority::High,
            None,
        )
        .unwrap();
    submit(&mut broker, "f", "b", "");
    submit(&mut broker, "f", "c", "");
    broker.grab_job(worker).unwrap();

    let function = broker.function(b"f").unwrap();
    assert_eq!(function.job_total, 3);
    assert_eq!(function.job_running, 1);
    assert_eq!(function.queued_jobs(Priority::High), 0);
    assert_eq!(function.queued_jobs(Priority::Normal), 2);
    assert_eq!(function.queued_jobs(Priority::Low), 0);
    assert_eq!(broker.running_jobs(), 1);
}

#[test]
fn test_function_status_snapshot() {
    let mut broker = test_broker();
    let worker = 1;
    let _rx = connect(&mut broker, worker);
    broker.can_do(worker, Bytes::from_static(b"beta"), 0);
    broker.can_do(worker, Bytes::from_static(b"alpha"), 0);
    submit(&mut broker, "beta", "u", "");

    let rows = broker.function_status();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], ("alpha".to_string(), 0, 0, 1));
    assert_eq!(rows[1], ("beta".to_string(), 1, 0, 1));
}
