use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::auth::generate_guid;
use crate::connection::State;
use crate::protocol::{ERROR_FAILED, ERROR_UNKNOWN_METHOD, INTROSPECTABLE_INTERFACE, PEER_INTERFACE};
use crate::*;

#[test]
fn shared_types_cross_threads() {
    use static_assertions::assert_impl_all;

    assert_impl_all!(Connection: Send);
    assert_impl_all!(LoopHandle: Send, Sync, Clone);
    assert_impl_all!(Message: Send, Sync);
    assert_impl_all!(Error: Send, Sync);
}

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

/// Connect a client to a server connection driven by `peer` on another thread.
fn client_with<F>(peer: F) -> (Connection, JoinHandle<()>)
where
    F: FnOnce(Connection) + Send + 'static,
{
    client_with_config(ConnectionConfig::peer_to_peer(), peer)
}

fn client_with_config<F>(config: ConnectionConfig, peer: F) -> (Connection, JoinHandle<()>)
where
    F: FnOnce(Connection) + Send + 'static,
{
    let (a, b) = UnixStream::pair().unwrap();
    let guid = generate_guid();
    let handle = thread::spawn(move || {
        let server =
            Connection::new_server(Box::new(b), &guid, ConnectionConfig::peer_to_peer()).unwrap();
        peer(server);
    });
    let client = Connection::new(Box::new(a), config).unwrap();
    (client, handle)
}

/// Dispatch until the other side hangs up.
fn serve(mut conn: Connection) {
    while conn.handle_message(WAIT).is_ok() {}
}

fn read_call(conn: &mut Connection) -> Message {
    loop {
        if let Some(m) = conn.read_message(WAIT).unwrap() {
            return m;
        }
    }
}

fn first_string(msg: &Message) -> String {
    String::try_from(msg.body().unwrap().remove(0)).unwrap()
}

struct Db;

impl Interface for Db {
    fn get_name(&self) -> &str {
        "vx.db"
    }

    fn call(&self, call: &mut Call) -> Result<()> {
        match call.request.member() {
            Some("ExecScalar") => {
                let args = call.request.check("s")?;
                match args[0].as_str() {
                    Some("SELECT 1") => call.reply(vec![1i32.into()]),
                    Some(q) => call.reply_invalid_args(&format!("cannot run '{}'", q)),
                    None => call.reply_invalid_args("no query"),
                }
            }
            Some("Lock") => Err(ErrorKind::CallbackFailed("database is locked".into()).into()),
            _ => call.reply_unknown_method(),
        }
    }
}

#[test]
fn exec_scalar_end_to_end() {
    let (mut client, peer) = client_with(|mut server| {
        server.register_interface(Arc::new(Db));
        serve(server);
    });

    assert_eq!(client.state(), State::Ready);
    assert!(client.guid().is_some());

    let reply = client
        .call_method(None, "/db", Some("vx.db"), "ExecScalar", vec!["SELECT 1".into()])
        .unwrap();
    assert_eq!(reply.msg_type(), MessageType::MethodReturn);
    assert_eq!(reply.check("i").unwrap(), vec![Value::Int32(1)]);

    let err = client
        .call_method(None, "/db", Some("vx.db"), "ExecScalar", vec!["DROP".into()])
        .unwrap_err();
    match err.kind() {
        ErrorKind::DBusError { name, message } => {
            assert_eq!(name, "org.freedesktop.DBus.Error.InvalidArgs");
            assert_eq!(message, "cannot run 'DROP'");
        }
        kind => panic!("unexpected error {:?}", kind),
    }

    drop(client);
    peer.join().unwrap();
}

#[test]
fn scrambled_replies_resolve_their_own_calls() {
    const CALLS: usize = 5;

    let (mut client, peer) = client_with(|mut server| {
        let calls: Vec<Message> = (0..CALLS).map(|_| read_call(&mut server)).collect();
        for call in calls.iter().rev() {
            let text = format!("reply to {}", first_string(call));
            let mut reply = call.reply(vec![text.into()]).unwrap();
            server.send(&mut reply).unwrap();
        }
        serve(server);
    });

    let results = Arc::new(Mutex::new(Vec::new()));
    for i in 0..CALLS - 1 {
        let mut msg = Message::method_call(None, "/", Some("org.example.Echo"), "Echo")
            .unwrap()
            .with_args(vec![i.to_string().into()])
            .unwrap();
        let results = results.clone();
        client
            .send_async(&mut msg, move |_, reply| {
                results.lock().push((i, first_string(&reply.unwrap())));
            })
            .unwrap();
    }
    assert_eq!(client.pending_calls(), CALLS - 1);

    // The blocking call is answered first and must not pick up any other reply.
    let mut last = Message::method_call(None, "/", Some("org.example.Echo"), "Echo")
        .unwrap()
        .with_args(vec![(CALLS - 1).to_string().into()])
        .unwrap();
    let reply = client.send_and_wait(&mut last).unwrap();
    assert_eq!(reply.reply_serial, Some(last.serial()));
    assert_eq!(first_string(&reply), format!("reply to {}", CALLS - 1));

    while results.lock().len() < CALLS - 1 {
        client.handle_message(WAIT).unwrap();
    }
    assert_eq!(client.pending_calls(), 0);

    let results = results.lock();
    let order: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
    assert_eq!(order, vec![3, 2, 1, 0]);
    for (i, text) in results.iter() {
        assert_eq!(text, &format!("reply to {}", i));
    }

    drop(client);
    peer.join().unwrap();
}

#[test]
fn auth_rejection_fails_setup() {
    let (a, b) = UnixStream::pair().unwrap();
    let peer = thread::spawn(move || {
        let mut reader = BufReader::new(b.try_clone().unwrap());
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).unwrap();
        assert_eq!(line[0], 0);
        assert!(line[1..].starts_with(b"AUTH EXTERNAL "));
        (&b).write_all(b"REJECTED EXTERNAL\r\n").unwrap();
    });

    let err = Connection::new(Box::new(a), ConnectionConfig::peer_to_peer())
        .err()
        .unwrap();
    assert!(matches!(err.kind(), ErrorKind::Authentication(_)));
    peer.join().unwrap();
}

#[test]
fn silent_server_times_out() {
    let (a, _b) = UnixStream::pair().unwrap();
    let config = ConnectionConfig {
        auth_timeout: Duration::from_millis(50),
        ..ConnectionConfig::peer_to_peer()
    };
    let err = Connection::new(Box::new(a), config).err().unwrap();
    assert!(matches!(err.kind(), ErrorKind::Authentication(_)));
}

#[test]
fn close_fails_pending_calls() {
    let (mut client, peer) = client_with(|mut server| {
        read_call(&mut server);
        read_call(&mut server);
        drop(server);
    });

    let closed = Arc::new(Mutex::new(0));
    {
        let closed = closed.clone();
        client.on_close(move |_| *closed.lock() += 1);
    }

    let failure = Arc::new(Mutex::new(None));
    let mut first = Message::method_call(None, "/", Some("org.example.Slow"), "Wait").unwrap();
    {
        let failure = failure.clone();
        client
            .send_async(&mut first, move |_, reply| {
                *failure.lock() = reply.err().map(Error::into_kind);
            })
            .unwrap();
    }

    let mut second = Message::method_call(None, "/", Some("org.example.Slow"), "Wait").unwrap();
    let err = client.send_and_wait(&mut second).unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::ConnectionClosed);
    assert_eq!(*failure.lock(), Some(ErrorKind::ConnectionClosed));
    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.pending_calls(), 0);

    client.close();
    assert_eq!(*closed.lock(), 1);

    let mut third = Message::method_call(None, "/", None, "Ping").unwrap();
    assert_eq!(
        client.send(&mut third).unwrap_err().kind(),
        &ErrorKind::ConnectionClosed
    );

    peer.join().unwrap();
}

#[test]
fn timeout_forgets_the_pending_call() {
    let (mut client, peer) = client_with(|mut server| {
        let slow = read_call(&mut server);
        let fast = read_call(&mut server);
        let mut late = slow.method_return();
        server.send(&mut late).unwrap();
        let mut reply = fast.reply(vec!["fast".into()]).unwrap();
        server.send(&mut reply).unwrap();
        serve(server);
    });

    let mut slow = Message::method_call(None, "/", Some("org.example.Slow"), "Wait").unwrap();
    let err = client
        .send_and_wait_timeout(&mut slow, Some(Duration::from_millis(50)))
        .unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::Timeout);
    assert_eq!(client.pending_calls(), 0);

    // The late reply to the first call is dropped as unsolicited.
    let mut fast = Message::method_call(None, "/", Some("org.example.Slow"), "Now").unwrap();
    let reply = client.send_and_wait(&mut fast).unwrap();
    assert_eq!(reply.reply_serial, Some(fast.serial()));
    assert_eq!(first_string(&reply), "fast");

    drop(client);
    peer.join().unwrap();
}

#[test]
fn unknown_method_is_answered() {
    let (mut client, peer) = client_with(serve);

    let err = client
        .call_method(None, "/", Some("org.example.Nope"), "Frob", vec![])
        .unwrap_err();
    match err.kind() {
        ErrorKind::DBusError { name, message } => {
            assert_eq!(name, ERROR_UNKNOWN_METHOD);
            assert!(message.contains("Frob"), "{}", message);
        }
        kind => panic!("unexpected error {:?}", kind),
    }

    // A call that wants no reply gets none.
    let mut oneway = Message::method_call(None, "/", Some("org.example.Nope"), "Frob")
        .unwrap()
        .with_flags(Flags::NO_REPLY_EXPECTED);
    client.send(&mut oneway).unwrap();
    assert!(!client.handle_message(Some(Duration::from_millis(50))).unwrap());

    drop(client);
    peer.join().unwrap();
}

#[test]
fn builtin_peer_methods() {
    let (mut client, peer) = client_with(|mut server| {
        server.register_interface(Arc::new(Db));
        serve(server);
    });

    let pong = client
        .call_method(None, "/", Some(PEER_INTERFACE), "Ping", vec![])
        .unwrap();
    assert_eq!(pong.msg_type(), MessageType::MethodReturn);
    assert!(pong.signature().is_empty());

    let id = client
        .call_method(None, "/", Some(PEER_INTERFACE), "GetMachineId", vec![])
        .unwrap();
    assert_eq!(first_string(&id).len(), 32);

    let xml = client
        .call_method(None, "/", Some(INTROSPECTABLE_INTERFACE), "Introspect", vec![])
        .unwrap();
    assert!(first_string(&xml).contains("<interface name=\"vx.db\""));

    drop(client);
    peer.join().unwrap();
}

#[test]
fn handler_error_becomes_failed_reply() {
    let (mut client, peer) = client_with(|mut server| {
        server.register_interface(Arc::new(Db));
        serve(server);
    });

    let err = client
        .call_method(None, "/db", Some("vx.db"), "Lock", vec![])
        .unwrap_err();
    match err.kind() {
        ErrorKind::DBusError { name, message } => {
            assert_eq!(name, ERROR_FAILED);
            assert!(message.contains("database is locked"), "{}", message);
        }
        kind => panic!("unexpected error {:?}", kind),
    }

    drop(client);
    peer.join().unwrap();
}

#[test]
fn signals_reach_matching_handlers() {
    let (mut client, peer) = client_with(|mut server| {
        let done = read_call(&mut server);
        for (iface, member, arg) in [
            ("org.example.Sig", "Changed", "a"),
            ("org.example.Sig", "Changed", "b"),
            ("org.example.Other", "Changed", "b"),
        ] {
            let mut signal = Message::signal("/org/example", iface, member)
                .unwrap()
                .with_args(vec![arg.into()])
                .unwrap();
            server.send(&mut signal).unwrap();
        }
        let mut reply = done.method_return();
        server.send(&mut reply).unwrap();
        serve(server);
    });

    let only_b = Arc::new(Mutex::new(Vec::new()));
    let all = Arc::new(Mutex::new(Vec::new()));
    {
        let only_b = only_b.clone();
        client.add_signal_handler(
            MatchRule::new_signal("org.example.Sig", "Changed").with_arg(0, "b"),
            move |_, msg| {
                only_b.lock().push(first_string(msg));
                Ok(())
            },
        );
    }
    let all_id = {
        let all = all.clone();
        let rule: MatchRule = "type='signal',interface='org.example.Sig'".parse().unwrap();
        client.add_signal_handler(rule, move |_, msg| {
            all.lock().push(first_string(msg));
            Ok(())
        })
    };

    let mut done = Message::method_call(None, "/", Some("org.example.Sig"), "Done").unwrap();
    client.send_and_wait(&mut done).unwrap();

    assert_eq!(*only_b.lock(), vec!["b".to_string()]);
    assert_eq!(*all.lock(), vec!["a".to_string(), "b".to_string()]);
    assert!(client.remove_handler(all_id));
    assert!(!client.remove_handler(all_id));

    drop(client);
    peer.join().unwrap();
}

#[test]
fn filters_claim_messages_first() {
    let (mut client, peer) = client_with(|mut server| {
        let done = read_call(&mut server);
        let mut signal = Message::signal("/", "org.example.Sig", "Changed").unwrap();
        server.send(&mut signal).unwrap();
        let mut reply = done.method_return();
        server.send(&mut reply).unwrap();
        serve(server);
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        client.add_filter(move |_, msg| {
            seen.lock().push(format!("filter {}", msg.member().unwrap_or_default()));
            Ok(true)
        });
    }
    {
        let seen = seen.clone();
        client.add_signal_handler(MatchRule::new_signal("org.example.Sig", "Changed"), move |_, _| {
            seen.lock().push("handler".into());
            Ok(())
        });
    }

    let mut done = Message::method_call(None, "/", Some("org.example.Sig"), "Done").unwrap();
    client.send_and_wait(&mut done).unwrap();
    assert_eq!(*seen.lock(), vec!["filter Changed".to_string()]);

    drop(client);
    peer.join().unwrap();
}

struct PeerValue;

impl Interface for PeerValue {
    fn get_name(&self) -> &str {
        "org.example.Peer"
    }

    fn call(&self, call: &mut Call) -> Result<()> {
        let mut tick = Message::signal("/", "org.example.Peer", "Tick")?;
        call.connection().send(&mut tick)?;
        call.reply(vec![7i32.into()])
    }
}

struct Nested {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Interface for Nested {
    fn get_name(&self) -> &str {
        "org.example.Client"
    }

    fn call(&self, call: &mut Call) -> Result<()> {
        self.log.lock().push("start");
        let reply = call
            .connection()
            .call_method(None, "/", Some("org.example.Peer"), "Value", vec![])?;
        let value = i32::try_from(reply.check("i")?.remove(0))?;
        self.log.lock().push("end");
        call.reply(vec![(value + 1).into()])
    }
}

#[test]
fn messages_during_a_nested_call_are_deferred() {
    let (mut client, peer) = client_with(|mut server| {
        server.register_interface(Arc::new(PeerValue));
        let reply = server
            .call_method(None, "/", Some("org.example.Client"), "Nested", vec![])
            .unwrap();
        assert_eq!(reply.check("i").unwrap(), vec![Value::Int32(8)]);
        serve(server);
    });

    let log = Arc::new(Mutex::new(Vec::new()));
    client.register_interface(Arc::new(Nested { log: log.clone() }));
    {
        let log = log.clone();
        client.add_signal_handler(MatchRule::new_signal("org.example.Peer", "Tick"), move |_, _| {
            log.lock().push("tick");
            Ok(())
        });
    }

    while log.lock().len() < 3 {
        client.handle_message(WAIT).unwrap();
    }
    assert_eq!(*log.lock(), vec!["start", "end", "tick"]);

    drop(client);
    peer.join().unwrap();
}

#[test]
fn attached_connection_dispatches_on_the_loop() {
    let (client, peer) = client_with(|mut server| {
        let mut signal = Message::signal("/", "org.example.Sig", "Changed")
            .unwrap()
            .with_args(vec!["loop".into()])
            .unwrap();
        server.send(&mut signal).unwrap();
        serve(server);
    });

    let mut el = EventLoop::new(LoopConfig::default()).unwrap();
    let handle = el.handle();
    handle.add_timer(Duration::from_secs(10), |h| {
        h.shutdown();
        Ok(())
    });

    let received = Arc::new(Mutex::new(None));
    let client = Arc::new(Mutex::new(client));
    {
        let received = received.clone();
        let handle = handle.clone();
        client.lock().add_signal_handler(
            MatchRule::new_signal("org.example.Sig", "Changed"),
            move |_, msg| {
                *received.lock() = Some(first_string(msg));
                handle.shutdown();
                Ok(())
            },
        );
    }
    Connection::attach(client.clone(), &handle).unwrap();

    el.run().unwrap();
    assert_eq!(received.lock().as_deref(), Some("loop"));

    drop(el);
    drop(client);
    peer.join().unwrap();
}

#[test]
fn attached_connection_deregisters_on_close() {
    let (client, peer) = client_with(drop);

    let mut el = EventLoop::new(LoopConfig::default()).unwrap();
    let handle = el.handle();
    handle.add_timer(Duration::from_secs(10), |h| {
        h.shutdown();
        Ok(())
    });

    let client = Arc::new(Mutex::new(client));
    {
        let handle = handle.clone();
        client.lock().on_close(move |_| handle.shutdown());
    }
    Connection::attach(client.clone(), &handle).unwrap();

    el.run().unwrap();
    assert_eq!(client.lock().state(), State::Closed);
    assert_eq!(el.num_sources(), 0);
    peer.join().unwrap();
}

struct Abandon {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Interface for Abandon {
    fn get_name(&self) -> &str {
        "org.example.Client"
    }

    fn call(&self, call: &mut Call) -> Result<()> {
        self.log.lock().push("start");
        call.connection()
            .call_method(None, "/", Some("org.example.Peer"), "Value", vec![])?;
        self.log.lock().push("end");
        // The reply to this call can no longer be sent.
        call.connection().close();
        Ok(())
    }
}

#[test]
fn deferred_messages_are_dispatched_when_a_handler_fails() {
    let (mut client, peer) = client_with(|mut server| {
        server.register_interface(Arc::new(PeerValue));
        let mut call = Message::method_call(None, "/", Some("org.example.Client"), "Abandon").unwrap();
        server.send(&mut call).unwrap();
        serve(server);
    });

    let log = Arc::new(Mutex::new(Vec::new()));
    client.register_interface(Arc::new(Abandon { log: log.clone() }));
    {
        let log = log.clone();
        client.add_signal_handler(MatchRule::new_signal("org.example.Peer", "Tick"), move |_, _| {
            log.lock().push("tick");
            Ok(())
        });
    }

    let err = loop {
        if let Err(e) = client.handle_message(WAIT) {
            break e;
        }
    };
    assert_eq!(err.kind(), &ErrorKind::ConnectionClosed);
    assert_eq!(*log.lock(), vec!["start", "end", "tick"]);

    drop(client);
    peer.join().unwrap();
}

#[test]
fn closed_connection_frees_its_fd_for_the_next_one() {
    let (first, first_peer) = client_with(serve);

    let mut el = EventLoop::new(LoopConfig::default()).unwrap();
    let handle = el.handle();
    handle.add_timer(Duration::from_secs(10), |h| {
        h.shutdown();
        Ok(())
    });

    let first = Arc::new(Mutex::new(first));
    Connection::attach(first.clone(), &handle).unwrap();
    el.run_once(Some(Duration::ZERO)).unwrap();
    assert_eq!(el.num_sources(), 1);

    // Closed outside the loop; the next socket usually gets the same number.
    first.lock().close();
    first_peer.join().unwrap();

    let (second, second_peer) = client_with(|mut server| {
        let mut signal = Message::signal("/", "org.example.Sig", "Changed")
            .unwrap()
            .with_args(vec!["reuse".into()])
            .unwrap();
        server.send(&mut signal).unwrap();
        serve(server);
    });
    let received = Arc::new(Mutex::new(None));
    let second = Arc::new(Mutex::new(second));
    {
        let received = received.clone();
        let handle = handle.clone();
        second.lock().add_signal_handler(
            MatchRule::new_signal("org.example.Sig", "Changed"),
            move |_, msg| {
                *received.lock() = Some(first_string(msg));
                handle.shutdown();
                Ok(())
            },
        );
    }
    Connection::attach(second.clone(), &handle).unwrap();

    el.run().unwrap();
    assert_eq!(received.lock().as_deref(), Some("reuse"));
    // The loop let go of the first connection.
    assert_eq!(Arc::strong_count(&first), 1);
    assert_eq!(el.num_sources(), 1);

    drop(el);
    drop(second);
    second_peer.join().unwrap();
}

#[test]
fn sends_on_the_loop_thread_do_not_wait_for_the_peer() {
    // Well past any default unix socket buffer.
    const BIG: usize = 4 << 20;

    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (client, peer) = client_with(move |mut server| {
        let _ = go_rx.recv_timeout(Duration::from_secs(5));
        let big = read_call(&mut server);
        assert_eq!(big.member(), Some("Big"));
        assert_eq!(first_string(&big).len(), BIG);
        let mut drained = Message::signal("/", "org.example.Sig", "Drained").unwrap();
        server.send(&mut drained).unwrap();
        serve(server);
    });

    let mut el = EventLoop::new(LoopConfig::default()).unwrap();
    let handle = el.handle();
    handle.add_timer(Duration::from_secs(10), |h| {
        h.shutdown();
        Ok(())
    });

    let client = Arc::new(Mutex::new(client));
    let drained = Arc::new(Mutex::new(false));
    {
        let drained = drained.clone();
        let handle = handle.clone();
        client.lock().add_signal_handler(
            MatchRule::new_signal("org.example.Sig", "Drained"),
            move |_, _| {
                *drained.lock() = true;
                handle.shutdown();
                Ok(())
            },
        );
    }
    Connection::attach(client.clone(), &handle).unwrap();

    let sent = Arc::new(Mutex::new(None));
    {
        let sent = sent.clone();
        let client = client.clone();
        handle.add_action(move |_| {
            let mut big = Message::signal("/", "org.example.Sig", "Big")
                .unwrap()
                .with_args(vec!["x".repeat(BIG).into()])
                .unwrap();
            let mut c = client.lock();
            let start = Instant::now();
            c.send(&mut big).unwrap();
            *sent.lock() = Some((start.elapsed(), c.pending_output()));
            go_tx.send(()).unwrap();
        });
    }

    el.run().unwrap();
    let (took, left) = sent.lock().take().unwrap();
    assert!(took < Duration::from_secs(2), "send took {:?}", took);
    assert!(left > 0);
    assert!(*drained.lock());
    assert_eq!(client.lock().pending_output(), 0);

    drop(el);
    drop(client);
    peer.join().unwrap();
}

/// Answers `org.freedesktop.DBus` calls like a bus daemon would.
struct FakeBus {
    matches: Arc<Mutex<Vec<String>>>,
}

impl Interface for FakeBus {
    fn get_name(&self) -> &str {
        "org.freedesktop.DBus"
    }

    fn call(&self, call: &mut Call) -> Result<()> {
        let args = call.args()?;
        let name = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let flags = args.get(1).and_then(Value::as_u32).unwrap_or_default();
        match call.request.member() {
            Some("Hello") => call.reply(vec![":1.42".into()]),
            Some("RequestName") => {
                let flags = NameFlags::from_bits_truncate(flags);
                let code: u32 = match name.as_str() {
                    "org.example.Taken" if flags.contains(NameFlags::DO_NOT_QUEUE) => 3,
                    "org.example.Taken" => 2,
                    _ => 1,
                };
                call.reply(vec![code.into()])
            }
            Some("ReleaseName") => {
                let code: u32 = match name.as_str() {
                    "org.example.Svc" => 1,
                    "org.example.Weird" => 9,
                    _ => 3,
                };
                call.reply(vec![code.into()])
            }
            Some("NameHasOwner") if name == "org.example.Weird" => {
                call.reply(vec!["yes".into()])
            }
            Some("NameHasOwner") => call.reply(vec![(name == "org.example.Svc").into()]),
            Some("AddMatch") => {
                self.matches.lock().push(name);
                Ok(())
            }
            Some("ListNames") => call.reply(vec![Value::array(
                "s",
                vec!["org.freedesktop.DBus".into(), ":1.42".into()],
            )?]),
            Some("GetNameOwner") => call.reply(vec![":1.42".into()]),
            Some("StartServiceByName") => {
                let code: u32 = if flags == 0 { 2 } else { 1 };
                call.reply(vec![code.into()])
            }
            _ => call.reply_unknown_method(),
        }
    }
}

#[test]
fn bus_methods_decode_daemon_replies() {
    let matches = Arc::new(Mutex::new(Vec::new()));
    let bus_matches = matches.clone();
    let (mut client, peer) = client_with_config(ConnectionConfig::default(), move |mut server| {
        server.register_interface(Arc::new(FakeBus {
            matches: bus_matches,
        }));
        serve(server);
    });

    // Hello went out during setup.
    assert_eq!(client.unique_name(), Some(":1.42"));

    assert_eq!(
        client
            .request_name("org.example.Svc", NameFlags::empty())
            .unwrap(),
        RequestNameReply::PrimaryOwner
    );
    assert_eq!(
        client
            .request_name("org.example.Taken", NameFlags::DO_NOT_QUEUE)
            .unwrap(),
        RequestNameReply::Exists
    );
    assert_eq!(
        client
            .request_name("org.example.Taken", NameFlags::ALLOW_REPLACEMENT)
            .unwrap(),
        RequestNameReply::InQueue
    );
    assert_eq!(
        client.release_name("org.example.Svc").unwrap(),
        ReleaseNameReply::Released
    );
    assert_eq!(
        client.release_name("org.example.Other").unwrap(),
        ReleaseNameReply::NotOwner
    );
    assert!(client.release_name("org.example.Weird").is_err());

    assert!(client.name_has_owner("org.example.Svc").unwrap());
    assert!(!client.name_has_owner("org.example.Gone").unwrap());
    assert!(client.name_has_owner("org.example.Weird").is_err());

    let rule = MatchRule::new_signal("org.example.Sig", "Changed");
    client.add_match(&rule).unwrap();
    client.add_match_str("type='signal'").unwrap();
    assert_eq!(
        *matches.lock(),
        vec![rule.to_string(), "type='signal'".to_string()]
    );

    assert_eq!(
        client.list_names().unwrap(),
        vec!["org.freedesktop.DBus".to_string(), ":1.42".to_string()]
    );
    assert_eq!(client.get_name_owner("org.example.Svc").unwrap(), ":1.42");
    assert_eq!(
        client.start_service_by_name("org.example.Svc", 0).unwrap(),
        StartReply::AlreadyRunning
    );
    assert_eq!(
        client.start_service_by_name("org.example.Svc", 1).unwrap(),
        StartReply::Success
    );

    drop(client);
    peer.join().unwrap();
}

struct NoHello;

impl Interface for NoHello {
    fn get_name(&self) -> &str {
        "org.freedesktop.DBus"
    }

    fn call(&self, _call: &mut Call) -> Result<()> {
        Err(ErrorKind::CallbackFailed("bus is full".into()).into())
    }
}

#[test]
fn failed_hello_fails_setup() {
    let (a, b) = UnixStream::pair().unwrap();
    let guid = generate_guid();
    let peer = thread::spawn(move || {
        let mut server =
            Connection::new_server(Box::new(b), &guid, ConnectionConfig::peer_to_peer()).unwrap();
        server.register_interface(Arc::new(NoHello));
        serve(server);
    });

    let err = Connection::new(Box::new(a), ConnectionConfig::default())
        .err()
        .unwrap();
    assert!(err.to_string().contains("bus is full"), "{}", err);
    peer.join().unwrap();
}
