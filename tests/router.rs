use courier::{
    Context, Error, Msg, RecvFlags, SendFlags, SocketOption, SocketType,
};

fn recv_message(socket: &mut courier::Socket) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        let msg = socket.recv(RecvFlags::DONT_WAIT).expect("frame available");
        let more = msg.has_more();
        frames.push(msg.data().to_vec());
        if !more {
            return frames;
        }
    }
}

#[test]
fn router_echo_round_trip() {
    let ctx = Context::new();
    let mut master = ctx.socket(SocketType::Router).unwrap();
    master.set_option(SocketOption::RoutingId(b"MASTER")).unwrap();
    master.bind("inproc://echo").unwrap();

    let mut worker = ctx.socket(SocketType::Router).unwrap();
    worker.set_option(SocketOption::RoutingId(b"W1")).unwrap();
    worker.connect("inproc://echo").unwrap();

    worker.send(Msg::from("MASTER"), SendFlags::MORE).unwrap();
    worker.send(Msg::from(""), SendFlags::MORE).unwrap();
    worker.send(Msg::from("ping"), SendFlags::default()).unwrap();

    let request = recv_message(&mut master);
    assert_eq!(
        request,
        vec![b"W1".to_vec(), b"".to_vec(), b"ping".to_vec()]
    );

    master.send(Msg::from("W1"), SendFlags::MORE).unwrap();
    master.send(Msg::from(""), SendFlags::MORE).unwrap();
    master.send(Msg::from("pong"), SendFlags::default()).unwrap();

    let reply = recv_message(&mut worker);
    assert_eq!(
        reply,
        vec![b"MASTER".to_vec(), b"".to_vec(), b"pong".to_vec()]
    );
}

#[test]
fn send_to_addresses_exactly_one_peer() {
    let ctx = Context::new();
    let mut hub = ctx.socket(SocketType::Router).unwrap();
    hub.set_option(SocketOption::RoutingId(b"HUB")).unwrap();
    hub.bind("inproc://addressed").unwrap();

    let mut peer_b = ctx.socket(SocketType::Router).unwrap();
    peer_b.set_option(SocketOption::RoutingId(b"B")).unwrap();
    peer_b.connect("inproc://addressed").unwrap();

    let mut peer_c = ctx.socket(SocketType::Router).unwrap();
    peer_c.set_option(SocketOption::RoutingId(b"C")).unwrap();
    peer_c.connect("inproc://addressed").unwrap();

    // Make the hub adopt both pipes.
    hub.send_to(b"B", Msg::from("for-b"), SendFlags::default()).unwrap();

    let received = recv_message(&mut peer_b);
    assert_eq!(received, vec![b"HUB".to_vec(), b"for-b".to_vec()]);
    assert!(peer_c.recv(RecvFlags::DONT_WAIT).is_err());
}

#[test]
fn unknown_peer_drops_silently_without_mandatory() {
    let ctx = Context::new();
    let mut router = ctx.socket(SocketType::Router).unwrap();
    router.bind("inproc://quiet-drop").unwrap();
    router
        .send_to(b"nobody", Msg::from("lost"), SendFlags::default())
        .unwrap();
}

#[test]
fn unknown_peer_fails_with_mandatory() {
    let ctx = Context::new();
    let mut router = ctx.socket(SocketType::Router).unwrap();
    router.set_option(SocketOption::RouterMandatory(true)).unwrap();
    router.bind("inproc://mandatory").unwrap();

    let result = router.send_to(b"nobody", Msg::from("lost"), SendFlags::default());
    assert!(matches!(result, Err(Error::HostUnreachable)));
}

#[test]
fn anonymous_peers_get_generated_identities() {
    let ctx = Context::new();
    let mut router = ctx.socket(SocketType::Router).unwrap();
    router.bind("inproc://anon").unwrap();

    let mut pair_a = ctx.socket(SocketType::Router).unwrap();
    pair_a.set_option(SocketOption::ConnectRoutingId(b"TEMP-A")).unwrap();
    pair_a.connect("inproc://anon").unwrap();

    // The bound router never set a routing id, so the connector assigned
    // its pipe a generated identity: a zero byte plus a 32-bit counter.
    let generated = [0u8, 0, 0, 0, 0];
    pair_a.send(Msg::from(&generated[..]), SendFlags::MORE).unwrap();
    pair_a.send(Msg::from("hi"), SendFlags::default()).unwrap();

    // The bound side sees the identity the connector announced.
    let frames = recv_message(&mut router);
    assert_eq!(frames, vec![b"TEMP-A".to_vec(), b"hi".to_vec()]);
}

#[test]
fn duplicate_identity_is_rejected_without_handover() {
    let ctx = Context::new();
    let mut router = ctx.socket(SocketType::Router).unwrap();
    router.set_option(SocketOption::RoutingId(b"HUB")).unwrap();
    router.bind("inproc://dup").unwrap();

    let mut first = ctx.socket(SocketType::Router).unwrap();
    first.set_option(SocketOption::RoutingId(b"SAME")).unwrap();
    first.connect("inproc://dup").unwrap();

    let mut second = ctx.socket(SocketType::Router).unwrap();
    second.set_option(SocketOption::RoutingId(b"SAME")).unwrap();
    second.connect("inproc://dup").unwrap();

    // Make the router adopt both attaches: the second pipe is refused.
    first.send(Msg::from("HUB"), SendFlags::MORE).unwrap();
    first.send(Msg::from("from-first"), SendFlags::default()).unwrap();
    let request = recv_message(&mut router);
    assert_eq!(request, vec![b"SAME".to_vec(), b"from-first".to_vec()]);

    // The refused peer's traffic goes nowhere.
    second.send(Msg::from("HUB"), SendFlags::MORE).unwrap();
    second.send(Msg::from("from-second"), SendFlags::default()).unwrap();
    assert!(router.recv(RecvFlags::DONT_WAIT).is_err());
}

#[test]
fn handover_replaces_the_previous_peer() {
    let ctx = Context::new();
    let mut router = ctx.socket(SocketType::Router).unwrap();
    router.set_option(SocketOption::RouterHandover(true)).unwrap();
    router.set_option(SocketOption::RoutingId(b"HUB")).unwrap();
    router.bind("inproc://handover").unwrap();

    let mut first = ctx.socket(SocketType::Router).unwrap();
    first.set_option(SocketOption::RoutingId(b"SAME")).unwrap();
    first.connect("inproc://handover").unwrap();
    // Force the router to adopt the first pipe now.
    router.send_to(b"SAME", Msg::from("hello-first"), SendFlags::default()).unwrap();

    let mut second = ctx.socket(SocketType::Router).unwrap();
    second.set_option(SocketOption::RoutingId(b"SAME")).unwrap();
    second.connect("inproc://handover").unwrap();

    // After handover the identity routes to the newcomer.
    router.send_to(b"SAME", Msg::from("hello-second"), SendFlags::default()).unwrap();
    let received = recv_message(&mut second);
    assert_eq!(received, vec![b"HUB".to_vec(), b"hello-second".to_vec()]);
}

#[test]
fn mandatory_full_pipe_reports_would_block() {
    let ctx = Context::new();
    let mut router = ctx.socket(SocketType::Router).unwrap();
    router.set_option(SocketOption::RouterMandatory(true)).unwrap();
    router.set_option(SocketOption::SndHwm(2)).unwrap();
    router.bind("inproc://backpressure").unwrap();

    let mut peer = ctx.socket(SocketType::Router).unwrap();
    peer.set_option(SocketOption::RoutingId(b"P")).unwrap();
    peer.set_option(SocketOption::RcvHwm(2)).unwrap();
    peer.connect("inproc://backpressure").unwrap();

    router.send_to(b"P", Msg::from("one"), SendFlags::DONT_WAIT).unwrap();
    router.send_to(b"P", Msg::from("two"), SendFlags::DONT_WAIT).unwrap();
    let result = router.send_to(b"P", Msg::from("three"), SendFlags::DONT_WAIT);
    assert!(matches!(result, Err(Error::WouldBlock)));
}
