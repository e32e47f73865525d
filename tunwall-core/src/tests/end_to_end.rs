use super::*;
use crate::config::{CaptureConfig, UpstreamRelay};
use crate::dns::{self, tests::build_query, tests::build_response};
use crate::packet::{build_icmp, TcpFlags, ICMPV4_ECHO_REPLY, ICMPV4_ECHO_REQUEST};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream, UdpSocket};

fn udp_sink() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    socket
}

/// Complete the virtual handshake; returns the relay's accepted stream and our next seq
fn establish(h: &Harness, client: &Client, listener: &TcpListener, isn: u32) -> (TcpStream, u32) {
    h.send(client.syn(isn));
    let (server, _) = listener.accept().unwrap();
    server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let (synack, payload) = h.recv_tcp();
    assert!(synack.flags.syn && synack.flags.ack, "expected SYN-ACK, got {}", synack.flags);
    assert_eq!(synack.ack, isn.wrapping_add(1));
    assert!(payload.is_empty());

    let ours = synack.seq.wrapping_add(1);
    h.send(client.segment(isn.wrapping_add(1), ours, TcpFlags::ack_only(), &[]));
    (server, ours)
}

#[test]
fn dns_query_is_relayed_and_resolution_reported() {
    let resolver = udp_sink();
    let h = Harness::start(fast_config(), TestHost::redirect_all(resolver.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:40003", "10.0.0.1:53");

    let query = build_query(0x4242, "example.com", 1);
    h.send(client.udp(&query));

    let mut buf = [0u8; 512];
    let (n, from) = resolver.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &query[..]);

    let response = build_response(0x4242, "example.com", "edge.example.net", Ipv4Addr::new(93, 184, 216, 34), 300);
    resolver.send_to(&response, from).unwrap();

    let (src, dst, payload) = udp_payload(&h.recv());
    assert_eq!(src, client.dst);
    assert_eq!(dst, client.src);
    assert_eq!(payload, response);

    {
        let recorded = h.recorded.lock();
        assert_eq!(recorded.dns.len(), 1);
        let record = &recorded.dns[0];
        assert_eq!(record.query_name, "example.com");
        assert_eq!(record.answer_name, "edge.example.net");
        assert_eq!(record.resource, "93.184.216.34");
        assert_eq!(record.ttl, 300);

        assert_eq!(recorded.packets.len(), 1);
        assert!(recorded.packets[0].allowed);
        assert_eq!(recorded.packets[0].data, "example.com");
        assert_eq!(recorded.packets[0].protocol, 17);
    }

    let recorded = h.recorded.clone();
    h.stop().unwrap();
    let usage = &recorded.lock().usage;
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].sent, query.len() as u64);
    assert_eq!(usage[0].received, response.len() as u64);
    assert_eq!(usage[0].uid, TEST_UID);
}

#[test]
fn denied_syn_gets_one_reset_and_no_session() {
    let h = Harness::start(fast_config(), TestHost::new(|_| Verdict::Deny));
    let client = Client::new("10.0.0.2:40002", "203.0.113.9:443");

    h.send(client.syn(5000));
    let (rst, payload) = h.recv_tcp();
    assert!(rst.flags.rst && rst.flags.ack);
    assert_eq!(rst.ack, 5001);
    assert!(payload.is_empty());
    assert!(h.quiet_for(Duration::from_millis(200)));

    assert!(h.firewall.sessions().is_empty());
    let stats = h.firewall.stats();
    assert_eq!(stats.relay_opened, 0);
    assert_eq!(stats.denied, 1);

    let recorded = h.recorded.lock();
    assert_eq!(recorded.packets.len(), 1);
    assert!(!recorded.packets[0].allowed);
    assert_eq!(recorded.packets[0].flags, "S");
    assert_eq!(recorded.packets[0].dst, client.dst);
}

#[test]
fn segment_for_unknown_flow_is_reset() {
    let h = Harness::start(fast_config(), TestHost::allow_all());
    let client = Client::new("10.0.0.2:40010", "203.0.113.9:80");

    h.send(client.segment(10, 4242, TcpFlags::psh_ack(), b"late"));
    let (rst, _) = h.recv_tcp();
    assert!(rst.flags.rst && !rst.flags.ack);
    assert_eq!(rst.seq, 4242);
    assert!(h.recorded.lock().packets.is_empty());
}

#[test]
fn tcp_stream_is_relayed_until_time_wait() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let h = Harness::start(fast_config(), TestHost::redirect_all(listener.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:40001", "93.184.216.34:80");

    h.send(client.syn(1000));
    let (mut server, _) = listener.accept().unwrap();
    server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let (synack, _) = h.recv_tcp();
    assert!(synack.flags.syn && synack.flags.ack);
    assert_eq!(synack.ack, 1001);
    assert_eq!(synack.mss, Some(9960));
    let ours = synack.seq.wrapping_add(1);
    h.send(client.segment(1001, ours, TcpFlags::ack_only(), &[]));

    let mut seq = 1001u32;
    for chunk in [&b"one"[..], b"two", b"three"] {
        h.send(client.segment(seq, ours, TcpFlags::psh_ack(), chunk));
        seq += chunk.len() as u32;
        let expected = seq;
        h.recv_tcp_until(|tcp| tcp.ack == expected);
    }

    h.send(client.segment(seq, ours, TcpFlags::fin_ack(), &[]));
    h.recv_tcp_until(|tcp| tcp.ack == seq + 1);

    // Half-close reaches the relay after all three payloads
    let mut received = Vec::new();
    server.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"onetwothree");
    drop(server);

    let segments = h.recv_tcp_until(|tcp| tcp.flags.fin);
    let (fin, _) = segments.last().unwrap();
    assert_eq!(fin.seq, ours);
    h.send(client.segment(seq + 1, fin.seq.wrapping_add(1), TcpFlags::ack_only(), &[]));

    wait_for("TIME_WAIT", || {
        h.firewall.sessions().iter().any(|s| s.state == "TIME_WAIT")
    });
    wait_for("eviction after linger", || h.firewall.sessions().is_empty());

    let recorded = h.recorded.lock();
    assert_eq!(recorded.connections, vec![(client.dst, b"one".to_vec())]);
    assert_eq!(recorded.usage.len(), 1);
    assert_eq!(recorded.usage[0].sent, 11);
    assert_eq!(recorded.usage[0].received, 0);
    assert_eq!(recorded.usage[0].dst, client.dst);
}

#[test]
fn relay_data_flows_back_to_client() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let h = Harness::start(fast_config(), TestHost::redirect_all(listener.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:40004", "93.184.216.34:80");
    let (mut server, ours) = establish(&h, &client, &listener, 77);

    server.write_all(b"hello from relay").unwrap();
    let segments = h.recv_tcp_until(|tcp| tcp.flags.psh);
    let (data, payload) = segments.last().unwrap();
    assert_eq!(payload, b"hello from relay");
    assert_eq!(data.seq, ours);

    h.send(client.segment(78, ours + payload.len() as u32, TcpFlags::ack_only(), &[]));
    wait_for("received bytes", || {
        h.firewall.sessions().first().map(|s| s.bytes_received) == Some(16)
    });
    assert_eq!(h.firewall.query_stats().tcp_count, 1);
}

#[test]
fn client_reset_aborts_relay_and_removes_session() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let h = Harness::start(fast_config(), TestHost::redirect_all(listener.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:40005", "93.184.216.34:80");
    let (mut server, ours) = establish(&h, &client, &listener, 9000);
    wait_for("established", || h.firewall.sessions().len() == 1);

    h.send(client.segment(9001, ours, TcpFlags::rst_only(), &[]));
    wait_for("session removal", || h.firewall.sessions().is_empty());
    let stats = h.firewall.stats();
    assert_eq!(stats.relay_opened, 1);
    assert_eq!(stats.relay_closed, 1);

    // The peer sees an abort, not an orderly close
    let mut buf = [0u8; 16];
    let err = server.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
}

#[test]
fn relay_reset_is_propagated_to_client() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let h = Harness::start(fast_config(), TestHost::redirect_all(listener.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:40006", "93.184.216.34:80");
    let (server, _) = establish(&h, &client, &listener, 1);

    socket2::SockRef::from(&server).set_linger(Some(Duration::ZERO)).unwrap();
    drop(server);

    h.recv_tcp_until(|tcp| tcp.flags.rst);
    wait_for("session removal", || h.firewall.sessions().is_empty());
}

#[test]
fn refused_connect_resets_client() {
    // Bind then drop to get a port nobody listens on
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let h = Harness::start(fast_config(), TestHost::redirect_all(port));
    let client = Client::new("10.0.0.2:40007", "93.184.216.34:80");

    h.send(client.syn(300));
    let (rst, _) = h.recv_tcp();
    assert!(rst.flags.rst && rst.flags.ack);
    assert_eq!(rst.ack, 301);
    wait_for("session removal", || h.firewall.sessions().is_empty());
}

#[test]
fn tcp_through_socks5_upstream() {
    let proxy = TcpListener::bind("127.0.0.1:0").unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let proxy_thread = thread::spawn(move || {
        let (mut stream, _) = proxy.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).unwrap();
        stream.write_all(&[5, 0]).unwrap();

        let mut request = [0u8; 10];
        stream.read_exact(&mut request).unwrap();
        stream.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0x1f, 0x90]).unwrap();

        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).unwrap();
        stream.write_all(b"pong").unwrap();

        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
        (greeting, request, ping)
    });

    let h = Harness::start(fast_config(), TestHost::allow_all());
    h.firewall
        .configure_upstream_relay(Some(UpstreamRelay::new(proxy_addr.ip(), proxy_addr.port())));
    let client = Client::new("10.0.0.2:40008", "198.51.100.7:443");

    h.send(client.syn(50));
    let (synack, _) = h.recv_tcp();
    assert!(synack.flags.syn && synack.flags.ack);
    let ours = synack.seq.wrapping_add(1);
    h.send(client.segment(51, ours, TcpFlags::ack_only(), &[]));
    h.send(client.segment(51, ours, TcpFlags::psh_ack(), b"ping"));

    let segments = h.recv_tcp_until(|tcp| tcp.flags.psh);
    assert_eq!(segments.last().unwrap().1, b"pong");

    h.send(client.segment(55, ours, TcpFlags::rst_only(), &[]));
    let (greeting, request, ping) = proxy_thread.join().unwrap();
    assert_eq!(greeting, [5, 1, 0]);
    assert_eq!(request, [5, 1, 0, 1, 198, 51, 100, 7, 0x01, 0xbb]);
    assert_eq!(&ping, b"ping");
}

#[test]
fn blocked_domain_is_answered_locally_and_captured() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dns.pcap");
    let firewall = Arc::new(Firewall::with_config(29, fast_config()).unwrap());
    firewall
        .configure_capture(Some(CaptureConfig {
            path: path.clone(),
            record_size: 64,
            max_file_size: 1 << 20,
        }))
        .unwrap();
    let h = Harness::start_on(firewall, TestHost::allow_all().block("ads.example.com"));
    let client = Client::new("10.0.0.2:40009", "10.0.0.1:53");

    let query = build_query(0x0bad, "ads.example.com", 1);
    h.send(client.udp(&query));
    let (src, _, payload) = udp_payload(&h.recv());
    assert_eq!(src, client.dst);

    let reply = dns::parse_message(&payload).unwrap();
    assert!(reply.is_response());
    assert_eq!(reply.id, 0x0bad);
    assert_eq!(reply.rcode(), 3);
    assert!(reply.answers.is_empty());

    assert!(h.firewall.sessions().is_empty());
    assert_eq!(h.firewall.stats().relay_opened, 0);
    assert!(h.recorded.lock().packets.is_empty());

    h.firewall.configure_capture(None).unwrap();
    let capture = std::fs::read(&path).unwrap();
    // Global header, then the query in and the reply out
    let first_len = u32::from_le_bytes(capture[32..36].try_into().unwrap()) as usize;
    let second = 24 + 16 + first_len;
    assert_eq!(capture.len(), second + 16 + (payload.len() + 28).min(64));
}

#[test]
fn denied_udp_is_dropped_silently() {
    let h = Harness::start(fast_config(), TestHost::new(|_| Verdict::Deny));
    let client = Client::new("10.0.0.2:40011", "198.51.100.1:123");

    h.send(client.udp(b"ntp?"));
    assert!(h.quiet_for(Duration::from_millis(200)));
    assert!(h.firewall.sessions().is_empty());

    let recorded = h.recorded.lock();
    assert_eq!(recorded.packets.len(), 1);
    assert!(!recorded.packets[0].allowed);
    assert_eq!(recorded.packets[0].protocol, 17);
}

#[test]
fn undecodable_packets_are_counted() {
    let h = Harness::start(fast_config(), TestHost::allow_all());
    h.send(vec![0x45, 0x00, 0x00]);
    h.send(vec![0x60; 10]);
    wait_for("decode failures", || h.firewall.stats().decode_failures == 2);
    assert!(h.firewall.sessions().is_empty());
}

#[test]
fn stop_tears_down_every_session() {
    let sink = udp_sink();
    let h = Harness::start(fast_config(), TestHost::redirect_all(sink.local_addr().unwrap()));

    for port in 41000..41003 {
        let client = Client::new(&format!("10.0.0.2:{}", port), "198.51.100.1:9999");
        h.send(client.udp(b"x"));
    }
    wait_for("three sessions", || h.firewall.query_stats().udp_count == 3);

    let firewall = h.firewall.clone();
    let recorded = h.recorded.clone();
    h.stop().unwrap();

    assert!(firewall.sessions().is_empty());
    let stats = firewall.stats();
    assert_eq!(stats.relay_opened, 3);
    assert_eq!(stats.relay_closed, 3);
    assert_eq!(recorded.lock().usage.len(), 3);
}

#[test]
fn clear_keeps_dispatcher_running() {
    let sink = udp_sink();
    let h = Harness::start(fast_config(), TestHost::redirect_all(sink.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:41100", "198.51.100.1:9999");

    h.send(client.udp(b"first"));
    wait_for("session", || h.firewall.sessions().len() == 1);
    h.firewall.clear();
    assert!(h.firewall.sessions().is_empty());
    wait_for("usage flushed", || h.recorded.lock().usage.len() == 1);

    h.send(client.udp(b"second"));
    wait_for("new session", || h.firewall.sessions().len() == 1);
    assert!(h.firewall.is_running());
    h.stop().unwrap();
}

#[test]
fn idle_udp_session_is_swept() {
    let sink = udp_sink();
    let config = EngineConfig {
        udp_timeout_ms: 200,
        ..fast_config()
    };
    let h = Harness::start(config, TestHost::redirect_all(sink.local_addr().unwrap()));
    let idle = Client::new("10.0.0.2:42000", "198.51.100.1:5000");
    let active = Client::new("10.0.0.2:42001", "198.51.100.1:5000");

    h.send(idle.udp(b"once"));
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(600) {
        h.send(active.udp(b"keepalive"));
        thread::sleep(Duration::from_millis(40));
    }

    let sessions = h.firewall.sessions();
    assert!(sessions.iter().all(|s| s.key.src != idle.src));
    assert!(sessions.iter().any(|s| s.key.src == active.src));
}

#[test]
fn run_reports_bad_descriptor() {
    let firewall = Firewall::init(29);
    firewall.start(LogLevel::Info);
    let mut host = TestHost::allow_all();
    let recorded = host.recorded.clone();

    assert!(firewall.run(-1, false, 0, &mut host).is_err());
    let errors = &recorded.lock().errors;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 1);
}

fn session_state(h: &Harness) -> Option<String> {
    h.firewall.sessions().first().map(|s| s.state.clone())
}

#[test]
fn retransmitted_client_data_reaches_the_relay_once() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let h = Harness::start(fast_config(), TestHost::redirect_all(listener.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:40032", "93.184.216.34:80");
    let (mut server, ours) = establish(&h, &client, &listener, 100);

    h.send(client.segment(101, ours, TcpFlags::psh_ack(), b"abc"));
    h.send(client.segment(101, ours, TcpFlags::psh_ack(), b"abc"));
    h.send(client.segment(102, ours, TcpFlags::psh_ack(), b"bcdef"));
    // Beyond the next expected byte: not queued
    h.send(client.segment(120, ours, TcpFlags::psh_ack(), b"zzz"));
    h.send(client.segment(107, ours, TcpFlags::fin_ack(), &[]));

    let mut received = Vec::new();
    server.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"abcdef");
    assert_eq!(h.recorded.lock().connections, vec![(client.dst, b"abc".to_vec())]);
}

#[test]
fn repeated_syn_gets_the_same_syn_ack() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let h = Harness::start(fast_config(), TestHost::redirect_all(listener.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:40033", "93.184.216.34:80");
    let (_server, ours) = establish(&h, &client, &listener, 4000);

    h.send(client.syn(4000));
    let (synack, _) = h.recv_tcp();
    assert!(synack.flags.syn && synack.flags.ack, "expected SYN-ACK, got {}", synack.flags);
    assert_eq!(synack.seq, ours.wrapping_sub(1));
    assert_eq!(synack.ack, 4001);
    assert_eq!(h.firewall.sessions().len(), 1);
    assert_eq!(h.firewall.stats().relay_opened, 1);
}

#[test]
fn unacknowledged_data_is_retransmitted_until_acked() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let config = EngineConfig {
        tcp_retransmit_ms: 150,
        ..fast_config()
    };
    let h = Harness::start(config, TestHost::redirect_all(listener.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:40031", "93.184.216.34:80");
    let (mut server, ours) = establish(&h, &client, &listener, 800);

    server.write_all(b"resend me").unwrap();
    let first = h.recv_tcp_until(|tcp| tcp.flags.psh);
    let (seg, payload) = first.last().unwrap();
    assert_eq!(seg.seq, ours);
    assert_eq!(payload, b"resend me");

    let again = h.recv_tcp_until(|tcp| tcp.flags.psh);
    let (seg, payload) = again.last().unwrap();
    assert_eq!(seg.seq, ours);
    assert_eq!(payload, b"resend me");

    h.send(client.segment(801, ours + 9, TcpFlags::ack_only(), &[]));
    // A copy may already be in flight when the ACK lands
    let quiet = (0..3).any(|_| h.quiet_for(Duration::from_millis(400)));
    assert!(quiet, "retransmission continued after the ACK");
}

#[test]
fn relay_closing_first_reports_last_ack_then_fin_wait2() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let h = Harness::start(fast_config(), TestHost::redirect_all(listener.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:40030", "93.184.216.34:80");
    let (server, ours) = establish(&h, &client, &listener, 700);

    drop(server);
    let segments = h.recv_tcp_until(|tcp| tcp.flags.fin);
    let (fin, _) = segments.last().unwrap();
    assert_eq!(fin.seq, ours);
    wait_for("LAST_ACK", || session_state(&h).as_deref() == Some("LAST_ACK"));

    h.send(client.segment(701, ours + 1, TcpFlags::ack_only(), &[]));
    wait_for("FIN_WAIT2", || session_state(&h).as_deref() == Some("FIN_WAIT2"));

    h.send(client.segment(701, ours + 1, TcpFlags::fin_ack(), &[]));
    h.recv_tcp_until(|tcp| tcp.ack == 702);
    wait_for("TIME_WAIT", || session_state(&h).as_deref() == Some("TIME_WAIT"));
}

#[test]
fn dns_forward_sends_queries_to_the_resolver() {
    let resolver = udp_sink();
    let config = EngineConfig {
        dns_resolver: Some(resolver.local_addr().unwrap()),
        ..fast_config()
    };
    let firewall = Arc::new(Firewall::with_config(29, config).unwrap());
    let h = Harness::start_with(firewall, TestHost::allow_all(), true);
    let client = Client::new("10.0.0.2:40020", "192.0.2.53:53");

    let query = build_query(0x5151, "example.org", 1);
    h.send(client.udp(&query));

    let mut buf = [0u8; 512];
    let (n, from) = resolver.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], &query[..]);

    let response = build_response(0x5151, "example.org", "edge.example.org", Ipv4Addr::new(192, 0, 2, 80), 60);
    resolver.send_to(&response, from).unwrap();

    // The reply comes from the address the client asked, not the resolver
    let (src, dst, payload) = udp_payload(&h.recv());
    assert_eq!(src, client.dst);
    assert_eq!(dst, client.src);
    assert_eq!(payload, response);
    assert_eq!(h.recorded.lock().dns.len(), 1);
}

#[test]
fn dns_port_sessions_outlive_the_generic_udp_timeout() {
    let sink = udp_sink();
    let config = EngineConfig {
        udp_timeout_ms: 200,
        udp_dns_timeout_ms: 5_000,
        ..fast_config()
    };
    let h = Harness::start(config, TestHost::redirect_all(sink.local_addr().unwrap()));
    let dns_client = Client::new("10.0.0.2:43000", "198.51.100.1:53");
    let other = Client::new("10.0.0.2:43001", "198.51.100.1:5353");

    h.send(dns_client.udp(&build_query(1, "example.com", 1)));
    h.send(other.udp(b"x"));
    wait_for("two sessions", || h.firewall.sessions().len() == 2);
    wait_for("generic timeout", || {
        h.firewall.sessions().iter().all(|s| s.key.src != other.src)
    });

    let sessions = h.firewall.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].key.src, dns_client.src);
}

#[test]
fn relay_datagram_over_the_mtu_is_dropped_and_counted() {
    let sink = udp_sink();
    let config = EngineConfig {
        mtu: 1280,
        ..fast_config()
    };
    let h = Harness::start(config, TestHost::redirect_all(sink.local_addr().unwrap()));
    let client = Client::new("10.0.0.2:44000", "198.51.100.1:7000");

    h.send(client.udp(b"hi"));
    let mut buf = [0u8; 64];
    let (_, from) = sink.recv_from(&mut buf).unwrap();

    sink.send_to(&[7u8; 2000], from).unwrap();
    sink.send_to(&[8u8; 1252], from).unwrap();

    let raw = h.recv();
    assert_eq!(raw.len(), 1280);
    let (_, _, payload) = udp_payload(&raw);
    assert_eq!(payload, vec![8u8; 1252]);
    assert_eq!(h.firewall.stats().oversized, 1);
}

fn ping_sockets_available() -> bool {
    socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::ICMPV4),
    )
    .is_ok()
}

#[test]
fn echo_request_is_relayed_with_client_ident() {
    if !ping_sockets_available() {
        // net.ipv4.ping_group_range excludes us
        return;
    }
    let h = Harness::start(fast_config(), TestHost::allow_all());
    let client: IpAddr = "10.0.0.2".parse().unwrap();
    let target: IpAddr = "127.0.0.1".parse().unwrap();

    let mut echo = vec![ICMPV4_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0x00, 0x07];
    echo.extend_from_slice(b"ping");
    h.send(build_icmp(client, target, &echo).unwrap());

    let reply = h.recv();
    let packet = parse_packet(&reply, true).unwrap();
    assert_eq!(packet.src_addr, target);
    assert_eq!(packet.dst_addr, client);
    let TransportInfo::Icmp(icmp) = &packet.transport else {
        panic!("expected ICMP, got {:?}", packet.transport);
    };
    assert_eq!(icmp.icmp_type, ICMPV4_ECHO_REPLY);
    assert_eq!(icmp.ident, 0x1234);
    assert_eq!(icmp.seq_no, 7);
    assert_eq!(packet.payload, b"ping");

    let recorded = h.recorded.lock();
    assert_eq!(recorded.packets.len(), 1);
    assert_eq!(recorded.packets[0].protocol, 1);
}

#[test]
fn non_echo_icmp_is_dropped_without_a_session() {
    let h = Harness::start(fast_config(), TestHost::allow_all());
    // Timestamp request
    let mut timestamp = vec![13u8, 0, 0, 0, 0x12, 0x34, 0x00, 0x01];
    timestamp.extend_from_slice(&[0u8; 12]);
    h.send(build_icmp("10.0.0.2".parse().unwrap(), "127.0.0.1".parse().unwrap(), &timestamp).unwrap());

    assert!(h.quiet_for(Duration::from_millis(200)));
    assert!(h.firewall.sessions().is_empty());
    assert!(h.recorded.lock().packets.is_empty());
    assert_eq!(h.firewall.stats().relay_opened, 0);
}
