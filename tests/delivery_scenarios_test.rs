//! End-to-end delivery scenarios against an in-process fake SMTP server.

use mta_rs::collab::inmemory::{InMemoryQueue, NullCertAuthority, OneShotRouteManager, StaticPtrResolver};
use mta_rs::collab::{Relay, Route};
use mta_rs::config::{RelayPolicy, SecurityPolicy, SessionConfig};
use mta_rs::metrics::Metrics;
use mta_rs::smtp::supervisor::Collaborators;
use mta_rs::smtp::task::{Mailbox, Task, Verdict};
use mta_rs::smtp::Supervisor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

async fn bind_fake_server() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn read_cmd<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line.trim_end_matches(['\r', '\n']).to_string()
}

async fn read_body_until_dot<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let line = read_cmd(reader).await;
        if line == "." {
            break;
        }
        lines.push(line);
    }
    lines
}

fn harness(route_manager: Arc<OneShotRouteManager>) -> Collaborators {
    Collaborators {
        queue: Arc::new(InMemoryQueue::new()),
        route_manager,
        ca: Arc::new(NullCertAuthority),
        ptr_resolver: Arc::new(StaticPtrResolver(None)),
        metrics: Arc::new(Metrics::new()),
    }
}

fn plain_relay(name: &str, security: SecurityPolicy) -> Arc<Relay> {
    Arc::new(Relay {
        name: name.to_string(),
        policy: RelayPolicy {
            security,
            secret: None,
            client_cert_name: None,
            port_override: None,
        },
    })
}

fn route_to(addr: SocketAddr) -> Arc<Route> {
    Arc::new(Route {
        source_addr: None,
        dest_addr: addr.ip(),
        dest_ptrname: None,
    })
}

/// S1 — happy path, cleartext, one recipient.
#[tokio::test]
async fn s1_happy_path_cleartext_one_recipient() {
    let (listener, addr) = bind_fake_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"220 mx.example ESMTP\r\n").await.unwrap();
        assert!(read_cmd(&mut reader).await.starts_with("EHLO"));
        write_half
            .write_all(b"250-mx.example\r\n250 PIPELINING\r\n")
            .await
            .unwrap();

        assert!(read_cmd(&mut reader).await.starts_with("MAIL FROM:"));
        write_half.write_all(b"250 2.1.0 Ok\r\n").await.unwrap();

        assert!(read_cmd(&mut reader).await.starts_with("RCPT TO:"));
        write_half.write_all(b"250 2.1.5 Ok\r\n").await.unwrap();

        assert_eq!(read_cmd(&mut reader).await, "DATA");
        write_half
            .write_all(b"354 End data with <CRLF>.<CRLF>\r\n")
            .await
            .unwrap();

        let body = read_body_until_dot(&mut reader).await;
        assert!(body.iter().any(|l| l == "Subject: hi"));
        write_half
            .write_all(b"250 2.0.0 Ok: queued as ABC\r\n")
            .await
            .unwrap();

        assert_eq!(read_cmd(&mut reader).await, "QUIT");
        write_half.write_all(b"221 2.0.0 Bye\r\n").await.unwrap();
    });

    let task = Task::new(
        uuid::Uuid::new_v4(),
        Mailbox::new("a", "x"),
        vec![Mailbox::new("b", "y")],
    );
    let message_id = task.message_id;
    let route_manager = Arc::new(OneShotRouteManager::new(vec![task]));
    let mut collabs = harness(route_manager.clone());
    let queue = Arc::new(InMemoryQueue::new().with_message(message_id, b"Subject: hi\r\n\r\nhello\r\n".to_vec()));
    collabs.queue = queue.clone();

    let supervisor = Supervisor::new(SessionConfig::default(), collabs);
    let relay = plain_relay("mx.example", SecurityPolicy::ForcePlain);
    let outcome = supervisor.start(relay, route_to(addr)).await.expect("session should succeed");

    server.await.unwrap();

    assert!(outcome.reached_ready);
    assert_eq!(outcome.delivered_count, 1);

    let reports = queue.reports.lock().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].2, Verdict::Ok);

    let events = route_manager.events.lock().unwrap();
    assert!(events.iter().any(|e| e == "route_ok"));
}

/// S2 — opportunistic STARTTLS succeeds, then the rest of the dialog
/// follows S1's shape over the encrypted channel.
#[tokio::test]
async fn s2_opportunistic_starttls_succeeds() {
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, PrivateKeyDer};

    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["mx.example".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let (listener, addr) = bind_fake_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"220 mx.example ESMTP\r\n").await.unwrap();
        assert!(read_cmd(&mut reader).await.starts_with("EHLO"));
        write_half
            .write_all(b"250-mx.example\r\n250 STARTTLS\r\n")
            .await
            .unwrap();

        assert_eq!(read_cmd(&mut reader).await, "STARTTLS");
        write_half.write_all(b"220 Ready to start TLS\r\n").await.unwrap();

        let plain = reader.into_inner();
        let tls_stream = acceptor.accept(plain).await.unwrap();
        let (tls_read, mut tls_write) = tokio::io::split(tls_stream);
        let mut tls_reader = BufReader::new(tls_read);

        assert!(read_cmd(&mut tls_reader).await.starts_with("EHLO"));
        tls_write.write_all(b"250 mx.example\r\n").await.unwrap();

        assert!(read_cmd(&mut tls_reader).await.starts_with("MAIL FROM:"));
        tls_write.write_all(b"250 2.1.0 Ok\r\n").await.unwrap();

        assert!(read_cmd(&mut tls_reader).await.starts_with("RCPT TO:"));
        tls_write.write_all(b"250 2.1.5 Ok\r\n").await.unwrap();

        assert_eq!(read_cmd(&mut tls_reader).await, "DATA");
        tls_write
            .write_all(b"354 End data with <CRLF>.<CRLF>\r\n")
            .await
            .unwrap();
        let _body = read_body_until_dot(&mut tls_reader).await;
        tls_write.write_all(b"250 2.0.0 Ok: queued\r\n").await.unwrap();

        assert_eq!(read_cmd(&mut tls_reader).await, "QUIT");
        tls_write.write_all(b"221 2.0.0 Bye\r\n").await.unwrap();
    });

    let task = Task::new(
        uuid::Uuid::new_v4(),
        Mailbox::new("a", "x"),
        vec![Mailbox::new("b", "y")],
    );
    let message_id = task.message_id;
    let route_manager = Arc::new(OneShotRouteManager::new(vec![task]));
    let mut collabs = harness(route_manager);
    let queue = Arc::new(InMemoryQueue::new().with_message(message_id, b"Subject: hi\r\n\r\nhello\r\n".to_vec()));
    collabs.queue = queue.clone();

    let supervisor = Supervisor::new(SessionConfig::default(), collabs);
    let relay = plain_relay("mx.example", SecurityPolicy::Opportunistic);
    let outcome = supervisor.start(relay, route_to(addr)).await.expect("session should succeed");

    server.await.unwrap();

    assert_eq!(outcome.delivered_count, 1);
    let reports = queue.reports.lock().await;
    assert_eq!(reports[0].2, Verdict::Ok);
}

/// S3 — per-recipient split: one RCPT accepted, the other rejected.
#[tokio::test]
async fn s3_per_recipient_split() {
    let (listener, addr) = bind_fake_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"220 mx.example ESMTP\r\n").await.unwrap();
        assert!(read_cmd(&mut reader).await.starts_with("EHLO"));
        write_half.write_all(b"250 mx.example\r\n").await.unwrap();

        assert!(read_cmd(&mut reader).await.starts_with("MAIL FROM:"));
        write_half.write_all(b"250 2.1.0 Ok\r\n").await.unwrap();

        assert!(read_cmd(&mut reader).await.starts_with("RCPT TO:<b@y>"));
        write_half.write_all(b"250 Ok\r\n").await.unwrap();

        assert!(read_cmd(&mut reader).await.starts_with("RCPT TO:<c@y>"));
        write_half.write_all(b"550 User unknown\r\n").await.unwrap();

        assert_eq!(read_cmd(&mut reader).await, "DATA");
        write_half
            .write_all(b"354 End data with <CRLF>.<CRLF>\r\n")
            .await
            .unwrap();
        let _body = read_body_until_dot(&mut reader).await;
        write_half.write_all(b"250 2.0.0 Ok: queued\r\n").await.unwrap();

        assert_eq!(read_cmd(&mut reader).await, "QUIT");
        write_half.write_all(b"221 2.0.0 Bye\r\n").await.unwrap();
    });

    let task = Task::new(
        uuid::Uuid::new_v4(),
        Mailbox::new("a", "x"),
        vec![Mailbox::new("b", "y"), Mailbox::new("c", "y")],
    );
    let message_id = task.message_id;
    let route_manager = Arc::new(OneShotRouteManager::new(vec![task]));
    let mut collabs = harness(route_manager);
    let queue = Arc::new(InMemoryQueue::new().with_message(message_id, b"Subject: hi\r\n\r\nhello\r\n".to_vec()));
    collabs.queue = queue.clone();

    let supervisor = Supervisor::new(SessionConfig::default(), collabs);
    let relay = plain_relay("mx.example", SecurityPolicy::ForcePlain);
    let outcome = supervisor.start(relay, route_to(addr)).await.expect("session should succeed");

    server.await.unwrap();

    assert_eq!(outcome.delivered_count, 1);
    let reports = queue.reports.lock().await;
    assert_eq!(reports.len(), 2);

    let ok_report = reports.iter().find(|r| r.2 == Verdict::Ok).expect("one Ok verdict");
    let fail_report = reports.iter().find(|r| r.2 == Verdict::PermFail).expect("one PermFail verdict");
    assert!(fail_report.3.contains("550"));
    assert_ne!(ok_report.1, fail_report.1);
}

/// S4 — transient failure at MAIL: whole task TempFails, delivered_count
/// stays at zero, and the client RSETs before QUIT.
#[tokio::test]
async fn s4_transient_failure_at_mail() {
    let (listener, addr) = bind_fake_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"220 mx.example ESMTP\r\n").await.unwrap();
        assert!(read_cmd(&mut reader).await.starts_with("EHLO"));
        write_half.write_all(b"250 mx.example\r\n").await.unwrap();

        assert!(read_cmd(&mut reader).await.starts_with("MAIL FROM:"));
        write_half.write_all(b"421 Service not available\r\n").await.unwrap();

        assert_eq!(read_cmd(&mut reader).await, "RSET");
        write_half.write_all(b"250 2.0.0 Ok\r\n").await.unwrap();

        assert_eq!(read_cmd(&mut reader).await, "QUIT");
        write_half.write_all(b"221 2.0.0 Bye\r\n").await.unwrap();
    });

    let task = Task::new(
        uuid::Uuid::new_v4(),
        Mailbox::new("a", "x"),
        vec![Mailbox::new("b", "y")],
    );
    let message_id = task.message_id;
    let route_manager = Arc::new(OneShotRouteManager::new(vec![task]));
    let mut collabs = harness(route_manager);
    let queue = Arc::new(InMemoryQueue::new().with_message(message_id, b"Subject: hi\r\n\r\nhello\r\n".to_vec()));
    collabs.queue = queue.clone();

    let supervisor = Supervisor::new(SessionConfig::default(), collabs);
    let relay = plain_relay("mx.example", SecurityPolicy::ForcePlain);
    let outcome = supervisor.start(relay, route_to(addr)).await.expect("session should run to Quit");

    server.await.unwrap();

    assert_eq!(outcome.delivered_count, 0);
    let reports = queue.reports.lock().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].2, Verdict::TempFail);
}

/// S5 — loop detection: too many `Received:` headers fails the task
/// before any MAIL is sent, and the session still reaches Quit cleanly.
#[tokio::test]
async fn s5_loop_detection() {
    let (listener, addr) = bind_fake_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"220 mx.example ESMTP\r\n").await.unwrap();
        assert!(read_cmd(&mut reader).await.starts_with("EHLO"));
        write_half.write_all(b"250 mx.example\r\n").await.unwrap();

        // Loop detection happens locally before any MAIL is sent, so the
        // very next command from the client is QUIT.
        assert_eq!(read_cmd(&mut reader).await, "QUIT");
        write_half.write_all(b"221 2.0.0 Bye\r\n").await.unwrap();
    });

    let mut body = Vec::new();
    for _ in 0..5 {
        body.extend_from_slice(b"Received: from somewhere\r\n");
    }
    body.extend_from_slice(b"\r\nhello\r\n");

    let task = Task::new(
        uuid::Uuid::new_v4(),
        Mailbox::new("a", "x"),
        vec![Mailbox::new("b", "y")],
    );
    let message_id = task.message_id;
    let route_manager = Arc::new(OneShotRouteManager::new(vec![task]));
    let mut collabs = harness(route_manager);
    let queue = Arc::new(InMemoryQueue::new().with_message(message_id, body));
    collabs.queue = queue.clone();

    let mut config = SessionConfig::default();
    config.hop_limit = 3;

    let supervisor = Supervisor::new(config, collabs);
    let relay = plain_relay("mx.example", SecurityPolicy::ForcePlain);
    let outcome = supervisor.start(relay, route_to(addr)).await.expect("session should run to Quit");

    server.await.unwrap();

    assert_eq!(outcome.delivered_count, 0);
    let reports = queue.reports.lock().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].2, Verdict::Loop);
}

/// S6 — TLS required but the remote doesn't advertise STARTTLS: the
/// session ends without delivering, and no envelope ever gets a verdict
/// since the task was never attached (Ready was never reached).
#[tokio::test]
async fn s6_secure_required_starttls_missing() {
    let (listener, addr) = bind_fake_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"220 mx.example ESMTP\r\n").await.unwrap();
        assert!(read_cmd(&mut reader).await.starts_with("EHLO"));
        // No STARTTLS advertised.
        write_half.write_all(b"250 mx.example\r\n").await.unwrap();
    });

    let task = Task::new(
        uuid::Uuid::new_v4(),
        Mailbox::new("a", "x"),
        vec![Mailbox::new("b", "y")],
    );
    let message_id = task.message_id;
    let route_manager = Arc::new(OneShotRouteManager::new(vec![task]));
    let mut collabs = harness(route_manager.clone());
    let queue = Arc::new(InMemoryQueue::new().with_message(message_id, b"Subject: hi\r\n\r\nhello\r\n".to_vec()));
    collabs.queue = queue.clone();

    let supervisor = Supervisor::new(SessionConfig::default(), collabs);
    let relay = plain_relay("mx.example", SecurityPolicy::ForceTls);
    let result = supervisor.start(relay, route_to(addr)).await;

    server.await.unwrap();

    let failure = result.expect_err("TLS-required session without STARTTLS must fail");
    assert!(!failure.reached_ready);

    let reports = queue.reports.lock().await;
    assert!(reports.is_empty(), "no envelope should receive a verdict");

    let events = route_manager.events.lock().unwrap();
    assert!(!events.iter().any(|e| e == "route_ok"));
}

/// `AUTH PLAIN` must never appear before a successful TLS handshake. Here
/// the relay wants AUTH but the remote never offers STARTTLS, and EHLO
/// itself is refused for carrying `use_auth` — the dialog must fail
/// before ever reaching `Auth`.
#[tokio::test]
async fn no_auth_without_tls() {
    let (listener, addr) = bind_fake_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"220 mx.example ESMTP\r\n").await.unwrap();
        assert!(read_cmd(&mut reader).await.starts_with("EHLO"));
        write_half.write_all(b"501 Syntax error\r\n").await.unwrap();
        // The client must give up here: it must never fall back to HELO
        // and then send AUTH in cleartext.
        let next = read_cmd(&mut reader).await;
        assert!(next.is_empty(), "client sent another command instead of closing: {next:?}");
    });

    let task = Task::new(
        uuid::Uuid::new_v4(),
        Mailbox::new("a", "x"),
        vec![Mailbox::new("b", "y")],
    );
    let message_id = task.message_id;
    let route_manager = Arc::new(OneShotRouteManager::new(vec![task]));
    let mut collabs = harness(route_manager);
    let queue = Arc::new(InMemoryQueue::new().with_message(message_id, b"Subject: hi\r\n\r\nhello\r\n".to_vec()));
    collabs.queue = queue.clone();

    let mut policy_relay = plain_relay("mx.example", SecurityPolicy::Opportunistic);
    Arc::get_mut(&mut policy_relay).unwrap().policy.secret = Some("AGFkbWluAHNlY3JldA==".to_string());

    let supervisor = Supervisor::new(SessionConfig::default(), collabs);
    let result = supervisor.start(policy_relay, route_to(addr)).await;

    server.await.unwrap();

    assert!(result.is_err());
}
