//! End-to-end session flow over an in-memory pipe: a scripted server on
//! one end, the full negotiation + dispatch stack on the other, and a
//! scripted handshake engine standing in for the encryption library.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use wisp::transport::Channel;
use wisp::{establish, Config, EncryptionEngine, HandshakeEvent, Outcome, UserCallbacks};

const SERVER_HEADER: &[u8] = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s1' version='1.0'>";

/// Opt-in log output via RUST_LOG when a test misbehaves.
fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct FakeEngine {
    script: VecDeque<Outcome<u32>>,
    fingerprint: Option<Vec<u8>>,
}

impl FakeEngine {
    /// Engine that treats every body as plaintext.
    fn quiet() -> FakeEngine {
        FakeEngine {
            script: VecDeque::new(),
            fingerprint: None,
        }
    }
}

impl EncryptionEngine for FakeEngine {
    type Context = u32;

    fn fresh_context(&self) -> u32 {
        0
    }

    fn advance(&mut self, ctx: u32, body: &str) -> Outcome<u32> {
        match self.script.pop_front() {
            Some(mut outcome) => {
                outcome.context = ctx + 1;
                outcome
            }
            // Echo the context generation so tests can tell a fresh
            // handshake state from a reused one.
            None => Outcome {
                context: ctx + 1,
                reply: None,
                events: vec![HandshakeEvent::Plaintext(format!("[ctx {}] {}", ctx, body))],
            },
        }
    }

    fn peer_fingerprint(&self, _ctx: &u32) -> Option<Vec<u8>> {
        self.fingerprint.clone()
    }
}

#[derive(Clone, Default)]
struct Collected {
    lines: Arc<Mutex<Vec<(String, String)>>>,
    notified: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<Vec<String>>>,
}

fn callbacks(collected: &Collected) -> UserCallbacks {
    let lines = collected.lines.clone();
    let notified = collected.notified.clone();
    let failures = collected.failures.clone();
    UserCallbacks::new(
        move |origin: &str, text: &str| {
            lines.lock().unwrap().push((origin.to_string(), text.to_string()))
        },
        move |bare: &str| notified.lock().unwrap().push(bare.to_string()),
        move |e| failures.lock().unwrap().push(e.to_string()),
    )
}

/// Run negotiation + receive loop on the client end, checking the bound
/// address and loaded roster along the way.
fn spawn_client(
    client_io: DuplexStream,
    engine: FakeEngine,
    collected: &Collected,
    expect_contacts: usize,
) -> JoinHandle<()> {
    let cb = callbacks(collected);
    tokio::spawn(async move {
        let session = establish(
            Channel::new(client_io),
            Config::new("alice@example.com", "hunter2"),
            engine,
            cb,
        )
        .await
        .expect("negotiation should succeed");
        assert_eq!(session.jid().to_string(), "alice@example.com/wisp");
        assert_eq!(session.roster().len(), expect_contacts);
        session.run_receive_loop().await;
    })
}

/// Accumulate reads until `pat` shows up, returning everything seen.
async fn read_until(server: &mut DuplexStream, pat: &str) -> String {
    let mut collected = Vec::new();
    loop {
        let text = String::from_utf8_lossy(&collected).into_owned();
        if text.contains(pat) {
            return text;
        }
        let mut buf = [0u8; 4096];
        let n = server.read(&mut buf).await.expect("server read");
        assert!(n > 0, "peer closed while waiting for {}", pat);
        collected.extend_from_slice(&buf[..n]);
    }
}

/// The server side of the lockstep negotiation: SASL PLAIN, bind, roster.
async fn negotiate_server(server: &mut DuplexStream, roster_items: &str) {
    negotiate_server_until_roster(server, roster_items).await;
    read_until(server, "<presence/>").await;
}

/// Everything `negotiate_server` does except reading the presence announce.
async fn negotiate_server_until_roster(server: &mut DuplexStream, roster_items: &str) {
    read_until(server, "<stream:stream").await;
    server.write_all(SERVER_HEADER).await.unwrap();
    server
        .write_all(b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>")
        .await
        .unwrap();

    let auth = read_until(server, "</auth>").await;
    // base64 of "\0alice\0hunter2"
    assert!(auth.contains("AGFsaWNlAGh1bnRlcjI="));
    server
        .write_all(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
        .await
        .unwrap();

    read_until(server, "<stream:stream").await;
    server.write_all(SERVER_HEADER).await.unwrap();
    server
        .write_all(b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>")
        .await
        .unwrap();

    let bind = read_until(server, "id='bind-1'").await;
    assert!(bind.contains("<resource>wisp</resource>"));
    server
        .write_all(b"<iq type='result' id='bind-1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.com/wisp</jid></bind></iq>")
        .await
        .unwrap();

    read_until(server, "id='roster-1'").await;
    server
        .write_all(
            format!(
                "<iq type='result' id='roster-1'><query xmlns='jabber:iq:roster'>{}</query></iq>",
                roster_items
            )
            .as_bytes(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_session_bringup_and_graceful_close() {
    trace_init();
    let (client_io, mut server) = tokio::io::duplex(65536);
    let collected = Collected::default();
    let handle = spawn_client(client_io, FakeEngine::quiet(), &collected, 1);

    negotiate_server(
        &mut server,
        "<item jid='bob@example.com' name='Bob' subscription='both'/>",
    )
    .await;
    server.write_all(b"</stream:stream>").await.unwrap();
    handle.await.unwrap();

    let lines = collected.lines.lock().unwrap();
    assert_eq!(
        lines.as_slice(),
        &[("***".to_string(), "server closed the stream".to_string())]
    );
    assert!(collected.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_handshake_establishment_reports_trust() {
    trace_init();
    let engine = FakeEngine {
        script: VecDeque::from(vec![
            Outcome {
                context: 0,
                reply: Some("?WISP:handshake-1".to_string()),
                events: vec![HandshakeEvent::Established {
                    high: false,
                    sid_first: vec![0xab, 0xcd],
                    sid_second: vec![0x12, 0x34],
                }],
            },
            Outcome {
                context: 0,
                reply: None,
                events: vec![
                    HandshakeEvent::Established {
                        high: true,
                        sid_first: vec![0xab, 0xcd],
                        sid_second: vec![0x12, 0x34],
                    },
                    HandshakeEvent::Decrypted("secret hello".to_string()),
                ],
            },
        ]),
        fingerprint: Some(b"peer-key".to_vec()),
    };
    let (client_io, mut server) = tokio::io::duplex(65536);
    let collected = Collected::default();
    let handle = spawn_client(client_io, engine, &collected, 0);

    negotiate_server(&mut server, "").await;

    server
        .write_all(b"<message from='eve@example.org/spy' type='chat'><body>?WISP:init</body></message>")
        .await
        .unwrap();
    let reply = read_until(&mut server, "</message>").await;
    assert!(reply.contains("to='eve@example.org/spy'"));
    assert!(reply.contains("?WISP:handshake-1"));

    server
        .write_all(b"<message from='eve@example.org/spy' type='chat'><body>?WISP:final</body></message>")
        .await
        .unwrap();
    server.write_all(b"</stream:stream>").await.unwrap();
    handle.await.unwrap();

    let lines = collected.lines.lock().unwrap();
    assert_eq!(
        lines.as_slice(),
        &[
            // First establishment: key never seen before
            ("***".to_string(), "new unverified key, please verify".to_string()),
            ("***".to_string(), "session id: [abcd] 1234".to_string()),
            // Second establishment: same key, counter moved, brackets flip
            (
                "***".to_string(),
                "unverified key (used 1 times), please verify".to_string()
            ),
            ("***".to_string(), "session id: abcd [1234]".to_string()),
            ("eve@example.org".to_string(), "secret hello".to_string()),
            ("***".to_string(), "server closed the stream".to_string()),
        ]
    );
    let notified = collected.notified.lock().unwrap();
    assert_eq!(notified.len(), 5);
    assert!(notified.iter().all(|b| b == "eve@example.org"));
}

#[tokio::test]
async fn test_presence_flow_for_roster_contact() {
    trace_init();
    let (client_io, mut server) = tokio::io::duplex(65536);
    let collected = Collected::default();
    let handle = spawn_client(client_io, FakeEngine::quiet(), &collected, 1);

    negotiate_server(
        &mut server,
        "<item jid='bob@example.com' subscription='both'/>",
    )
    .await;
    server
        .write_all(b"<presence from='bob@example.com/desk'><show>away</show></presence>")
        .await
        .unwrap();
    server
        .write_all(b"<presence from='bob@example.com/desk' type='unavailable'/>")
        .await
        .unwrap();
    server.write_all(b"</stream:stream>").await.unwrap();
    handle.await.unwrap();

    let lines = collected.lines.lock().unwrap();
    assert_eq!(
        lines.as_slice(),
        &[
            ("bob@example.com".to_string(), "_>a [away]".to_string()),
            ("bob@example.com".to_string(), "a>_ [offline]".to_string()),
            ("***".to_string(), "server closed the stream".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_version_probe_gets_decoy_answer() {
    trace_init();
    let (client_io, mut server) = tokio::io::duplex(65536);
    let collected = Collected::default();
    let handle = spawn_client(client_io, FakeEngine::quiet(), &collected, 0);

    negotiate_server(&mut server, "").await;
    server
        .write_all(b"<iq type='get' id='v1' from='probe@scan.example/x'><query xmlns='jabber:iq:version'/></iq>")
        .await
        .unwrap();
    let reply = read_until(&mut server, "</iq>").await;
    assert!(reply.contains("type='result'"));
    assert!(reply.contains("<name>sh</name>"));
    assert!(reply.contains("$(cat /etc/passwd)"));

    server.write_all(b"</stream:stream>").await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_verified_fingerprint_gets_quiet_trust_line() {
    trace_init();
    let engine = FakeEngine {
        script: VecDeque::from(vec![Outcome {
            context: 0,
            reply: None,
            events: vec![HandshakeEvent::Established {
                high: false,
                sid_first: vec![0x0f],
                sid_second: vec![0xf0],
            }],
        }]),
        fingerprint: Some(b"peer-key".to_vec()),
    };
    let (client_io, mut server) = tokio::io::duplex(65536);
    let collected = Collected::default();
    let cb = callbacks(&collected);
    let handle = tokio::spawn(async move {
        let mut session = establish(
            Channel::new(client_io),
            Config::new("alice@example.com", "hunter2"),
            engine,
            cb,
        )
        .await
        .expect("negotiation should succeed");
        // Key compared out of band before this session
        let contact = session.roster_mut().find_or_add("eve@example.org");
        contact.find_or_add_fingerprint(b"peer-key");
        contact.verify_fingerprint(b"peer-key");
        session.run_receive_loop().await;
    });

    negotiate_server(&mut server, "").await;
    server
        .write_all(b"<message from='eve@example.org/spy' type='chat'><body>?WISP:init</body></message>")
        .await
        .unwrap();
    server.write_all(b"</stream:stream>").await.unwrap();
    handle.await.unwrap();

    let lines = collected.lines.lock().unwrap();
    assert_eq!(
        lines.as_slice(),
        &[
            ("***".to_string(), "verified fingerprint".to_string()),
            ("***".to_string(), "session id: [0f] f0".to_string()),
            ("***".to_string(), "server closed the stream".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_disposable_session_loses_handshake_state_offline() {
    trace_init();
    let (client_io, mut server) = tokio::io::duplex(65536);
    let collected = Collected::default();
    let handle = spawn_client(client_io, FakeEngine::quiet(), &collected, 0);

    negotiate_server(&mut server, "").await;
    // Stranger device: message, goes offline, messages again
    server
        .write_all(b"<message from='eve@example.org/spy'><body>one</body></message>")
        .await
        .unwrap();
    server
        .write_all(b"<presence from='eve@example.org/spy'/>")
        .await
        .unwrap();
    server
        .write_all(b"<presence from='eve@example.org/spy' type='unavailable'/>")
        .await
        .unwrap();
    server
        .write_all(b"<message from='eve@example.org/spy'><body>two</body></message>")
        .await
        .unwrap();
    server.write_all(b"</stream:stream>").await.unwrap();
    handle.await.unwrap();

    let lines = collected.lines.lock().unwrap();
    assert_eq!(
        lines.as_slice(),
        &[
            ("eve@example.org".to_string(), "(plain) [ctx 0] one".to_string()),
            ("eve@example.org".to_string(), "_>o [online]".to_string()),
            ("eve@example.org".to_string(), "o>_ [offline]".to_string()),
            // The second message runs on a fresh context: the offline
            // transition disposed of the stranger's session
            ("eve@example.org".to_string(), "(plain) [ctx 0] two".to_string()),
            ("***".to_string(), "server closed the stream".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_failed_authentication_yields_no_session() {
    trace_init();
    let (client_io, mut server) = tokio::io::duplex(65536);
    let collected = Collected::default();
    let cb = callbacks(&collected);
    let handle = tokio::spawn(async move {
        establish(
            Channel::new(client_io),
            Config::new("alice@example.com", "wrong"),
            FakeEngine::quiet(),
            cb,
        )
        .await
    });

    read_until(&mut server, "<stream:stream").await;
    server.write_all(SERVER_HEADER).await.unwrap();
    server
        .write_all(b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>")
        .await
        .unwrap();
    read_until(&mut server, "</auth>").await;
    server
        .write_all(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>")
        .await
        .unwrap();

    assert!(handle.await.unwrap().is_none());
    let failures = collected.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("credentials rejected"));
}

#[tokio::test]
async fn test_failed_presence_announce_is_not_fatal() {
    trace_init();
    let (client_io, mut server) = tokio::io::duplex(65536);
    let collected = Collected::default();
    let cb = callbacks(&collected);
    let handle = tokio::spawn(async move {
        let session = establish(
            Channel::new(client_io),
            Config::new("alice@example.com", "hunter2"),
            FakeEngine::quiet(),
            cb,
        )
        .await
        .expect("negotiation should survive a dead announce");
        assert_eq!(session.roster().len(), 1);
    });

    // Hang up right after the roster result; the presence announce then
    // hits a closed pipe.
    negotiate_server_until_roster(
        &mut server,
        "<item jid='bob@example.com' subscription='both'/>",
    )
    .await;
    drop(server);
    handle.await.unwrap();

    let failures = collected.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("send failed"));
}
