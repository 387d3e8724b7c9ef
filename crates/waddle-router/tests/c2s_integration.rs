//! C2S Integration Tests
//!
//! Real TCP clients against the C2S listener:
//! - stream negotiation, SASL PLAIN and resource binding
//! - stanza routing between two connected clients
//! - stream errors closing only the offending connection
//!
//! Run with: `cargo test -p waddle-router --test c2s_integration`

mod common;

use common::*;
use waddle_router::session::SessionStatus;

const USERS: &[(&str, &str)] = &[
    ("user.alice.password", "wonderland"),
    ("user.bob.password", "builder"),
];

/// Send a ping and wait for its result, which also proves every stanza
/// sent before it on this stream has been routed.
async fn ping(client: &mut TestClient, id: &str) -> String {
    client
        .send(&format!(
            "<iq type='get' id='{}'><ping xmlns='urn:xmpp:ping'/></iq>",
            id
        ))
        .await
        .unwrap();
    let reply = client.read_until(id).await.unwrap();
    client.clear_buffer();
    reply
}

#[tokio::test]
async fn test_login_bind_and_ping() {
    init_test();
    let server = TestServer::start(USERS).await;
    let mut client = server.connect().await;

    client.send_stream_header(DOMAIN).await.unwrap();
    let features = client.expect_features().await.unwrap();
    assert!(features.contains("<stream:stream"));
    assert!(features.contains("PLAIN"));
    assert!(!features.contains("ANONYMOUS"));

    client.authenticate_plain("alice", "wonderland").await.unwrap();
    let bound = client.bind("rabbit-hole").await.unwrap();
    assert!(bound.contains("alice@example.com/rabbit-hole"));
    assert_eq!(server.ctx.session_manager().session_count(), 1);

    let reply = ping(&mut client, "ping-1").await;
    assert!(reply.contains("result"));
}

#[tokio::test]
async fn test_stream_open_marks_session_connected() {
    init_test();
    let server = TestServer::start(USERS).await;
    let mut client = server.connect().await;

    client.send_stream_header(DOMAIN).await.unwrap();
    client.expect_features().await.unwrap();

    let waiting = server.ctx.session_manager().pre_authenticated_sessions();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].status(), SessionStatus::Connected);
    assert_eq!(waiting[0].stream_version(), (1, 0));

    client.authenticate_plain("alice", "wonderland").await.unwrap();
    client.bind("desk").await.unwrap();
    let session = server
        .ctx
        .session_manager()
        .session(&jid("alice@example.com/desk"))
        .unwrap();
    assert_eq!(session.status(), SessionStatus::Authenticated);
    assert_eq!(session.stream_version(), (1, 0));
}

#[tokio::test]
async fn test_unsupported_major_version_gets_stream_error() {
    init_test();
    let server = TestServer::start(USERS).await;
    let mut client = server.connect().await;

    client
        .send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
            xmlns:stream='http://etherx.jabber.org/streams' to='{}' version='2.0'>",
            DOMAIN
        ))
        .await
        .unwrap();

    let reply = client.read_to_end().await.unwrap();
    assert!(reply.contains("unsupported-version"));
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    init_test();
    let server = TestServer::start(USERS).await;
    let mut client = server.connect().await;

    client.send_stream_header(DOMAIN).await.unwrap();
    client.expect_features().await.unwrap();
    client
        .send("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGFsaWNlAHdyb25n</auth>")
        .await
        .unwrap();

    let reply = client.read_until("</failure>").await.unwrap();
    assert!(reply.contains("not-authorized"));
    assert_eq!(server.ctx.session_manager().session_count(), 0);
}

#[tokio::test]
async fn test_anonymous_login_when_enabled() {
    init_test();
    let server = TestServer::start(&[("xmpp.auth.anonymous", "true")]).await;
    let mut client = server.connect().await;

    client.send_stream_header(DOMAIN).await.unwrap();
    let features = client.expect_features().await.unwrap();
    assert!(features.contains("ANONYMOUS"));

    client
        .send("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='ANONYMOUS'/>")
        .await
        .unwrap();
    client.read_until("<success").await.unwrap();
    client.clear_buffer();
    client.send_stream_header(DOMAIN).await.unwrap();
    client.expect_features().await.unwrap();
    let bound = client.bind("guest").await.unwrap();

    assert!(bound.contains("@example.com/guest"));
    let session = &server.ctx.session_manager().sessions()[0];
    assert!(session.is_anonymous());
}

#[tokio::test]
async fn test_message_between_clients() {
    init_test();
    let server = TestServer::start(USERS).await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;
    alice.login("alice", "wonderland", "desk").await.unwrap();
    bob.login("bob", "builder", "bench").await.unwrap();

    bob.send("<presence/>").await.unwrap();
    ping(&mut bob, "bob-ready").await;

    alice
        .send("<message to='bob@example.com' type='chat'><body>can we fix it?</body></message>")
        .await
        .unwrap();

    let received = bob.read_until("can we fix it?").await.unwrap();
    assert!(received.contains("alice@example.com/desk"));
}

#[tokio::test]
async fn test_unknown_host_gets_stream_error() {
    init_test();
    let server = TestServer::start(USERS).await;
    let mut client = server.connect().await;

    client.send_stream_header("elsewhere.org").await.unwrap();

    let reply = client.read_to_end().await.unwrap();
    assert!(reply.contains("<stream:stream"));
    assert!(reply.contains("host-unknown"));
    assert!(reply.contains("</stream:stream>"));
}

#[tokio::test]
async fn test_stanza_before_auth_is_not_authorized() {
    init_test();
    let server = TestServer::start(USERS).await;
    let mut client = server.connect().await;

    client.send_stream_header(DOMAIN).await.unwrap();
    client.expect_features().await.unwrap();
    client
        .send("<message to='bob@example.com'><body>let me in</body></message>")
        .await
        .unwrap();

    let reply = client.read_to_end().await.unwrap();
    assert!(reply.contains("not-authorized"));
}

/// A malformed stream ends that connection only.
#[tokio::test]
async fn test_not_well_formed_closes_only_offender() {
    init_test();
    let server = TestServer::start(USERS).await;
    let mut offender = server.connect().await;
    let mut bystander = server.connect().await;
    offender.login("alice", "wonderland", "desk").await.unwrap();
    bystander.login("bob", "builder", "bench").await.unwrap();

    offender.send("this is not xml<presence/>").await.unwrap();
    let reply = offender.read_to_end().await.unwrap();
    assert!(reply.contains("not-well-formed"));

    let pong = ping(&mut bystander, "still-here").await;
    assert!(pong.contains("result"));
}

#[tokio::test]
async fn test_closing_stream_removes_session() {
    init_test();
    let server = TestServer::start(USERS).await;
    let mut client = server.connect().await;
    client.login("alice", "wonderland", "desk").await.unwrap();
    assert_eq!(server.ctx.session_manager().session_count(), 1);

    client.send("</stream:stream>").await.unwrap();
    client.read_to_end().await.unwrap();

    for _ in 0..100 {
        if server.ctx.session_manager().session_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(server.ctx.session_manager().session_count(), 0);
    assert!(!server
        .ctx
        .routing_table()
        .has_client_route(&jid("alice@example.com/desk")));
}
