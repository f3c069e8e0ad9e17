#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Crawler chain tests against a mock web API.

use std::{sync::Arc, time::Duration};

use {
    mockito::{Matcher, Mock, Server, ServerGuard},
    secrecy::Secret,
    serde_json::json,
};

use skiff_slack::{
    SlackWorkspaceConfig,
    crawler::Crawler,
    state::{SharedState, WorkspaceState},
};

fn crawler(base: &str, state: &SharedState) -> Crawler {
    let config = SlackWorkspaceConfig {
        token: Secret::new("tok".into()),
        api_base: base.to_string(),
        ..Default::default()
    };
    Crawler::new(
        "acme",
        reqwest::Client::new(),
        Arc::new(config),
        Arc::clone(state),
    )
    .with_timeout(Duration::from_secs(5))
}

fn page_query(cursor: &str) -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("token".into(), "tok".into()),
        Matcher::UrlEncoded("cursor".into(), cursor.into()),
        Matcher::UrlEncoded("exclude_archived".into(), "false".into()),
        Matcher::UrlEncoded("limit".into(), "20".into()),
    ])
}

async fn channel_page(server: &mut ServerGuard, cursor: &str, id: &str, next: &str) -> Mock {
    server
        .mock("GET", "/channels.list")
        .match_query(page_query(cursor))
        .with_body(
            json!({
                "ok": true,
                "channels": [{"id": id, "name": format!("chan-{id}")}],
                "response_metadata": {"next_cursor": next}
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await
}

async fn members_page(server: &mut ServerGuard, channel: &str, members: &[&str]) -> Mock {
    server
        .mock("GET", "/conversations.members")
        .match_query(Matcher::AllOf(vec![
            page_query(""),
            Matcher::UrlEncoded("channel".into(), channel.into()),
        ]))
        .with_body(
            json!({
                "ok": true,
                "members": members,
                "response_metadata": {"next_cursor": ""}
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await
}

#[tokio::test]
async fn full_chain_follows_cursors_then_chains() {
    let mut server = Server::new_async().await;
    let c1 = channel_page(&mut server, "", "C1", "p2").await;
    let c2 = channel_page(&mut server, "p2", "C2", "p3").await;
    let c3 = channel_page(&mut server, "p3", "C3", "").await;
    let users = server
        .mock("GET", "/users.list")
        .match_query(page_query(""))
        .with_body(
            json!({
                "ok": true,
                "members": [
                    {"id": "U1", "name": "alice", "profile": {"display_name": "Alice"}},
                    {"id": "U2", "name": "bob", "profile": {"display_name": ""}}
                ],
                "response_metadata": {"next_cursor": ""}
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let m1 = members_page(&mut server, "C1", &["U1", "U2"]).await;
    let m2 = members_page(&mut server, "C2", &["U1"]).await;
    let m3 = members_page(&mut server, "C3", &[]).await;

    let state = WorkspaceState::shared("acme");
    let report = crawler(&server.url(), &state).crawl_all().await;

    for mock in [c1, c2, c3, users, m1, m2, m3] {
        mock.assert_async().await;
    }
    assert_eq!(report.pages_of("channels.list"), 3);
    assert_eq!(report.pages_of("users.list"), 1);
    assert_eq!(report.membership_crawls, 3);
    assert_eq!(report.failures, 0);

    let st = state.read().unwrap();
    assert_eq!(st.channel_ids(), vec!["C1", "C2", "C3"]);
    assert_eq!(st.find_user("U2").unwrap().display_name(), "bob");
    assert_eq!(st.find_channel("C1").unwrap().members, vec!["U1", "U2"]);
    assert!(st.in_flight_requests().is_empty());
}

#[tokio::test]
async fn api_error_stops_the_chain() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/channels.list")
        .match_query(Matcher::Any)
        .with_body(r#"{"ok":false,"error":"invalid_auth"}"#)
        .create_async()
        .await;
    let users = server
        .mock("GET", "/users.list")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let state = WorkspaceState::shared("acme");
    let report = crawler(&server.url(), &state).crawl_all().await;

    users.assert_async().await;
    assert_eq!(report.failures, 1);
    assert!(state.read().unwrap().channels().is_empty());
}

#[tokio::test]
async fn missing_metadata_keeps_entries_and_stops() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/channels.list")
        .match_query(Matcher::Any)
        .with_body(r#"{"ok":true,"channels":[{"id":"C1","name":"general"}]}"#)
        .create_async()
        .await;
    let users = server
        .mock("GET", "/users.list")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let state = WorkspaceState::shared("acme");
    let report = crawler(&server.url(), &state).crawl_all().await;

    users.assert_async().await;
    assert_eq!(report.failures, 0);
    assert!(state.read().unwrap().find_channel("C1").is_some());
}

#[tokio::test]
async fn chunked_body_is_reassembled() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/channels.list")
        .match_query(Matcher::Any)
        .with_chunked_body(|w| {
            w.write_all(br#"{"ok":true,"chan"#)?;
            w.write_all(br#"nels":[{"id":"C1","name":"gen"#)?;
            w.write_all(br#"eral"}],"response_metadata":{"next_cursor":""}}"#)
        })
        .create_async()
        .await;
    server
        .mock("GET", "/users.list")
        .match_query(Matcher::Any)
        .with_body(r#"{"ok":true,"members":[],"response_metadata":{"next_cursor":""}}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/conversations.members")
        .match_query(Matcher::Any)
        .with_body(r#"{"ok":true,"members":[],"response_metadata":{"next_cursor":""}}"#)
        .create_async()
        .await;

    let state = WorkspaceState::shared("acme");
    crawler(&server.url(), &state).crawl_all().await;
    assert_eq!(state.read().unwrap().find_channel("C1").unwrap().name, "general");
}

#[tokio::test]
async fn deadline_expiry_is_a_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accept and never answer.
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            held.push(sock);
        }
    });

    let state = WorkspaceState::shared("acme");
    let report = crawler(&format!("http://{addr}"), &state)
        .with_timeout(Duration::from_millis(200))
        .crawl_all()
        .await;

    assert_eq!(report.failures, 1);
    assert_eq!(report.requests, 1);
    assert!(state.read().unwrap().in_flight_requests().is_empty());
}
