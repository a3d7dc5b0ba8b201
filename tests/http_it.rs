use feed_reload::config;
use feed_reload::connection::ConnectionService;
use feed_reload::db::{self, SqliteStore};
use feed_reload::events::BroadcastEventSink;
use feed_reload::interpreter::SyndicationInterpreter;
use feed_reload::model::{RetentionOverrides, RetentionSettings};
use feed_reload::reload::{FeedReloadCoordinator, ReloadOutcome};
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY: &str = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>T</title><link>http://e/</link><description>d</description><item><title>A</title><link>http://e/1</link><guid>http://e/1</guid></item></channel></rss>"#;

fn connection() -> config::Connection {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    config::Connection {
        credentials: vec![],
        ..cfg.connection
    }
}

async fn setup() -> (tempfile::TempDir, db::Pool, BroadcastEventSink, FeedReloadCoordinator) {
    let td = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/feeds.db", td.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let sink = BroadcastEventSink::new(16);
    let coordinator = FeedReloadCoordinator::new(
        Arc::new(ConnectionService::from_config(&connection()).unwrap()),
        Arc::new(SyndicationInterpreter),
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(sink.clone()),
        RetentionSettings {
            max_age_days: 0,
            ..Default::default()
        },
    );
    (td, pool, sink, coordinator)
}

#[tokio::test]
async fn etag_is_stored_and_replayed_for_a_304() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .insert_header("etag", "\"v1\"")
                .set_body_string(BODY),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (_td, pool, sink, coordinator) = setup().await;
    let mut events = sink.subscribe();
    let link = format!("{}/feed", server.uri());
    let id = db::insert_bookmark(&pool, "T", &link, &RetentionOverrides::default())
        .await
        .unwrap();
    let bookmark = db::get_bookmark(&pool, id).await.unwrap().unwrap();

    let first = coordinator.reload(&bookmark).await.unwrap();
    assert!(matches!(first, ReloadOutcome::Done(ref s) if s.added == 1));
    let event = events.recv().await.unwrap();
    assert_eq!(event.added[0].title, "A");

    let stored = db::get_conditional_get(&pool, &link).await.unwrap().unwrap();
    assert_eq!(stored.if_none_match.as_deref(), Some("\"v1\""));

    let second = coordinator.reload(&bookmark).await.unwrap();
    assert_eq!(second, ReloadOutcome::NotModified);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn unauthorized_reports_realm() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("www-authenticate", "Basic realm=\"Feeds\""),
        )
        .mount(&server)
        .await;

    let (_td, pool, _sink, coordinator) = setup().await;
    let link = format!("{}/private", server.uri());
    let id = db::insert_bookmark(&pool, "P", &link, &RetentionOverrides::default())
        .await
        .unwrap();
    let bookmark = db::get_bookmark(&pool, id).await.unwrap().unwrap();

    match coordinator.reload(&bookmark).await.unwrap() {
        ReloadOutcome::AuthRequired { realm, .. } => assert_eq!(realm.as_deref(), Some("Feeds")),
        other => panic!("expected AuthRequired, got {:?}", other),
    }
    assert!(db::load_feed_by_link(&pool, &link).await.unwrap().is_none());
}

#[tokio::test]
async fn proxy_auth_reads_the_proxy_challenge() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/proxied"))
        .respond_with(
            ResponseTemplate::new(407)
                .insert_header("proxy-authenticate", "Basic realm=\"Gateway\"")
                .insert_header("www-authenticate", "Basic realm=\"Origin\""),
        )
        .mount(&server)
        .await;

    let (_td, pool, _sink, coordinator) = setup().await;
    let link = format!("{}/proxied", server.uri());
    let id = db::insert_bookmark(&pool, "P", &link, &RetentionOverrides::default())
        .await
        .unwrap();
    let bookmark = db::get_bookmark(&pool, id).await.unwrap().unwrap();

    match coordinator.reload(&bookmark).await.unwrap() {
        ReloadOutcome::AuthRequired { realm, .. } => assert_eq!(realm.as_deref(), Some("Gateway")),
        other => panic!("expected AuthRequired, got {:?}", other),
    }
}

#[tokio::test]
async fn server_errors_are_recorded_on_the_bookmark() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (_td, pool, _sink, coordinator) = setup().await;
    let link = format!("{}/broken", server.uri());
    let id = db::insert_bookmark(&pool, "B", &link, &RetentionOverrides::default())
        .await
        .unwrap();
    let bookmark = db::get_bookmark(&pool, id).await.unwrap().unwrap();

    assert!(coordinator.reload(&bookmark).await.is_err());
    let bookmark = db::get_bookmark(&pool, id).await.unwrap().unwrap();
    assert!(bookmark.last_error.unwrap().contains("500"));
}
