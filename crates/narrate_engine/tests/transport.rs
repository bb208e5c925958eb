use std::time::Duration;

use futures_util::StreamExt;
use narrate_engine::{
    ChannelMessage, EventTransport, ReqwestTransport, TransportError, TransportSettings,
};
use pretty_assertions::assert_eq;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn subscribe_url(server: &MockServer) -> Url {
    Url::parse(&format!(
        "{}/api/events/subscribe?channels=jobs%2Chealth",
        server.uri()
    ))
    .expect("valid url")
}

#[tokio::test]
async fn open_streams_decoded_events_until_close() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"event\":\"connected\",\"channels\":[\"jobs\",\"health\"]}\n\n",
        ": keepalive\n\n",
        "data: {\"event\":\"job.started\",\"jobId\":\"j1\",\"_channel\":\"jobs\"}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/events/subscribe"))
        .and(query_param("channels", "jobs,health"))
        .and(header("accept", "text/event-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new(TransportSettings::default()).expect("client");
    let stream = transport.open(&subscribe_url(&server)).await.expect("open");
    let items: Vec<_> = stream.collect().await;

    assert_eq!(
        items,
        vec![
            Ok(ChannelMessage {
                data: "{\"event\":\"connected\",\"channels\":[\"jobs\",\"health\"]}".to_string(),
                ..ChannelMessage::default()
            }),
            Ok(ChannelMessage {
                data: "{\"event\":\"job.started\",\"jobId\":\"j1\",\"_channel\":\"jobs\"}"
                    .to_string(),
                ..ChannelMessage::default()
            }),
            Err(TransportError::Closed),
        ]
    );
}

#[tokio::test]
async fn open_rejects_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new(TransportSettings::default()).expect("client");
    let result = transport.open(&subscribe_url(&server)).await;
    assert!(matches!(result, Err(TransportError::HttpStatus { status: 503 })));
}

#[tokio::test]
async fn open_rejects_non_event_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new(TransportSettings::default()).expect("client");
    match transport.open(&subscribe_url(&server)).await {
        Err(TransportError::ContentType(content_type)) => {
            assert_eq!(content_type.as_deref(), Some("text/html"));
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("html accepted as event stream"),
    }
}

#[tokio::test]
async fn open_reports_unreachable_server() {
    let transport = ReqwestTransport::new(TransportSettings::default()).expect("client");
    let url = Url::parse("http://127.0.0.1:9/api/events/subscribe").expect("valid url");
    assert!(matches!(
        transport.open(&url).await,
        Err(TransportError::Connect(_))
    ));
}

#[tokio::test]
async fn open_gives_up_when_headers_never_arrive() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("", "text/event-stream")
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new(TransportSettings {
        connect_timeout: Duration::from_millis(200),
        idle_timeout: Duration::from_millis(200),
    })
    .expect("client");
    let outcome = tokio::time::timeout(Duration::from_secs(3), transport.open(&subscribe_url(&server)))
        .await
        .expect("open returns within its connect timeout");
    assert!(matches!(outcome, Err(TransportError::Connect(_))));
}
