//! WebSocket upgrade handshake and frame delivery.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use http::Method;

use common::{MockChannel, MockConnector, WsRecordingHandler, head, leaked_connector};
use tether::proto::{ResponseEvent, WsFrame};
use tether::{
    Channel as _, Client, ClientConfig, Error, HandshakeError, LogicalRequest, derive_accept_key,
};

fn client() -> (Client<MockChannel, &'static MockConnector>, &'static MockConnector) {
    let connector = leaked_connector();
    (Client::new(ClientConfig::default(), connector), connector)
}

fn ws_request(uri: &str) -> LogicalRequest {
    LogicalRequest::get(uri.parse().unwrap())
}

async fn open_connection(
    client: &Client<MockChannel, &'static MockConnector>,
    connector: &'static MockConnector,
    handler: Arc<WsRecordingHandler>,
) -> (Arc<tether::RequestFuture<MockChannel>>, Arc<MockChannel>) {
    let fut = client
        .execute(ws_request("ws://example.com/chat"), handler)
        .await
        .unwrap();
    let channel = connector.channel(0);

    let key = channel.last_head().sec_websocket_key().unwrap().to_owned();
    let accept = derive_accept_key(&key);
    client
        .dispatcher()
        .handle_event(
            &channel,
            head(
                101,
                &[
                    ("upgrade", "websocket"),
                    ("connection", "Upgrade"),
                    ("sec-websocket-accept", &accept),
                ],
            ),
        )
        .await;
    (fut, channel)
}

#[tokio::test]
async fn successful_upgrade_fires_on_open_once() {
    let (client, connector) = client();
    let handler = Arc::new(WsRecordingHandler::default());

    let (fut, channel) = open_connection(&client, connector, handler.clone()).await;

    assert!(channel.upgraded.load(Ordering::SeqCst));
    assert_eq!(handler.opens.load(Ordering::SeqCst), 1);
    assert_eq!(handler.http.completed.load(Ordering::SeqCst), 1);
    assert!(fut.wait().await.is_ok());

    // a duplicate upgrade response must not re-open
    let key = channel.heads.lock()[0].sec_websocket_key().unwrap().to_owned();
    let accept = derive_accept_key(&key);
    client
        .dispatcher()
        .handle_event(
            &channel,
            head(
                101,
                &[
                    ("upgrade", "websocket"),
                    ("connection", "Upgrade"),
                    ("sec-websocket-accept", &accept),
                ],
            ),
        )
        .await;
    assert_eq!(handler.opens.load(Ordering::SeqCst), 1);
    assert_eq!(handler.http.completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn plain_200_fails_the_handshake_without_on_open() {
    let (client, connector) = client();
    let handler = Arc::new(WsRecordingHandler::default());

    let fut = client
        .execute(ws_request("ws://example.com/chat"), handler.clone())
        .await
        .unwrap();
    let channel = connector.channel(0);

    client
        .dispatcher()
        .handle_event(&channel, head(200, &[("content-length", "0")]))
        .await;

    let err = fut.wait().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Handshake(HandshakeError::UnexpectedStatusCode(status))
            if status.as_u16() == 200
    ));
    assert_eq!(handler.opens.load(Ordering::SeqCst), 0);
    assert_eq!(handler.http.errors.lock().len(), 1);
    assert!(!channel.is_open(), "failed handshake closes the channel");
}

#[tokio::test]
async fn accept_key_mismatch_fails_the_handshake() {
    let (client, connector) = client();
    let handler = Arc::new(WsRecordingHandler::default());

    let fut = client
        .execute(ws_request("ws://example.com/chat"), handler.clone())
        .await
        .unwrap();
    let channel = connector.channel(0);

    client
        .dispatcher()
        .handle_event(
            &channel,
            head(
                101,
                &[
                    ("upgrade", "websocket"),
                    ("connection", "Upgrade"),
                    ("sec-websocket-accept", "bm90IHRoZSByaWdodCBrZXk="),
                ],
            ),
        )
        .await;

    assert!(matches!(
        fut.wait().await,
        Err(Error::Handshake(HandshakeError::AcceptKeyMismatch { .. }))
    ));
    assert_eq!(handler.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_upgrade_headers_fail_the_handshake() {
    let (client, connector) = client();
    let handler = Arc::new(WsRecordingHandler::default());

    let fut = client
        .execute(ws_request("ws://example.com/chat"), handler)
        .await
        .unwrap();

    client
        .dispatcher()
        .handle_event(&connector.channel(0), head(101, &[]))
        .await;

    assert!(matches!(
        fut.wait().await,
        Err(Error::Handshake(HandshakeError::MissingUpgradeHeader))
    ));
}

#[tokio::test]
async fn fragments_are_forwarded_with_the_fin_flag() {
    let (client, connector) = client();
    let handler = Arc::new(WsRecordingHandler::default());
    let (_fut, channel) = open_connection(&client, connector, handler.clone()).await;

    let dispatcher = client.dispatcher();
    dispatcher
        .handle_event(
            &channel,
            ResponseEvent::WsFrame(WsFrame::Text {
                data: Bytes::from_static(b"hel"),
                fin: false,
            }),
        )
        .await;
    dispatcher
        .handle_event(
            &channel,
            ResponseEvent::WsFrame(WsFrame::Text {
                data: Bytes::from_static(b"lo"),
                fin: true,
            }),
        )
        .await;
    dispatcher
        .handle_event(
            &channel,
            ResponseEvent::WsFrame(WsFrame::Binary {
                data: Bytes::from_static(&[1, 2, 3]),
                fin: true,
            }),
        )
        .await;

    let fragments = handler.fragments.lock();
    assert_eq!(fragments.len(), 3);
    assert_eq!(fragments[0], (b"hel".to_vec(), true, false));
    assert_eq!(fragments[1], (b"lo".to_vec(), true, true));
    assert_eq!(fragments[2], (vec![1, 2, 3], false, true));
}

#[tokio::test]
async fn close_frame_notifies_and_closes_the_channel() {
    let (client, connector) = client();
    let handler = Arc::new(WsRecordingHandler::default());
    let (_fut, channel) = open_connection(&client, connector, handler.clone()).await;

    client
        .dispatcher()
        .handle_event(
            &channel,
            ResponseEvent::WsFrame(WsFrame::Close {
                code: 1000,
                reason: "bye".to_owned(),
            }),
        )
        .await;

    assert_eq!(handler.closes.lock().as_slice(), &[(1000, "bye".to_owned())]);
    assert!(!channel.is_open());

    // frames after close are discarded
    client
        .dispatcher()
        .handle_event(
            &channel,
            ResponseEvent::WsFrame(WsFrame::Text {
                data: Bytes::from_static(b"late"),
                fin: true,
            }),
        )
        .await;
    assert!(handler.fragments.lock().is_empty());
}

#[tokio::test]
async fn abnormal_closure_reports_code_1006() {
    let (client, connector) = client();
    let handler = Arc::new(WsRecordingHandler::default());
    let (_fut, channel) = open_connection(&client, connector, handler.clone()).await;

    client.dispatcher().handle_channel_closed(&channel).await;

    let closes = handler.closes.lock();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].0, 1006);
}

#[tokio::test]
async fn non_get_websocket_request_is_rejected() {
    let (client, _connector) = client();
    let request = LogicalRequest::new(Method::POST, "ws://example.com/chat".parse().unwrap());

    let err = client
        .execute(request, Arc::new(WsRecordingHandler::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn handler_without_ws_capability_is_rejected() {
    let (client, _connector) = client();
    let err = client
        .execute(
            ws_request("ws://example.com/chat"),
            Arc::new(common::RecordingHandler::default()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}
