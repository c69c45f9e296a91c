/// Relay service behind the multiplexed TCP listener
mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use relay_tunnel::handler::relay::RelayHandler;
use relay_tunnel::handler::{Handler, HandlerOptions};
use relay_tunnel::listener::mtcp::MtcpListener;
use relay_tunnel::listener::{Listener, ListenerOptions};
use relay_tunnel::mux::{MuxConfig, MuxSession};
use relay_tunnel::relay::{AddrFeature, Feature, Request, Response, Status, CMD_CONNECT};
use relay_tunnel::service::Service;

use common::start_echo_server;

/// Several relay requests multiplexed over one TCP connection.
#[tokio::test]
async fn test_connect_over_mtcp() {
    let mut listener = MtcpListener::new(ListenerOptions::new("127.0.0.1:0", "relay-mtcp"));
    listener.init(serde_json::json!({})).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut handler = RelayHandler::new(HandlerOptions::new("relay-mtcp"));
    handler
        .init(serde_json::json!({"read_timeout": 5}))
        .await
        .unwrap();

    let service = std::sync::Arc::new(Service::new(
        "relay-mtcp",
        Box::new(listener),
        Box::new(handler),
    ));
    let serve = service.clone();
    tokio::spawn(async move {
        serve.serve().await.ok();
    });

    let echo_addr = start_echo_server().await;

    let conn = TcpStream::connect(addr).await.unwrap();
    let session = MuxSession::client(conn, &MuxConfig::default());

    for i in 0u8..3 {
        let mut stream = session.open_stream().await.unwrap();

        let mut req = Request::new(CMD_CONNECT);
        req.features
            .push(Feature::Addr(AddrFeature::new("0.0.0.0", 0)));
        req.features.push(Feature::Addr(AddrFeature::new(
            echo_addr.ip().to_string(),
            echo_addr.port(),
        )));
        req.write_to(&mut stream).await.unwrap();

        let resp = Response::read_from(&mut stream).await.unwrap();
        assert_eq!(resp.status, Status::Ok);

        let payload = [b'a' + i; 8];
        stream.write_all(&payload).await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 8];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("echo within deadline")
            .unwrap();
        assert_eq!(buf, payload);
    }

    service.close().await.unwrap();
}
