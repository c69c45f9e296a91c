/// Common utilities for integration tests
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

use relay_tunnel::auth::StaticAuthenticator;
use relay_tunnel::handler::relay::RelayHandler;
use relay_tunnel::handler::{Handler, HandlerOptions};
use relay_tunnel::ingress::StaticIngress;
use relay_tunnel::listener::tcp::TcpListener;
use relay_tunnel::listener::{Listener, ListenerOptions};
use relay_tunnel::relay::{Feature, Request, Response, TunnelId, CMD_BIND};
use relay_tunnel::sd::MemorySd;
use relay_tunnel::service::Service;

pub const T1: &str = "11111111-1111-1111-1111-111111111111";

pub fn tid_t1() -> TunnelId {
    T1.parse().unwrap()
}

pub struct TestServer {
    pub service: Arc<Service>,
    pub relay_addr: SocketAddr,
    pub ep_addr: Option<SocketAddr>,
    pub sd: Arc<MemorySd>,
}

impl TestServer {
    pub async fn shutdown(&self) {
        self.service.close().await.ok();
    }
}

/// Start a relay service on an ephemeral port.
///
/// `users` enables authentication, `ingress` maps host keys to tunnel IDs.
pub async fn start_relay_server(
    metadata: serde_json::Value,
    users: Option<HashMap<String, String>>,
    ingress: Vec<(&str, TunnelId)>,
) -> TestServer {
    let sd = Arc::new(MemorySd::new());

    let mut options = HandlerOptions::new("relay-test").with_sd(sd.clone());
    if let Some(users) = users {
        options = options.with_auther(Arc::new(StaticAuthenticator::new(users)));
    }
    let mut table = StaticIngress::default();
    for (host, tid) in ingress {
        table.insert(host, tid);
    }
    options = options.with_ingress(Arc::new(table));

    let mut listener = TcpListener::new(ListenerOptions::new("127.0.0.1:0", "relay-test"));
    listener
        .init(serde_json::json!({}))
        .await
        .expect("listener init");
    let relay_addr = listener.local_addr().expect("listener addr");

    let mut handler = RelayHandler::new(options);
    handler.init(metadata).await.expect("handler init");
    let ep_addr = handler.entrypoint_addr().await;

    let service = Arc::new(Service::new(
        "relay-test",
        Box::new(listener),
        Box::new(handler),
    ));
    let serve = service.clone();
    tokio::spawn(async move {
        serve.serve().await.ok();
    });

    TestServer {
        service,
        relay_addr,
        ep_addr,
        sd,
    }
}

/// Send a relay BIND request and read the response.
pub async fn send_bind(
    stream: &mut TcpStream,
    tid: TunnelId,
    user: Option<(&str, &str)>,
) -> Response {
    let mut req = Request::new(CMD_BIND);
    if let Some((username, password)) = user {
        req.features.push(Feature::UserAuth {
            username: username.to_string(),
            password: password.to_string(),
        });
    }
    req.features.push(Feature::Tunnel(tid));
    req.write_to(stream).await.expect("write bind request");
    Response::read_from(stream).await.expect("read bind response")
}

/// Start a simple echo server, returns its address.
pub async fn start_echo_server() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind echo server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Read until EOF with a timeout, returning whatever arrived.
pub async fn read_to_end_within(stream: &mut TcpStream, limit: Duration) -> Vec<u8> {
    let mut data = Vec::new();
    let _ = tokio::time::timeout(limit, stream.read_to_end(&mut data)).await;
    data
}
