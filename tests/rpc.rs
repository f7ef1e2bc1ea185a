//! End-to-end unary RPC over an in-memory byte pipe: a real server
//! connection on one end, a real client on the other.

use grpc2::{BadStatus, Bytes, Client, Connection, Server, Service, StatusCode};

struct HelloWorld;

impl Service for HelloWorld {
    fn name(&self) -> &str {
        "example.HelloWorld"
    }

    fn handle(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, BadStatus> {
        match method {
            "SayHello" => {
                assert_eq!(request, b"\x0a\x03foo");
                Ok(b"\x0a\x05Hello".to_vec())
            }
            "Denied" => Err(BadStatus::new(StatusCode::PermissionDenied, "nope")),
            other => Err(BadStatus::new(StatusCode::Unimplemented, other)),
        }
    }
}

struct Echo;

impl Service for Echo {
    fn name(&self) -> &str {
        "example.Echo"
    }

    fn handle(&self, _method: &str, request: &[u8]) -> Result<Vec<u8>, BadStatus> {
        Ok(request.to_vec())
    }
}

async fn start(server: Server) -> Client {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        server.serve_connection(server_io).await.unwrap();
    });
    let connection = Connection::client(client_io).await.unwrap();
    Client::from_connection(connection, "localhost")
}

fn hello_server() -> Server {
    let mut server = Server::new();
    server.register(HelloWorld);
    server
}

#[tokio::test]
async fn unary_happy_path() {
    let client = start(hello_server()).await;
    let response = client
        .call(
            "example.HelloWorld",
            "SayHello",
            Bytes::from_static(b"\x0a\x03foo"),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), Some(200));
    assert_eq!(response.header("content-type"), Some("application/grpc"));
    assert_eq!(response.header("grpc-status"), Some("0"));
    assert_eq!(response.grpc_status(), Some(StatusCode::Ok));
    assert_eq!(&response.body[..], b"\x00\x00\x00\x00\x07\x0a\x05Hello");
    assert_eq!(&response.message().unwrap()[..], b"\x0a\x05Hello");
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    let client = start(hello_server()).await;
    let response = client
        .call("unknown.Service", "Method", Bytes::new())
        .await
        .unwrap();

    assert_eq!(response.grpc_status(), Some(StatusCode::NotFound));
    assert_eq!(response.header("grpc-status"), Some("5"));
    assert_eq!(&response.body[..], [0u8; 5]);
}

#[tokio::test]
async fn handler_status_reaches_the_trailers() {
    let client = start(hello_server()).await;
    let response = client
        .call("example.HelloWorld", "Denied", Bytes::new())
        .await
        .unwrap();

    assert_eq!(response.grpc_status(), Some(StatusCode::PermissionDenied));
    assert_eq!(response.header("grpc-status"), Some("7"));
    assert_eq!(response.grpc_message().as_deref(), Some("nope"));
    assert_eq!(&response.body[..], [0u8; 5]);
}

#[tokio::test]
async fn sequential_calls_share_the_connection() {
    let client = start(hello_server()).await;
    for _ in 0..3 {
        // repeated calls exercise the shared header-compression tables
        let response = client
            .call(
                "example.HelloWorld",
                "SayHello",
                Bytes::from_static(b"\x0a\x03foo"),
            )
            .await
            .unwrap();
        assert_eq!(response.grpc_status(), Some(StatusCode::Ok));
    }
}

#[tokio::test]
async fn concurrent_calls_multiplex() {
    let client = start(hello_server()).await;
    let (first, second, third) = tokio::join!(
        client.call(
            "example.HelloWorld",
            "SayHello",
            Bytes::from_static(b"\x0a\x03foo")
        ),
        client.call("example.HelloWorld", "Denied", Bytes::new()),
        client.call("unknown.Service", "Method", Bytes::new()),
    );
    assert_eq!(first.unwrap().grpc_status(), Some(StatusCode::Ok));
    assert_eq!(
        second.unwrap().grpc_status(),
        Some(StatusCode::PermissionDenied)
    );
    assert_eq!(third.unwrap().grpc_status(), Some(StatusCode::NotFound));
}

#[tokio::test]
async fn large_bodies_cross_the_flow_control_window() {
    let mut server = Server::new();
    server.register(Echo);
    let client = start(server).await;

    // three times the initial window in each direction
    let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
    let response = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        client.call("example.Echo", "Echo", Bytes::from(payload.clone())),
    )
    .await
    .expect("flow control stalled")
    .unwrap();

    assert_eq!(response.grpc_status(), Some(StatusCode::Ok));
    assert_eq!(&response.message().unwrap()[..], &payload[..]);
}

#[tokio::test]
async fn request_trailers_are_accepted() {
    let client = start(hello_server()).await;
    let headers = vec![
        (":method".to_owned(), "POST".to_owned()),
        (":scheme".to_owned(), "http".to_owned()),
        (":path".to_owned(), "/example.HelloWorld/SayHello".to_owned()),
        (":authority".to_owned(), "localhost".to_owned()),
        ("content-type".to_owned(), "application/grpc".to_owned()),
    ];
    let trailers = vec![("x-checksum".to_owned(), "0".to_owned())];
    let response = client
        .send(headers, Bytes::from_static(b"\x0a\x03foo"), Some(trailers))
        .await
        .unwrap();
    assert_eq!(response.grpc_status(), Some(StatusCode::Ok));
}
