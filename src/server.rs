//! The server side: a registry of unary services, a middleware-style
//! handler chain, and the per-stream dispatch that turns a half-closed
//! inbound stream into HEADERS + DATA + trailer HEADERS.

use crate::connection::{Connection, ConnectionError, RequestHook, RequestParts};
use crate::flags::{DataFlags, HeadersFlags};
use crate::hpack::Indexing;
use crate::rpc;
use crate::status::{BadStatus, StatusCode};
use crate::types::*;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

/// A unary service, addressed by `"/" + name() + "/" + method`.
pub trait Service: Send + Sync {
    /// The fully qualified service name, e.g. `"example.HelloWorld"`.
    fn name(&self) -> &str;

    /// Dispatch one method call over an opaque request message.
    fn handle(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, BadStatus>;
}

/// One request-response exchange flowing through the handler chain.
#[derive(Debug)]
pub struct RpcContext {
    pub stream: StreamId,
    pub headers: Headers,
    pub body: Bytes,
    pub response: ResponseParts,
}

impl RpcContext {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

#[derive(Debug)]
pub struct ResponseParts {
    pub status: u16,
    pub content_type: String,
    /// Envelope-wrapped message bytes, exactly as the DATA frame carries them.
    pub body: Bytes,
    pub grpc_status: StatusCode,
    pub grpc_message: Option<String>,
}

impl Default for ResponseParts {
    fn default() -> Self {
        Self {
            status: 200,
            content_type: rpc::CONTENT_TYPE_GRPC.to_owned(),
            body: rpc::encode_message(b""),
            grpc_status: StatusCode::Ok,
            grpc_message: None,
        }
    }
}

/// A link in the handler chain. Call `next.run(cx)` to pass the request
/// further down; the chain ends in the RPC dispatch handler.
pub trait Handler: Send + Sync {
    fn call(&self, cx: &mut RpcContext, next: Next<'_>);
}

pub struct Next<'a> {
    rest: &'a [Arc<dyn Handler>],
}

impl Next<'_> {
    pub fn run(self, cx: &mut RpcContext) {
        if let Some((head, rest)) = self.rest.split_first() {
            head.call(cx, Next { rest });
        }
    }
}

/// The chain tail: envelope parsing, path routing, service dispatch, and
/// status mapping.
struct RpcHandler {
    services: HashMap<String, Arc<dyn Service>>,
}

impl Handler for RpcHandler {
    fn call(&self, cx: &mut RpcContext, _next: Next<'_>) {
        let path = cx.header(":path").unwrap_or("").to_owned();
        let Some((service_name, method)) = rpc::split_path(&path) else {
            debug!("unroutable path {path:?}");
            cx.response.grpc_status = StatusCode::NotFound;
            return;
        };
        let Some(service) = self.services.get(service_name) else {
            debug!("no service named {service_name:?}");
            cx.response.grpc_status = StatusCode::NotFound;
            return;
        };

        let request = match rpc::decode_message(&cx.body) {
            Ok((_flag, message)) => message,
            Err(err) => {
                cx.response.grpc_status = StatusCode::Internal;
                cx.response.grpc_message = Some(err.to_string());
                return;
            }
        };

        match service.handle(method, request) {
            Ok(reply) => {
                cx.response.body = rpc::encode_message(&reply);
            }
            Err(bad) => {
                cx.response.grpc_status = bad.code;
                cx.response.grpc_message = Some(bad.message);
            }
        }
    }
}

struct Dispatch {
    chain: Vec<Arc<dyn Handler>>,
}

impl Dispatch {
    fn hook(self: &Arc<Self>) -> RequestHook {
        let dispatch = self.clone();
        Arc::new(move |connection, request| {
            let dispatch = dispatch.clone();
            tokio::spawn(async move {
                dispatch.respond(connection, request).await;
            });
        })
    }

    async fn respond(&self, connection: Connection, request: RequestParts) {
        let stream = request.stream;
        let mut cx = RpcContext {
            stream,
            headers: request.headers,
            body: request.body,
            response: ResponseParts::default(),
        };
        Next { rest: &self.chain }.run(&mut cx);
        if let Err(err) = emit(&connection, stream, &cx.response).await {
            warn!("response on stream {stream}: {err}");
        }
        // the stream leaves the table on every exit path
        connection.remove_stream(stream);
    }
}

async fn emit(
    connection: &Connection,
    stream: StreamId,
    response: &ResponseParts,
) -> Result<(), ConnectionError> {
    let headers: Headers = vec![
        (":status".to_owned(), response.status.to_string()),
        (rpc::CONTENT_TYPE.to_owned(), response.content_type.clone()),
    ];
    connection
        .write_headers(stream, &headers, HeadersFlags::END_HEADERS, Indexing::Always)
        .await?;

    connection
        .write_data(stream, DataFlags::empty(), response.body.clone())
        .await?;

    let mut trailers: Headers = vec![(
        rpc::GRPC_STATUS.to_owned(),
        response.grpc_status.as_trailer(),
    )];
    if let Some(message) = &response.grpc_message {
        trailers.push((
            rpc::GRPC_MESSAGE.to_owned(),
            rpc::encode_grpc_message(message),
        ));
    }
    connection
        .write_headers(
            stream,
            &trailers,
            HeadersFlags::END_STREAM | HeadersFlags::END_HEADERS,
            Indexing::Always,
        )
        .await
}

#[derive(Default)]
pub struct Server {
    services: HashMap<String, Arc<dyn Service>>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Server {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: impl Service + 'static) -> &mut Self {
        let service = Arc::new(service);
        self.services.insert(service.name().to_owned(), service);
        self
    }

    /// Add a handler in front of the RPC dispatch; handlers run in the
    /// order they were added.
    pub fn wrap(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    fn dispatch(&self) -> Arc<Dispatch> {
        let mut chain = self.handlers.clone();
        chain.push(Arc::new(RpcHandler {
            services: self.services.clone(),
        }));
        Arc::new(Dispatch { chain })
    }

    /// Accept loop: one connection task per accepted socket.
    pub async fn serve(&self, addr: &str) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);
        let dispatch = self.dispatch();
        loop {
            let (socket, peer) = listener.accept().await?;
            debug!("accepted {peer}");
            let hook = dispatch.hook();
            tokio::spawn(async move {
                if let Err(err) = Connection::server(socket, hook).await {
                    warn!("connection from {peer}: {err}");
                }
            });
        }
    }

    /// Serve a single established byte pipe (any bidirectional stream).
    pub async fn serve_connection<S>(&self, socket: S) -> Result<Connection, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Connection::server(socket, self.dispatch().hook()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hello;

    impl Service for Hello {
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
                _ => Err(BadStatus::new(StatusCode::Unimplemented, method)),
            }
        }
    }

    fn run_chain(services: Vec<Arc<dyn Service>>, path: &str, body: Bytes) -> RpcContext {
        let services = services
            .into_iter()
            .map(|service| (service.name().to_owned(), service))
            .collect();
        let chain: Vec<Arc<dyn Handler>> = vec![Arc::new(RpcHandler { services })];
        let mut cx = RpcContext {
            stream: 1,
            headers: vec![
                (":method".to_owned(), "POST".to_owned()),
                (":path".to_owned(), path.to_owned()),
            ],
            body,
            response: ResponseParts::default(),
        };
        Next { rest: &chain }.run(&mut cx);
        cx
    }

    #[test]
    fn happy_path_wraps_the_reply() {
        let cx = run_chain(
            vec![Arc::new(Hello)],
            "/example.HelloWorld/SayHello",
            Bytes::from_static(b"\x00\x00\x00\x00\x05\x0a\x03foo"),
        );
        assert_eq!(cx.response.grpc_status, StatusCode::Ok);
        assert_eq!(cx.response.grpc_message, None);
        assert_eq!(
            &cx.response.body[..],
            b"\x00\x00\x00\x00\x07\x0a\x05Hello"
        );
    }

    #[test]
    fn unknown_service_is_not_found_with_empty_body() {
        let cx = run_chain(
            vec![Arc::new(Hello)],
            "/unknown.Service/Method",
            Bytes::from_static(b"\x00\x00\x00\x00\x00"),
        );
        assert_eq!(cx.response.grpc_status, StatusCode::NotFound);
        assert_eq!(&cx.response.body[..], [0u8; 5]);
    }

    #[test]
    fn bad_status_lands_in_the_trailer_fields() {
        let cx = run_chain(
            vec![Arc::new(Hello)],
            "/example.HelloWorld/Denied",
            Bytes::from_static(b"\x00\x00\x00\x00\x00"),
        );
        assert_eq!(cx.response.grpc_status, StatusCode::PermissionDenied);
        assert_eq!(cx.response.grpc_message.as_deref(), Some("nope"));
        assert_eq!(&cx.response.body[..], [0u8; 5]);
    }

    #[test]
    fn truncated_envelope_is_internal() {
        let cx = run_chain(
            vec![Arc::new(Hello)],
            "/example.HelloWorld/SayHello",
            Bytes::from_static(b"\x00\x00"),
        );
        assert_eq!(cx.response.grpc_status, StatusCode::Internal);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        struct Tag(&'static str);

        impl Handler for Tag {
            fn call(&self, cx: &mut RpcContext, next: Next<'_>) {
                cx.headers.push(("x-tag".to_owned(), self.0.to_owned()));
                next.run(cx);
            }
        }

        let chain: Vec<Arc<dyn Handler>> = vec![
            Arc::new(Tag("outer")),
            Arc::new(Tag("inner")),
            Arc::new(RpcHandler {
                services: HashMap::new(),
            }),
        ];
        let mut cx = RpcContext {
            stream: 1,
            headers: vec![(":path".to_owned(), "/a/b".to_owned())],
            body: Bytes::new(),
            response: ResponseParts::default(),
        };
        Next { rest: &chain }.run(&mut cx);
        let tags: Vec<_> = cx
            .headers
            .iter()
            .filter(|(name, _)| name == "x-tag")
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(tags, ["outer", "inner"]);
        assert_eq!(cx.response.grpc_status, StatusCode::NotFound);
    }
}
