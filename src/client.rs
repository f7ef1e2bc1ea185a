//! The unary client: lazy connect, odd stream-id allocation, and a blocking
//! `send` that resolves when the stream closes.

use crate::connection::{Connection, ConnectionError};
use crate::flags::{DataFlags, HeadersFlags};
use crate::hpack::Indexing;
use crate::response::Response;
use crate::rpc;
use crate::types::Headers;
use bytes::Bytes;
use log::trace;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("invalid target url: {0}")]
    BadTarget(String),
    #[error("connection closed before the response arrived")]
    ConnectionClosed,
}

pub struct Client {
    scheme: String,
    authority: String,
    addr: String,
    connection: OnceCell<Connection>,
}

impl Client {
    /// A lazy client: the TCP connect and handshake happen on first use.
    pub fn new(target: &Url) -> Result<Self, ClientError> {
        let host = target
            .host_str()
            .ok_or_else(|| ClientError::BadTarget(target.to_string()))?;
        let port = target
            .port_or_known_default()
            .ok_or_else(|| ClientError::BadTarget(target.to_string()))?;
        Ok(Self {
            scheme: target.scheme().to_owned(),
            authority: if let Some(port) = target.port() {
                format!("{host}:{port}")
            } else {
                host.to_owned()
            },
            addr: format!("{host}:{port}"),
            connection: OnceCell::new(),
        })
    }

    /// Wrap an already-established connection (any byte pipe driven through
    /// [`Connection::client`]).
    #[must_use]
    pub fn from_connection(connection: Connection, authority: impl Into<String>) -> Self {
        let authority = authority.into();
        Self {
            scheme: "http".to_owned(),
            authority: authority.clone(),
            addr: authority,
            connection: OnceCell::new_with(Some(connection)),
        }
    }

    async fn connection(&self) -> Result<&Connection, ClientError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                trace!("connecting to {}", self.addr);
                let socket = TcpStream::connect(&self.addr)
                    .await
                    .map_err(ConnectionError::Io)?;
                Connection::client(socket).await
            })
            .await?;
        Ok(connection)
    }

    /// Issue one unary call with the standard request headers.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        message: impl Into<Bytes>,
    ) -> Result<Response, ClientError> {
        let headers: Headers = vec![
            (":method".to_owned(), "POST".to_owned()),
            (":scheme".to_owned(), self.scheme.clone()),
            (":path".to_owned(), format!("/{service}/{method}")),
            (":authority".to_owned(), self.authority.clone()),
            (
                rpc::CONTENT_TYPE.to_owned(),
                rpc::CONTENT_TYPE_GRPC.to_owned(),
            ),
        ];
        self.send(headers, message.into(), None).await
    }

    /// Lower-level entry point: emit HEADERS, the envelope-wrapped body,
    /// optionally a trailer block, then wait for the stream to close and
    /// hand back whatever it accumulated.
    pub async fn send(
        &self,
        headers: Headers,
        body: Bytes,
        trailers: Option<Headers>,
    ) -> Result<Response, ClientError> {
        let connection = self.connection().await?;
        let (stream, response) = connection.open_stream();
        trace!("request on stream {stream}");

        connection
            .write_headers(stream, &headers, HeadersFlags::END_HEADERS, Indexing::Always)
            .await?;

        let end_of_request = if trailers.is_none() {
            DataFlags::END_STREAM
        } else {
            DataFlags::empty()
        };
        connection
            .write_data(stream, end_of_request, rpc::encode_message(&body))
            .await?;

        if let Some(trailers) = trailers {
            connection
                .write_headers(
                    stream,
                    &trailers,
                    HeadersFlags::END_STREAM | HeadersFlags::END_HEADERS,
                    Indexing::Always,
                )
                .await?;
        }

        response.await.map_err(|_| ClientError::ConnectionClosed)
    }
}
