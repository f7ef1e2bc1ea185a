#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
)]

mod client;
mod connection;
mod flags;
mod frame;
mod hpack;
mod huffman;
mod response;
mod rpc;
mod server;
mod status;
mod stream;
mod types;
mod wire;

pub use bytes::Bytes;
pub use client::{Client, ClientError};
pub use connection::{Connection, ConnectionError, PREFACE};
pub use hpack::{Decoder, Encoder, HpackError, Indexing};
pub use response::Response;
pub use rpc::{decode_message, encode_message, EnvelopeError};
pub use server::{Handler, Next, ResponseParts, RpcContext, Server, Service};
pub use status::{BadStatus, StatusCode};
pub use types::{Headers, StreamId};
pub use url::Url;
