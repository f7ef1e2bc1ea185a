//! Differential checks of the header codec against the `hpack` crate.

use grpc2::{Decoder, Encoder, Headers, Indexing};

fn request_headers() -> Headers {
    vec![
        (":method".to_owned(), "POST".to_owned()),
        (":scheme".to_owned(), "http".to_owned()),
        (":path".to_owned(), "/example.HelloWorld/SayHello".to_owned()),
        (":authority".to_owned(), "localhost:50051".to_owned()),
        ("content-type".to_owned(), "application/grpc".to_owned()),
    ]
}

fn as_byte_pairs(headers: &Headers) -> Vec<(Vec<u8>, Vec<u8>)> {
    headers
        .iter()
        .map(|(name, value)| (name.as_bytes().to_vec(), value.as_bytes().to_vec()))
        .collect()
}

#[test]
fn their_decoder_reads_our_blocks() {
    let mut encoder = Encoder::default();
    let mut their_decoder = hpack::Decoder::new();

    // repeated blocks walk the encoder through its dynamic table
    for _ in 0..3 {
        let block = encoder.encode(&request_headers(), Indexing::Always);
        assert_eq!(
            their_decoder.decode(&block).unwrap(),
            as_byte_pairs(&request_headers())
        );
    }
}

#[test]
fn their_decoder_reads_our_unindexed_blocks() {
    let mut encoder = Encoder::default();
    let mut their_decoder = hpack::Decoder::new();

    for indexing in [Indexing::Never, Indexing::None] {
        let block = encoder.encode(&request_headers(), indexing);
        assert_eq!(
            their_decoder.decode(&block).unwrap(),
            as_byte_pairs(&request_headers())
        );
    }
}

#[test]
fn our_decoder_reads_their_blocks() {
    let mut their_encoder = hpack::Encoder::new();
    let mut decoder = Decoder::default();

    let headers = vec![
        (&b":status"[..], &b"200"[..]),
        (&b"content-type"[..], &b"application/grpc"[..]),
        (&b"grpc-status"[..], &b"0"[..]),
    ];
    for _ in 0..2 {
        let block = their_encoder.encode(headers.clone());
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(
            decoded,
            vec![
                (":status".to_owned(), "200".to_owned()),
                ("content-type".to_owned(), "application/grpc".to_owned()),
                ("grpc-status".to_owned(), "0".to_owned()),
            ]
        );
    }
}
