//! Fuzz target for CDC frame decoding.
//!
//! Arbitrary bytes on the socket must produce frames or errors, never a
//! panic, for both directions of the protocol.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use replication_client::stream::{ClientCodec, ServerCodec};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut client = ClientCodec::new();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = client.decode(&mut buf) {}

    let mut server = ServerCodec::new();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = server.decode(&mut buf) {}
});
