//! Fuzz target for envelope parsing and packet classification
//!
//! Tests that decoding, validation and classification of arbitrary bytes never
//! panic, and that a successful decode strips exactly the variant's header.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sixtun_core::{
    EnvelopeCodec, EnvelopeVariant, OuterHeader, classify_protocol, classify_version,
    identify_tunnel_packet,
};

fuzz_target!(|data: &[u8]| {
    let _ = classify_version(data);
    let _ = classify_protocol(data);
    let _ = identify_tunnel_packet(data);

    if let Ok(header) = OuterHeader::parse(data) {
        let _ = header.checksum_valid();
        let _ = header.total_length();
    }

    let codecs = [
        EnvelopeCodec::plain(),
        EnvelopeCodec::new(EnvelopeVariant::TcpMimic {
            src_port: 4000,
            dst_port: 4000,
        }),
    ];
    for codec in codecs {
        if let Ok(inner) = codec.decode(data) {
            assert_eq!(inner.len(), data.len() - codec.variant().header_len());
        }
        let _ = codec.validate(data);
    }
});
