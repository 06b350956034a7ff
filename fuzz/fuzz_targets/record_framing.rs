//! Fuzz target for stream record framing
//!
//! Feeds arbitrary bytes to every framing mode and checks that reads either
//! fail cleanly or yield records within the size limit.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sixtun_transport::{Framing, MAX_RECORD_SIZE};

fuzz_target!(|data: &[u8]| {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };

    for framing in [Framing::HeaderLength, Framing::LengthPrefixed, Framing::Raw] {
        runtime.block_on(async {
            let mut reader = data;
            let mut buf = Vec::new();
            while let Ok(Some(n)) = framing.read_record(&mut reader, &mut buf, MAX_RECORD_SIZE).await {
                assert_eq!(n, buf.len());
                assert!(n <= MAX_RECORD_SIZE);
            }
        });
    }
});
