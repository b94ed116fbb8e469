#![no_main]

use libfuzzer_sys::fuzz_target;
use scard_proxy::proto::{Request, Response};

fuzz_target!(|data: &[u8]| {
    // Fuzz packet-body decoding - test for panics, crashes, runaway allocation
    let _ = Request::decode(data);
    let _ = Response::decode(data);
});
