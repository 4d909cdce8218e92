#![no_main]

use libfuzzer_sys::fuzz_target;
use webconn::http::Method;
use webconn::{try_parse_response, BodyReader, MAX_RESPONSE_HEADERS};

// First byte picks the request method, the rest is what the server sends.
const METHODS: &[Method] = &[Method::GET, Method::HEAD, Method::POST, Method::CONNECT];

fuzz_target!(|data: &[u8]| {
    let Some((&pick, input)) = data.split_first() else {
        return;
    };
    let method = &METHODS[pick as usize % METHODS.len()];

    let Ok(Some((used, res))) = try_parse_response::<MAX_RESPONSE_HEADERS>(input) else {
        return;
    };

    let Ok(mut reader) = BodyReader::for_response(method, res.status(), res.headers()) else {
        return;
    };

    let mut input = &input[used..];
    let mut output = [0_u8; 1024];

    while !reader.is_ended() {
        let Ok((n_in, n_out)) = reader.read(input, &mut output) else {
            return;
        };
        assert!(n_in <= input.len());
        assert!(n_out <= output.len());
        if n_in == 0 && n_out == 0 {
            return;
        }
        input = &input[n_in..];
    }
});
