#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use latency_mitigator::config::{Config, ConfigProvider};
use latency_mitigator::protocol::ConnectionId;
use latency_mitigator::service::Interceptor;

fuzz_target!(|data: &[u8]| {
    let config = Config::default_with_overrides(|config| config.mitigation.enabled = false);
    let interceptor = Interceptor::new(Arc::new(ConfigProvider::new(config)));
    let id = ConnectionId(1);
    interceptor.on_connection_found(id);

    // Feed the input in uneven chunks; without the mitigator nothing is rewritten
    let mut forwarded = Vec::with_capacity(data.len());
    for chunk in data.chunks(97) {
        forwarded.extend(interceptor.on_recv(id, chunk));
    }
    if let Some((_, recv)) = interceptor.on_connection_gone(id) {
        forwarded.extend(recv);
    }
    assert_eq!(forwarded, data);
});
