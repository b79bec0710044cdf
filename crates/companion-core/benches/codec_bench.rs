//! Criterion benchmarks for the handshake codec.
//!
//! Run with `cargo bench -p companion-core`.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use companion_core::{
    decode_message, encode_message,
    protocol::messages::ConnectResponse,
    CompanionMessage, ModifierDescriptor, Permission,
};

fn bench_decode_connect_request(c: &mut Criterion) {
    let raw = br#"{"type":"ConnectRequest","protocolVersion":1,"clientId":"6f1c2a","clientName":"Kitchen phone"}"#;
    c.bench_function("decode_connect_request", |b| {
        b.iter(|| decode_message(black_box(raw)))
    });
}

fn bench_decode_malformed(c: &mut Criterion) {
    let raw = br#"{"type":"Unknown","protocolVersion":1}"#;
    c.bench_function("decode_malformed", |b| b.iter(|| decode_message(black_box(raw))));
}

fn bench_encode_connect_response(c: &mut Criterion) {
    let msg = CompanionMessage::ConnectResponse(ConnectResponse {
        client_id: "6f1c2a".to_string(),
        client_name: "Kitchen phone".to_string(),
        server_side_port: 34567,
        permissions: Permission::ALL.into_iter().collect(),
        available_modifiers: (0..8)
            .map(|i| ModifierDescriptor::new(format!("mod-{i}"), format!("Modifier {i}")))
            .collect(),
        error_message: None,
    });
    c.bench_function("encode_connect_response", |b| {
        b.iter(|| encode_message(black_box(&msg)))
    });
}

criterion_group!(
    benches,
    bench_decode_connect_request,
    bench_decode_malformed,
    bench_encode_connect_response
);
criterion_main!(benches);
