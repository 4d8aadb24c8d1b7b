//! Hot-path benchmarks.
//!
//! Measures the per-message cost of the framer, the keystream transform
//! and the dispatch pipeline, the three stages every inbound byte pays
//! for.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use interpose::codec::{Catalogue, Codec, Definition, Event, Value};
use interpose::crypto::DirectionKeystream;
use interpose::dispatch::{Dispatch, HookKind, HookOpts, HookVersion, RawOutcome};
use interpose::proto::{Framer, LengthFormat, MessageBuilder};

fn message(opcode: u16, payload_len: usize) -> Vec<u8> {
    MessageBuilder::assemble(opcode, &vec![0u8; payload_len]).unwrap()
}

fn bench_framer_drain(c: &mut Criterion) {
    let msg = message(0x2001, 60);
    let mut stream = Vec::new();
    for _ in 0..64 {
        stream.extend_from_slice(&msg);
    }

    let mut group = c.benchmark_group("framer_drain");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("64_messages", |b| {
        b.iter(|| {
            let mut framer = Framer::new(LengthFormat::U16Le);
            framer.write(&stream);
            while let Some(frame) = framer.read().unwrap() {
                black_box(frame);
            }
        })
    });

    group.finish();
}

fn bench_keystream_apply(c: &mut Criterion) {
    let ikm = [0x42u8; 512];
    let mut stream = DirectionKeystream::derive(&ikm, b"to-server");
    let mut buf = vec![0u8; 1200];

    let mut group = c.benchmark_group("keystream_apply");
    group.throughput(Throughput::Bytes(1200));

    group.bench_function("1200_bytes", |b| {
        b.iter(|| {
            stream.apply(&mut buf);
            black_box(&buf);
        })
    });

    group.finish();
}

fn shared() -> (Arc<Catalogue>, Arc<Codec>) {
    let catalogue = Arc::new(Catalogue::new());
    catalogue.add_opcode("S_CHAT", 0x2001, false).unwrap();

    let codec = Arc::new(Codec::new());
    codec
        .add_definition("S_CHAT", 1, Definition::parse("channel u32\nmessage string").unwrap(), false)
        .unwrap();
    catalogue.refresh_latest(&codec);
    (catalogue, codec)
}

fn bench_dispatch_raw_hooks(c: &mut Criterion) {
    let (catalogue, codec) = shared();
    let mut dispatch = Dispatch::new(catalogue, codec);
    for order in 0..8 {
        dispatch
            .hook(
                "bench",
                "S_CHAT",
                HookVersion::Raw,
                HookOpts::order(order),
                HookKind::Raw(Box::new(|_, _| Ok(RawOutcome::Pass))),
            )
            .unwrap();
    }
    let msg = message(0x2001, 60);

    c.bench_function("dispatch_8_raw_hooks", |b| {
        b.iter(|| black_box(dispatch.run(msg.clone(), true, false)))
    });
}

fn bench_dispatch_parsed_hook(c: &mut Criterion) {
    let (catalogue, codec) = shared();
    let id = codec.resolve("S_CHAT", 1).unwrap();

    let mut event = Event::new();
    event.set("channel", Value::U32(3));
    event.set("message", Value::Str("benchmark message body".into()));
    let payload = codec.write(&id, &event).unwrap();
    let msg = MessageBuilder::assemble(0x2001, &payload).unwrap();

    let mut dispatch = Dispatch::new(catalogue, codec);
    dispatch
        .hook(
            "bench",
            "S_CHAT",
            HookVersion::Number(1),
            HookOpts::default(),
            HookKind::Parsed(Box::new(|_, ev, _| {
                black_box(ev.get("message"));
                Ok(interpose::dispatch::ParsedOutcome::Pass)
            })),
        )
        .unwrap();

    c.bench_function("dispatch_parse_and_clone", |b| {
        b.iter(|| black_box(dispatch.run(msg.clone(), true, false)))
    });
}

criterion_group!(
    benches,
    bench_framer_drain,
    bench_keystream_apply,
    bench_dispatch_raw_hooks,
    bench_dispatch_parsed_hook,
);

criterion_main!(benches);
