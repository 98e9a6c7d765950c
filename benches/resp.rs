use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use shardkv::*;

fn bench_resp_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("resp");
    let mut buf = BytesMut::new();
    for i in 0..1000 {
        buf.extend_from_slice(
            format!(
                "*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n${}\r\nval{}\r\n",
                3 + i.to_string().len(),
                i
            )
            .as_bytes(),
        );
    }

    group.bench_function("parse_many_1k", |b| {
        b.iter(|| {
            let mut tmp = buf.clone();
            let mut out = Vec::new();
            protocol::parse_many(&mut tmp, &mut out).unwrap();
            black_box(out.len());
        });
    });
    group.bench_function("parse_and_validate_1k", |b| {
        b.iter(|| {
            let mut tmp = buf.clone();
            let mut out = Vec::new();
            protocol::parse_many(&mut tmp, &mut out).unwrap();
            let cmds: Vec<Cmd> = out.into_iter().filter_map(|r| Cmd::parse(r).ok()).collect();
            black_box(cmds.len());
        });
    });
    group.finish();
}

fn bench_frame_encode(c: &mut Criterion) {
    let reply = Frame::Array((0..100).map(|i| Frame::bulk(format!("value-{i}"))).collect());
    c.bench_function("encode_array_100", |b| {
        b.iter(|| {
            let mut out = BytesMut::with_capacity(4096);
            reply.encode(&mut out);
            black_box(out.len());
        });
    });
}

criterion_group!(benches, bench_resp_parse, bench_frame_encode);
criterion_main!(benches);
