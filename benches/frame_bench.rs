//! Frame and TLV8 codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use hds::characteristics::tlv::{self, TlvWriter};
use hds::characteristics::HapTransportWrite;
use hds::transport::{encode_unencrypted, FrameHeader, FrameType};

fn bench_header_parse(c: &mut Criterion) {
    let header = FrameHeader::new(FrameType::Encrypted, 0x01_2345).unwrap().to_bytes();

    c.bench_function("frame_header_parse", |b| {
        b.iter(|| black_box(FrameHeader::parse(black_box(&header)).unwrap()))
    });
}

fn bench_encode_unencrypted(c: &mut Criterion) {
    let payload = vec![0u8; 1024];

    let mut group = c.benchmark_group("encode_unencrypted");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("1024_bytes", |b| b.iter(|| black_box(encode_unencrypted(&payload).unwrap())));
    group.finish();
}

fn bench_tlv_fragmented(c: &mut Criterion) {
    // A full HAP Transport write: payload split into 255-byte fragments.
    let write = HapTransportWrite {
        session_identifier: 1,
        payload: vec![0xa5u8; 1000],
        force_close: false,
    };
    let encoded = write.encode().unwrap();

    let mut group = c.benchmark_group("tlv_hap_transport_write");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode", |b| b.iter(|| black_box(write.encode().unwrap())));
    group.bench_function("parse", |b| b.iter(|| black_box(HapTransportWrite::parse(&encoded).unwrap())));
    group.finish();
}

fn bench_tlv_nested(c: &mut Criterion) {
    c.bench_function("tlv_setup_response", |b| {
        b.iter(|| {
            let mut writer = TlvWriter::new();
            writer.append(0x01, &[0]).unwrap();
            writer
                .append_nested(0x02, |nested| {
                    nested.append(0x01, &40000u16.to_le_bytes())?;
                    nested.append(0x02, &[7])
                })
                .unwrap();
            writer.append(0x03, &[0u8; 32]).unwrap();
            black_box(tlv::decode(&writer.into_bytes()).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_header_parse,
    bench_encode_unencrypted,
    bench_tlv_fragmented,
    bench_tlv_nested,
);

criterion_main!(benches);
