use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tela_wire::frame::{self, FrameInfo, Framing};
use tela_wire::tdf::TdfBuffer;

fn bench_frame_encode(c: &mut Criterion) {
    let key = [0x42u8; 32];
    let info = FrameInfo {
        packet_type: 0x03,
        flags: 0,
        key_id: 0x123456,
        device_id: 0x1122_3344_5566_7788,
        gps_time: 1_400_000_000,
        sequence: 42,
    };
    let payload = vec![0xA5u8; 512];

    c.bench_function("encode_unversioned_512", |b| {
        b.iter(|| {
            frame::encode(
                Framing::Unversioned,
                black_box(&info),
                0x1234,
                &key,
                black_box(&payload),
            )
            .unwrap()
        });
    });

    let encoded = frame::encode(Framing::Unversioned, &info, 0x1234, &key, &payload).unwrap();
    c.bench_function("decrypt_unversioned_512", |b| {
        b.iter(|| frame::decrypt(Framing::Unversioned, black_box(&encoded), &key).unwrap());
    });
}

fn bench_tdf_add(c: &mut Criterion) {
    c.bench_function("tdf_add_single", |b| {
        let mut buf = TdfBuffer::new(8192);
        let data = [0u8; 12];
        let mut t = 1_000_000_000u64;
        b.iter(|| {
            t += 100;
            if buf.add(0x10, t, black_box(&data)).is_err() {
                buf.reset();
            }
        });
    });
}

criterion_group!(benches, bench_frame_encode, bench_tdf_add);
criterion_main!(benches);
