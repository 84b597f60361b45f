//! Throughput of packet header parsing and FEC reconstruction on synthetic
//! frames, run independent of the async runtime.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use remote_play_relay::codec::{self, AvPacket, Codec, HostType, PacketType};

fn video_unit_bytes(seq: u16, frame_index: u16, unit_index: u32, units_src: u32, units_fec: u32, payload: &[u8]) -> Vec<u8> {
    let units_total = units_src + units_fec;
    let mut b = vec![0u8; 24];
    b[0] = 0x00; // video, no nalu
    b[1..3].copy_from_slice(&seq.to_be_bytes());
    b[3..5].copy_from_slice(&frame_index.to_be_bytes());
    let dword2: u32 = (unit_index << 21) | ((units_total - 1) << 10) | units_fec;
    b[5..9].copy_from_slice(&dword2.to_be_bytes());
    b[9] = 0; // H264
    b.extend_from_slice(payload);
    b
}

fn make_source_frame_packets(frame_index: u16, units_src: u32, units_fec: u32, unit_payload: &[u8]) -> Vec<Vec<u8>> {
    (0..units_src)
        .map(|i| video_unit_bytes(100 + i as u16, frame_index, i, units_src, units_fec, unit_payload))
        .collect()
}

fn bench_parse(c: &mut Criterion) {
    let packets = make_source_frame_packets(42, 8, 2, b"synthetic-h264-unit-payload-bytes");

    c.bench_function("parse_video_packet_batch", |b| {
        b.iter(|| {
            for bytes in &packets {
                let pkt = codec::parse(black_box(bytes), HostType::Ps4).unwrap();
                black_box(&pkt);
            }
        })
    });

    let parsed: Vec<AvPacket> = packets.iter().map(|b| codec::parse(b, HostType::Ps4).unwrap()).collect();
    c.bench_function("serialize_video_packet_batch", |b| {
        b.iter(|| {
            for pkt in &parsed {
                black_box(codec::serialize(black_box(pkt), HostType::Ps4));
            }
        })
    });
}

fn make_src_unit(unit_index: u32, units_total: u32, units_src: u32, payload: &[u8]) -> AvPacket {
    AvPacket {
        kind: PacketType::Video,
        has_nalu: false,
        seq: unit_index as u16,
        frame_index: 7,
        codec: Codec::H264,
        key_pos: 0,
        unit_index,
        units_total,
        units_src,
        units_fec: units_total - units_src,
        audio_unit_size: 0,
        adaptive_stream_index: 0,
        data: payload.to_vec(),
    }
}

fn xor_parity(sources: &[Vec<u8>], stride: usize) -> Vec<u8> {
    let mut parity = vec![0u8; stride];
    for s in sources {
        for i in 0..stride.min(s.len()) {
            parity[i] ^= s[i];
        }
    }
    parity
}

fn bench_fec_recover(c: &mut Criterion) {
    use remote_play_relay::fec::FrameBuilder;

    let units_src = 8u32;
    let stride_payload = 18usize; // 2-byte size-extension header + 16 bytes of content
    let sources: Vec<Vec<u8>> = (0..units_src)
        .map(|i| {
            let mut v = vec![0u8, 0u8];
            v.extend_from_slice(format!("payload-unit-{:02}", i).as_bytes());
            v.resize(stride_payload, 0);
            v
        })
        .collect();
    let parity = xor_parity(&sources, stride_payload);

    c.bench_function("fec_recover_one_dropped_source", |b| {
        b.iter(|| {
            let first = make_src_unit(0, units_src + 1, units_src, &sources[0]);
            let mut fb = FrameBuilder::alloc_frame(&first);
            // drop source unit 0; supply the rest plus the single parity unit.
            for i in 1..units_src {
                fb.put_unit(&make_src_unit(i, units_src + 1, units_src, &sources[i as usize])).unwrap();
            }
            fb.put_unit(&make_src_unit(units_src, units_src + 1, units_src, &parity)).unwrap();
            black_box(fb.flush())
        })
    });
}

criterion_group!(benches, bench_parse, bench_fec_recover);
criterion_main!(benches);
