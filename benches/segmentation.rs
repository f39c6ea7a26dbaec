use bacnet_appservice::app::*;
use bacnet_appservice::network::NetworkAddress;
use bacnet_appservice::service::ConfirmedServiceChoice;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn large_request(len: usize) -> Apdu {
    Apdu::ConfirmedRequest {
        segmented: false,
        more_follows: false,
        segmented_response_accepted: true,
        max_segments: MaxSegments::SixtyFour,
        max_response_size: MaxApduSize::Up206,
        invoke_id: 1,
        sequence_number: None,
        proposed_window_size: None,
        service_choice: ConfirmedServiceChoice::WritePropertyMultiple,
        service_data: Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>()),
    }
}

fn segmenting_client() -> ClientSsm {
    let config = ApplicationConfig::default()
        .with_max_apdu_length_accepted(MaxApduSize::Up206)
        .with_segmentation(Segmentation::Both);
    let peer = NetworkAddress::local(vec![10, 0, 0, 2, 0xBA, 0xC0]);
    let mut client = ClientSsm::new(peer, &config, None);
    client
        .indication(large_request(4000))
        .expect("request should segment");
    client
}

fn segment_benchmark(c: &mut Criterion) {
    let client = segmenting_client();

    c.bench_function("get_segment_all", |b| {
        b.iter(|| {
            for index in 0..client.segment_count() {
                black_box(client.get_segment(index).expect("segment in range"));
            }
        })
    });
}

fn reassembly_benchmark(c: &mut Criterion) {
    let client = segmenting_client();
    let chunks: Vec<Apdu> = (0..client.segment_count())
        .map(|index| {
            client
                .get_segment(index)
                .expect("segment in range")
                .0
                .without_segmentation()
        })
        .collect();

    c.bench_function("reassemble_segments", |b| {
        b.iter(|| {
            let mut context = SegmentationContext::new(&chunks[0]).expect("first chunk");
            for chunk in &chunks[1..] {
                context.append(chunk).expect("matching chunk");
            }
            black_box(context.reassembled())
        })
    });
}

criterion_group!(benches, segment_benchmark, reassembly_benchmark);
criterion_main!(benches);
