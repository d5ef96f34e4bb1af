//! Performance benchmarks for the framing codec and request scheduling

use bytes::BytesMut;
use server::files::FileStore;
use server::producer::{ChunkProducer, Fulfilment};
use server::provider::MemoryArchive;
use server::queue::{ChunkRequest, RequestQueue};
use server::session::Outbox;
use shared::{encode_response, Container, Priority, ResponseDecoder};
use std::sync::Arc;
use std::time::Instant;

fn stored_container(len: usize) -> Vec<u8> {
    let mut stored = vec![0u8];
    stored.extend_from_slice(&(len as u32).to_be_bytes());
    stored.extend((0..len).map(|i| (i % 251) as u8));
    stored
}

/// Benchmarks framing a large container into blocks
#[test]
fn benchmark_response_encoding() {
    let stored = stored_container(256 * 1024);
    let container = Container::parse(&stored).unwrap();

    let iterations = 200;
    let start = Instant::now();

    for _ in 0..iterations {
        let frames = encode_response(1, 1, &container, Priority::Normal);
        assert!(frames.len() > 500);
    }

    let duration = start.elapsed();
    println!(
        "Response encoding: {} × 256 KiB in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks reassembling responses from arbitrarily split reads
#[test]
fn benchmark_response_decoding() {
    let stored = stored_container(64 * 1024);
    let container = Container::parse(&stored).unwrap();
    let wire: Vec<u8> = encode_response(7, 3, &container, Priority::Urgent)
        .iter()
        .flat_map(|frame| frame.iter().copied())
        .collect();

    let iterations = 500;
    let start = Instant::now();

    let mut decoder = ResponseDecoder::new();
    for _ in 0..iterations {
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in wire.chunks(1460) {
            buf.extend_from_slice(chunk);
            if let Some(response) = decoder.decode(&mut buf).unwrap() {
                decoded = Some(response);
            }
        }
        assert_eq!(decoded.unwrap().data().len(), 64 * 1024);
    }

    let duration = start.elapsed();
    println!(
        "Response decoding: {} × 64 KiB in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 5 seconds
    assert!(duration.as_millis() < 5000);
}

/// Stress tests the queue with interleaved priorities
#[tokio::test]
async fn stress_test_queue_ordering() {
    let queue = RequestQueue::new(20_000);
    let (outbox, _receiver) = Outbox::channel(1, 20_000);

    let start = Instant::now();
    for entry in 0..10_000u16 {
        let priority = if entry % 4 == 0 {
            Priority::Urgent
        } else {
            Priority::Normal
        };
        let slot = outbox.reserve().await.unwrap();
        queue
            .push(ChunkRequest::new(outbox.link(), 0, entry, priority, slot))
            .await
            .unwrap();
    }

    let mut urgent_done = false;
    let mut last_urgent = None;
    let mut last_normal = None;
    for _ in 0..10_000 {
        let request = queue.pop().await.unwrap();
        match request.priority {
            Priority::Urgent => {
                assert!(!urgent_done, "urgent request after a normal one");
                assert!(last_urgent.map_or(true, |last| last < request.entry));
                last_urgent = Some(request.entry);
            }
            Priority::Normal => {
                urgent_done = true;
                assert!(last_normal.map_or(true, |last| last < request.entry));
                last_normal = Some(request.entry);
            }
        }
    }

    let duration = start.elapsed();
    println!("Queue: 10000 requests in {:?}", duration);

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks workers fulfilling requests for one session
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn benchmark_worker_throughput() {
    let mut archive = MemoryArchive::new();
    for entry in 0..64u16 {
        archive.insert(2, entry, stored_container(8 * 1024));
    }
    let files = Arc::new(FileStore::new(Arc::new(archive), &[]));
    let queue = Arc::new(RequestQueue::new(4096));
    let producer = ChunkProducer::new(Arc::clone(&queue), files);

    let requests = 2000usize;
    let (outbox, mut receiver) = Outbox::channel(1, requests);
    let start = Instant::now();

    for i in 0..requests {
        let slot = outbox.reserve().await.unwrap();
        let request = ChunkRequest::new(outbox.link(), 2, (i % 64) as u16, Priority::Normal, slot);
        queue.push(request).await.unwrap();
    }
    queue.close().await;

    let mut workers = producer.spawn(4);
    let mut delivered = 0;
    while delivered < requests {
        if receiver.recv().await.is_none() {
            break;
        }
        delivered += 1;
    }
    while let Some(result) = workers.join_next().await {
        result.unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Workers: {} × 8 KiB responses in {:?} ({:.2} μs/request)",
        requests,
        duration,
        duration.as_micros() as f64 / requests as f64
    );

    assert_eq!(delivered, requests);
    // Should complete in under 10 seconds
    assert!(duration.as_millis() < 10_000);

    // Requests for a closed session cost nothing
    let (outbox, receiver) = Outbox::channel(2, 1);
    let slot = outbox.reserve().await.unwrap();
    let request = ChunkRequest::new(outbox.link(), 2, 0, Priority::Urgent, slot);
    drop(receiver);
    assert_eq!(producer.fulfil(request).await, Fulfilment::Discarded);
}
