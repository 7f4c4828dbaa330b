mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use vidl_engine::{
    BatchDownloader, DownloadError, Part, ProgressSnapshot, ProgressiveDownloader, Segment,
    SegmentKey, SegmentMap, binary_merge,
};

use common::{MockTransport, encrypt_data, engine_config, ts_payload};

fn serve_part(transport: &MockTransport, part: u64, count: u64) -> Part {
    let segments = (0..count)
        .map(|i| {
            let url = format!("https://cdn.test/p{part}/{i}.ts");
            transport.serve(&url, ts_payload((part * 16 + i) as u8, 3));
            Segment::new(i, url)
        })
        .collect();
    Part::new(part, segments)
}

#[tokio::test]
async fn second_run_performs_no_fetches() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let parts = vec![serve_part(&transport, 0, 5)];

    let downloader = BatchDownloader::new(transport.clone(), engine_config(tmp.path()));
    let token = CancellationToken::new();
    let plan = downloader.download(&parts, &token).await.unwrap();
    assert_eq!(plan.len(), 5);
    assert_eq!(transport.fetches(), 5);

    downloader.download(&parts, &token).await.unwrap();
    assert_eq!(transport.fetches(), 5);
}

#[tokio::test]
async fn in_flight_fetches_respect_concurrency() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.set_latency(Duration::from_millis(20));
    let parts = vec![serve_part(&transport, 0, 12)];

    let mut config = engine_config(tmp.path());
    config.concurrency = 3;
    BatchDownloader::new(transport.clone(), config)
        .download(&parts, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(transport.fetches(), 12);
    assert!(transport.peak_in_flight() <= 3);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let parts = vec![serve_part(&transport, 0, 4)];
    transport.fail("https://cdn.test/p0/2.ts", 2);

    BatchDownloader::new(transport.clone(), engine_config(tmp.path()))
        .download(&parts, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(transport.fetches_of("https://cdn.test/p0/2.ts"), 3);
}

#[tokio::test]
async fn exhausted_budget_makes_budget_plus_one_attempts() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let parts = vec![serve_part(&transport, 0, 1)];
    let url = "https://cdn.test/p0/0.ts";
    transport.fail(url, u32::MAX);

    let mut config = engine_config(tmp.path());
    config.max_retries = 3;
    config.outer_retries = 0;
    let err = BatchDownloader::new(transport.clone(), config)
        .download(&parts, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::OverRetry { attempts: 4, .. }));
    assert_eq!(transport.fetches_of(url), 4);
}

#[tokio::test]
async fn outer_retry_restarts_with_fresh_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let parts = vec![serve_part(&transport, 0, 2)];
    let url = "https://cdn.test/p0/1.ts";
    // First pass: 1 attempt + 1 retry fail; second pass succeeds.
    transport.fail(url, 2);

    let mut config = engine_config(tmp.path());
    config.concurrency = 1;
    config.max_retries = 1;
    config.outer_retries = 1;
    BatchDownloader::new(transport.clone(), config)
        .download(&parts, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(transport.fetches_of(url), 3);
    // The finished segment is not fetched again on restart.
    assert_eq!(transport.fetches_of("https://cdn.test/p0/0.ts"), 1);
}

#[tokio::test]
async fn decrypts_aes128_segments() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let key = [0x42u8; 16];
    let key_url = "https://cdn.test/key.bin";
    transport.serve(key_url, key.to_vec());

    let mut plaintext = Vec::new();
    let segments = (0..3u64)
        .map(|i| {
            let url = format!("https://cdn.test/enc/{i}.ts");
            let data = ts_payload(i as u8 + 1, 7);
            // IV defaults to the media sequence number.
            let iv = (i as u128).to_be_bytes();
            transport.serve(&url, encrypt_data(&data, &key, &iv));
            plaintext.extend_from_slice(&data);
            let mut segment = Segment::new(i, url);
            segment.key = SegmentKey::aes128(key_url, None);
            segment
        })
        .collect();

    let downloader = BatchDownloader::new(transport.clone(), engine_config(tmp.path()));
    let plan = downloader
        .download(&[Part::new(0, segments)], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(transport.fetches_of(key_url), 1);

    let output = tmp.path().join("out.ts");
    binary_merge(&plan.batch_dir, &output).await.unwrap();
    assert_eq!(tokio::fs::read(&output).await.unwrap(), plaintext);
}

#[tokio::test]
async fn concatenates_parts_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let parts = vec![serve_part(&transport, 0, 2), serve_part(&transport, 1, 2)];

    let plan = BatchDownloader::new(transport.clone(), engine_config(tmp.path()))
        .download(&parts, &CancellationToken::new())
        .await
        .unwrap();

    let output = tmp.path().join("out.ts");
    binary_merge(&plan.batch_dir, &output).await.unwrap();

    let expected: Vec<u8> = [0u8, 1, 16, 17]
        .into_iter()
        .flat_map(|tag| ts_payload(tag, 3))
        .collect();
    assert_eq!(tokio::fs::read(&output).await.unwrap(), expected);
}

#[tokio::test]
async fn cancellation_is_not_a_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.set_latency(Duration::from_secs(30));
    let parts = vec![serve_part(&transport, 0, 4)];

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        })
    };

    let err = BatchDownloader::new(transport.clone(), engine_config(tmp.path()))
        .download(&parts, &token)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, DownloadError::Cancelled));
    let part_dir = tmp.path().join("batch").join("Part_0");
    let mut entries = tokio::fs::read_dir(&part_dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name = entry.file_name();
        assert!(
            !name.to_string_lossy().ends_with(".ts"),
            "unexpected final file {name:?}"
        );
    }
}

#[tokio::test]
async fn progress_snapshots_are_monotonic() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.set_latency(Duration::from_millis(15));
    let parts = vec![serve_part(&transport, 0, 8)];

    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let callback = {
        let snapshots = Arc::clone(&snapshots);
        Arc::new(move |snapshot: ProgressSnapshot| snapshots.lock().push(snapshot))
    };
    let mut config = engine_config(tmp.path());
    config.concurrency = 2;
    config.report_interval = Duration::from_millis(10);
    BatchDownloader::new(transport.clone(), config)
        .with_progress(callback)
        .download(&parts, &CancellationToken::new())
        .await
        .unwrap();

    let snapshots = snapshots.lock();
    assert!(!snapshots.is_empty());
    for pair in snapshots.windows(2) {
        assert!(pair[0].finished <= pair[1].finished);
        assert!(pair[0].downloaded_bytes <= pair[1].downloaded_bytes);
    }
    for snapshot in snapshots.iter() {
        assert!(snapshot.finished <= snapshot.total);
    }
    let last = snapshots.last().unwrap();
    assert_eq!(last.finished, 8);
    assert_eq!(last.downloaded_bytes, 8 * 3 * 188);
}

#[tokio::test]
async fn progressive_download_joins_ranged_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let url = "https://cdn.test/media/clip.mp4";
    let body: Vec<u8> = (0..25_000u32).map(|i| (i % 251) as u8).collect();
    transport.serve(url, body.clone());

    let output = ProgressiveDownloader::new(transport.clone(), engine_config(tmp.path()))
        .with_chunk_size(4096)
        .download(url, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output, tmp.path().join("batch").join("batch.mp4"));
    assert_eq!(tokio::fs::read(&output).await.unwrap(), body);
    // One range request for the length plus seven chunks.
    assert_eq!(transport.fetches_of(url), 8);
}

#[tokio::test]
async fn counters_do_not_drop_on_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let parts = vec![serve_part(&transport, 0, 3)];
    transport.fail("https://cdn.test/p0/2.ts", 2);

    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let callback = {
        let snapshots = Arc::clone(&snapshots);
        Arc::new(move |snapshot: ProgressSnapshot| snapshots.lock().push(snapshot))
    };
    let mut config = engine_config(tmp.path());
    config.concurrency = 1;
    config.max_retries = 1;
    config.outer_retries = 1;
    config.outer_delay = Duration::from_millis(40);
    config.report_interval = Duration::from_millis(10);
    BatchDownloader::new(transport.clone(), config)
        .with_progress(callback)
        .download(&parts, &CancellationToken::new())
        .await
        .unwrap();

    let snapshots = snapshots.lock();
    for pair in snapshots.windows(2) {
        assert!(pair[0].finished <= pair[1].finished);
        assert!(pair[0].downloaded_bytes <= pair[1].downloaded_bytes);
    }
    let last = snapshots.last().unwrap();
    assert_eq!(last.finished, 3);
    assert_eq!(last.downloaded_bytes, 3 * 3 * 188);
}

#[tokio::test]
async fn speed_cap_bounds_bytes_per_interval() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let segments: Vec<Segment> = (0..4u64)
        .map(|i| {
            let url = format!("https://cdn.test/slow/{i}.ts");
            transport.serve(&url, vec![0x47u8; 2000]);
            Segment::new(i, url)
        })
        .collect();
    let total_bytes = 4 * 2000u64;

    // 20 000 B/s over 100 ms windows: 2000 bytes per window for four workers.
    let rate = 20_000u64;
    let interval = Duration::from_millis(100);
    let mut config = engine_config(tmp.path());
    config.concurrency = 4;
    config.max_speed = Some(rate);
    config.report_interval = interval;

    let started = std::time::Instant::now();
    BatchDownloader::new(transport.clone(), config)
        .download(&[Part::new(0, segments)], &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Moving `total_bytes` at no more than one budget per window needs at
    // least `total / budget` windows, i.e. that many minus one resets.
    let budget = rate * interval.as_millis() as u64 / 1000;
    let windows = total_bytes.div_ceil(budget);
    let floor = interval * (windows as u32 - 1);
    assert!(
        elapsed + Duration::from_millis(20) >= floor,
        "{total_bytes} bytes in {elapsed:?} exceeds {rate} B/s"
    );
    assert!(elapsed < Duration::from_secs(10), "stalled: {elapsed:?}");
}

#[tokio::test]
async fn downloaded_bytes_match_the_files_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let parts = vec![serve_part(&transport, 0, 3)];
    // First response is cut short and rejected by the length check.
    transport.truncate("https://cdn.test/p0/1.ts", 1);

    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let callback = {
        let snapshots = Arc::clone(&snapshots);
        Arc::new(move |snapshot: ProgressSnapshot| snapshots.lock().push(snapshot))
    };
    let mut config = engine_config(tmp.path());
    config.concurrency = 1;
    let plan = BatchDownloader::new(transport.clone(), config)
        .with_progress(callback)
        .download(&parts, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(transport.fetches_of("https://cdn.test/p0/1.ts"), 2);

    let mut on_disk = 0;
    for item in &plan.items {
        on_disk += tokio::fs::metadata(item.final_path()).await.unwrap().len();
    }
    let last = snapshots.lock().last().cloned().unwrap();
    assert_eq!(on_disk, 3 * 3 * 188);
    assert_eq!(last.downloaded_bytes, on_disk);
    assert_eq!(last.retry_count, 1);
}

#[tokio::test]
async fn decrypts_encrypted_init_map() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let key = [0x24u8; 16];
    let key_url = "https://cdn.test/fmp4/key";
    transport.serve(key_url, key.to_vec());

    let map_iv = [0x11u8; 16];
    let init = b"ftyp....moov....".repeat(5);
    transport.serve(
        "https://cdn.test/fmp4/init.mp4",
        encrypt_data(&init, &key, &map_iv),
    );
    let fragment = vec![0x5au8; 700];
    let fragment_iv = 8u128.to_be_bytes();
    transport.serve(
        "https://cdn.test/fmp4/8.m4s",
        encrypt_data(&fragment, &key, &fragment_iv),
    );

    let mut segment = Segment::new(8, "https://cdn.test/fmp4/8.m4s");
    segment.key = SegmentKey::aes128(key_url, None);
    let part = Part::new(0, vec![segment]).with_map(
        SegmentMap::new("https://cdn.test/fmp4/init.mp4", None)
            .with_key(SegmentKey::aes128(key_url, Some(map_iv))),
    );

    let plan = BatchDownloader::new(transport.clone(), engine_config(tmp.path()))
        .download(&[part], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(transport.fetches_of(key_url), 1);

    let part_dir = plan.batch_dir.join("Part_0");
    assert_eq!(tokio::fs::read(part_dir.join("!MAP.mp4")).await.unwrap(), init);
    assert_eq!(tokio::fs::read(part_dir.join("8.m4s")).await.unwrap(), fragment);
}
