mod common;

use common::{block, MockBlockService};
use lightwallet_sync::{BlockDownloader, BlockRange, BlockStore, CancelToken, Error};
use proptest::prelude::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn downloader(service: &Arc<MockBlockService>) -> BlockDownloader {
    let store = BlockStore::open_in_memory().unwrap();
    BlockDownloader::new(service.clone(), store)
}

#[tokio::test]
async fn test_downloads_exact_range() {
    let service = MockBlockService::new(1010);
    let downloader = downloader(&service);
    let range = BlockRange::new(1000, 1010).unwrap();

    downloader.set_sync_range(range).unwrap();
    downloader.start_download(4).unwrap();
    downloader
        .wait_until_requested_blocks_are_downloaded(range, &CancelToken::new())
        .await
        .unwrap();

    let store = downloader.store();
    assert_eq!(store.lowest_height().unwrap(), Some(1000));
    assert_eq!(store.latest_height().unwrap(), Some(1010));
    let heights: Vec<u64> = store
        .load_range(range)
        .unwrap()
        .iter()
        .map(|b| b.height)
        .collect();
    assert_eq!(heights, (1000..=1010).collect::<Vec<_>>());
    assert_eq!(downloader.downloaded_height(), Some(1010));
}

#[tokio::test]
async fn test_start_requires_sync_range() {
    let service = MockBlockService::new(1010);
    let downloader = downloader(&service);
    assert!(matches!(
        downloader.start_download(10),
        Err(Error::SyncRangeNotSet)
    ));
    assert!(matches!(
        BlockRange::new(1010, 1000),
        Err(Error::InvalidRange {
            lower: 1010,
            upper: 1000
        })
    ));
}

#[tokio::test]
async fn test_buffer_bounds_outstanding_blocks() {
    let service = MockBlockService::new(1299);
    let downloader = downloader(&service);
    service.observe_store(downloader.store().clone());
    let range = BlockRange::new(1000, 1299).unwrap();

    downloader.set_sync_range(range).unwrap();
    downloader.start_download(10).unwrap();
    downloader
        .wait_until_requested_blocks_are_downloaded(range, &CancelToken::new())
        .await
        .unwrap();

    let max = service.max_outstanding.load(Ordering::SeqCst);
    assert!(max > 0);
    assert!(max <= 10, "{} blocks outstanding", max);
    assert_eq!(service.blocks_served.load(Ordering::SeqCst), 300);
}

#[tokio::test]
async fn test_blocks_past_requested_end_are_not_stored() {
    let service = MockBlockService::new(1020);
    service.over_deliver(500);
    let downloader = downloader(&service);
    let range = BlockRange::new(1000, 1020).unwrap();
    let cancel = CancelToken::new();

    downloader.set_sync_range(range).unwrap();
    downloader.set_download_limit(1010);
    downloader.start_download(4).unwrap();
    downloader
        .wait_until_requested_blocks_are_downloaded(BlockRange::new(1000, 1010).unwrap(), &cancel)
        .await
        .unwrap();

    // the stream for [1000, 1010] keeps going; it is dropped at 1011
    let err = downloader
        .wait_until_requested_blocks_are_downloaded(BlockRange::new(1011, 1020).unwrap(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StreamFailed(_)));
    assert!(!downloader.is_running());
    assert_eq!(downloader.store().latest_height().unwrap(), Some(1010));
    assert_eq!(downloader.downloaded_height(), Some(1010));
    assert!(service.blocks_served.load(Ordering::SeqCst) <= 12);
}

#[tokio::test]
async fn test_download_limit_pauses_stream() {
    let service = MockBlockService::new(1100);
    let downloader = downloader(&service);
    let range = BlockRange::new(1000, 1100).unwrap();
    let cancel = CancelToken::new();

    downloader.set_sync_range(range).unwrap();
    downloader.set_download_limit(1020);
    downloader.start_download(8).unwrap();
    downloader
        .wait_until_requested_blocks_are_downloaded(BlockRange::new(1000, 1020).unwrap(), &cancel)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(downloader.downloaded_height(), Some(1020));
    assert!(downloader.is_running());

    // waiting on a later range raises the limit
    downloader
        .wait_until_requested_blocks_are_downloaded(BlockRange::new(1021, 1040).unwrap(), &cancel)
        .await
        .unwrap();
    assert!(downloader.downloaded_height().unwrap() >= 1040);
    downloader.stop_download().await;
}

#[tokio::test]
async fn test_stream_failure_keeps_written_prefix() {
    let service = MockBlockService::new(1010);
    service.fail_stream_once_at(1005);
    let downloader = downloader(&service);
    let range = BlockRange::new(1000, 1010).unwrap();

    downloader.set_sync_range(range).unwrap();
    downloader.start_download(100).unwrap();
    let err = downloader
        .wait_until_requested_blocks_are_downloaded(range, &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StreamFailed(_)));
    assert!(err.is_retryable());
    assert_eq!(downloader.store().latest_height().unwrap(), Some(1004));

    // restarting resumes after the stored prefix
    downloader.start_download(100).unwrap();
    downloader
        .wait_until_requested_blocks_are_downloaded(range, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(downloader.store().latest_height().unwrap(), Some(1010));
    assert_eq!(service.stream_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancelled_wait_returns_cancel_signal() {
    let service = MockBlockService::new(1010);
    service.set_block_delay(Duration::from_secs(30));
    let downloader = downloader(&service);
    let range = BlockRange::new(1000, 1010).unwrap();
    downloader.set_sync_range(range).unwrap();
    downloader.start_download(10).unwrap();

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        downloader.wait_until_requested_blocks_are_downloaded(range, &cancel),
    )
    .await
    .expect("wait should return once cancelled");
    assert!(matches!(result, Err(Error::Cancelled)));

    downloader.stop_download().await;
    downloader.stop_download().await;
    assert!(!downloader.is_running());
}

#[tokio::test]
async fn test_disconnected_store_is_discarded() {
    let service = MockBlockService::new(2010);
    let downloader = downloader(&service);
    downloader
        .store()
        .write(&(10..=20).map(block).collect::<Vec<_>>())
        .unwrap();

    let range = BlockRange::new(2000, 2010).unwrap();
    downloader.set_sync_range(range).unwrap();
    downloader.start_download(10).unwrap();
    downloader
        .wait_until_requested_blocks_are_downloaded(range, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(downloader.store().lowest_height().unwrap(), Some(2000));
}

/// Download `range` batch by batch, the way the processor drives it
async fn download_in_batches(lower: u64, upper: u64, batch: u64, buffer: usize) -> Vec<u64> {
    let service = MockBlockService::new(upper + 20);
    let downloader = downloader(&service);
    let range = BlockRange::new(lower, upper).unwrap();
    let cancel = CancelToken::new();

    downloader.set_sync_range(range).unwrap();
    downloader.set_download_limit((lower + batch - 1).min(upper));
    downloader.start_download(buffer).unwrap();
    let mut start = lower;
    while start <= upper {
        let end = (start + batch - 1).min(upper);
        downloader
            .wait_until_requested_blocks_are_downloaded(BlockRange::new(start, end).unwrap(), &cancel)
            .await
            .unwrap();
        start = end + 1;
    }
    downloader.stop_download().await;

    downloader
        .store()
        .load_range(BlockRange::new(lower.saturating_sub(10), upper + 20).unwrap())
        .unwrap()
        .iter()
        .map(|b| b.height)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_store_holds_exactly_the_sync_range(
        lower in 1u64..5_000,
        len in 0u64..80,
        batch in 1u64..30,
        buffer in 1usize..16,
    ) {
        let upper = lower + len;
        let heights = Runtime::new()
            .unwrap()
            .block_on(download_in_batches(lower, upper, batch, buffer));
        prop_assert_eq!(heights, (lower..=upper).collect::<Vec<_>>());
    }
}
