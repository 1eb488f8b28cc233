//! Room-set fetches feeding fleet reconciliation
//!
//! Both fetches run off the engine task and return the complete target set;
//! the engine diffs it against the fleet. `None` means the pass was aborted
//! and the fleet must be left as is until the next cadence.

use super::platform::{owner_id_or_zero, PlatformApi};
use super::store::RoomStore;
use super::types::RoomTarget;
use std::collections::HashSet;
use std::time::Duration;

/// Upper bound on pages walked in one discovery pass
pub const MAX_DISCOVERY_PAGES: u64 = 10_000;

/// Rooms written to the store after `updated_after`
///
/// Owners missing from the store are resolved from the platform unless the
/// room is already connected (`connected` rooms keep the owner they have).
pub async fn fetch_persisted_rooms(
    store: &dyn RoomStore,
    platform: &dyn PlatformApi,
    updated_after: i64,
    connected: &HashSet<u64>,
) -> Option<Vec<RoomTarget>> {
    let records = match store.find(updated_after).await {
        Ok(records) => records,
        Err(e) => {
            log::warn!("⚠️  Persisted room query failed, skipping this pass: {}", e);
            return None;
        }
    };

    let mut rooms = Vec::with_capacity(records.len());
    for record in records {
        let owner_id = if record.owner_id == 0 && !connected.contains(&record.room_id) {
            owner_id_or_zero(platform, record.room_id).await
        } else {
            record.owner_id
        };
        rooms.push(RoomTarget::new(record.room_id, owner_id));
    }
    Some(rooms)
}

/// Every room currently live on the platform
///
/// A failed page is skipped; a failed total count aborts the pass, and so
/// does a count implying more than `MAX_DISCOVERY_PAGES` pages. Pages are
/// fetched one at a time with `page_delay` between them.
pub async fn fetch_live_rooms(
    platform: &dyn PlatformApi,
    page_size: u64,
    page_delay: Duration,
) -> Option<Vec<RoomTarget>> {
    let page_size = page_size.max(1);
    let count = match platform.live_room_count().await {
        Ok(count) => count,
        Err(e) => {
            log::warn!("⚠️  Live room count failed, aborting discovery pass: {}", e);
            return None;
        }
    };

    let pages = count.div_ceil(page_size);
    if pages > MAX_DISCOVERY_PAGES {
        log::warn!(
            "⚠️  Live room count {} needs {} pages (max {}), aborting discovery pass",
            count,
            pages,
            MAX_DISCOVERY_PAGES
        );
        return None;
    }
    // Sized by what pages actually return, never by the reported count
    let mut rooms = Vec::new();
    let mut seen = HashSet::new();
    let mut failed_pages = 0u64;

    for page in 1..=pages {
        if page > 1 && !page_delay.is_zero() {
            tokio::time::sleep(page_delay).await;
        }
        match platform.live_room_page(page, page_size).await {
            Ok(batch) => {
                // Listings shift while paging; keep the first sighting
                rooms.extend(batch.into_iter().filter(|r| seen.insert(r.room_id)));
            }
            Err(e) => {
                failed_pages += 1;
                log::warn!("⚠️  Discovery page {}/{} failed: {}", page, pages, e);
            }
        }
    }

    log::info!(
        "🔍 Discovery pass: {} live rooms reported, {} collected over {} pages ({} failed)",
        count,
        rooms.len(),
        pages,
        failed_pages
    );
    Some(rooms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::platform::tests::MockPlatform;
    use crate::listener::store::tests::MemoryStore;
    use crate::listener::types::RoomRecord;

    #[tokio::test]
    async fn test_fetch_live_rooms_walks_every_page() {
        let platform = MockPlatform::default();
        *platform.live_count.lock().unwrap() = Some(5);
        {
            let mut pages = platform.pages.lock().unwrap();
            pages.insert(1, vec![RoomTarget::new(1, 10), RoomTarget::new(2, 20)]);
            pages.insert(2, vec![RoomTarget::new(3, 30), RoomTarget::new(2, 20)]);
            pages.insert(3, vec![RoomTarget::new(5, 50)]);
        }

        let rooms = fetch_live_rooms(&platform, 2, Duration::ZERO).await.unwrap();

        let ids: Vec<u64> = rooms.iter().map(|r| r.room_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 5]);
        assert_eq!(platform.page_calls.lock().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_page_is_skipped() {
        let platform = MockPlatform::default();
        *platform.live_count.lock().unwrap() = Some(4);
        platform.pages.lock().unwrap().insert(2, vec![RoomTarget::new(9, 0)]);

        let rooms = fetch_live_rooms(&platform, 2, Duration::ZERO).await.unwrap();

        assert_eq!(rooms, vec![RoomTarget::new(9, 0)]);
    }

    #[tokio::test]
    async fn test_failed_count_aborts_pass() {
        let platform = MockPlatform::default();

        assert!(fetch_live_rooms(&platform, 500, Duration::ZERO).await.is_none());
        assert!(platform.page_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_absurd_count_aborts_without_paging() {
        for count in [1u64 << 40, u64::MAX] {
            let platform = MockPlatform::default();
            *platform.live_count.lock().unwrap() = Some(count);

            assert!(fetch_live_rooms(&platform, 500, Duration::ZERO).await.is_none());
            assert!(platform.page_calls.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_count_at_page_cap_is_walked() {
        let platform = MockPlatform::default();
        *platform.live_count.lock().unwrap() = Some(MAX_DISCOVERY_PAGES);
        platform.pages.lock().unwrap().insert(1, vec![RoomTarget::new(4, 40)]);

        let rooms = fetch_live_rooms(&platform, 1, Duration::ZERO).await.unwrap();

        assert_eq!(rooms, vec![RoomTarget::new(4, 40)]);
        assert_eq!(platform.page_calls.lock().unwrap().len() as u64, MAX_DISCOVERY_PAGES);
    }

    #[tokio::test]
    async fn test_store_timeout_skips_persisted_pass() {
        let store = MemoryStore::with_rooms(&[RoomRecord { room_id: 1, owner_id: 11, update_time: 500 }]);
        store.fail_find.store(true, std::sync::atomic::Ordering::SeqCst);
        let platform = MockPlatform::default();

        assert!(fetch_persisted_rooms(&store, &platform, 0, &HashSet::new()).await.is_none());
        assert!(platform.owner_calls.lock().unwrap().is_empty());

        store.fail_find.store(false, std::sync::atomic::Ordering::SeqCst);
        let rooms = fetch_persisted_rooms(&store, &platform, 0, &HashSet::new()).await.unwrap();
        assert_eq!(rooms, vec![RoomTarget::new(1, 11)]);
    }

    #[tokio::test]
    async fn test_fetch_persisted_resolves_unknown_owners() {
        let store = MemoryStore::with_rooms(&[
            RoomRecord { room_id: 1, owner_id: 11, update_time: 500 },
            RoomRecord { room_id: 2, owner_id: 0, update_time: 500 },
            RoomRecord { room_id: 3, owner_id: 0, update_time: 500 },
            RoomRecord { room_id: 4, owner_id: 0, update_time: 10 },
        ]);
        let platform = MockPlatform::default();
        platform.owners.lock().unwrap().insert(2, 22);
        let connected: HashSet<u64> = [3].into_iter().collect();

        let mut rooms = fetch_persisted_rooms(&store, &platform, 100, &connected).await.unwrap();
        rooms.sort_by_key(|r| r.room_id);

        assert_eq!(
            rooms,
            vec![RoomTarget::new(1, 11), RoomTarget::new(2, 22), RoomTarget::new(3, 0)]
        );
        assert_eq!(platform.owner_calls.lock().unwrap().as_slice(), &[2]);
    }
}
