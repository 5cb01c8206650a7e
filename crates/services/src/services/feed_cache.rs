use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use moka::future::Cache;

use api_types::BlogPost;

pub const DEFAULT_FEED_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CachedFeed {
    pub posts: Arc<Vec<BlogPost>>,
    pub cached_at: DateTime<Utc>,
}

/// Single-slot, time-boxed memo of the unfiltered feed.
///
/// Filtered and paginated reads never go through here.
pub struct FeedCache {
    slot: Cache<(), CachedFeed>,
    /// Bumped on every invalidation so fills that raced with a mutation are dropped.
    generation: AtomicU64,
    ttl: Duration,
}

impl std::fmt::Debug for FeedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCache")
            .field("ttl", &self.ttl)
            .field("generation", &self.generation.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for FeedCache {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_TTL)
    }
}

impl FeedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Cache::builder().time_to_live(ttl).build(),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached feed, or `None` when empty or older than the window.
    pub async fn get(&self) -> Option<CachedFeed> {
        self.slot.get(&()).await
    }

    pub async fn set(&self, posts: Vec<BlogPost>) {
        self.slot
            .insert(
                (),
                CachedFeed {
                    posts: Arc::new(posts),
                    cached_at: Utc::now(),
                },
            )
            .await;
    }

    pub async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.slot.invalidate(&()).await;
    }

    /// Token to pass to [`fill`](Self::fill) after a remote read completes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Stores `posts` unless the cache was invalidated since `generation` was taken.
    pub async fn fill(&self, generation: u64, posts: Vec<BlogPost>) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.set(posts).await;
        true
    }
}
