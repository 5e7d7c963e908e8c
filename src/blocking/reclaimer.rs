use std::sync::Arc;
use std::time::Duration;

use bson::Timestamp;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::registry::CursorRegistry;
use crate::pre_image::PreImageStore;
use crate::time_helper;

/// Deletes expired pre-images, never past what an open cursor may still read.
pub struct PreImageReclaimer {
    pre_images: Arc<PreImageStore>,
    registry: Arc<CursorRegistry>,
    expire_after: Duration,
}

impl PreImageReclaimer {
    /// Reclaimer keeping pre-images for `expire_after`.
    pub fn new(
        pre_images: Arc<PreImageStore>,
        registry: Arc<CursorRegistry>,
        expire_after: Duration,
    ) -> Self {
        PreImageReclaimer {
            pre_images,
            registry,
            expire_after,
        }
    }

    /// Pre-images older than the returned timestamp may be deleted at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Timestamp {
        let expired_before = match chrono::Duration::from_std(self.expire_after)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        {
            Some(at) => time_helper::from_datetime(at),
            None => Timestamp {
                time: 0,
                increment: 0,
            },
        };
        match self.registry.pre_image_watermark() {
            Some(watermark)
                if time_helper::cmp(&watermark, &expired_before) == std::cmp::Ordering::Less =>
            {
                debug!(?watermark, ?expired_before, "Reclamation held back by a cursor.");
                watermark
            }
            _ => expired_before,
        }
    }

    /// One reclamation pass as of `now`, returns how many records were deleted.
    pub fn run_at(&self, now: DateTime<Utc>) -> usize {
        let _exclusive = self.registry.reclaim_guard();
        let cutoff = self.cutoff(now);
        let removed = self.pre_images.reclaim(cutoff);
        if removed > 0 {
            info!(?cutoff, removed, "Reclaim pre-images.");
        }
        removed
    }

    /// One reclamation pass.
    pub fn run_once(&self) -> usize {
        self.run_at(Utc::now())
    }
}
