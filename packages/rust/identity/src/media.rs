//! Listing photos and street-level imagery for newly matched listings.
//!
//! Images are stored under `<root>/<place_id>/` as downscaled JPEGs
//! (`street_view.jpg`, `photo_<n>.jpg`) and their paths recorded on the
//! [`DirectoryRecord`]. A failed download is logged and skipped.

use std::path::{Path, PathBuf};

use recordflow_crawler::verify::store_jpeg;
use recordflow_shared::{AppConfig, DirectoryRecord, RecordFlowError, Result, ServiceError};
use tracing::{debug, warn};

use crate::client::DirectoryClient;

/// Where and how much listing media to download.
#[derive(Debug, Clone)]
pub struct ListingMedia {
    root: PathBuf,
    max_photos: usize,
    street_view: bool,
    max_width: u32,
}

impl ListingMedia {
    pub fn new(root: impl Into<PathBuf>, max_photos: usize, street_view: bool, max_width: u32) -> Self {
        Self {
            root: root.into(),
            max_photos,
            street_view,
            max_width,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.paths.listing_images,
            config.identity.max_photos,
            config.identity.street_view,
            config.crawl.max_image_width,
        )
    }

    /// Directory holding the images of one listing.
    pub fn listing_dir(&self, place_id: &str) -> PathBuf {
        let safe: String = place_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    /// Download the street view and up to `max_photos` photos of `record`
    /// and record their paths. Earlier images of the listing are replaced.
    pub async fn attach(&self, client: &dyn DirectoryClient, record: &mut DirectoryRecord) {
        let wants_street_view = self.street_view && record.location.is_some();
        let wants_photos = self.max_photos > 0 && !record.photo_references.is_empty();
        if !wants_street_view && !wants_photos {
            return;
        }

        let dir = self.listing_dir(&record.place_id);
        if let Err(e) = reset_dir(&dir).await {
            warn!(place_id = %record.place_id, error = %e, "cannot prepare listing image directory");
            return;
        }

        if let Some(location) = record.location.filter(|_| wants_street_view) {
            let fetched = client.street_view(location).await;
            record.street_view_path = self
                .store(fetched, dir.join("street_view.jpg"), &record.place_id)
                .await;
        }

        let references: Vec<String> = record
            .photo_references
            .iter()
            .take(self.max_photos)
            .cloned()
            .collect();
        for (index, reference) in references.iter().enumerate() {
            let fetched = client.photo(reference, self.max_width).await;
            let path = dir.join(format!("photo_{index}.jpg"));
            if let Some(stored) = self.store(fetched, path, &record.place_id).await {
                record.photos.push(stored);
            }
        }

        debug!(
            place_id = %record.place_id,
            photos = record.photos.len(),
            street_view = record.street_view_path.is_some(),
            "listing media stored"
        );
    }

    async fn store(
        &self,
        fetched: std::result::Result<Option<Vec<u8>>, ServiceError>,
        path: PathBuf,
        place_id: &str,
    ) -> Option<PathBuf> {
        let bytes = match fetched {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(%place_id, path = %path.display(), "no image available");
                return None;
            }
            Err(e) => {
                warn!(%place_id, path = %path.display(), error = %e, "image download failed");
                return None;
            }
        };

        let max_width = self.max_width;
        let target = path.clone();
        let stored = tokio::task::spawn_blocking(move || store_jpeg(&bytes, &target, max_width)).await;
        match stored {
            Ok(Ok(_)) => Some(path),
            Ok(Err(e)) => {
                warn!(%place_id, path = %path.display(), error = %e, "image could not be stored");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
            Err(e) => {
                warn!(%place_id, error = %e, "image task failed");
                None
            }
        }
    }
}

async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(RecordFlowError::io(dir, e)),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RecordFlowError::io(dir, e))
}
