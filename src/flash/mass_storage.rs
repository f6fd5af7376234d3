//! Mass-storage flashing: copy the image onto the bootloader's USB volume.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{FlashMethod, FlashStrategy};

/// Copies the image to the single mounted bootloader volume.
#[derive(Debug, Clone)]
pub struct MassStorageStrategy {
    mount_roots: Vec<PathBuf>,
    labels: Vec<String>,
    timeout: Duration,
}

impl MassStorageStrategy {
    pub fn new(mount_roots: Vec<PathBuf>, labels: Vec<String>, timeout: Duration) -> Self {
        Self {
            mount_roots,
            labels,
            timeout,
        }
    }

    /// Volume labels compare case-insensitively; some hosts mount them lowercased.
    fn matches_label(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| self.labels.iter().any(|l| l.eq_ignore_ascii_case(name)))
    }

    /// Mounted bootloader volumes under the configured roots, checked one level
    /// deep as well (`/media/<user>/RPI-RP2`).
    pub async fn find_volumes(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for root in &self.mount_roots {
            for path in subdirs(root).await {
                if self.matches_label(&path) {
                    found.push(path);
                    continue;
                }
                for child in subdirs(&path).await {
                    if self.matches_label(&child) {
                        found.push(child);
                    }
                }
            }
        }
        found.sort();
        found.dedup();
        found
    }
}

/// Directories directly under `dir`; unreadable entries are skipped.
async fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = tokio::fs::metadata(entry.path()).await.is_ok_and(|m| m.is_dir());
        if is_dir {
            out.push(entry.path());
        }
    }
    out
}

#[async_trait]
impl FlashStrategy for MassStorageStrategy {
    fn method(&self) -> FlashMethod {
        FlashMethod::MassStorage
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn flash(&self, image: &Path) -> Result<String, String> {
        let volumes = self.find_volumes().await;
        let volume = match volumes.as_slice() {
            [one] => one,
            [] => return Err(format!("no bootloader volume mounted (labels: {})", self.labels.join(", "))),
            many => {
                let names: Vec<String> = many.iter().map(|p| p.display().to_string()).collect();
                return Err(format!("ambiguous bootloader volumes: {}", names.join(", ")));
            }
        };

        let file_name = image
            .file_name()
            .ok_or_else(|| format!("image path has no file name: {}", image.display()))?;
        let dest = volume.join(file_name);
        let bytes = tokio::fs::copy(image, &dest)
            .await
            .map_err(|e| format!("copy to {} failed: {}", dest.display(), e))?;
        Ok(format!("copied {} bytes to {}", bytes, dest.display()))
    }
}
