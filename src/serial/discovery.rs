//! Serial endpoint discovery.
//!
//! Order of preference:
//! 1. an explicitly configured port
//! 2. the first entry (lexicographic) of the stable by-id directory
//! 3. glob-matched device nodes, newest modification time first; equal
//!    times are broken by ascending path so the choice is deterministic

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SerialConfig;
use crate::error::{HilError, Result};

#[derive(Debug, Clone)]
pub struct PortDiscovery {
    explicit: Option<PathBuf>,
    prefer_by_id: bool,
    by_id_dir: PathBuf,
    patterns: Vec<String>,
}

impl PortDiscovery {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            explicit: None,
            prefer_by_id: false,
            by_id_dir: PathBuf::from("/dev/serial/by-id"),
            patterns,
        }
    }

    pub fn from_config(config: &SerialConfig) -> Self {
        Self {
            explicit: config.port.clone(),
            prefer_by_id: config.prefer_by_id,
            by_id_dir: config.by_id_dir.clone(),
            patterns: config.patterns.clone(),
        }
    }

    pub fn with_explicit(mut self, port: impl Into<PathBuf>) -> Self {
        self.explicit = Some(port.into());
        self
    }

    pub fn with_by_id_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.by_id_dir = dir.into();
        self.prefer_by_id = true;
        self
    }

    /// Pick the current endpoint, if any exists right now.
    pub fn discover(&self) -> Option<PathBuf> {
        if let Some(port) = &self.explicit {
            return port.exists().then(|| port.clone());
        }
        if self.prefer_by_id {
            if let Some(stable) = first_by_id(&self.by_id_dir) {
                return Some(stable);
            }
        }
        self.pattern_candidates().into_iter().next()
    }

    /// Glob matches in preference order.
    pub fn pattern_candidates(&self) -> Vec<PathBuf> {
        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        for pattern in &self.patterns {
            let Ok(paths) = glob::glob(pattern) else {
                debug!(pattern = %pattern, "Invalid serial glob pattern");
                continue;
            };
            for path in paths.flatten() {
                let mtime = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((mtime, path));
            }
        }
        rank_newest_first(found)
    }

    /// Poll until an endpoint exists or `budget` runs out.
    pub async fn wait_for_port(&self, budget: Duration, poll: Duration) -> Result<PathBuf> {
        let deadline = Instant::now() + budget;
        loop {
            if let Some(port) = self.discover() {
                info!(port = %port.display(), "Serial endpoint found");
                return Ok(port);
            }
            if Instant::now() >= deadline {
                return Err(HilError::transient_device(format!(
                    "serial endpoint did not appear within {}ms",
                    budget.as_millis()
                )));
            }
            tokio::time::sleep_until((Instant::now() + poll).min(deadline)).await;
        }
    }
}

fn first_by_id(dir: &Path) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir).ok()?.flatten().map(|e| e.path()).collect();
    entries.sort();
    entries.into_iter().next()
}

/// Newest first; ties by ascending path.
pub fn rank_newest_first(mut found: Vec<(SystemTime, PathBuf)>) -> Vec<PathBuf> {
    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let mut ranked: Vec<PathBuf> = found.into_iter().map(|(_, p)| p).collect();
    let mut seen = std::collections::HashSet::new();
    ranked.retain(|p| seen.insert(p.clone()));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_rank_newest_first_with_path_tiebreak() {
        let ranked = rank_newest_first(vec![
            (at(10), PathBuf::from("/dev/ttyACM0")),
            (at(30), PathBuf::from("/dev/ttyACM2")),
            (at(30), PathBuf::from("/dev/ttyACM1")),
            (at(20), PathBuf::from("/dev/ttyUSB0")),
        ]);
        assert_eq!(
            ranked,
            vec![
                PathBuf::from("/dev/ttyACM1"),
                PathBuf::from("/dev/ttyACM2"),
                PathBuf::from("/dev/ttyUSB0"),
                PathBuf::from("/dev/ttyACM0"),
            ]
        );
    }

    #[test]
    fn test_by_id_preferred_over_patterns() {
        let dev = TempDir::new().unwrap();
        let by_id = dev.path().join("by-id");
        std::fs::create_dir(&by_id).unwrap();
        std::fs::write(by_id.join("usb-Raspberry_Pi_Pico_E66-if00"), "").unwrap();
        std::fs::write(by_id.join("usb-Raspberry_Pi_Pico_A11-if00"), "").unwrap();
        std::fs::write(dev.path().join("ttyACM0"), "").unwrap();

        let pattern = format!("{}/ttyACM*", dev.path().display());
        let discovery = PortDiscovery::new(vec![pattern.clone()]).with_by_id_dir(&by_id);
        assert_eq!(discovery.discover(), Some(by_id.join("usb-Raspberry_Pi_Pico_A11-if00")));

        let no_by_id = PortDiscovery::new(vec![pattern]).with_by_id_dir(dev.path().join("missing"));
        assert_eq!(no_by_id.discover(), Some(dev.path().join("ttyACM0")));
    }

    #[test]
    fn test_explicit_port_must_exist() {
        let dev = TempDir::new().unwrap();
        let port = dev.path().join("ttyACM7");
        let discovery = PortDiscovery::new(vec![]).with_explicit(&port);
        assert_eq!(discovery.discover(), None);
        std::fs::write(&port, "").unwrap();
        assert_eq!(discovery.discover(), Some(port));
    }

    #[tokio::test]
    async fn test_wait_for_port_times_out_as_transient() {
        let dev = TempDir::new().unwrap();
        let discovery = PortDiscovery::new(vec![format!("{}/ttyACM*", dev.path().display())]);
        let err = discovery
            .wait_for_port(Duration::from_millis(60), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_wait_for_port_sees_reenumeration() {
        let dev = TempDir::new().unwrap();
        let port = dev.path().join("ttyACM0");
        let discovery = PortDiscovery::new(vec![format!("{}/ttyACM*", dev.path().display())]);

        let creator = {
            let port = port.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::write(&port, "").unwrap();
            })
        };
        let found = discovery
            .wait_for_port(Duration::from_secs(2), Duration::from_millis(10))
            .await
            .unwrap();
        creator.await.unwrap();
        assert_eq!(found, port);
    }
}
