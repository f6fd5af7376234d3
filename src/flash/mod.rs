//! Device programmer - ordered flashing strategies with per-strategy deadlines
//!
//! A strategy that fails or times out is recorded and the next one is tried.
//! Nothing is retried in place; when every strategy fails the error lists
//! each one with its reason.

mod mass_storage;
mod openocd;
mod picotool;
pub mod placeholder;
pub mod tool;

pub use mass_storage::MassStorageStrategy;
pub use openocd::OpenOcdStrategy;
pub use picotool::PicotoolStrategy;
pub use placeholder::{PLACEHOLDER_MARKER, is_placeholder, looks_like_placeholder};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FlashConfig;
use crate::error::HilError;

/// Flashing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashMethod {
    /// Standard order, no preference
    Auto,
    /// Copy onto the bootloader's USB volume
    #[serde(alias = "uf2")]
    MassStorage,
    /// Device-specific command-line flasher
    Picotool,
    /// Debug probe
    #[serde(alias = "openocd")]
    OpenOcd,
    /// Mock mode; nothing is written anywhere
    Simulated,
}

impl FlashMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashMethod::Auto => "auto",
            FlashMethod::MassStorage => "mass_storage",
            FlashMethod::Picotool => "picotool",
            FlashMethod::OpenOcd => "open_ocd",
            FlashMethod::Simulated => "simulated",
        }
    }
}

impl fmt::Display for FlashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FlashMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(FlashMethod::Auto),
            "mass_storage" | "uf2" => Ok(FlashMethod::MassStorage),
            "picotool" => Ok(FlashMethod::Picotool),
            "open_ocd" | "openocd" => Ok(FlashMethod::OpenOcd),
            "simulated" => Ok(FlashMethod::Simulated),
            other => Err(format!("unknown flash method '{}'", other)),
        }
    }
}

/// One way of getting an image onto the target.
#[async_trait]
pub trait FlashStrategy: Send + Sync {
    fn method(&self) -> FlashMethod;

    /// Deadline for a single invocation.
    fn timeout(&self) -> Duration;

    /// Flash `image`. `Ok` carries a short success detail, `Err` the failure reason.
    async fn flash(&self, image: &Path) -> Result<String, String>;
}

/// Mock-mode strategy: always succeeds without touching hardware.
#[derive(Debug, Clone, Default)]
pub struct SimulatedStrategy;

#[async_trait]
impl FlashStrategy for SimulatedStrategy {
    fn method(&self) -> FlashMethod {
        FlashMethod::Simulated
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn flash(&self, image: &Path) -> Result<String, String> {
        Ok(format!("simulated flash of {}", image.display()))
    }
}

/// A strategy that was tried and did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyFailure {
    pub method: FlashMethod,
    pub reason: String,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.method, self.reason)
    }
}

fn list_failures(failures: &[StrategyFailure]) -> String {
    failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("refusing to flash placeholder image {0}")]
    Placeholder(PathBuf),

    #[error("firmware image not found: {0}")]
    MissingImage(PathBuf),

    #[error("no flash strategy available")]
    NoStrategies,

    #[error("all flash strategies failed: {}", list_failures(.0))]
    Exhausted(Vec<StrategyFailure>),
}

impl From<FlashError> for HilError {
    fn from(err: FlashError) -> Self {
        match err {
            FlashError::Placeholder(_) | FlashError::MissingImage(_) | FlashError::NoStrategies => {
                HilError::Configuration(err.to_string())
            }
            FlashError::Exhausted(_) => HilError::fatal_device(err.to_string()),
        }
    }
}

/// Successful flash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashReport {
    pub method: FlashMethod,
    /// Failed strategies in order, then the winning strategy's detail
    pub diagnostics: Vec<String>,
    pub elapsed_ms: u64,
}

/// Whether the programmer drives real hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgrammerMode {
    Live,
    Simulated,
}

/// Selects and runs flashing strategies in priority order.
pub struct DeviceProgrammer {
    mode: ProgrammerMode,
    strategies: Vec<Box<dyn FlashStrategy>>,
}

impl DeviceProgrammer {
    /// Live programmer over an explicit strategy list, in standard order.
    pub fn live(strategies: Vec<Box<dyn FlashStrategy>>) -> Self {
        Self {
            mode: ProgrammerMode::Live,
            strategies,
        }
    }

    /// Mock-mode programmer.
    pub fn simulated() -> Self {
        Self {
            mode: ProgrammerMode::Simulated,
            strategies: vec![Box::new(SimulatedStrategy)],
        }
    }

    /// Live programmer with mass storage, picotool and OpenOCD, in that order.
    pub fn from_config(config: &FlashConfig) -> Self {
        let timeout = Duration::from_millis(config.strategy_timeout_ms);
        Self::live(vec![
            Box::new(MassStorageStrategy::new(
                config.mount_roots.clone(),
                config.volume_labels.clone(),
                timeout,
            )),
            Box::new(PicotoolStrategy::new(config.picotool_bin.clone(), timeout)),
            Box::new(OpenOcdStrategy::new(
                config.openocd_bin.clone(),
                config.openocd_cfg.clone(),
                timeout,
            )),
        ])
    }

    /// Methods in the order they would be tried.
    pub fn order(&self, preferred: FlashMethod, excluded: &[FlashMethod]) -> Vec<FlashMethod> {
        self.ordered(preferred, excluded).iter().map(|s| s.method()).collect()
    }

    fn ordered(&self, preferred: FlashMethod, excluded: &[FlashMethod]) -> Vec<&dyn FlashStrategy> {
        let mut order: Vec<&dyn FlashStrategy> = self
            .strategies
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| !excluded.contains(&s.method()))
            .collect();
        if let Some(pos) = order.iter().position(|s| s.method() == preferred) {
            let first = order.remove(pos);
            order.insert(0, first);
        }
        order
    }

    /// Flash `image`, first strategy that succeeds wins.
    pub async fn flash(
        &self,
        image: &Path,
        preferred: FlashMethod,
        excluded: &[FlashMethod],
    ) -> Result<FlashReport, FlashError> {
        if self.mode == ProgrammerMode::Live {
            match is_placeholder(image).await {
                Ok(true) => {
                    warn!(image = %image.display(), "Placeholder image refused");
                    return Err(FlashError::Placeholder(image.to_path_buf()));
                }
                Ok(false) => {}
                Err(_) => return Err(FlashError::MissingImage(image.to_path_buf())),
            }
        }

        let order = self.ordered(preferred, excluded);
        if order.is_empty() {
            return Err(FlashError::NoStrategies);
        }

        let started = Instant::now();
        let mut failures = Vec::new();
        for strategy in order {
            let method = strategy.method();
            debug!(method = %method, "Trying flash strategy");
            let outcome = match tokio::time::timeout(strategy.timeout(), strategy.flash(image)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(format!("timed out after {}ms", strategy.timeout().as_millis())),
            };
            match outcome {
                Ok(detail) => {
                    info!(method = %method, "Flash succeeded");
                    let mut diagnostics: Vec<String> = failures.iter().map(|f: &StrategyFailure| f.to_string()).collect();
                    diagnostics.push(format!("{}: {}", method, detail));
                    return Ok(FlashReport {
                        method,
                        diagnostics,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(reason) => {
                    warn!(method = %method, reason = %reason, "Flash strategy failed");
                    failures.push(StrategyFailure { method, reason });
                }
            }
        }
        Err(FlashError::Exhausted(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Scripted {
        method: FlashMethod,
        result: Result<String, String>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn boxed(method: FlashMethod, result: Result<&str, &str>, calls: &Arc<AtomicUsize>) -> Box<dyn FlashStrategy> {
            Box::new(Self {
                method,
                result: result.map(String::from).map_err(String::from),
                delay: Duration::ZERO,
                calls: calls.clone(),
            })
        }
    }

    #[async_trait]
    impl FlashStrategy for Scripted {
        fn method(&self) -> FlashMethod {
            self.method
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn flash(&self, _image: &Path) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn real_image(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("fw.uf2");
        std::fs::write(&path, [0x55u8, 0x46, 0x32, 0x0a]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_fallback_to_third_strategy() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let programmer = DeviceProgrammer::live(vec![
            Scripted::boxed(FlashMethod::MassStorage, Err("no volume"), &calls),
            Scripted::boxed(FlashMethod::Picotool, Err("usb claim failed"), &calls),
            Scripted::boxed(FlashMethod::OpenOcd, Ok("verified"), &calls),
        ]);

        let report = programmer
            .flash(&real_image(&dir), FlashMethod::Auto, &[])
            .await
            .unwrap();
        assert_eq!(report.method, FlashMethod::OpenOcd);
        assert_eq!(report.diagnostics.len(), 3);
        assert!(report.diagnostics[0].contains("no volume"));
        assert!(report.diagnostics[1].contains("usb claim failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_all_fail_lists_every_strategy() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let programmer = DeviceProgrammer::live(vec![
            Scripted::boxed(FlashMethod::MassStorage, Err("no volume"), &calls),
            Scripted::boxed(FlashMethod::Picotool, Err("not found"), &calls),
        ]);

        let err = programmer
            .flash(&real_image(&dir), FlashMethod::Auto, &[])
            .await
            .unwrap_err();
        match &err {
            FlashError::Exhausted(failures) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[1].method, FlashMethod::Picotool);
            }
            other => panic!("unexpected error: {other}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("mass_storage: no volume"));
        assert!(msg.contains("picotool: not found"));
        assert!(HilError::from(err).is_fatal());
    }

    #[tokio::test]
    async fn test_strategy_timeout_falls_through() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = Box::new(Scripted {
            method: FlashMethod::MassStorage,
            result: Ok("late".into()),
            delay: Duration::from_secs(5),
            calls: calls.clone(),
        });
        let programmer = DeviceProgrammer::live(vec![slow, Scripted::boxed(FlashMethod::Picotool, Ok("ok"), &calls)]);

        let report = programmer
            .flash(&real_image(&dir), FlashMethod::Auto, &[])
            .await
            .unwrap();
        assert_eq!(report.method, FlashMethod::Picotool);
        assert!(report.diagnostics[0].contains("timed out after 50ms"));
    }

    #[tokio::test]
    async fn test_placeholder_never_flashed() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("fw.uf2");
        std::fs::write(&image, "UF2_PLACEHOLDER\n").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let programmer = DeviceProgrammer::live(vec![Scripted::boxed(FlashMethod::MassStorage, Ok("ok"), &calls)]);

        let err = programmer.flash(&image, FlashMethod::Auto, &[]).await.unwrap_err();
        assert!(matches!(err, FlashError::Placeholder(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(HilError::from(err), HilError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_image_is_configuration_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let programmer = DeviceProgrammer::live(vec![Scripted::boxed(FlashMethod::MassStorage, Ok("ok"), &calls)]);
        let err = programmer
            .flash(Path::new("/nonexistent/fw.uf2"), FlashMethod::Auto, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::MissingImage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_simulated_accepts_placeholder() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("fw.uf2");
        std::fs::write(&image, "UF2_PLACEHOLDER\n").unwrap();
        let report = DeviceProgrammer::simulated()
            .flash(&image, FlashMethod::Auto, &[])
            .await
            .unwrap();
        assert_eq!(report.method, FlashMethod::Simulated);
    }

    #[test]
    fn test_preferred_moves_first_and_exclusion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let programmer = DeviceProgrammer::live(vec![
            Scripted::boxed(FlashMethod::MassStorage, Ok("a"), &calls),
            Scripted::boxed(FlashMethod::Picotool, Ok("b"), &calls),
            Scripted::boxed(FlashMethod::OpenOcd, Ok("c"), &calls),
        ]);
        assert_eq!(
            programmer.order(FlashMethod::OpenOcd, &[]),
            vec![FlashMethod::OpenOcd, FlashMethod::MassStorage, FlashMethod::Picotool]
        );
        assert_eq!(
            programmer.order(FlashMethod::Auto, &[FlashMethod::MassStorage]),
            vec![FlashMethod::Picotool, FlashMethod::OpenOcd]
        );
    }

    #[test]
    fn test_flash_method_parse() {
        assert_eq!("uf2".parse::<FlashMethod>().unwrap(), FlashMethod::MassStorage);
        assert_eq!("OpenOCD".parse::<FlashMethod>().unwrap(), FlashMethod::OpenOcd);
        assert!("jtag".parse::<FlashMethod>().is_err());
        assert_eq!(serde_json::to_string(&FlashMethod::MassStorage).unwrap(), "\"mass_storage\"");
    }
}
