//! Debug-probe flashing through OpenOCD. Only usable with an interface config.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::tool::{find_tool, run_tool};
use super::{FlashMethod, FlashStrategy};

#[derive(Debug, Clone)]
pub struct OpenOcdStrategy {
    bin: String,
    cfg: Option<PathBuf>,
    timeout: Duration,
}

impl OpenOcdStrategy {
    pub fn new(bin: impl Into<String>, cfg: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            cfg,
            timeout,
        }
    }

    pub fn args(cfg: &Path, image: &Path) -> Vec<String> {
        vec![
            "-f".into(),
            cfg.display().to_string(),
            "-c".into(),
            format!("program {} verify reset exit", image.display()),
        ]
    }
}

#[async_trait]
impl FlashStrategy for OpenOcdStrategy {
    fn method(&self) -> FlashMethod {
        FlashMethod::OpenOcd
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn flash(&self, image: &Path) -> Result<String, String> {
        let cfg = self
            .cfg
            .as_deref()
            .ok_or_else(|| "not configured (flash.openocd_cfg unset)".to_string())?;
        let program = find_tool(&self.bin).ok_or_else(|| format!("{} not found on PATH", self.bin))?;
        run_tool(&program, &Self::args(cfg, image), self.timeout).await
    }
}
