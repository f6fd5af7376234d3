//! Device-specific command-line flasher (`picotool load <image> -f -x`).

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use super::tool::{find_tool, run_tool};
use super::{FlashMethod, FlashStrategy};

#[derive(Debug, Clone)]
pub struct PicotoolStrategy {
    bin: String,
    timeout: Duration,
}

impl PicotoolStrategy {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    pub fn args(image: &Path) -> Vec<String> {
        vec![
            "load".into(),
            image.display().to_string(),
            "-f".into(),
            "-x".into(),
        ]
    }
}

#[async_trait]
impl FlashStrategy for PicotoolStrategy {
    fn method(&self) -> FlashMethod {
        FlashMethod::Picotool
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn flash(&self, image: &Path) -> Result<String, String> {
        let program = find_tool(&self.bin).ok_or_else(|| format!("{} not found on PATH", self.bin))?;
        run_tool(&program, &Self::args(image), self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        assert_eq!(
            PicotoolStrategy::args(Path::new("/tmp/fw.uf2")),
            vec!["load", "/tmp/fw.uf2", "-f", "-x"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_failure() {
        let s = PicotoolStrategy::new("no-such-picotool-here", Duration::from_secs(1));
        let err = s.flash(Path::new("/tmp/fw.uf2")).await.unwrap_err();
        assert!(err.contains("not found on PATH"));
    }
}
