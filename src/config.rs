// PERCENTINEL CONFIGURATION
// TWO KNOBS: THE SLIDING WINDOW LENGTH AND HOW MANY RING SLOTS IT IS CUT
// INTO. EVERYTHING ELSE IS DERIVED. VALIDATION HAPPENS ONCE, AT ENGINE
// START -- THE FAST PATH NEVER SEES AN UNCHECKED VALUE.

use anyhow::{bail, Result};

pub const MIN_WINDOW_SECS: u64 = 60;
pub const MAX_WINDOW_SECS: u64 = 3600;
pub const DEF_WINDOW_SECS: u64 = 300;

pub const MIN_SCALE: u64 = 1;
pub const MAX_SCALE: u64 = 50;
pub const DEF_SCALE: u64 = 5;

/// A ring slot shorter than this is pointless churn.
pub const MIN_INTERVAL_SECS: u64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApmConfig {
    /// Sliding window length in seconds.
    pub window_secs: u64,
    /// Number of ring buffer slots the window is divided into.
    pub scale: u64,
}

impl Default for ApmConfig {
    fn default() -> Self {
        Self {
            window_secs: DEF_WINDOW_SECS,
            scale: DEF_SCALE,
        }
    }
}

impl ApmConfig {
    /// Parse `window=N scale=N` entries. Unknown keys are rejected, missing
    /// keys keep their defaults.
    pub fn parse_kv<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut cfg = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            let (key, val) = match entry.split_once('=') {
                Some(kv) => kv,
                None => bail!("apm_stats: arguments must be a key=value pair: '{entry}'"),
            };
            let parsed: u64 = match val.parse() {
                Ok(v) => v,
                Err(_) => bail!("apm_stats: invalid value for '{key}': '{val}'"),
            };
            match key {
                "window" => cfg.window_secs = parsed,
                "scale" => cfg.scale = parsed,
                _ => bail!("apm_stats: unsupported argument: '{key}={val}'"),
            }
        }
        Ok(cfg)
    }

    /// Validate and derive the jiffy-domain parameters.
    pub fn resolve(&self, hz: u64) -> Result<ResolvedConfig> {
        if self.window_secs < MIN_WINDOW_SECS || self.window_secs > MAX_WINDOW_SECS {
            bail!(
                "apm_stats: window: value '{}' is out of limits [{MIN_WINDOW_SECS}, {MAX_WINDOW_SECS}]",
                self.window_secs
            );
        }
        if self.scale < MIN_SCALE || self.scale > MAX_SCALE {
            bail!(
                "apm_stats: scale: value '{}' is out of limits [{MIN_SCALE}, {MAX_SCALE}]",
                self.scale
            );
        }

        // A SINGLE SLOT CANNOT SLIDE; PROMOTE TO TWO
        let scale = self.scale.max(2);

        let jtmwindow = self.window_secs * hz;
        let jtmintrvl = jtmwindow / scale + u64::from(jtmwindow % scale != 0);
        if jtmintrvl < MIN_INTERVAL_SECS * hz {
            bail!(
                "apm_stats: window={} scale={}: scale is too long",
                self.window_secs,
                self.scale
            );
        }

        // THE EFFECTIVE WINDOW IS A WHOLE NUMBER OF INTERVALS
        Ok(ResolvedConfig {
            jtmwindow: jtmintrvl * scale,
            jtmintrvl,
            rbufsz: scale as usize,
            hz,
        })
    }
}

/// Jiffy-domain parameters derived from a validated [`ApmConfig`].
#[derive(Clone, Copy, Debug)]
pub struct ResolvedConfig {
    /// Effective window in jiffies (interval * slots).
    pub jtmwindow: u64,
    /// One ring slot in jiffies.
    pub jtmintrvl: u64,
    /// Ring buffer slot count, after scale promotion.
    pub rbufsz: usize,
    pub hz: u64,
}
