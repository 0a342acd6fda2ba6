//! Configuration system for the veil compositor
//!
//! Loads configuration from TOML file at `~/.config/veil/veil.toml`
//! Auto-generates default config file on first run if missing.
//! Everything is resolved to plain values here; the core never sees
//! the file format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::animation::Curve;
use crate::events::WindowType;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub fading: FadingConfig,
    pub shadow: ShadowConfig,
    pub animation: AnimationConfig,
    pub unredirect: UnredirectConfig,
    pub opacity: OpacityConfig,
    /// Per-window-type overrides, keyed by EWMH type.
    #[serde(default)]
    pub wintypes: HashMap<WindowType, WintypeOptions>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fading: FadingConfig::default(),
            shadow: ShadowConfig::default(),
            animation: AnimationConfig::default(),
            unredirect: UnredirectConfig::default(),
            opacity: OpacityConfig::default(),
            wintypes: default_wintypes(),
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("veil");

        Ok(config_dir.join("veil.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    /// Length of one animation tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.fading.delta_ms.max(1))
    }

    /// Ticks needed to fade between two opacities at the configured step
    /// size. Fading up and down use separate step sizes.
    pub fn fade_ticks(&self, from: f64, to: f64) -> u32 {
        let distance = (to - from).abs();
        if distance < 1e-9 {
            return 0;
        }
        let step = if to > from {
            self.fading.fade_in_step
        } else {
            self.fading.fade_out_step
        };
        if step <= 0.0 {
            return 0;
        }
        (distance / step).ceil() as u32
    }

    /// Ticks for a map/unmap/destroy fade; zero when open/close fading is
    /// switched off.
    pub fn openclose_fade_ticks(&self, from: f64, to: f64, wintype: WindowType) -> u32 {
        if self.fading.no_fading_openclose || !self.fade_enabled(wintype) {
            return 0;
        }
        self.fade_ticks(from, to)
    }

    fn wintype(&self, wintype: WindowType) -> Option<&WintypeOptions> {
        self.wintypes.get(&wintype)
    }

    pub fn fade_enabled(&self, wintype: WindowType) -> bool {
        if !self.fading.enabled {
            return false;
        }
        self.wintype(wintype).and_then(|w| w.fade).unwrap_or(true)
    }

    pub fn shadow_enabled(&self, wintype: WindowType) -> bool {
        if !self.shadow.enabled {
            return false;
        }
        self.wintype(wintype).and_then(|w| w.shadow).unwrap_or(true)
    }

    /// Per-type base opacity, when one is configured.
    pub fn type_opacity(&self, wintype: WindowType) -> Option<f64> {
        self.wintype(wintype).and_then(|w| w.opacity)
    }

    pub fn paint_excluded(&self, wintype: WindowType) -> bool {
        self.wintype(wintype)
            .and_then(|w| w.paint_excluded)
            .unwrap_or(false)
    }

    /// Windows of this type are invisible to the unredirection heuristic.
    pub fn unredir_ignored(&self, wintype: WindowType) -> bool {
        self.wintype(wintype)
            .and_then(|w| w.unredir_ignored)
            .unwrap_or(false)
    }
}

/// Opacity fade configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FadingConfig {
    /// Enable opacity fades
    pub enabled: bool,
    /// Milliseconds per animation tick
    pub delta_ms: u64,
    /// Opacity change per tick when fading in (0.0-1.0)
    pub fade_in_step: f64,
    /// Opacity change per tick when fading out (0.0-1.0)
    pub fade_out_step: f64,
    /// Skip fades on window open/close
    pub no_fading_openclose: bool,
}

impl Default for FadingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delta_ms: 10,
            fade_in_step: 0.028,
            fade_out_step: 0.03,
            no_fading_openclose: false,
        }
    }
}

/// Drop shadow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// Enable drop shadows
    pub enabled: bool,
    /// Shadow opacity (0.0-1.0)
    pub opacity: f64,
    /// Blur radius of the shadow edge in pixels
    pub radius: u32,
    /// Shadow offset from the window, in pixels
    pub offset_x: i32,
    pub offset_y: i32,
    /// Shadow color channels (0.0-1.0)
    pub red: f64,
    pub green: f64,
    pub blue: f64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            opacity: 0.75,
            radius: 12,
            offset_x: -15,
            offset_y: -15,
            red: 0.0,
            green: 0.0,
            blue: 0.0,
        }
    }
}

/// Window move animation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationConfig {
    /// Animate window position changes
    pub enabled: bool,
    /// Animation length in ticks
    pub duration_ticks: u32,
    /// Interpolation curve
    pub curve: Curve,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_ticks: 16,
            curve: Curve::EaseOutCubic,
        }
    }
}

/// Fullscreen unredirection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnredirectConfig {
    /// Unredirect when a fullscreen opaque window covers the screen
    pub enabled: bool,
    /// Debounce delay before unredirecting, in milliseconds
    pub delay_ms: u64,
    /// Override the heuristic: `true` forces compositing on, `false`
    /// forces it off. Absent means decide per frame.
    pub force_redirect: Option<bool>,
}

impl Default for UnredirectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 0,
            force_redirect: None,
        }
    }
}

/// Opacity policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpacityConfig {
    /// Opacity of window frames (title bars, borders)
    pub frame_opacity: f64,
    /// Opacity applied to unfocused windows, when set
    pub inactive_opacity: Option<f64>,
    /// Treat windows sharing a `WM_CLIENT_LEADER` as one group for the
    /// inactive check, so dialogs do not dim their main window
    #[serde(default)]
    pub detect_client_leader: bool,
}

impl Default for OpacityConfig {
    fn default() -> Self {
        Self {
            frame_opacity: 1.0,
            inactive_opacity: None,
            detect_client_leader: false,
        }
    }
}

/// Per-window-type overrides. Unset fields fall back to the globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WintypeOptions {
    pub shadow: Option<bool>,
    pub fade: Option<bool>,
    pub opacity: Option<f64>,
    pub paint_excluded: Option<bool>,
    pub unredir_ignored: Option<bool>,
}

fn default_wintypes() -> HashMap<WindowType, WintypeOptions> {
    let mut map = HashMap::new();
    map.insert(
        WindowType::Desktop,
        WintypeOptions {
            shadow: Some(false),
            ..Default::default()
        },
    );
    map.insert(
        WindowType::Dock,
        WintypeOptions {
            shadow: Some(false),
            ..Default::default()
        },
    );
    map.insert(
        WindowType::Tooltip,
        WintypeOptions {
            shadow: Some(false),
            ..Default::default()
        },
    );
    map.insert(
        WindowType::Dnd,
        WintypeOptions {
            shadow: Some(false),
            fade: Some(false),
            ..Default::default()
        },
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veil.toml");
        Config::save_default(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.fading.delta_ms, 10);
        assert!(loaded.shadow.enabled);
        assert!(!loaded.shadow_enabled(WindowType::Dock));
        assert!(loaded.shadow_enabled(WindowType::Normal));
    }

    #[test]
    fn test_optional_fields_default() {
        let text = r#"
            [fading]
            enabled = true
            delta_ms = 5
            fade_in_step = 0.1
            fade_out_step = 0.1
            no_fading_openclose = false

            [shadow]
            enabled = false
            opacity = 0.5
            radius = 8
            offset_x = -7
            offset_y = -7
            red = 0.0
            green = 0.0
            blue = 0.0

            [animation]
            enabled = true
            duration_ticks = 20
            curve = "ease-out-cubic"

            [unredirect]
            enabled = true
            delay_ms = 50

            [opacity]
            frame_opacity = 0.8
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.fading.delta_ms, 5);
        assert_eq!(config.unredirect.delay_ms, 50);
        assert_eq!(config.unredirect.force_redirect, None);
        assert_eq!(config.opacity.inactive_opacity, None);
        assert!(config.wintypes.is_empty());
    }

    #[test]
    fn test_fade_ticks_from_step_size() {
        let mut config = Config::default();
        config.fading.fade_in_step = 0.1;
        config.fading.fade_out_step = 0.05;
        assert_eq!(config.fade_ticks(0.0, 1.0), 10);
        assert_eq!(config.fade_ticks(1.0, 0.0), 20);
        assert_eq!(config.fade_ticks(0.5, 0.5), 0);
        // Partial fade rounds up to a whole tick.
        assert_eq!(config.fade_ticks(0.0, 0.15), 2);
    }

    #[test]
    fn test_openclose_fading_switch() {
        let mut config = Config::default();
        config.fading.fade_in_step = 0.1;
        assert_eq!(config.openclose_fade_ticks(0.0, 1.0, WindowType::Normal), 10);
        config.fading.no_fading_openclose = true;
        assert_eq!(config.openclose_fade_ticks(0.0, 1.0, WindowType::Normal), 0);
        config.fading.no_fading_openclose = false;
        // Dnd windows have fading disabled by default.
        assert_eq!(config.openclose_fade_ticks(0.0, 1.0, WindowType::Dnd), 0);
    }

    #[test]
    fn test_wintype_overrides() {
        let mut config = Config::default();
        config.wintypes.insert(
            WindowType::Dialog,
            WintypeOptions {
                opacity: Some(0.9),
                unredir_ignored: Some(true),
                ..Default::default()
            },
        );
        assert_eq!(config.type_opacity(WindowType::Dialog), Some(0.9));
        assert_eq!(config.type_opacity(WindowType::Normal), None);
        assert!(config.unredir_ignored(WindowType::Dialog));
        assert!(!config.paint_excluded(WindowType::Dialog));
    }
}
