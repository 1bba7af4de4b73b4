//! Capture configuration management

use crate::capture::{MIN_POOL_SIZE, SessionParams};
use anyhow::{Context, Result, anyhow};
use protocol::registers::{USBTV_ISOC_PACKETS_PER_REQUEST, USBTV_ISOC_TRANSFERS, USBTV_VIDEO_EP};
use protocol::{PACKET_SIZE, ScanType, TvInput, TvNorm};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub video: VideoSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "CaptureSettings::default_log_level")]
    pub log_level: String,
    /// usbfs node, e.g. /dev/bus/usb/001/004; located automatically when unset
    #[serde(default)]
    pub device: Option<String>,
    /// File that receives raw YUYV pictures
    #[serde(default)]
    pub output: Option<String>,
    /// Stop after this many frames
    #[serde(default)]
    pub frames: Option<u64>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            device: None,
            output: None,
            frames: None,
        }
    }
}

impl CaptureSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Device path with `~` expanded
    pub fn device_path(&self) -> Option<PathBuf> {
        self.device.as_deref().map(expand_path)
    }

    /// Output path with `~` expanded
    pub fn output_path(&self) -> Option<PathBuf> {
        self.output.as_deref().map(expand_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    #[serde(default)]
    pub norm: TvNorm,
    #[serde(default)]
    pub input: TvInput,
    #[serde(default)]
    pub scan: ScanType,
    #[serde(default = "VideoSettings::default_pool_size")]
    pub pool_size: usize,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            norm: TvNorm::default(),
            input: TvInput::default(),
            scan: ScanType::default(),
            pool_size: Self::default_pool_size(),
        }
    }
}

impl VideoSettings {
    fn default_pool_size() -> usize {
        4
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default)]
    pub interface: u32,
    /// Alternate setting carrying the video endpoint
    #[serde(default = "UsbSettings::default_alt_setting")]
    pub alt_setting: u32,
    #[serde(default = "UsbSettings::default_endpoint")]
    pub endpoint: u8,
    /// Bytes per isochronous packet (high-bandwidth: up to 3 protocol packets)
    #[serde(default = "UsbSettings::default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "UsbSettings::default_iso_transfers")]
    pub iso_transfers: usize,
    #[serde(default = "UsbSettings::default_packets_per_transfer")]
    pub packets_per_transfer: usize,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            interface: 0,
            alt_setting: Self::default_alt_setting(),
            endpoint: Self::default_endpoint(),
            max_packet_size: Self::default_max_packet_size(),
            iso_transfers: Self::default_iso_transfers(),
            packets_per_transfer: Self::default_packets_per_transfer(),
        }
    }
}

impl UsbSettings {
    fn default_alt_setting() -> u32 {
        1
    }

    fn default_endpoint() -> u8 {
        USBTV_VIDEO_EP
    }

    fn default_max_packet_size() -> usize {
        3 * PACKET_SIZE
    }

    fn default_iso_transfers() -> usize {
        USBTV_ISOC_TRANSFERS
    }

    fn default_packets_per_transfer() -> usize {
        USBTV_ISOC_PACKETS_PER_REQUEST
    }
}

impl CaptureConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbtv-capture/capture.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CaptureConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load from a user-supplied path, expanding `~`
    pub fn load_from(path: &str) -> Result<Self> {
        Self::load(Some(expand_path(path)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbtv-capture").join("capture.toml")
        } else {
            PathBuf::from(".config/usbtv-capture/capture.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.capture.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.capture.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.video.pool_size < MIN_POOL_SIZE {
            return Err(anyhow!(
                "Invalid pool size {}, must be at least {}",
                self.video.pool_size,
                MIN_POOL_SIZE
            ));
        }

        if self.usb.endpoint & 0x80 == 0 {
            return Err(anyhow!(
                "Invalid endpoint {:#04x}, video endpoint must be an IN endpoint",
                self.usb.endpoint
            ));
        }

        if self.usb.max_packet_size == 0 || self.usb.max_packet_size % PACKET_SIZE != 0 {
            return Err(anyhow!(
                "Invalid max packet size {}, must be a positive multiple of {}",
                self.usb.max_packet_size,
                PACKET_SIZE
            ));
        }

        if self.usb.iso_transfers == 0 || self.usb.packets_per_transfer == 0 {
            return Err(anyhow!(
                "Isochronous transfer count and packets per transfer must be greater than 0"
            ));
        }

        Ok(())
    }

    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            norm: self.video.norm,
            input: self.video.input,
            scan: self.video.scan,
            frame_pool_size: self.video.pool_size,
            interface: self.usb.interface,
            alt_setting: self.usb.alt_setting,
            endpoint: self.usb.endpoint,
            max_packet_size: self.usb.max_packet_size,
            iso_transfers: self.usb.iso_transfers,
            packets_per_transfer: self.usb.packets_per_transfer,
        }
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
