//! Version information for crossbit.

use crate::platform::PlatformInfo;

/// crossbit version from Cargo.toml
pub const CROSSBIT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information printed by `--version` and the interactive console.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub crossbit: &'static str,
    /// Platform the worker was built for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformInfo>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            crossbit: CROSSBIT_VERSION,
            platform: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform(mut self, platform: PlatformInfo) -> Self {
        self.platform = Some(platform);
        self
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "crossbit {}", self.crossbit)?;
        if let Some(platform) = &self.platform {
            write!(f, " on {platform}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux64() -> PlatformInfo {
        PlatformInfo {
            os: "linux".into(),
            arch: "x86_64".into(),
            pointer_width: 64,
            exe_suffix: String::new(),
        }
    }

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.crossbit, CROSSBIT_VERSION);
        assert!(info.platform.is_none());
    }

    #[test]
    fn version_info_displays_platform() {
        let info = VersionInfo {
            crossbit: "0.1.0",
            platform: Some(linux64()),
        };
        assert_eq!(info.to_string(), "crossbit 0.1.0 on linux-x86_64 (64-bit)");
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            crossbit: "0.1.0",
            platform: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "crossbit": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_full() {
        let info = VersionInfo {
            crossbit: "0.1.0",
            platform: None,
        }
        .with_platform(linux64());
        insta::assert_json_snapshot!(info, @r#"
        {
          "crossbit": "0.1.0",
          "platform": {
            "os": "linux",
            "arch": "x86_64",
            "pointer_width": 64,
            "exe_suffix": ""
          }
        }
        "#);
    }
}
