//! Obfuscation settings
//!
//! The field names follow the persisted front-end settings object, so a saved
//! settings file deserializes directly. Missing keys take the defaults below;
//! unknown keys are ignored.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ObfuscateError, ObfuscateResult};

/// Lowest effective dead code density once the pass is enabled
pub const MIN_DEAD_CODE_PERCENT: u8 = 95;
pub const MAX_DEAD_CODE_PERCENT: u8 = 100;

/// Configuration for one obfuscation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Interface language of the front end; the engine ignores it
    pub language: String,
    /// Density of injected dead code; 0 disables the pass
    pub dead_code_percent: u8,
    /// Share of eligible regions lowered to bytecode
    pub virtualization_intensity: u8,
    #[serde(rename = "useAI")]
    pub use_ai: bool,
    /// Seeds every random choice of the run
    pub seed: String,
    pub watermark: String,

    pub anti_tracing: bool,
    pub anti_tamper: bool,
    pub env_lock: bool,
    pub dynamic_keys: bool,
    pub heavy_math: bool,
    #[serde(rename = "nonLinearPC")]
    pub non_linear_pc: bool,
    pub decoy_traps: bool,
    pub state_anchors: bool,
    pub ghost_cycles: bool,
    pub stack_machine: bool,
    pub opcode_shuffle: bool,
    pub instruction_encryption: bool,
    pub control_flow_chaos: bool,
    pub vm_mutation: bool,
    pub proxy_native: bool,
    pub stack_shuffling: bool,
    pub decoy_constants: bool,
    pub optimize_globals: bool,
    #[serde(rename = "nestedVM")]
    pub nested_vm: bool,
    pub honey_pots: bool,
    pub arithmetic_obf: bool,
    pub jump_logic: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            dead_code_percent: 99,
            virtualization_intensity: 100,
            use_ai: false,
            seed: "ARCANUM".to_string(),
            watermark: "Arcanum_v5.0.0".to_string(),
            anti_tracing: true,
            anti_tamper: true,
            env_lock: true,
            dynamic_keys: true,
            heavy_math: true,
            non_linear_pc: true,
            decoy_traps: true,
            state_anchors: true,
            ghost_cycles: true,
            stack_machine: true,
            opcode_shuffle: true,
            instruction_encryption: true,
            control_flow_chaos: true,
            vm_mutation: true,
            proxy_native: true,
            stack_shuffling: true,
            decoy_constants: true,
            optimize_globals: true,
            nested_vm: true,
            honey_pots: true,
            arithmetic_obf: true,
            jump_logic: true,
        }
    }
}

impl Settings {
    /// Every toggle off and both intensities at zero
    pub fn all_disabled() -> Self {
        Self {
            dead_code_percent: 0,
            virtualization_intensity: 0,
            anti_tracing: false,
            anti_tamper: false,
            env_lock: false,
            dynamic_keys: false,
            heavy_math: false,
            non_linear_pc: false,
            decoy_traps: false,
            state_anchors: false,
            ghost_cycles: false,
            stack_machine: false,
            opcode_shuffle: false,
            instruction_encryption: false,
            control_flow_chaos: false,
            vm_mutation: false,
            proxy_native: false,
            stack_shuffling: false,
            decoy_constants: false,
            optimize_globals: false,
            nested_vm: false,
            honey_pots: false,
            arithmetic_obf: false,
            jump_logic: false,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = seed.into();
        self
    }

    pub fn with_watermark(mut self, watermark: impl Into<String>) -> Self {
        self.watermark = watermark.into();
        self
    }

    /// Load settings from a `.json` or `.toml` file
    pub fn from_file(path: &Path) -> ObfuscateResult<Self> {
        let content = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let settings: Settings = match extension.as_str() {
            "json" => serde_json::from_str(&content).map_err(|e| {
                ObfuscateError::Config(format!("{}: {}", path.display(), e))
            })?,
            "toml" => toml::from_str(&content).map_err(|e| {
                ObfuscateError::Config(format!("{}: {}", path.display(), e))
            })?,
            other => {
                return Err(ObfuscateError::Config(format!(
                    "unsupported settings format '{}' for {}",
                    other,
                    path.display()
                )))
            }
        };
        Ok(settings.normalized())
    }

    /// Render as pretty TOML (used by `arcanum init`)
    pub fn to_toml(&self) -> ObfuscateResult<String> {
        toml::to_string_pretty(self).map_err(|e| ObfuscateError::Config(e.to_string()))
    }

    /// Clamp the continuous controls into their supported ranges
    pub fn normalized(mut self) -> Self {
        self.dead_code_percent = match self.dead_code_percent {
            0 => 0,
            p if p < MIN_DEAD_CODE_PERCENT => MIN_DEAD_CODE_PERCENT,
            p => p.min(MAX_DEAD_CODE_PERCENT),
        };
        self.virtualization_intensity = self.virtualization_intensity.min(100);
        self
    }

    pub fn dead_code_enabled(&self) -> bool {
        self.dead_code_percent > 0
    }

    /// Virtualization runs only with the stack machine on and a nonzero intensity
    pub fn virtualization_enabled(&self) -> bool {
        self.stack_machine && self.virtualization_intensity > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_front_end() {
        let settings = Settings::default();
        assert_eq!(settings.dead_code_percent, 99);
        assert_eq!(settings.virtualization_intensity, 100);
        assert_eq!(settings.watermark, "Arcanum_v5.0.0");
        assert!(settings.jump_logic && settings.nested_vm);
        assert!(!settings.use_ai);
    }

    #[test]
    fn test_front_end_json_deserializes() {
        let json = r#"{
            "language": "ru",
            "deadCodePercent": 97,
            "virtualizationIntensity": 40,
            "useAI": true,
            "seed": "K9X2",
            "nonLinearPC": false,
            "nestedVM": false,
            "someFutureFlag": 1
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.dead_code_percent, 97);
        assert_eq!(settings.virtualization_intensity, 40);
        assert!(settings.use_ai);
        assert!(!settings.non_linear_pc);
        assert!(!settings.nested_vm);
        // untouched keys keep their defaults
        assert!(settings.anti_tamper);
    }

    #[test]
    fn test_normalization() {
        let mut settings = Settings::default();
        settings.dead_code_percent = 10;
        settings.virtualization_intensity = 250;
        let settings = settings.normalized();
        assert_eq!(settings.dead_code_percent, 95);
        assert_eq!(settings.virtualization_intensity, 100);

        let off = Settings::all_disabled().normalized();
        assert_eq!(off.dead_code_percent, 0);
        assert!(!off.dead_code_enabled());
        assert!(!off.virtualization_enabled());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "seed = \"FILESEED\"\nantiTamper = false").unwrap();
        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.seed, "FILESEED");
        assert!(!settings.anti_tamper);
    }

    #[test]
    fn test_toml_round_trip() {
        let settings = Settings::default().with_seed("ROUND");
        let text = settings.to_toml().unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            Settings::from_file(file.path()),
            Err(ObfuscateError::Config(_))
        ));
    }
}
