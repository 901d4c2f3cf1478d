use std::env;
use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::outpaint::normalize_ratio_label;

/// Service, auth and presentation settings, read from a JSON file where every
/// field may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub api_base: String,
    pub completion_path: String,
    pub upload_path: String,
    pub timeout_secs: u64,
    pub auth: AuthConfig,
    /// Extra request headers, sent after the built-in browser headers.
    pub headers: IndexMap<String, String>,
    /// Query parameters appended to every service call.
    pub query: IndexMap<String, String>,
    pub styles: Vec<String>,
    pub ratios: Vec<String>,
    pub default_ratio: String,
    pub prompts: PromptTemplates,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub cookie: String,
    #[serde(rename = "msToken")]
    pub ms_token: String,
    pub a_bogus: String,
    #[serde(rename = "x-flow-trace")]
    pub x_flow_trace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    /// Appended to generation prompts; `{style}` is substituted.
    pub style_suffix: String,
    /// Appended to generation prompts; `{ratio}` is substituted.
    pub ratio_suffix: String,
    /// Message text sent with outpaint requests.
    pub outpaint_text: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            style_suffix: "，图风格为「{style}」".to_string(),
            ratio_suffix: "，比例「{ratio}」".to_string(),
            outpaint_text: "按新尺寸生成图片".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub retention_days: u32,
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            sweep_interval_secs: 3600,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let query = [
            ("aid", "497858"),
            ("device_platform", "web"),
            ("language", "zh"),
            ("pkg_type", "release_version"),
            ("real_aid", "497858"),
            ("region", "CN"),
            ("samantha_web", "1"),
            ("sys_region", "CN"),
            ("use-olympus-account", "1"),
            ("version_code", "20800"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

        Self {
            api_base: "https://www.doubao.com".to_string(),
            completion_path: "/samantha/chat/completion".to_string(),
            upload_path: "/alice/resource/upload".to_string(),
            timeout_secs: 60,
            auth: AuthConfig::default(),
            headers: IndexMap::new(),
            query,
            styles: [
                "realistic",
                "anime",
                "illustration",
                "oil painting",
                "watercolor",
                "ink wash",
                "3d render",
                "pixel art",
                "sketch",
                "cyberpunk",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            ratios: ["1:1", "2:3", "4:3", "9:16", "16:9"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            default_ratio: "4:3".to_string(),
            prompts: PromptTemplates::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads `path` when given, otherwise starts from defaults. Environment
    /// overrides apply either way.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = non_empty_env("ATELIER_API_BASE") {
            self.api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = non_empty_env("ATELIER_COOKIE") {
            self.auth.cookie = value;
        }
        if let Some(value) = non_empty_env("ATELIER_MS_TOKEN") {
            self.auth.ms_token = value;
        }
        if let Some(value) = non_empty_env("ATELIER_A_BOGUS") {
            self.auth.a_bogus = value;
        }
    }

    pub fn supports_style(&self, style: &str) -> bool {
        self.styles.iter().any(|known| known == style.trim())
    }

    pub fn supports_ratio(&self, ratio: &str) -> bool {
        let wanted = normalize_ratio_label(ratio);
        self.ratios
            .iter()
            .any(|known| normalize_ratio_label(known) == wanted)
    }

    /// Prompt text as the service expects it, with style and ratio hints.
    pub fn decorate_prompt(
        &self,
        prompt: &str,
        style: Option<&str>,
        ratio: Option<&str>,
    ) -> String {
        let mut text = prompt.trim().to_string();
        if let Some(style) = style.map(str::trim).filter(|s| !s.is_empty()) {
            text.push_str(&self.prompts.style_suffix.replace("{style}", style));
        }
        if let Some(ratio) = ratio.map(str::trim).filter(|r| !r.is_empty()) {
            text.push_str(&self.prompts.ratio_suffix.replace("{ratio}", ratio));
        }
        text
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.storage.retention_days))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::ServiceConfig;

    #[test]
    fn partial_file_keeps_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "styles": ["realistic", "anime"],
                "auth": {"cookie": "sid=1", "msToken": "tok"},
                "storage": {"retention_days": 3}
            }"#,
        )?;

        let config = ServiceConfig::load(&path)?;
        assert_eq!(config.styles, vec!["realistic", "anime"]);
        assert_eq!(config.auth.ms_token, "tok");
        assert_eq!(config.storage.retention_days, 3);
        assert_eq!(config.storage.sweep_interval_secs, 3600);
        assert_eq!(config.default_ratio, "4:3");
        assert_eq!(config.query.get("aid").map(String::as_str), Some("497858"));
        Ok(())
    }

    #[test]
    fn ratio_support_accepts_full_width_colon() {
        let config = ServiceConfig::default();
        assert!(config.supports_ratio("16：9"));
        assert!(!config.supports_ratio("21:9"));
        assert!(config.supports_style("realistic"));
        assert!(!config.supports_style("vaporwave"));
    }

    #[test]
    fn decorate_prompt_appends_hints() {
        let mut config = ServiceConfig::default();
        config.prompts.style_suffix = ", style {style}".to_string();
        config.prompts.ratio_suffix = ", ratio {ratio}".to_string();
        assert_eq!(
            config.decorate_prompt(" a cat ", Some("realistic"), Some("4:3")),
            "a cat, style realistic, ratio 4:3"
        );
        assert_eq!(config.decorate_prompt("a cat", Some("  "), None), "a cat");
    }
}
