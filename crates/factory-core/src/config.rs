use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use factory_providers::LlmConfig;

use crate::error::Result;
use crate::usage::{ModelPrice, PricingTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    pub timeout_secs: u64,
    /// Prefix for task branches, e.g. `features/<task_id>`
    pub branch_prefix: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            branch_prefix: "features/".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Overlays, history and logs live here
    pub state_dir: Option<PathBuf>,
    pub snapshot_interval_ms: u64,
    /// Agent turns per run before the loop gives up
    pub max_turns: u32,
    pub git: GitSettings,
    /// Absent means runs perform no model interaction
    pub llm: Option<LlmConfig>,
    pub budget_usd: Option<f64>,
    pub prices: Vec<ModelPrice>,
    pub log_retention_days: u64,
    /// How long a finished run stays addressable for review and replay
    pub finished_run_retention_ms: u64,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            snapshot_interval_ms: 1000,
            max_turns: 100,
            git: GitSettings::default(),
            llm: None,
            budget_usd: None,
            prices: Vec::new(),
            log_retention_days: 7,
            finished_run_retention_ms: 600_000,
        }
    }
}

impl FactoryConfig {
    pub fn resolved_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("factory"))
            .unwrap_or_else(|| PathBuf::from(".factory"))
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms.max(10))
    }

    pub fn finished_run_retention(&self) -> Duration {
        Duration::from_millis(self.finished_run_retention_ms)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git.timeout_secs.max(1))
    }

    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::with_overrides(self.prices.clone())
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: JSON file, then environment, then CLI overrides.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: Option<&Path>, cli_overrides: Option<Value>) -> Result<Self> {
        let file = match path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        Ok(Self {
            path: path.map(Path::to_path_buf),
            layers: Arc::new(RwLock::new(ConfigLayers {
                file,
                env: env_layer(),
                cli: cli_overrides.unwrap_or_else(empty_object),
            })),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self) -> FactoryConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_else(|err| {
            tracing::warn!("invalid configuration, using defaults: {}", err);
            FactoryConfig::default()
        })
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "file": layers.file,
            "env": layers.env,
            "cli": layers.cli
        })
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|err| {
        tracing::warn!(path = %path.display(), "ignoring unparseable config file: {}", err);
        empty_object()
    }))
}

fn env_layer() -> Value {
    env_layer_from(|name| std::env::var(name).ok())
}

fn env_layer_from<F>(lookup: F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let mut root = empty_object();

    if let Some(dir) = get("FACTORY_STATE_DIR") {
        deep_merge(&mut root, &json!({ "state_dir": dir }));
    }
    if let Some(ms) = get("FACTORY_SNAPSHOT_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "snapshot_interval_ms": ms }));
    }
    if let Some(turns) = get("FACTORY_MAX_TURNS").and_then(|v| v.parse::<u32>().ok()) {
        deep_merge(&mut root, &json!({ "max_turns": turns }));
    }
    if let Some(budget) = get("FACTORY_BUDGET_USD").and_then(|v| v.parse::<f64>().ok()) {
        deep_merge(&mut root, &json!({ "budget_usd": budget }));
    }

    let mut llm = Map::new();
    for (var, key) in [
        ("FACTORY_LLM_PROVIDER", "provider"),
        ("FACTORY_LLM_MODEL", "model"),
        ("FACTORY_LLM_API_KEY", "api_key"),
        ("FACTORY_LLM_BASE_URL", "base_url"),
    ] {
        if let Some(value) = get(var) {
            llm.insert(key.to_string(), Value::String(value));
        }
    }
    if !llm.contains_key("api_key") {
        if let Some(key) = get("OPENAI_API_KEY") {
            llm.insert("api_key".to_string(), Value::String(key));
        }
    }
    if get("FACTORY_MOCK_LLM").and_then(|v| parse_bool_like(&v)) == Some(true) {
        llm.insert("provider".to_string(), Value::String("mock".to_string()));
    }
    if !llm.is_empty() {
        deep_merge(&mut root, &json!({ "llm": Value::Object(llm) }));
    }
    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Recursive object merge; nulls in `overlay` never erase `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn deep_merge_keeps_lower_layers_for_nulls() {
        let mut base = json!({"git": {"timeout_secs": 30, "branch_prefix": "f/"}, "max_turns": 5});
        deep_merge(&mut base, &json!({"git": {"timeout_secs": 60, "branch_prefix": null}, "budget_usd": null}));
        assert_eq!(base["git"]["timeout_secs"], 60);
        assert_eq!(base["git"]["branch_prefix"], "f/");
        assert!(base.get("budget_usd").is_none());
    }

    #[test]
    fn env_layer_maps_variables() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FACTORY_SNAPSHOT_INTERVAL_MS", "250"),
            ("FACTORY_BUDGET_USD", "0.5"),
            ("FACTORY_MAX_TURNS", "not-a-number"),
            ("FACTORY_LLM_MODEL", "gpt-4o"),
            ("OPENAI_API_KEY", "sk-env"),
        ]);
        let layer = env_layer_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(layer["snapshot_interval_ms"], 250);
        assert_eq!(layer["budget_usd"], 0.5);
        assert!(layer.get("max_turns").is_none());
        assert_eq!(layer["llm"]["model"], "gpt-4o");
        assert_eq!(layer["llm"]["api_key"], "sk-env");
    }

    #[test]
    fn mock_flag_forces_mock_provider() {
        let env: HashMap<&str, &str> = HashMap::from([("FACTORY_MOCK_LLM", "yes")]);
        let layer = env_layer_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(layer["llm"]["provider"], "mock");
    }

    #[tokio::test]
    async fn cli_overrides_file_layer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("factory.json");
        std::fs::write(&path, r#"{"max_turns": 7, "git": {"branch_prefix": "work/"}, "snapshot_interval_ms": 40}"#)
            .expect("write config");
        let store = ConfigStore::new(Some(&path), Some(json!({"max_turns": 3})))
            .await
            .expect("store");
        let cfg = store.get().await;
        assert_eq!(cfg.max_turns, 3);
        assert_eq!(cfg.git.branch_prefix, "work/");
        assert_eq!(cfg.git.timeout_secs, 120);
        assert_eq!(cfg.snapshot_interval(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(Some(&temp.path().join("absent.json")), None)
            .await
            .expect("store");
        let layers = store.get_layers_value().await;
        assert_eq!(layers["file"], json!({}));
        assert_eq!(FactoryConfig::default().max_turns, 100);
    }
}
