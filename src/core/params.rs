use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;

/// Environment variable prefix for parameter overrides.
pub const ENV_PREFIX: &str = "LLAMA_BRIDGE_";

/// Per-context load and sampling parameters.
///
/// `ContextParams::default()` is the engine's default-parameters constructor.
/// Callers layer environment overrides with [`ContextParams::from_env`] and a
/// JSON options object with [`ContextParams::apply_map`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextParams {
    pub num_ctx: usize,
    /// Tokens to generate; negative means until the context window is full.
    pub num_predict: i32,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: u64,
    pub stop: Vec<String>,
    pub add_bos: bool,
    pub use_gpu: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            num_ctx: 2048,
            num_predict: 128,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: 299_792_458,
            stop: vec![],
            add_bos: true,
            use_gpu: true,
        }
    }
}

impl ContextParams {
    /// Defaults with `LLAMA_BRIDGE_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut params = Self::default();
        params.apply_env(|key| env::var(key).ok());
        params
    }

    /// Apply overrides from a variable lookup. Split out from [`from_env`]
    /// so tests do not have to mutate the process environment.
    ///
    /// [`from_env`]: ContextParams::from_env
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        override_from(&mut self.num_ctx, "NUM_CTX", get("NUM_CTX"));
        override_from(&mut self.num_predict, "NUM_PREDICT", get("NUM_PREDICT"));
        override_from(&mut self.temperature, "TEMPERATURE", get("TEMPERATURE"));
        override_from(&mut self.top_k, "TOP_K", get("TOP_K"));
        override_from(&mut self.top_p, "TOP_P", get("TOP_P"));
        override_from(&mut self.repeat_penalty, "REPEAT_PENALTY", get("REPEAT_PENALTY"));
        override_from(&mut self.repeat_last_n, "REPEAT_LAST_N", get("REPEAT_LAST_N"));
        override_from(&mut self.seed, "SEED", get("SEED"));
        override_from(&mut self.use_gpu, "USE_GPU", get("USE_GPU"));
    }

    /// Apply an options object such as `{"num_predict": 64, "stop": ["\n"]}`.
    /// Unknown keys and mistyped values are ignored, and so are integers
    /// that do not fit the field.
    pub fn apply_map(&mut self, m: &HashMap<String, serde_json::Value>) {
        if let Some(v) = in_range("num_ctx", m.get("num_ctx").and_then(|v| v.as_u64())) {
            self.num_ctx = v;
        }
        if let Some(v) = in_range("num_predict", m.get("num_predict").and_then(|v| v.as_i64())) {
            self.num_predict = v;
        }
        if let Some(v) = m.get("temperature").and_then(|v| v.as_f64()) {
            self.temperature = v;
        }
        if let Some(v) = in_range("top_k", m.get("top_k").and_then(|v| v.as_u64())) {
            self.top_k = v;
        }
        if let Some(v) = m.get("top_p").and_then(|v| v.as_f64()) {
            self.top_p = v;
        }
        if let Some(v) = m.get("repeat_penalty").and_then(|v| v.as_f64()) {
            self.repeat_penalty = v as f32;
        }
        if let Some(v) = in_range("repeat_last_n", m.get("repeat_last_n").and_then(|v| v.as_u64())) {
            self.repeat_last_n = v;
        }
        if let Some(v) = m.get("seed").and_then(|v| v.as_u64()) {
            self.seed = v;
        }
        if let Some(v) = m.get("stop").and_then(|v| v.as_array()) {
            self.stop = v
                .iter()
                .filter_map(|s| s.as_str().map(String::from))
                .collect();
        }
        if let Some(v) = m.get("add_bos").and_then(|v| v.as_bool()) {
            self.add_bos = v;
        }
        if let Some(v) = m.get("use_gpu").and_then(|v| v.as_bool()) {
            self.use_gpu = v;
        }
    }

    /// Parse a JSON options object and apply it on top of `self`.
    pub fn with_json(mut self, json: &str) -> serde_json::Result<Self> {
        let map: HashMap<String, serde_json::Value> = serde_json::from_str(json)?;
        self.apply_map(&map);
        Ok(self)
    }

    /// Set a single option by name, as typed in the interactive CLI.
    pub fn set(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        let json = if name == "stop" {
            serde_json::json!([value])
        } else {
            serde_json::from_str(value)
                .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", name, e))?
        };
        let known = [
            "num_ctx",
            "num_predict",
            "temperature",
            "top_k",
            "top_p",
            "repeat_penalty",
            "repeat_last_n",
            "seed",
            "stop",
            "add_bos",
            "use_gpu",
        ];
        if !known.contains(&name) {
            anyhow::bail!("unknown parameter: {}", name);
        }
        let mut map = HashMap::new();
        map.insert(name.to_string(), json);
        self.apply_map(&map);
        Ok(())
    }

    /// Whether sampling collapses to argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

fn override_from<T: FromStr>(slot: &mut T, name: &str, raw: Option<String>) {
    let Some(raw) = raw else { return };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!("ignoring {}{}={:?}: not a valid value", ENV_PREFIX, name, raw),
    }
}

fn in_range<T, V>(name: &str, value: Option<V>) -> Option<T>
where
    T: TryFrom<V>,
    V: Copy + Display,
{
    let value = value?;
    match T::try_from(value) {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring option {}={}: out of range", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = ContextParams::default();
        assert_eq!(params.num_ctx, 2048);
        assert_eq!(params.num_predict, 128);
        assert!(params.add_bos);
        assert!(!params.is_greedy());
    }

    #[test]
    fn test_env_overrides() {
        let mut params = ContextParams::default();
        params.apply_env(|key| match key {
            "LLAMA_BRIDGE_NUM_PREDICT" => Some("16".into()),
            "LLAMA_BRIDGE_TEMPERATURE" => Some("0".into()),
            "LLAMA_BRIDGE_USE_GPU" => Some("false".into()),
            "LLAMA_BRIDGE_TOP_K" => Some("lots".into()),
            _ => None,
        });

        assert_eq!(params.num_predict, 16);
        assert!(params.is_greedy());
        assert!(!params.use_gpu);
        // Bad values leave the default in place.
        assert_eq!(params.top_k, 40);
    }

    #[test]
    fn test_json_options() {
        let params = ContextParams::default()
            .with_json(r#"{"num_predict": -1, "stop": ["</s>", "\n\n"], "seed": 7, "bogus": 1}"#)
            .unwrap();
        assert_eq!(params.num_predict, -1);
        assert_eq!(params.stop, vec!["</s>".to_string(), "\n\n".to_string()]);
        assert_eq!(params.seed, 7);

        assert!(ContextParams::default().with_json("[1, 2]").is_err());
    }

    #[test]
    fn test_out_of_range_integers_are_ignored() {
        let params = ContextParams::default()
            .with_json(r#"{"num_predict": 4294967295}"#)
            .unwrap();
        assert_eq!(params.num_predict, 128);

        let params = ContextParams::default()
            .with_json(r#"{"num_predict": 4294967424, "top_k": 7}"#)
            .unwrap();
        assert_eq!(params.num_predict, 128);
        assert_eq!(params.top_k, 7);

        let params = ContextParams::default()
            .with_json(r#"{"num_predict": -2147483648, "num_ctx": -1}"#)
            .unwrap();
        assert_eq!(params.num_predict, i32::MIN);
        assert_eq!(params.num_ctx, 2048);

        let mut params = ContextParams::default();
        params.set("num_predict", "2147483648").unwrap();
        assert_eq!(params.num_predict, 128);
    }

    #[test]
    fn test_set_single_option() {
        let mut params = ContextParams::default();
        params.set("temperature", "0.2").unwrap();
        params.set("stop", "User:").unwrap();
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.stop, vec!["User:".to_string()]);

        assert!(params.set("nope", "1").is_err());
        assert!(params.set("top_k", "many").is_err());
    }
}
