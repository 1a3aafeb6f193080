use crate::error::StmbError;
use crate::stmb::lorebook::{ConstVectMode, OrderMode};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API: &str = "openai";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TITLE_FORMAT: &str = "[000] - {{title}}";
pub const DEFAULT_PRESET: &str = "summary";
pub const FULL_MANUAL_API: &str = "full-manual";
pub const OUTLET_POSITION: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedConnection {
    pub api: String,
    pub model: String,
    pub temperature: f64,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

impl Default for FixedConnection {
    fn default() -> Self {
        Self {
            api: DEFAULT_API.to_string(),
            model: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            endpoint: None,
            api_key: None,
        }
    }
}

/// Where a profile gets its model settings from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionSpec {
    Fixed(FixedConnection),
    /// Follow whatever the host currently has active, read at call time.
    #[default]
    MirrorActive,
}

/// The single place a `ConnectionSpec` becomes concrete.
pub fn resolve_connection(spec: &ConnectionSpec, active: &FixedConnection) -> FixedConnection {
    let picked = match spec {
        ConnectionSpec::Fixed(fixed) => fixed.clone(),
        ConnectionSpec::MirrorActive => active.clone(),
    };
    FixedConnection {
        api: if picked.api.trim().is_empty() {
            DEFAULT_API.to_string()
        } else {
            picked.api.trim().to_string()
        },
        model: picked.model.trim().to_string(),
        temperature: clamp_temperature(picked.temperature),
        endpoint: picked
            .endpoint
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty()),
        api_key: picked.api_key.filter(|k| !k.trim().is_empty()),
    }
}

pub fn clamp_temperature(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 2.0)
    } else {
        DEFAULT_TEMPERATURE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionProfile {
    pub name: String,
    pub connection: ConnectionSpec,
    pub prompt: Option<String>,
    pub preset: Option<String>,
    pub title_format: Option<String>,
    pub const_vect_mode: ConstVectMode,
    pub position: i64,
    pub order_mode: OrderMode,
    pub order_value: i64,
    pub reverse_start: i64,
    pub prevent_recursion: bool,
    pub delay_until_recursion: bool,
    pub outlet_name: Option<String>,
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self {
            name: "Current Host Settings".to_string(),
            connection: ConnectionSpec::MirrorActive,
            prompt: None,
            preset: Some(DEFAULT_PRESET.to_string()),
            title_format: None,
            const_vect_mode: ConstVectMode::Link,
            position: 0,
            order_mode: OrderMode::Auto,
            order_value: 100,
            reverse_start: 9999,
            prevent_recursion: true,
            delay_until_recursion: true,
            outlet_name: None,
        }
    }
}

impl ConnectionProfile {
    /// Apply the normalization rules every stored profile goes through.
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            self.name = "New Profile".to_string();
        }
        if let ConnectionSpec::Fixed(fixed) = &mut self.connection {
            fixed.temperature = clamp_temperature(fixed.temperature);
            if fixed.api.trim().is_empty() {
                fixed.api = DEFAULT_API.to_string();
            }
        }
        let prompt = self.prompt.take().filter(|p| !p.trim().is_empty());
        let preset = self.preset.take().filter(|p| !p.trim().is_empty());
        match (prompt, preset) {
            (Some(prompt), _) => self.prompt = Some(prompt),
            (None, Some(preset)) => self.preset = Some(preset),
            (None, None) => self.preset = Some(DEFAULT_PRESET.to_string()),
        }
        self.reverse_start = self.reverse_start.clamp(100, 9999);
        self.order_value = self.order_value.clamp(0, 9999);
        if self.position != OUTLET_POSITION {
            self.outlet_name = None;
        }
        self
    }

    pub fn title_format(&self, fallback: &str) -> String {
        self.title_format
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }

    /// Prompt text this profile sends ahead of the scene.
    pub fn effective_prompt(&self) -> String {
        if let Some(prompt) = self.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            return prompt.to_string();
        }
        match self.preset.as_deref() {
            Some(key) => preset_prompt(key).unwrap_or_else(|| {
                tracing::warn!(preset = key, "unknown preset; using the default prompt");
                default_prompt()
            }),
            None => default_prompt(),
        }
    }
}

/// Reject profiles that cannot produce a request.
pub fn validate_profile(profile: &ConnectionProfile, resolved: &FixedConnection) -> Result<(), StmbError> {
    let has_prompt = profile
        .prompt
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());
    let has_preset = profile
        .preset
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());
    if !has_prompt && !has_preset {
        return Err(StmbError::InvalidProfile(format!(
            "profile `{}` has neither a prompt nor a preset",
            profile.name
        )));
    }
    if resolved.model.is_empty() {
        return Err(StmbError::InvalidProfile(format!(
            "profile `{}` resolves to a connection without a model",
            profile.name
        )));
    }
    if resolved.api == FULL_MANUAL_API && resolved.endpoint.is_none() {
        return Err(StmbError::InvalidProfile(format!(
            "profile `{}` uses a full-manual connection without an endpoint",
            profile.name
        )));
    }
    Ok(())
}

const JSON_SHAPE: &str = r#"You must respond with ONLY valid JSON in this exact format:
{
  "title": "Short scene title (1-3 words)",
  "content": "...",
  "keywords": ["keyword1", "keyword2", "keyword3"]
}"#;

const KEYWORD_RULE: &str = "For the keywords field, provide 15-30 concrete, scene-specific keywords (locations, objects, proper nouns, unique actions) for retrieval. Avoid abstract themes and character names.";

const JSON_ONLY: &str = "Return ONLY the JSON, no other text.";

pub fn default_prompt() -> String {
    format!(
        "Analyze the following chat scene and return a memory as JSON.\n\n{JSON_SHAPE}\n\nThe content field holds a concise memory of key plot points, character development, and important interactions.\n\n{JSON_ONLY}"
    )
}

pub const BUILTIN_PRESETS: [&str; 8] = [
    "summary",
    "summarize",
    "synopsis",
    "sumup",
    "minimal",
    "northgate",
    "aelemar",
    "comprehensive",
];

pub fn preset_prompt(key: &str) -> Option<String> {
    let (lead, body) = match key.trim().to_ascii_lowercase().as_str() {
        "summary" => (
            "You are a talented summarist. Analyze the following roleplay scene and return a detailed memory as JSON.",
            "For the content field, write a beat-by-beat summary in narrative prose. Note the date and time first, then every important story beat, interaction highlight, revelation, and the outcome for {{user}} and {{char}}. Skip [OOC] chatter.",
        ),
        "summarize" => (
            "Analyze the following roleplay scene and return a structured summary as JSON.",
            "For the content field, use markdown headers Timeline, Story Beats, Key Interactions, Notable Details, and Outcome. Skip [OOC] chatter.",
        ),
        "synopsis" => (
            "Analyze the following roleplay scene and return a comprehensive synopsis as JSON.",
            "For the content field, write a long markdown synopsis with a scene heading, a timeline line, and sections for story beats, key interactions, notable details, and outcome.",
        ),
        "sumup" => (
            "Analyze the following roleplay scene and return a beat summary as JSON.",
            "For the content field, start with `# Scene Summary - Day X - [Title]`, note the time covered, then narrate every important beat and the outcome.",
        ),
        "minimal" => (
            "Analyze the following roleplay scene and return a minimal memory entry as JSON.",
            "For the content field, write a brief 2-5 sentence summary of what happened.",
        ),
        "northgate" => (
            "You are a memory archivist for a long-form narrative. Extract the scene into a structured JSON object.",
            "For the content field, write a literary third-person past-tense summary that can stand alone as a record of the scene and its impact on the characters.",
        ),
        "aelemar" => (
            "You are a meticulous archivist. Record the scene as JSON for long-term story continuity.",
            "For the content field, capture plot progression, character decisions and motivations, relationship shifts, and world details introduced, in dense factual prose.",
        ),
        "comprehensive" => (
            "Analyze the following roleplay scene and return an exhaustive memory as JSON.",
            "For the content field, combine a timeline, a beat-by-beat narrative, memorable quotes, and the emotional state of {{user}} and {{char}} at the end of the scene.",
        ),
        _ => return None,
    };
    Some(format!(
        "{lead}\n\n{JSON_SHAPE}\n\n{body}\n\n{KEYWORD_RULE}\n\n{JSON_ONLY}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(model: &str) -> ConnectionSpec {
        ConnectionSpec::Fixed(FixedConnection {
            model: model.to_string(),
            ..FixedConnection::default()
        })
    }

    #[test]
    fn mirror_active_resolves_to_host_settings_at_call_time() {
        let active = FixedConnection {
            api: "claude".to_string(),
            model: "claude-sonnet".to_string(),
            temperature: 3.5,
            ..FixedConnection::default()
        };
        let got = resolve_connection(&ConnectionSpec::MirrorActive, &active);
        assert_eq!(got.api, "claude");
        assert_eq!(got.model, "claude-sonnet");
        assert_eq!(got.temperature, 2.0);
    }

    #[test]
    fn fixed_connection_ignores_host_settings() {
        let active = FixedConnection {
            model: "host-model".to_string(),
            ..FixedConnection::default()
        };
        let got = resolve_connection(&fixed("gpt-4o-mini"), &active);
        assert_eq!(got.model, "gpt-4o-mini");
        assert_eq!(got.api, "openai");
    }

    #[test]
    fn normalized_prefers_custom_prompt_over_preset() {
        let profile = ConnectionProfile {
            prompt: Some("custom".to_string()),
            preset: Some("minimal".to_string()),
            ..ConnectionProfile::default()
        }
        .normalized();
        assert_eq!(profile.prompt.as_deref(), Some("custom"));
        assert_eq!(profile.preset, None);
        assert_eq!(profile.effective_prompt(), "custom");
    }

    #[test]
    fn normalized_falls_back_to_summary_preset_and_clamps() {
        let profile = ConnectionProfile {
            prompt: Some("   ".to_string()),
            preset: None,
            reverse_start: 5,
            outlet_name: Some("side".to_string()),
            position: 2,
            ..ConnectionProfile::default()
        }
        .normalized();
        assert_eq!(profile.preset.as_deref(), Some("summary"));
        assert_eq!(profile.reverse_start, 100);
        assert_eq!(profile.outlet_name, None);
    }

    #[test]
    fn outlet_name_survives_only_at_outlet_position() {
        let profile = ConnectionProfile {
            position: OUTLET_POSITION,
            outlet_name: Some("recap".to_string()),
            ..ConnectionProfile::default()
        }
        .normalized();
        assert_eq!(profile.outlet_name.as_deref(), Some("recap"));
    }

    #[test]
    fn validate_profile_rejects_missing_model_and_endpoint() {
        let profile = ConnectionProfile::default();
        let no_model = resolve_connection(&fixed(""), &FixedConnection::default());
        assert!(matches!(
            validate_profile(&profile, &no_model),
            Err(StmbError::InvalidProfile(_))
        ));

        let manual = FixedConnection {
            api: FULL_MANUAL_API.to_string(),
            model: "local".to_string(),
            ..FixedConnection::default()
        };
        assert!(validate_profile(&profile, &manual).is_err());
    }

    #[test]
    fn every_builtin_preset_asks_for_json() {
        for key in BUILTIN_PRESETS {
            let prompt = preset_prompt(key).expect("builtin preset");
            assert!(prompt.contains("\"keywords\""), "{key}");
        }
        assert!(preset_prompt("nope").is_none());
    }

    #[test]
    fn connection_spec_reads_tagged_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            connection: ConnectionSpec,
        }
        let parsed: Wrapper =
            toml::from_str("connection = { kind = \"fixed\", model = \"m\", temperature = 0.2 }")
                .expect("toml");
        assert_eq!(parsed.connection, fixed_with_temp("m", 0.2));
        let mirror: Wrapper =
            toml::from_str("connection = { kind = \"mirror_active\" }").expect("toml");
        assert_eq!(mirror.connection, ConnectionSpec::MirrorActive);
    }

    fn fixed_with_temp(model: &str, temperature: f64) -> ConnectionSpec {
        ConnectionSpec::Fixed(FixedConnection {
            model: model.to_string(),
            temperature,
            ..FixedConnection::default()
        })
    }
}
