use crate::stmb::lorebook::{ConstVectMode, EntryPlacement, OrderMode};
use crate::stmb::profile::OUTLET_POSITION;
use crate::stmb::util::now_rfc3339;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DOC_VERSION: u32 = 2;
pub const DEFAULT_INTERVAL_MESSAGES: i64 = 50;
pub const MANUAL_COMMAND: &str = "sideprompt";
const PLACEHOLDER_PROMPT: &str = "this is a placeholder prompt";
const UNTITLED: &str = "Untitled Side Prompt";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalTrigger {
    pub visible_messages: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AfterMemoryTrigger {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Triggers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_interval: Option<IntervalTrigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_after_memory: Option<AfterMemoryTrigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
}

impl Triggers {
    fn manual_only() -> Self {
        Self {
            commands: Some(vec![MANUAL_COMMAND.to_string()]),
            ..Self::default()
        }
    }

    /// Clamp the interval, drop blank commands, and default a missing
    /// command list to the manual command.
    pub fn normalized(mut self) -> Self {
        if let Some(interval) = self.on_interval.as_mut() {
            interval.visible_messages = interval.visible_messages.max(1);
        }
        self.commands = Some(match self.commands.take() {
            Some(commands) => commands
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            None => vec![MANUAL_COMMAND.to_string()],
        });
        self
    }

    pub fn allows_command(&self, command: &str) -> bool {
        self.commands
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(command))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LorebookOverride {
    pub enabled: bool,
    pub lorebook_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateLorebookSettings {
    pub const_vect_mode: ConstVectMode,
    pub position: i64,
    pub order_mode: OrderMode,
    pub order_value: i64,
    pub prevent_recursion: bool,
    pub delay_until_recursion: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outlet_name: Option<String>,
}

impl Default for TemplateLorebookSettings {
    fn default() -> Self {
        Self {
            const_vect_mode: ConstVectMode::Link,
            position: 0,
            order_mode: OrderMode::Auto,
            order_value: 100,
            prevent_recursion: true,
            delay_until_recursion: false,
            outlet_name: None,
        }
    }
}

impl TemplateLorebookSettings {
    /// Placement for the template's output entry. Only `manual` ordering uses
    /// the configured value; everything else sits at 100.
    pub fn placement(&self) -> EntryPlacement {
        let outlet_name = self
            .outlet_name
            .as_deref()
            .map(str::trim)
            .filter(|name| self.position == OUTLET_POSITION && !name.is_empty())
            .map(str::to_string);
        EntryPlacement {
            activation: self.const_vect_mode.activation(),
            position: self.position,
            order: if self.order_mode == OrderMode::Manual {
                self.order_value
            } else {
                100
            },
            prevent_recursion: self.prevent_recursion,
            delay_until_recursion: self.delay_until_recursion,
            outlet_name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateSettings {
    pub override_profile_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_profile_index: Option<usize>,
    pub previous_memories_count: i64,
    pub lorebook_override: LorebookOverride,
    pub lorebook: TemplateLorebookSettings,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TemplateSettings {
    /// Profile index to run with, when the template overrides it.
    pub fn profile_override(&self) -> Option<usize> {
        if self.override_profile_enabled {
            self.override_profile_index
        } else {
            None
        }
    }

    pub fn previous_memories(&self) -> usize {
        self.previous_memories_count.clamp(0, 7) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidePromptTemplate {
    pub key: String,
    pub name: String,
    pub enabled: bool,
    pub prompt: String,
    #[serde(default)]
    pub response_format: String,
    #[serde(default)]
    pub settings: TemplateSettings,
    #[serde(default)]
    pub triggers: Triggers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl SidePromptTemplate {
    pub fn interval_threshold(&self) -> Option<i64> {
        self.triggers
            .on_interval
            .as_ref()
            .map(|i| i.visible_messages.max(1))
    }

    pub fn runs_after_memory(&self) -> bool {
        self.triggers
            .on_after_memory
            .as_ref()
            .is_some_and(|t| t.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    OnInterval,
    OnAfterMemory,
    Command(String),
}

impl TriggerKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "onInterval" => Some(Self::OnInterval),
            "onAfterMemory" => Some(Self::OnAfterMemory),
            other => other
                .strip_prefix("command:")
                .map(|cmd| Self::Command(cmd.trim().to_string())),
        }
    }
}

/// Fields a caller may set on create or edit. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct TemplateInput {
    pub key: Option<String>,
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub prompt: Option<String>,
    pub response_format: Option<String>,
    pub settings: Option<TemplateSettings>,
    pub triggers: Option<Triggers>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Changed { name: String },
    AlreadySet { name: String },
    All { changed: usize },
}

/// How a stored document was brought to the current shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocSource {
    Current,
    VersionBumped,
    MigratedFromV1,
    RecreatedBuiltins,
}

impl DocSource {
    pub fn needs_save(self) -> bool {
        self != Self::Current
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidePromptDoc {
    pub version: u32,
    pub prompts: BTreeMap<String, SidePromptTemplate>,
}

impl Default for SidePromptDoc {
    fn default() -> Self {
        Self {
            version: DOC_VERSION,
            prompts: builtin_templates(),
        }
    }
}

impl SidePromptDoc {
    /// Accept a stored document as-is, migrate a type-based one, or fall
    /// back to the built-ins when the shape is unusable.
    pub fn from_stored(raw: Option<Value>) -> (Self, DocSource) {
        let Some(raw) = raw else {
            return (Self::default(), DocSource::RecreatedBuiltins);
        };
        if looks_like_v1(&raw) {
            return (migrate_v1(&raw), DocSource::MigratedFromV1);
        }
        if !validate_v2(&raw) {
            tracing::warn!("side prompt document has an invalid shape; recreating built-ins");
            return (Self::default(), DocSource::RecreatedBuiltins);
        }
        match serde_json::from_value::<SidePromptDoc>(raw) {
            Ok(mut doc) if doc.version < DOC_VERSION => {
                doc.version = DOC_VERSION;
                (doc, DocSource::VersionBumped)
            }
            Ok(doc) => (doc, DocSource::Current),
            Err(err) => {
                tracing::warn!(error = %err, "side prompt document failed to decode; recreating built-ins");
                (Self::default(), DocSource::RecreatedBuiltins)
            }
        }
    }

    /// Templates, most recently updated first.
    pub fn list(&self) -> Vec<&SidePromptTemplate> {
        let mut all = self.prompts.values().collect::<Vec<_>>();
        let stamp = |t: &SidePromptTemplate| {
            t.updated_at
                .clone()
                .or_else(|| t.created_at.clone())
                .unwrap_or_default()
        };
        all.sort_by_key(|t| std::cmp::Reverse(stamp(t)));
        all
    }

    pub fn list_by_trigger(&self, kind: &TriggerKind) -> Vec<&SidePromptTemplate> {
        self.list()
            .into_iter()
            .filter(|t| match kind {
                TriggerKind::OnInterval => t.enabled && t.interval_threshold().is_some(),
                TriggerKind::OnAfterMemory => t.enabled && t.runs_after_memory(),
                TriggerKind::Command(cmd) => t.triggers.allows_command(cmd),
            })
            .collect()
    }

    /// Exact name/key/slug match, then prefix, then substring; all
    /// case-insensitive.
    pub fn find_by_name(&self, name: &str) -> Option<&SidePromptTemplate> {
        let raw = name.trim();
        if raw.is_empty() {
            return None;
        }
        let target = raw.to_lowercase();
        let target_slug = safe_slug(raw);
        let target_norm = normalize_words(&target);
        let templates = self.prompts.values().collect::<Vec<_>>();

        let exact = templates.iter().find(|t| {
            t.name.to_lowercase() == target
                || t.key.to_lowercase() == target
                || safe_slug(&t.name) == target_slug
        });
        let prefix = || {
            templates.iter().find(|t| {
                t.name.to_lowercase().starts_with(&target)
                    || safe_slug(&t.name).starts_with(&target_slug)
                    || t.key.to_lowercase().starts_with(&target)
            })
        };
        let contains = || {
            templates.iter().find(|t| {
                let lower = t.name.to_lowercase();
                lower.contains(&target)
                    || safe_slug(&t.name).contains(&target_slug)
                    || (!target_norm.is_empty() && normalize_words(&lower).contains(&target_norm))
            })
        };
        exact.or_else(prefix).or_else(contains).copied()
    }

    /// Create or edit a template. Returns its key.
    pub fn upsert(&mut self, input: TemplateInput) -> String {
        let now = now_rfc3339();
        let current = input.key.as_ref().and_then(|k| self.prompts.get(k)).cloned();
        let requested = input
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        let name = requested
            .or_else(|| current.as_ref().map(|c| c.name.clone()))
            .unwrap_or_else(|| UNTITLED.to_string());

        let key = match input.key {
            Some(key) => key,
            None => self.unique_key(&name),
        };

        let triggers = input
            .triggers
            .or_else(|| current.as_ref().map(|c| c.triggers.clone()))
            .unwrap_or_else(Triggers::manual_only)
            .normalized();
        let next = SidePromptTemplate {
            key: key.clone(),
            name,
            enabled: input
                .enabled
                .or_else(|| current.as_ref().map(|c| c.enabled))
                .unwrap_or(false),
            prompt: input
                .prompt
                .or_else(|| current.as_ref().map(|c| c.prompt.clone()))
                .unwrap_or_else(|| PLACEHOLDER_PROMPT.to_string()),
            response_format: input
                .response_format
                .or_else(|| current.as_ref().map(|c| c.response_format.clone()))
                .unwrap_or_default(),
            settings: input
                .settings
                .or_else(|| current.as_ref().map(|c| c.settings.clone()))
                .unwrap_or_default(),
            triggers,
            created_at: current
                .as_ref()
                .and_then(|c| c.created_at.clone())
                .or_else(|| Some(now.clone())),
            updated_at: Some(now),
        };
        self.prompts.insert(key.clone(), next);
        key
    }

    fn unique_key(&self, name: &str) -> String {
        let mut candidate = safe_slug(name);
        let mut suffix = 2;
        while self.prompts.contains_key(&candidate) {
            candidate = safe_slug(&format!("{name} {suffix}"));
            suffix += 1;
        }
        candidate
    }

    /// `sideprompt-on|off <name|all>`.
    pub fn set_enabled(&mut self, target: &str, enabled: bool) -> Result<ToggleOutcome> {
        let target = target.trim();
        if target.is_empty() {
            return Err(anyhow!(
                "missing name; use sideprompt-{} \"Name\" or all",
                if enabled { "on" } else { "off" }
            ));
        }
        if target.eq_ignore_ascii_case("all") {
            let keys = self
                .prompts
                .values()
                .filter(|t| t.enabled != enabled)
                .map(|t| t.key.clone())
                .collect::<Vec<_>>();
            for key in &keys {
                self.toggle(key, enabled);
            }
            return Ok(ToggleOutcome::All {
                changed: keys.len(),
            });
        }
        let template = self
            .find_by_name(target)
            .ok_or_else(|| anyhow!("side prompt not found: {target}"))?;
        let (key, name) = (template.key.clone(), template.name.clone());
        if template.enabled == enabled {
            return Ok(ToggleOutcome::AlreadySet { name });
        }
        self.toggle(&key, enabled);
        Ok(ToggleOutcome::Changed { name })
    }

    fn toggle(&mut self, key: &str, enabled: bool) {
        if let Some(template) = self.prompts.get_mut(key) {
            template.enabled = enabled;
            template.updated_at = Some(now_rfc3339());
        }
    }
}

/// Lowercase, non-alphanumeric runs collapsed to `-`, trimmed, at most 50
/// characters. Never empty.
pub fn safe_slug(raw: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in raw.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    let mut cut = slug.chars().take(50).collect::<String>();
    while cut.ends_with('-') {
        cut.pop();
    }
    if cut.is_empty() {
        "sideprompt".to_string()
    } else {
        cut
    }
}

fn normalize_words(raw: &str) -> String {
    raw.split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_v1(raw: &Value) -> bool {
    raw.get("prompts")
        .and_then(Value::as_object)
        .is_some_and(|prompts| {
            prompts.values().any(|p| {
                p.as_object()
                    .is_some_and(|o| o.contains_key("type") && !o.contains_key("triggers"))
            })
        })
}

fn validate_v2(raw: &Value) -> bool {
    let Some(obj) = raw.as_object() else {
        return false;
    };
    if !obj.get("version").is_some_and(Value::is_number) {
        return false;
    }
    let Some(prompts) = obj.get("prompts").and_then(Value::as_object) else {
        return false;
    };
    prompts.iter().all(|(key, p)| {
        let Some(p) = p.as_object() else {
            return false;
        };
        let name_ok = p
            .get("name")
            .and_then(Value::as_str)
            .is_some_and(|n| !n.trim().is_empty());
        let Some(triggers) = p.get("triggers").and_then(Value::as_object) else {
            return false;
        };
        let interval_ok = match triggers.get("onInterval") {
            None | Some(Value::Null) => true,
            Some(oi) => oi
                .get("visibleMessages")
                .and_then(Value::as_f64)
                .is_some_and(|v| v >= 1.0),
        };
        let after_ok = match triggers.get("onAfterMemory") {
            None | Some(Value::Null) => true,
            Some(oam) => oam.get("enabled").is_some_and(Value::is_boolean),
        };
        let commands_ok = match triggers.get("commands") {
            None | Some(Value::Null) => true,
            Some(Value::Array(items)) => items
                .iter()
                .all(|c| c.as_str().is_some_and(|s| !s.trim().is_empty())),
            Some(_) => false,
        };
        p.get("key").and_then(Value::as_str) == Some(key.as_str())
            && name_ok
            && p.get("enabled").is_some_and(Value::is_boolean)
            && p.get("prompt").is_some_and(Value::is_string)
            && p.get("settings").is_some_and(Value::is_object)
            && interval_ok
            && after_ok
            && commands_ok
    })
}

/// Type-based documents: `tracker` runs on an interval, `plotpoints` after
/// memories, `scoreboard` after memories only when `withMemories` is set.
/// Every migrated template keeps the manual command.
pub fn migrate_v1(raw: &Value) -> SidePromptDoc {
    let now = now_rfc3339();
    let old_version = raw.get("version").and_then(Value::as_u64).unwrap_or(1) as u32;
    let mut prompts = BTreeMap::new();
    let entries = raw
        .get("prompts")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for (key, p) in entries {
        let text = |field: &str| p.get(field).and_then(Value::as_str).map(str::to_string);
        let legacy = p.get("settings").cloned().unwrap_or(Value::Null);
        let mut triggers = Triggers::manual_only();
        match text("type").unwrap_or_default().to_lowercase().as_str() {
            "tracker" => {
                let visible = legacy
                    .get("intervalVisibleMessages")
                    .and_then(Value::as_i64)
                    .unwrap_or(DEFAULT_INTERVAL_MESSAGES)
                    .max(1);
                triggers.on_interval = Some(IntervalTrigger {
                    visible_messages: visible,
                });
            }
            "plotpoints" => {
                let with_memories = legacy
                    .get("withMemories")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                triggers.on_after_memory = Some(AfterMemoryTrigger {
                    enabled: with_memories,
                });
            }
            "scoreboard" => {
                let with_memories = legacy
                    .get("withMemories")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if with_memories {
                    triggers.on_after_memory = Some(AfterMemoryTrigger { enabled: true });
                }
            }
            _ => {}
        }
        let settings = serde_json::from_value::<TemplateSettings>(legacy).unwrap_or_default();
        prompts.insert(
            key.clone(),
            SidePromptTemplate {
                key,
                name: text("name").unwrap_or_else(|| "Side Prompt".to_string()),
                enabled: p.get("enabled").and_then(Value::as_bool).unwrap_or(false),
                prompt: text("prompt").unwrap_or_else(|| PLACEHOLDER_PROMPT.to_string()),
                response_format: text("responseFormat").unwrap_or_default(),
                settings,
                triggers,
                created_at: text("createdAt").or_else(|| Some(now.clone())),
                updated_at: Some(now.clone()),
            },
        );
    }

    SidePromptDoc {
        version: DOC_VERSION.max(old_version + 1),
        prompts,
    }
}

fn builtin(
    name: &str,
    prompt: &str,
    response_format: &str,
    lorebook: (ConstVectMode, i64, i64),
) -> SidePromptTemplate {
    let now = now_rfc3339();
    let (const_vect_mode, position, order_value) = lorebook;
    SidePromptTemplate {
        key: safe_slug(name),
        name: name.to_string(),
        enabled: false,
        prompt: prompt.to_string(),
        response_format: response_format.to_string(),
        settings: TemplateSettings {
            lorebook: TemplateLorebookSettings {
                const_vect_mode,
                position,
                order_mode: OrderMode::Manual,
                order_value,
                ..TemplateLorebookSettings::default()
            },
            ..TemplateSettings::default()
        },
        triggers: Triggers {
            on_after_memory: Some(AfterMemoryTrigger { enabled: true }),
            ..Triggers::manual_only()
        },
        created_at: Some(now.clone()),
        updated_at: Some(now),
    }
}

/// The four shipped templates, all disabled.
pub fn builtin_templates() -> BTreeMap<String, SidePromptTemplate> {
    let mut cast = builtin(
        "Cast of Characters",
        "You are a skilled reporter with a clear eye for judging the importance of NPCs to the plot. \nStep 1: Review the scene and either add or update plot-related NPCs to the NPC WHO'S WHO report. Please note that {{char}} and {{user}} are major characters and do NOT need to be included in this report.\nStep 2: This list should be kept in order of importance to the plot, so it may need to be reordered.\nStep 3: If your response would be more than 2000 tokens long, remove NPCs with the least impact to the plot.",
        "===NPC WHO'S WHO===\n(In order of importance to the plot)\n\nPerson 1: 1-2 sentence description\nPerson 2: 1-2 sentence description\n===END NPC WHO'S WHO===",
        (ConstVectMode::Blue, 3, 15),
    );
    cast.key = safe_slug("Cast");

    [
        builtin(
            "Plotpoints",
            "Analyze the accompanying scene for plot threads, story arcs, and other narrative movements. The previous scenes are there to provide context. Generate a story thread report. If a report already exists in context, update it instead of recreating.",
            "=== Plot Points ===\n(as of [point in the story when this analysis was done])\n\n[Overarching Plot Arc]\n(2-3 sentence summary of the superobjective or major plot)\n\n[Thread #1 Title]\n- Summary: (1 sentence)\n- Status: (active / on hold)\n- At Stake: (how resolution will affect the ongoing story)\n- Last Known: (location or time)\n- Key Characters: ...\n\n...\n\n-- Plot Hooks --\n- (new or potential plot hooks)\n\n-- Character Dynamics --\n- current status of {{user}}'s/{{char}}'s relationships with NPCs\n\n===End Plot Points===\n",
            (ConstVectMode::Blue, 2, 25),
        ),
        builtin(
            "Status",
            "Analyze all context (previous scenes, memories, lore, history, interactions) to generate a detailed analysis of {{user}} and {{char}}. Note: If there is a pre-existing status report, update it, do not regurgitate it.",
            "Follow this general format:\n\n## Witty Headline or Summary\n\n### AFFINITY (0-100)\n- Score with evidence\n- Recent changes\n- Supporting quotes\n\n### RELATIONSHIP STATUS (negative = enemies, 0 = strangers, 100 = life partners)\n- Trust/boundaries/communication\n- Key events\n- Issues\n\n### GOALS\n- Short/long-term objectives\n- Progress/obstacles\n- Growth areas\n\n### ANALYSIS\n- Psychology/POV\n- Development/triggers\n- Story suggestions\n\n### WRAP-UP\n- OOC Summary (1 paragraph)",
            (ConstVectMode::Link, 3, 25),
        ),
        cast,
        builtin(
            "Assess",
            "Assess the interaction between {{char}} and {{user}} to date. List all the information {{char}} has learned about {{user}} through observation, questioning, or drawing conclusions from interaction (similar to a mental \"note to self\"). If there is already a list, update it. Try to keep it token-efficient and compact, focused on the important things.",
            "Use this format: \n=== Things {{char}} has learned about {{user}} ===\n(detailed list, in {{char}}'s POV/tone of voice)\n===",
            (ConstVectMode::Blue, 2, 30),
        ),
    ]
    .into_iter()
    .map(|t| (t.key.clone(), t))
    .collect()
}
