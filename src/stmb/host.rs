//! Contracts between the engine and whatever hosts it.
//!
//! The engine never touches storage, the network, or a human directly; it
//! goes through these traits. `Host` bundles one borrowed implementation of
//! each for the duration of an operation.

use crate::stmb::json_repair::MemoryJson;
use crate::stmb::lorebook::Lorebook;
use crate::stmb::markers::SceneMarkers;
use crate::stmb::sideprompts::templates::SidePromptDoc;
use crate::stmb::transport::CompletionTransport;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(alias = "name")]
    pub speaker: String,
    #[serde(alias = "mes")]
    pub text: String,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default = "visible_by_default")]
    pub is_visible: bool,
}

fn visible_by_default() -> bool {
    true
}

impl ChatMessage {
    /// Counted by trackers and included in compiled scenes.
    pub fn is_countable(&self) -> bool {
        !self.is_system && self.is_visible
    }
}

pub trait Transcript {
    fn len(&self) -> usize;
    fn message(&self, index: usize) -> Option<ChatMessage>;
    fn character_name(&self) -> String;
    fn user_name(&self) -> String;
    fn chat_name(&self) -> String;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn len_i64(&self) -> i64 {
        i64::try_from(self.len()).unwrap_or(i64::MAX)
    }
}

/// Per-chat metadata: scene markers plus lorebook bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatMetadata {
    #[serde(flatten)]
    pub markers: SceneMarkers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_lorebook: Option<String>,
    /// Lorebook picked by the operator while manual mode is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_lorebook: Option<String>,
}

pub trait MetadataStore {
    fn load(&self) -> Result<ChatMetadata>;
    fn save(&self, metadata: &ChatMetadata) -> Result<()>;
}

pub trait LorebookStore {
    fn list_names(&self) -> Result<Vec<String>>;
    /// Fails when the lorebook does not exist.
    fn load(&self, name: &str) -> Result<Lorebook>;
    fn save(&self, name: &str, lorebook: &Lorebook) -> Result<()>;

    fn exists(&self, name: &str) -> bool {
        self.list_names()
            .map(|names| names.iter().any(|n| n == name))
            .unwrap_or(false)
    }
}

/// Persistence for the side-prompt template document.
pub trait TemplateStore {
    fn load(&self) -> Result<SidePromptDoc>;
    fn save(&self, doc: &SidePromptDoc) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreviewDecision {
    Accept,
    Edit(MemoryJson),
    Retry,
    Cancel,
}

/// Human-in-the-loop prompts. Only ever called from the engine's own thread.
pub trait Operator {
    fn confirm(&self, prompt: &str) -> bool;
    /// Index into `options`, or `None` when dismissed.
    fn choose(&self, prompt: &str, options: &[String]) -> Option<usize>;
    fn present(&self, heading: &str, record: &MemoryJson) -> PreviewDecision;
}

pub struct Host<'a> {
    pub transcript: &'a dyn Transcript,
    pub metadata: &'a dyn MetadataStore,
    pub lorebooks: &'a dyn LorebookStore,
    pub templates: &'a dyn TemplateStore,
    pub transport: &'a dyn CompletionTransport,
    pub operator: &'a dyn Operator,
}

/// Non-interactive operator driven by pre-set answers.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    pub confirm: bool,
    /// Option label (case-insensitive) or zero-based index to pick.
    pub choice: Option<String>,
    previews: Mutex<VecDeque<PreviewDecision>>,
    presented: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn new(confirm: bool, choice: Option<String>) -> Self {
        Self {
            confirm,
            choice,
            ..Self::default()
        }
    }

    /// Queue preview answers; once drained every preview is accepted.
    #[cfg(test)]
    pub fn with_previews(self, decisions: impl IntoIterator<Item = PreviewDecision>) -> Self {
        if let Ok(mut queue) = self.previews.lock() {
            queue.extend(decisions);
        }
        self
    }

    /// Headings shown so far, in order.
    #[cfg(test)]
    pub fn presented(&self) -> Vec<String> {
        self.presented.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Operator for ScriptedOperator {
    fn confirm(&self, _prompt: &str) -> bool {
        self.confirm
    }

    fn choose(&self, _prompt: &str, options: &[String]) -> Option<usize> {
        let wanted = self.choice.as_deref()?.trim();
        options
            .iter()
            .position(|o| o.eq_ignore_ascii_case(wanted))
            .or_else(|| wanted.parse::<usize>().ok().filter(|i| *i < options.len()))
    }

    fn present(&self, heading: &str, _record: &MemoryJson) -> PreviewDecision {
        if let Ok(mut presented) = self.presented.lock() {
            presented.push(heading.to_string());
        }
        self.previews
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(PreviewDecision::Accept)
    }
}
