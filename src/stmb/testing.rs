//! In-memory host doubles for unit tests.

use crate::stmb::host::{
    ChatMessage, ChatMetadata, Host, LorebookStore, MetadataStore, ScriptedOperator, TemplateStore,
    Transcript,
};
use crate::stmb::lorebook::Lorebook;
use crate::stmb::sideprompts::templates::SidePromptDoc;
use crate::stmb::transport::ReplayTransport;
use anyhow::{Result, anyhow};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

pub struct VecTranscript(pub Vec<ChatMessage>);

impl VecTranscript {
    pub fn alternating(count: usize) -> Self {
        Self(
            (0..count)
                .map(|i| ChatMessage {
                    speaker: if i % 2 == 0 { "Ava" } else { "Sam" }.to_string(),
                    text: format!("message {i}"),
                    is_system: false,
                    is_visible: true,
                })
                .collect(),
        )
    }
}

impl Transcript for VecTranscript {
    fn len(&self) -> usize {
        self.0.len()
    }
    fn message(&self, index: usize) -> Option<ChatMessage> {
        self.0.get(index).cloned()
    }
    fn character_name(&self) -> String {
        "Ava".to_string()
    }
    fn user_name(&self) -> String {
        "Sam".to_string()
    }
    fn chat_name(&self) -> String {
        "bridge".to_string()
    }
}

#[derive(Default)]
pub struct MemMetadata(pub Mutex<ChatMetadata>);

impl MemMetadata {
    pub fn bound_to(name: &str) -> Self {
        Self(Mutex::new(ChatMetadata {
            bound_lorebook: Some(name.to_string()),
            ..ChatMetadata::default()
        }))
    }

    pub fn get(&self) -> ChatMetadata {
        self.0.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl MetadataStore for MemMetadata {
    fn load(&self) -> Result<ChatMetadata> {
        Ok(self.get())
    }
    fn save(&self, metadata: &ChatMetadata) -> Result<()> {
        *self.0.lock().map_err(|_| anyhow!("poisoned"))? = metadata.clone();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemLorebooks {
    pub books: Mutex<BTreeMap<String, Lorebook>>,
    /// Names whose save always fails.
    pub failing_saves: BTreeSet<String>,
    pub saves: Mutex<Vec<String>>,
}

impl MemLorebooks {
    pub fn with(names: &[&str]) -> Self {
        let store = Self::default();
        if let Ok(mut books) = store.books.lock() {
            for name in names {
                books.insert((*name).to_string(), Lorebook::default());
            }
        }
        store
    }

    pub fn get(&self, name: &str) -> Lorebook {
        self.books
            .lock()
            .ok()
            .and_then(|b| b.get(name).cloned())
            .unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl LorebookStore for MemLorebooks {
    fn list_names(&self) -> Result<Vec<String>> {
        Ok(self
            .books
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .keys()
            .cloned()
            .collect())
    }
    fn load(&self, name: &str) -> Result<Lorebook> {
        self.books
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("lorebook not found: {name}"))
    }
    fn save(&self, name: &str, lorebook: &Lorebook) -> Result<()> {
        if self.failing_saves.contains(name) {
            return Err(anyhow!("disk full"));
        }
        if let Ok(mut saves) = self.saves.lock() {
            saves.push(name.to_string());
        }
        self.books
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .insert(name.to_string(), lorebook.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemTemplates(pub Mutex<SidePromptDoc>);

impl MemTemplates {
    pub fn from_doc(doc: SidePromptDoc) -> Self {
        Self(Mutex::new(doc))
    }
}

impl TemplateStore for MemTemplates {
    fn load(&self) -> Result<SidePromptDoc> {
        Ok(self.0.lock().map_err(|_| anyhow!("poisoned"))?.clone())
    }
    fn save(&self, doc: &SidePromptDoc) -> Result<()> {
        *self.0.lock().map_err(|_| anyhow!("poisoned"))? = doc.clone();
        Ok(())
    }
}

/// Owns one of each double; `host()` borrows them.
pub struct Fixture {
    pub transcript: VecTranscript,
    pub metadata: MemMetadata,
    pub lorebooks: MemLorebooks,
    pub templates: MemTemplates,
    pub transport: ReplayTransport,
    pub operator: ScriptedOperator,
}

impl Fixture {
    /// `messages` alternating messages, bound to an empty lorebook `LTM`,
    /// with the side-prompt built-ins (all disabled).
    pub fn new(messages: usize, responses: Value) -> Self {
        Self {
            transcript: VecTranscript::alternating(messages),
            metadata: MemMetadata::bound_to("LTM"),
            lorebooks: MemLorebooks::with(&["LTM"]),
            templates: MemTemplates::default(),
            transport: ReplayTransport::from_value(responses).unwrap_or_else(|err| panic!("{err}")),
            operator: ScriptedOperator::default(),
        }
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            transcript: &self.transcript,
            metadata: &self.metadata,
            lorebooks: &self.lorebooks,
            templates: &self.templates,
            transport: &self.transport,
            operator: &self.operator,
        }
    }
}
