//! JSON-file implementations of the host contracts, rooted at `STMB_HOME`.

use crate::stmb::host::{ChatMessage, ChatMetadata, LorebookStore, MetadataStore, TemplateStore, Transcript};
use crate::stmb::lorebook::Lorebook;
use crate::stmb::paths::StmbPaths;
use crate::stmb::sideprompts::templates::SidePromptDoc;
use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Read `path` as JSON, or `T::default()` when it does not exist.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write pretty JSON through a temp file in the same directory, holding an
/// exclusive lock on a sidecar `.lock` file while the rename happens.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let lock_path = lock_path_for(path);
    let lock = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("failed to open {}", lock_path.display()))?;
    lock.lock_exclusive()
        .with_context(|| format!("failed to lock {}", lock_path.display()))?;

    let data = serde_json::to_string_pretty(value)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(format!("{data}\n").as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|err| anyhow!("failed to write {}: {}", path.display(), err.error))?;

    FileExt::unlock(&lock).with_context(|| format!("failed to unlock {}", lock_path.display()))?;
    Ok(())
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// On-disk transcript: either a bare message array or an object with names.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TranscriptFile {
    character_name: String,
    user_name: String,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TranscriptShape {
    Bare(Vec<ChatMessage>),
    Full(TranscriptFile),
}

pub struct FileTranscript {
    chat: String,
    character: String,
    user: String,
    messages: Vec<ChatMessage>,
}

impl FileTranscript {
    pub fn load(paths: &StmbPaths, chat: &str) -> Result<Self> {
        let path = paths.chat_dir(chat).join("messages.json");
        let file = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match serde_json::from_str::<TranscriptShape>(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
            {
                TranscriptShape::Bare(messages) => TranscriptFile {
                    messages,
                    ..TranscriptFile::default()
                },
                TranscriptShape::Full(file) => file,
            }
        } else {
            TranscriptFile::default()
        };
        Ok(Self {
            chat: chat.to_string(),
            character: non_empty_or(file.character_name, "Character"),
            user: non_empty_or(file.user_name, "User"),
            messages: file.messages,
        })
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.trim().to_string()
    }
}

impl Transcript for FileTranscript {
    fn len(&self) -> usize {
        self.messages.len()
    }

    fn message(&self, index: usize) -> Option<ChatMessage> {
        self.messages.get(index).cloned()
    }

    fn character_name(&self) -> String {
        self.character.clone()
    }

    fn user_name(&self) -> String {
        self.user.clone()
    }

    fn chat_name(&self) -> String {
        self.chat.clone()
    }
}

pub struct FileMetadataStore {
    path: PathBuf,
}

impl FileMetadataStore {
    pub fn new(paths: &StmbPaths, chat: &str) -> Self {
        Self {
            path: paths.chat_dir(chat).join("metadata.json"),
        }
    }
}

impl MetadataStore for FileMetadataStore {
    fn load(&self) -> Result<ChatMetadata> {
        read_json_or_default(&self.path)
    }

    fn save(&self, metadata: &ChatMetadata) -> Result<()> {
        write_json_atomic(&self.path, metadata)
    }
}

pub struct FileLorebookStore {
    dir: PathBuf,
}

impl FileLorebookStore {
    pub fn new(paths: &StmbPaths) -> Self {
        Self {
            dir: paths.lorebooks_dir.clone(),
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.contains(['/', '\\']) || trimmed.starts_with('.') {
            return Err(anyhow!("invalid lorebook name: {name:?}"));
        }
        Ok(self.dir.join(format!("{trimmed}.json")))
    }
}

impl LorebookStore for FileLorebookStore {
    fn list_names(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn load(&self, name: &str) -> Result<Lorebook> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(anyhow!("lorebook not found: {name}"));
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn save(&self, name: &str, lorebook: &Lorebook) -> Result<()> {
        write_json_atomic(&self.path_for(name)?, lorebook)
    }
}

pub struct FileTemplateStore {
    path: PathBuf,
}

impl FileTemplateStore {
    pub fn new(paths: &StmbPaths) -> Self {
        Self {
            path: paths.side_prompts_file.clone(),
        }
    }
}

impl TemplateStore for FileTemplateStore {
    /// Migrated or recreated documents are written back before returning.
    fn load(&self) -> Result<SidePromptDoc> {
        let stored = if self.path.exists() {
            let raw = fs::read_to_string(&self.path)
                .with_context(|| format!("failed to read {}", self.path.display()))?;
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "side prompt file is not JSON");
                    None
                }
            }
        } else {
            None
        };
        let (doc, source) = SidePromptDoc::from_stored(stored);
        if source.needs_save() {
            tracing::info!(?source, "saving normalized side prompt document");
            self.save(&doc)?;
        }
        Ok(doc)
    }

    fn save(&self, doc: &SidePromptDoc) -> Result<()> {
        write_json_atomic(&self.path, doc)
    }
}

/// Last-failure slots survive between CLI invocations under `state/`.
pub fn load_slot<T: DeserializeOwned>(paths: &StmbPaths, name: &str) -> Result<Option<T>> {
    let path = paths.state_dir.join(format!("{name}.json"));
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// `None` removes the slot file.
pub fn save_slot<T: Serialize>(paths: &StmbPaths, name: &str, value: Option<&T>) -> Result<()> {
    let path = paths.state_dir.join(format!("{name}.json"));
    match value {
        Some(value) => write_json_atomic(&path, value),
        None => {
            if path.exists() {
                fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmb::lorebook::LorebookEntry;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn missing_files_load_as_defaults() {
        let tmp = tempdir().expect("tempdir");
        let paths = StmbPaths::from_home(tmp.path().to_path_buf());
        let meta = FileMetadataStore::new(&paths, "c1").load().expect("meta");
        assert_eq!(meta, ChatMetadata::default());
        let transcript = FileTranscript::load(&paths, "c1").expect("transcript");
        assert!(transcript.is_empty());
        assert_eq!(transcript.character_name(), "Character");
        assert!(load_slot::<Value>(&paths, "last_memory_failure").expect("slot").is_none());
    }

    #[test]
    fn transcript_accepts_bare_array_and_named_object() {
        let tmp = tempdir().expect("tempdir");
        let paths = StmbPaths::from_home(tmp.path().to_path_buf());
        fs::create_dir_all(paths.chat_dir("a")).expect("dir");
        fs::create_dir_all(paths.chat_dir("b")).expect("dir");
        fs::write(
            paths.chat_dir("a").join("messages.json"),
            json!([{"speaker": "Ava", "text": "hi"}]).to_string(),
        )
        .expect("write");
        fs::write(
            paths.chat_dir("b").join("messages.json"),
            json!({"characterName": "Ava", "userName": "Sam", "messages": [{"name": "Sam", "mes": "yo"}]})
                .to_string(),
        )
        .expect("write");
        let a = FileTranscript::load(&paths, "a").expect("a");
        assert_eq!(a.len(), 1);
        let b = FileTranscript::load(&paths, "b").expect("b");
        assert_eq!(b.user_name(), "Sam");
        assert_eq!(b.message(0).map(|m| m.text), Some("yo".to_string()));
    }

    #[test]
    fn lorebook_store_round_trips_and_lists_names() {
        let tmp = tempdir().expect("tempdir");
        let paths = StmbPaths::from_home(tmp.path().to_path_buf());
        let store = FileLorebookStore::new(&paths);
        assert!(store.load("LTM - Ava").is_err());

        let mut book = Lorebook::default();
        book.create_entry(LorebookEntry {
            comment: "[001] - Ambush".to_string(),
            stmemorybooks: true,
            ..LorebookEntry::default()
        });
        store.save("LTM - Ava", &book).expect("save");
        assert_eq!(store.list_names().expect("names"), vec!["LTM - Ava"]);
        assert!(store.exists("LTM - Ava"));
        assert_eq!(store.load("LTM - Ava").expect("load"), book);
        assert!(store.save("../escape", &book).is_err());
    }

    #[test]
    fn template_store_writes_builtins_on_first_load() {
        let tmp = tempdir().expect("tempdir");
        let paths = StmbPaths::from_home(tmp.path().to_path_buf());
        let store = FileTemplateStore::new(&paths);
        let doc = store.load().expect("load");
        assert_eq!(doc.prompts.len(), 4);
        assert!(paths.side_prompts_file.exists());
    }

    #[test]
    fn slots_save_and_clear() {
        let tmp = tempdir().expect("tempdir");
        let paths = StmbPaths::from_home(tmp.path().to_path_buf());
        save_slot(&paths, "slot", Some(&json!({"code": "UNBALANCED"}))).expect("save");
        let back: Option<Value> = load_slot(&paths, "slot").expect("load");
        assert_eq!(back, Some(json!({"code": "UNBALANCED"})));
        save_slot::<Value>(&paths, "slot", None).expect("clear");
        assert!(load_slot::<Value>(&paths, "slot").expect("load").is_none());
    }
}
