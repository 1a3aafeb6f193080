pub mod arcs;
pub mod chat_event;
pub mod highest;
pub mod memory;
pub mod repair;
pub mod sideprompt;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::env;
use std::path::PathBuf;

use crate::error::StmbError;
use crate::stmb::arcs::FailedArcRun;
use crate::stmb::audit;
use crate::stmb::config::load_config;
use crate::stmb::engine::Engine;
use crate::stmb::host::{Host, ScriptedOperator};
use crate::stmb::paths::{StmbPaths, resolve_paths};
use crate::stmb::pipeline::FailedMemory;
use crate::stmb::store::{
    FileLorebookStore, FileMetadataStore, FileTemplateStore, FileTranscript, load_slot, save_slot,
};
use crate::stmb::transport::{CompletionTransport, HttpTransport, ReplayTransport};

const MEMORY_FAILURE_SLOT: &str = "last_memory_failure";
const ARC_FAILURE_SLOT: &str = "last_arc_failure";

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

/// Options shared by every command that works on one chat.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub chat: String,
    /// Profile name; the configured default when absent.
    pub profile: Option<String>,
    /// Answer yes to every confirmation.
    pub yes: bool,
    /// Label or zero-based index picked whenever a choice is offered.
    pub choose: Option<String>,
}

/// One chat opened against the file-backed harness.
pub struct Session {
    pub paths: StmbPaths,
    pub engine: Engine,
    pub profile_index: Option<usize>,
    transcript: FileTranscript,
    metadata: FileMetadataStore,
    lorebooks: FileLorebookStore,
    templates: FileTemplateStore,
    transport: Box<dyn CompletionTransport>,
    operator: ScriptedOperator,
}

fn build_transport(engine: &Engine) -> Result<Box<dyn CompletionTransport>> {
    if let Ok(raw) = env::var("STMB_REPLAY_RESPONSES")
        && !raw.trim().is_empty()
    {
        let path = PathBuf::from(raw.trim());
        tracing::debug!(path = %path.display(), "using replayed completions");
        return Ok(Box::new(ReplayTransport::from_file(&path)?));
    }
    let host = &engine.config.host;
    Ok(Box::new(HttpTransport::new(
        &host.openai_base_url,
        &host.anthropic_base_url,
        host.openai_api_key.clone(),
        host.anthropic_api_key.clone(),
    )?))
}

impl Session {
    pub fn open(opts: &ChatOptions) -> Result<Self> {
        let chat = opts.chat.trim();
        if chat.is_empty() || chat.contains(['/', '\\']) || chat.starts_with('.') {
            return Err(anyhow!("invalid chat name: {:?}", opts.chat));
        }
        let paths = resolve_paths()?;
        let config = load_config(&paths)?;
        let profile_index = match opts.profile.as_deref() {
            Some(name) => Some(
                config
                    .profile_index_by_name(name)
                    .with_context(|| format!("unknown profile: {name}"))?,
            ),
            None => None,
        };
        let engine = Engine::new(config);
        engine.set_last_failure(load_slot::<FailedMemory>(&paths, MEMORY_FAILURE_SLOT)?);
        engine.set_last_arc_failure(load_slot::<FailedArcRun>(&paths, ARC_FAILURE_SLOT)?);
        let transport = build_transport(&engine)?;

        Ok(Self {
            transcript: FileTranscript::load(&paths, chat)?,
            metadata: FileMetadataStore::new(&paths, chat),
            lorebooks: FileLorebookStore::new(&paths),
            templates: FileTemplateStore::new(&paths),
            transport,
            operator: ScriptedOperator::new(opts.yes, opts.choose.clone()),
            engine,
            profile_index,
            paths,
        })
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            transcript: &self.transcript,
            metadata: &self.metadata,
            lorebooks: &self.lorebooks,
            templates: &self.templates,
            transport: self.transport.as_ref(),
            operator: &self.operator,
        }
    }

    /// Persist the failure slots for the next invocation.
    pub fn close(&self) -> Result<()> {
        save_slot(&self.paths, MEMORY_FAILURE_SLOT, self.engine.last_failure().as_ref())?;
        save_slot(&self.paths, ARC_FAILURE_SLOT, self.engine.last_arc_failure().as_ref())?;
        Ok(())
    }

    pub fn audit(&self, phase: &str, status: &str, message: &str) {
        if let Err(err) = audit::append_event(&self.paths, phase, status, message) {
            tracing::warn!(error = %format!("{err:#}"), "failed to write audit event");
        }
    }

    /// Report a domain failure as an issue and in the audit log.
    pub fn fail(&self, report: &mut CommandReport, phase: &str, err: &StmbError) {
        let code = err.code();
        match err {
            StmbError::Busy(_) | StmbError::TokenWarning { .. } => {
                tracing::warn!(phase, code, "{err}");
            }
            _ => tracing::error!(phase, code, "{err}"),
        }
        report.issue(format!("{code}: {err}"));
        if let StmbError::AiResponse(ai) = err {
            report.detail(format!("next step: {}", ai.code.remedy()));
        }
        self.audit(phase, "failed", &format!("{code}: {err}"));
    }
}
