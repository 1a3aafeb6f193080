//! Side prompts keep one named lorebook entry per template up to date.
//!
//! A template runs on an interval of visible messages, after every memory,
//! or on demand. Each keeps its own checkpoint, independent of the memory
//! watermark, on the entry it writes.

pub mod templates;

use crate::error::{AiErrorCode, AiResponseError, StmbError};
use crate::stmb::binding::require_strict;
use crate::stmb::compile::{CompiledScene, PreviousMemory, compile_scene, previous_memories};
use crate::stmb::config::StmbConfig;
use crate::stmb::engine::Engine;
use crate::stmb::host::{Host, PreviewDecision, Transcript};
use crate::stmb::json_repair::{MemoryJson, unwrap_envelope};
use crate::stmb::lorebook::{Checkpoint, Lorebook, LorebookEntry, SceneRange, UpsertItem};
use crate::stmb::profile::{ConnectionProfile, FixedConnection, resolve_connection, validate_profile};
use crate::stmb::transport::{CompletionRequest, CompletionTransport};
use crate::stmb::util::{now_epoch_millis, now_rfc3339, parse_index_range, rfc3339_to_millis};
use anyhow::anyhow;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use templates::{
    DEFAULT_INTERVAL_MESSAGES, MANUAL_COMMAND, SidePromptTemplate, ToggleOutcome, TriggerKind,
};

pub const TITLE_SUFFIX: &str = "(STMB SidePrompt)";
const LEGACY_SUFFIXES: [&str; 3] = ["(STMB Tracker)", "(STMB Plotpoints)", "(STMB Scoreboard)"];
const INTERVAL_DEBOUNCE_MS: u64 = 10_000;
const WINDOW_CAP: i64 = 200;
const SUMMARY_NAMES: usize = 5;

pub const RANGE_HINT: &str = "Tip: run a specific range with sideprompt \"Name\" X-Y (for example sideprompt \"Scoreboard\" 100-120). Without a range the messages since the last checkpoint are used.";

pub fn entry_title(name: &str) -> String {
    format!("{name} {TITLE_SUFFIX}")
}

/// The template's entry, under its current title or a legacy one.
pub fn existing_entry<'b>(book: &'b Lorebook, name: &str) -> Option<&'b LorebookEntry> {
    book.find_by_title(&entry_title(name)).or_else(|| {
        LEGACY_SUFFIXES
            .iter()
            .find_map(|suffix| book.find_by_title(&format!("{name} {suffix}")))
    })
}

pub fn build_side_prompt(
    template: &SidePromptTemplate,
    prior: &str,
    scene: &CompiledScene,
    previous: &[PreviousMemory],
) -> String {
    let mut out = template.prompt.clone();
    if !prior.trim().is_empty() {
        out.push_str("\n=== PRIOR ENTRY ===\n");
        out.push_str(prior);
    }
    if !previous.is_empty() {
        out.push_str("\n=== PREVIOUS SCENE CONTEXT (DO NOT SUMMARIZE) ===\n");
        out.push_str("These are previous memories for context only. Do NOT include them in your new output.\n\n");
        for (i, memory) in previous.iter().enumerate() {
            out.push_str(&format!("Context {} - {}:\n{}\n", i + 1, memory.title, memory.content));
            if !memory.keywords.is_empty() {
                out.push_str(&format!("Keywords: {}\n", memory.keywords.join(", ")));
            }
            out.push('\n');
        }
        out.push_str("=== END PREVIOUS SCENE CONTEXT ===\n");
    }
    out.push_str("\n=== SCENE TEXT ===\n");
    out.push_str(&scene.readable_text());
    let format = template.response_format.trim();
    if !format.is_empty() {
        out.push_str("\n=== RESPONSE FORMAT ===\n");
        out.push_str(format);
    }
    scene.substitute(&out)
}

#[derive(Debug, Clone, Serialize)]
pub struct SidePromptFailure {
    pub name: String,
    pub error: String,
}

/// Per-template results of one trigger evaluation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SidePromptReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<SidePromptFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

pub type AfterMemoryReport = SidePromptReport;

impl SidePromptReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.skipped.is_empty()
    }

    fn fail(&mut self, name: &str, error: impl std::fmt::Display) {
        self.failed.push(SidePromptFailure {
            name: name.to_string(),
            error: error.to_string(),
        });
    }

    /// One-line outcome; `None` when nothing ran.
    pub fn summary(&self) -> Option<String> {
        let ok = self.succeeded.len();
        if self.failed.is_empty() {
            return (ok > 0).then(|| format!("{ok} succeeded. {}", summarize_names(&self.succeeded)));
        }
        let failed = self.failed.iter().map(|f| f.name.clone()).collect::<Vec<_>>();
        Some(format!(
            "{ok} succeeded, {} failed. Failed: {}",
            failed.len(),
            summarize_names(&failed)
        ))
    }
}

/// At most five names, then a count of the rest.
pub fn summarize_names(names: &[String]) -> String {
    let shown = names
        .iter()
        .take(SUMMARY_NAMES)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if names.len() > SUMMARY_NAMES {
        format!("{shown}, +{} more", names.len() - SUMMARY_NAMES)
    } else {
        shown
    }
}

#[derive(Debug, Clone)]
struct Target {
    name: String,
    book: Lorebook,
}

/// Destination books for a template. Override names that are unknown or fail
/// to load are skipped; with none left the default book is used.
fn resolve_targets(host: &Host<'_>, template: &SidePromptTemplate, default: &Target) -> Vec<Target> {
    let overrides = &template.settings.lorebook_override;
    if !overrides.enabled || overrides.lorebook_names.is_empty() {
        return vec![default.clone()];
    }
    let known = host.lorebooks.list_names().unwrap_or_default();
    let mut names = Vec::new();
    for name in overrides.lorebook_names.iter().map(|n| n.trim()) {
        if !name.is_empty() && known.iter().any(|k| k == name) && !names.contains(&name) {
            names.push(name);
        }
    }
    let mut out = Vec::new();
    for name in names {
        if name == default.name {
            out.push(default.clone());
            continue;
        }
        match host.lorebooks.load(name) {
            Ok(book) => out.push(Target {
                name: name.to_string(),
                book,
            }),
            Err(err) => {
                tracing::warn!(template = %template.name, lorebook = name, "skipping override lorebook: {err:#}");
            }
        }
    }
    if out.is_empty() {
        tracing::warn!(template = %template.name, "no usable override lorebook; using the default");
        return vec![default.clone()];
    }
    out
}

/// Template override profile, else `profile`, else the default profile.
fn connection_for(
    cfg: &StmbConfig,
    template: &SidePromptTemplate,
    profile: Option<&ConnectionProfile>,
) -> Result<FixedConnection, StmbError> {
    let profile = match template.settings.profile_override() {
        Some(index) => cfg.profile(Some(index)),
        None => profile.unwrap_or_else(|| cfg.profile(None)),
    };
    let connection = resolve_connection(&profile.connection, &cfg.host.active);
    validate_profile(profile, &connection)?;
    Ok(connection)
}

/// Side prompts take the model's text as-is.
fn call_model(transport: &dyn CompletionTransport, request: &CompletionRequest) -> Result<String, StmbError> {
    let response = transport.complete(request).map_err(StmbError::Transport)?;
    if let Some(truncated) = response.truncation() {
        return Err(truncated.into());
    }
    let text = if response.text.trim().is_empty() {
        unwrap_envelope(&response.raw)?
    } else {
        response.text
    };
    let text = text.trim();
    if text.is_empty() {
        return Err(AiResponseError::new(AiErrorCode::EmptyOrInvalid, "side prompt response is empty", "").into());
    }
    Ok(text.to_string())
}

/// Operator preview. `None` means the result is dropped.
fn review(cfg: &StmbConfig, host: &Host<'_>, template: &SidePromptTemplate, text: String) -> Option<String> {
    if !cfg.memory.show_memory_previews {
        return Some(text);
    }
    let record = MemoryJson {
        title: entry_title(&template.name),
        content: text.clone(),
        keywords: Vec::new(),
    };
    match host
        .operator
        .present(&format!("Side prompt: {}", template.name), &record)
    {
        PreviewDecision::Accept => Some(text),
        PreviewDecision::Edit(edited) if !edited.content.trim().is_empty() => Some(edited.content),
        PreviewDecision::Edit(_) => Some(text),
        PreviewDecision::Retry | PreviewDecision::Cancel => {
            tracing::info!(template = %template.name, "side prompt dropped in preview");
            None
        }
    }
}

/// Upsert `item` into every target. Fails only when no target was written.
fn write_targets(host: &Host<'_>, targets: &[Target], item: &UpsertItem) -> Result<Vec<String>, StmbError> {
    let mut written = Vec::new();
    let mut last_error = None;
    for target in targets {
        let mut book = target.book.clone();
        book.upsert_by_title(item);
        match host.lorebooks.save(&target.name, &book) {
            Ok(()) => written.push(target.name.clone()),
            Err(err) => {
                tracing::warn!(lorebook = %target.name, title = %item.title, "side prompt write failed: {err:#}");
                last_error = Some(err);
            }
        }
    }
    match (written.is_empty(), last_error) {
        (true, Some(err)) => Err(StmbError::Lorebook(format!(
            "failed to save {:?}: {err:#}",
            item.title
        ))),
        _ => Ok(written),
    }
}

fn count_visible_since(transcript: &dyn Transcript, exclusive_start: i64, inclusive_end: i64) -> i64 {
    let start = exclusive_start.max(-1) + 1;
    let end = inclusive_end.min(transcript.len_i64() - 1);
    (start..=end)
        .filter_map(|i| usize::try_from(i).ok())
        .filter_map(|i| transcript.message(i))
        .filter(|m| m.is_countable())
        .count() as i64
}

fn default_target(engine: &Engine, host: &Host<'_>) -> Result<Target, StmbError> {
    let meta = host.metadata.load().map_err(StmbError::Other)?;
    let (name, book) = require_strict(&engine.config, host, &meta)?;
    Ok(Target { name, book })
}

struct AfterMemoryJob {
    template: SidePromptTemplate,
    targets: Vec<Target>,
    request: CompletionRequest,
    last_msg_id: i64,
}

struct WaveResult {
    index: usize,
    completed_at: Instant,
    outcome: Result<String, StmbError>,
}

/// Run one wave concurrently and wait for all of it.
fn run_wave(transport: &dyn CompletionTransport, jobs: &[AfterMemoryJob]) -> Vec<WaveResult> {
    std::thread::scope(|scope| {
        let handles = jobs
            .iter()
            .enumerate()
            .map(|(index, job)| {
                let request = &job.request;
                (
                    index,
                    scope.spawn(move || {
                        let outcome = call_model(transport, request);
                        (Instant::now(), outcome)
                    }),
                )
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|(index, handle)| match handle.join() {
                Ok((completed_at, outcome)) => WaveResult {
                    index,
                    completed_at,
                    outcome,
                },
                Err(_) => WaveResult {
                    index,
                    completed_at: Instant::now(),
                    outcome: Err(StmbError::Other(anyhow!("side prompt worker panicked"))),
                },
            })
            .collect()
    })
}

/// After-memory templates against the scene that was just memorized.
///
/// Waves of `max_concurrent` run in parallel; previews follow completion
/// order; approved results are written once per destination lorebook, and a
/// failed lorebook only fails the templates that target it.
pub fn run_after_memory(
    engine: &Engine,
    host: &Host<'_>,
    scene: &CompiledScene,
    profile: &ConnectionProfile,
) -> Result<AfterMemoryReport, StmbError> {
    let cfg = &engine.config;
    let mut report = SidePromptReport::default();
    let doc = host.templates.load().map_err(StmbError::Other)?;
    let templates = doc
        .list_by_trigger(&TriggerKind::OnAfterMemory)
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();
    if templates.is_empty() {
        return Ok(report);
    }
    let default = default_target(engine, host)?;

    for wave in templates.chunks(cfg.side_prompts.wave_size()) {
        let mut jobs = Vec::new();
        for template in wave {
            let connection = match connection_for(cfg, template, Some(profile)) {
                Ok(connection) => connection,
                Err(err) => {
                    report.fail(&template.name, &err);
                    continue;
                }
            };
            let targets = resolve_targets(host, template, &default);
            let existing = targets
                .first()
                .and_then(|t| existing_entry(&t.book, &template.name));
            let prior = existing.map(|e| e.content.clone()).unwrap_or_default();
            let last_msg_id = existing
                .and_then(|e| e.checkpoint(&template.key))
                .map_or(-1, |c| c.last_msg_id);
            let (previous, _) =
                previous_memories(&default.book, Some(scene.range), template.settings.previous_memories());
            tracing::info!(trigger = "onAfterMemory", template = %template.name, model = %connection.model, "side prompt attempt");
            jobs.push(AfterMemoryJob {
                request: CompletionRequest {
                    connection,
                    prompt: build_side_prompt(template, &prior, scene, &previous),
                    max_tokens: cfg.memory.max_tokens(),
                },
                template: template.clone(),
                targets,
                last_msg_id,
            });
        }

        let mut results = run_wave(host.transport, &jobs);
        results.sort_by_key(|r| r.completed_at);

        let mut approved = Vec::new();
        for result in results {
            let job = &jobs[result.index];
            match result.outcome {
                Ok(text) => match review(cfg, host, &job.template, text) {
                    Some(text) => approved.push((result.index, text)),
                    None => report.fail(&job.template.name, "canceled in preview"),
                },
                Err(err) => {
                    tracing::error!(template = %job.template.name, "side prompt failed: {err}");
                    report.fail(&job.template.name, &err);
                }
            }
        }

        let mut groups: BTreeMap<String, Vec<UpsertItem>> = BTreeMap::new();
        let run_at = now_rfc3339();
        for (index, text) in &approved {
            let job = &jobs[*index];
            let item = UpsertItem {
                title: entry_title(&job.template.name),
                content: text.clone(),
                placement: job.template.settings.lorebook.placement(),
                checkpoint: Some((
                    job.template.key.clone(),
                    Checkpoint {
                        last_msg_id: job.last_msg_id,
                        last_run_at: Some(run_at.clone()),
                    },
                )),
            };
            for target in &job.targets {
                groups.entry(target.name.clone()).or_default().push(item.clone());
            }
        }

        let mut failed_titles = BTreeMap::new();
        for (lorebook, items) in &groups {
            let saved = host.lorebooks.load(lorebook).and_then(|mut fresh| {
                fresh.batch_upsert(items);
                host.lorebooks.save(lorebook, &fresh)
            });
            if let Err(err) = saved {
                tracing::error!(%lorebook, "failed to save side prompt updates for this wave: {err:#}");
                for item in items {
                    failed_titles
                        .entry(item.title.clone())
                        .or_insert_with(|| format!("lorebook {lorebook:?}: {err:#}"));
                }
            }
        }
        let mut reported = BTreeSet::new();
        for (index, _) in &approved {
            let name = &jobs[*index].template.name;
            if !reported.insert(name.clone()) {
                continue;
            }
            match failed_titles.get(&entry_title(name)) {
                Some(error) => report.fail(name, error),
                None => {
                    tracing::info!(trigger = "onAfterMemory", template = %name, "side prompt updated");
                    report.succeeded.push(name.clone());
                }
            }
        }
    }

    if let Some(summary) = report.summary() {
        if report.failed.is_empty() {
            tracing::info!("side prompts after memory: {summary}");
        } else {
            tracing::warn!("side prompts after memory: {summary}");
        }
    }
    Ok(report)
}

enum TrackerStep {
    Saved,
    Skipped(String),
}

/// Interval templates whose threshold of new visible messages is met.
/// Does nothing during a dry run.
pub fn evaluate_trackers(engine: &Engine, host: &Host<'_>) -> Result<SidePromptReport, StmbError> {
    let mut report = SidePromptReport::default();
    if engine.is_dry_run() {
        tracing::debug!("dry run; trackers not evaluated");
        return Ok(report);
    }
    let doc = host.templates.load().map_err(StmbError::Other)?;
    let templates = doc
        .list_by_trigger(&TriggerKind::OnInterval)
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();
    if templates.is_empty() {
        return Ok(report);
    }
    let default = default_target(engine, host)?;
    let last = host.transcript.len_i64() - 1;
    if last < 0 {
        return Ok(report);
    }
    let now = now_epoch_millis().map_err(StmbError::Other)?;

    for template in &templates {
        match run_tracker(engine, host, template, &default, last, now) {
            Ok(TrackerStep::Saved) => report.succeeded.push(template.name.clone()),
            Ok(TrackerStep::Skipped(reason)) => {
                tracing::debug!(template = %template.name, "tracker skipped: {reason}");
                report.skipped.push(format!("{}: {reason}", template.name));
            }
            Err(err) => {
                tracing::error!(template = %template.name, "tracker failed: {err}");
                report.fail(&template.name, &err);
            }
        }
    }
    Ok(report)
}

fn run_tracker(
    engine: &Engine,
    host: &Host<'_>,
    template: &SidePromptTemplate,
    default: &Target,
    last: i64,
    now: u64,
) -> Result<TrackerStep, StmbError> {
    let cfg = &engine.config;
    let targets = resolve_targets(host, template, default);
    let existing = targets
        .first()
        .and_then(|t| existing_entry(&t.book, &template.name));
    let checkpoint = existing.and_then(|e| e.checkpoint(&template.key));
    let last_id = checkpoint.as_ref().map_or(-1, |c| c.last_msg_id);

    if let Some(ran_at) = checkpoint
        .as_ref()
        .and_then(|c| c.last_run_at.as_deref())
        .and_then(rfc3339_to_millis)
        && now.saturating_sub(ran_at) < INTERVAL_DEBOUNCE_MS
    {
        return Ok(TrackerStep::Skipped("ran less than 10 s ago".to_string()));
    }
    let since = count_visible_since(host.transcript, last_id, last);
    let threshold = template
        .interval_threshold()
        .unwrap_or(DEFAULT_INTERVAL_MESSAGES);
    if since < threshold {
        return Ok(TrackerStep::Skipped(format!(
            "{since} of {threshold} visible messages"
        )));
    }

    let start = (last_id + 1).max(last - WINDOW_CAP + 1).max(0);
    let scene = compile_scene(host.transcript, SceneRange::new(start, last))?;
    let prior = existing.map(|e| e.content.clone()).unwrap_or_default();
    let (previous, _) =
        previous_memories(&default.book, Some(scene.range), template.settings.previous_memories());
    let connection = connection_for(cfg, template, None)?;
    tracing::info!(
        trigger = "onInterval",
        template = %template.name,
        range = %scene.range.label(),
        since,
        threshold,
        model = %connection.model,
        "side prompt attempt"
    );
    let text = call_model(
        host.transport,
        &CompletionRequest {
            connection,
            prompt: build_side_prompt(template, &prior, &scene, &previous),
            max_tokens: cfg.memory.max_tokens(),
        },
    )?;
    let Some(text) = review(cfg, host, template, text) else {
        return Ok(TrackerStep::Skipped("canceled in preview".to_string()));
    };
    let item = UpsertItem {
        title: entry_title(&template.name),
        content: text,
        placement: template.settings.lorebook.placement(),
        checkpoint: Some((
            template.key.clone(),
            Checkpoint {
                last_msg_id: last,
                last_run_at: Some(now_rfc3339()),
            },
        )),
    };
    write_targets(host, &targets, &item)?;
    Ok(TrackerStep::Saved)
}

/// Split `"Name" X-Y`, `'Name' X-Y`, or `Name X-Y` into name and range text.
pub fn parse_name_and_range(input: &str) -> (String, Option<String>) {
    let s = input.trim();
    for quote in ['"', '\''] {
        if let Some(body) = s.strip_prefix(quote)
            && let Some(close) = body.find(quote)
            && close > 0
        {
            let rest = body[close + quote.len_utf8()..].trim();
            return (
                body[..close].to_string(),
                (!rest.is_empty()).then(|| rest.to_string()),
            );
        }
    }
    match trailing_range_start(s) {
        Some(at) => (s[..at].trim().to_string(), Some(s[at..].trim().to_string())),
        None => (s.to_string(), None),
    }
}

/// Byte offset of a trailing `digits dash digits` run.
fn trailing_range_start(s: &str) -> Option<usize> {
    let chars = s.trim_end().char_indices().collect::<Vec<_>>();
    let mut i = chars.len();
    let skip = |i: &mut usize, pred: &dyn Fn(char) -> bool| {
        let from = *i;
        while *i > 0 && pred(chars[*i - 1].1) {
            *i -= 1;
        }
        from - *i
    };
    if skip(&mut i, &|c| c.is_ascii_digit()) == 0 {
        return None;
    }
    skip(&mut i, &char::is_whitespace);
    if i == 0 || !matches!(chars[i - 1].1, '-' | '–' | '—') {
        return None;
    }
    i -= 1;
    skip(&mut i, &char::is_whitespace);
    if skip(&mut i, &|c| c.is_ascii_digit()) == 0 {
        return None;
    }
    Some(chars[i].0)
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualSidePromptRun {
    pub name: String,
    pub title: String,
    pub range: SceneRange,
    /// Lorebooks written; empty when the result was dropped in preview.
    pub lorebooks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// `sideprompt "Name" [X-Y]`.
pub fn run_side_prompt(engine: &Engine, host: &Host<'_>, args: &str) -> Result<ManualSidePromptRun, StmbError> {
    let cfg = &engine.config;
    let (name, range_arg) = parse_name_and_range(args);
    if name.trim().is_empty() {
        return Err(StmbError::SidePrompt(
            "name not provided; usage: sideprompt \"Name\" [X-Y]".to_string(),
        ));
    }
    let default = default_target(engine, host)?;
    let doc = host.templates.load().map_err(StmbError::Other)?;
    let template = doc
        .find_by_name(&name)
        .cloned()
        .ok_or_else(|| StmbError::SidePrompt(format!("template not found: {name}")))?;
    if !template.triggers.allows_command(MANUAL_COMMAND) {
        return Err(StmbError::SidePrompt(format!(
            "manual runs are disabled for {:?}; allow the {MANUAL_COMMAND} command in the template",
            template.name
        )));
    }
    let targets = resolve_targets(host, &template, &default);
    let existing = targets
        .first()
        .and_then(|t| existing_entry(&t.book, &template.name));
    let len = host.transcript.len_i64();
    if len == 0 {
        return Err(StmbError::InvalidScene("no messages available".to_string()));
    }

    let mut hint = None;
    let range = match range_arg {
        Some(raw) => {
            let (start, end) = parse_index_range(&raw).ok_or_else(|| {
                StmbError::InvalidScene(format!("invalid range format {raw:?}; use X-Y"))
            })?;
            if !(start >= 0 && start <= end && end < len) {
                return Err(StmbError::InvalidScene(format!(
                    "invalid message range {start}-{end} for a chat of {len} messages"
                )));
            }
            SceneRange::new(start, end)
        }
        None => {
            if engine.take_range_hint() {
                tracing::info!("{RANGE_HINT}");
                hint = Some(RANGE_HINT.to_string());
            }
            let last_id = existing
                .and_then(|e| e.manual_checkpoint(&template.key))
                .map_or(-1, |c| c.last_msg_id);
            let last = len - 1;
            SceneRange::new((last_id + 1).max(last - WINDOW_CAP + 1).max(0), last)
        }
    };

    let scene = compile_scene(host.transcript, range)?;
    let prior = existing.map(|e| e.content.clone()).unwrap_or_default();
    let (previous, _) =
        previous_memories(&default.book, Some(scene.range), template.settings.previous_memories());
    let connection = connection_for(cfg, &template, None)?;
    tracing::info!(trigger = "manual", template = %template.name, range = %scene.range.label(), model = %connection.model, "side prompt attempt");
    let text = call_model(
        host.transport,
        &CompletionRequest {
            connection,
            prompt: build_side_prompt(&template, &prior, &scene, &previous),
            max_tokens: cfg.memory.max_tokens(),
        },
    )?;

    let title = entry_title(&template.name);
    let Some(text) = review(cfg, host, &template, text) else {
        return Ok(ManualSidePromptRun {
            name: template.name,
            title,
            range: scene.range,
            lorebooks: Vec::new(),
            hint,
        });
    };
    let item = UpsertItem {
        title: title.clone(),
        content: text,
        placement: template.settings.lorebook.placement(),
        checkpoint: Some((
            template.key.clone(),
            Checkpoint {
                last_msg_id: scene.range.end,
                last_run_at: Some(now_rfc3339()),
            },
        )),
    };
    let lorebooks = write_targets(host, &targets, &item)?;
    tracing::info!(trigger = "manual", template = %template.name, "side prompt updated");
    Ok(ManualSidePromptRun {
        name: template.name,
        title,
        range: scene.range,
        lorebooks,
        hint,
    })
}

/// `sideprompt-on|off <name|all>`.
pub fn set_side_prompt_enabled(host: &Host<'_>, target: &str, enabled: bool) -> Result<ToggleOutcome, StmbError> {
    let mut doc = host.templates.load().map_err(StmbError::Other)?;
    let outcome = doc
        .set_enabled(target, enabled)
        .map_err(|err| StmbError::SidePrompt(format!("{err:#}")))?;
    if !matches!(outcome, ToggleOutcome::AlreadySet { .. }) {
        host.templates.save(&doc).map_err(StmbError::Other)?;
    }
    Ok(outcome)
}
