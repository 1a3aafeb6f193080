//! Scene to memory: compile, ask the model, parse, review, commit.
//!
//! Every entry point holds the engine's memory flag for its whole run; the
//! guard drops on every return path.

use crate::error::StmbError;
use crate::stmb::binding::resolve_for_memory;
use crate::stmb::compile::{
    CompiledScene, check_token_budget, compile_scene, estimate_tokens, memory_prompt,
    previous_memories,
};
use crate::stmb::config::{MAX_PREVIOUS_MEMORIES, StmbConfig};
use crate::stmb::engine::Engine;
use crate::stmb::host::{ChatMetadata, Host, PreviewDecision};
use crate::stmb::json_repair::{MemoryJson, parse_model_json, unwrap_envelope};
use crate::stmb::lorebook::{
    EntryPlacement, Lorebook, LorebookEntry, SceneRange, TitleContext, render_title,
};
use crate::stmb::markers::check_overlap;
use crate::stmb::profile::{ConnectionProfile, resolve_connection, validate_profile};
use crate::stmb::sideprompts::{AfterMemoryReport, run_after_memory};
use crate::stmb::transport::CompletionRequest;
use crate::stmb::util::now_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

pub const MAX_USER_RETRIES: u32 = 3;
pub const METHOD_STRUCTURED: &str = "json-structured-output";
pub const METHOD_MANUAL_REPAIR: &str = "manual-json-repair";

#[derive(Debug, Clone, Default)]
pub struct MemoryRequest {
    /// Index into the configured profiles; the default profile when `None`.
    pub profile_index: Option<usize>,
    /// Previous memories to include as context; the configured count when `None`.
    pub context_memories: Option<u64>,
}

/// Everything needed to finish a memory without calling the model again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMemory {
    pub scene: CompiledScene,
    pub profile: ConnectionProfile,
    pub lorebook: String,
    pub code: String,
    pub message: String,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommittedMemory {
    pub title: String,
    pub uid: u64,
    pub lorebook: String,
    pub range: SceneRange,
    /// Model calls made, including retries.
    pub attempts: u32,
    pub context_memories: usize,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_prompts: Option<AfterMemoryReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MemoryOutcome {
    Committed(CommittedMemory),
    Cancelled { reason: String },
}

enum Review {
    Commit(MemoryJson),
    Retry,
    Cancel(String),
}

enum Step {
    Committed { uid: u64, title: String },
    Retry,
    Cancelled(String),
}

/// Turn the staged scene into a memory entry.
pub fn create_memory(
    engine: &Engine,
    host: &Host<'_>,
    request: &MemoryRequest,
) -> Result<MemoryOutcome, StmbError> {
    let _guard = engine.memory_flag.acquire_or_busy()?;
    let cfg = &engine.config;
    let chat_len = host.transcript.len_i64();

    let mut meta = host.metadata.load().map_err(StmbError::Other)?;
    if meta.markers.validate_against(chat_len) {
        tracing::warn!("staged scene no longer fits the chat; cleared it");
        host.metadata.save(&meta).map_err(StmbError::Other)?;
    }
    let range = meta.markers.staged_range().ok_or_else(|| {
        StmbError::InvalidScene("no scene selected; stage one with scenememory X-Y or nextmemory".to_string())
    })?;

    let (lorebook, mut book) = resolve_for_memory(cfg, host, &mut meta)?;
    if !cfg.memory.allow_scene_overlap {
        check_overlap(range, &book.memory_records())?;
    }

    let profile = cfg.profile(request.profile_index).clone();
    let connection = resolve_connection(&profile.connection, &cfg.host.active);
    validate_profile(&profile, &connection)?;

    if cfg.memory.convert_existing_recursion {
        convert_existing_recursion(host, &lorebook, &mut book, &profile);
    }

    let mut scene = compile_scene(host.transcript, range)?;
    let wanted = request
        .context_memories
        .unwrap_or(cfg.memory.default_memory_count)
        .min(MAX_PREVIOUS_MEMORIES) as usize;
    let (previous, warning) = previous_memories(&book, Some(range), wanted);
    let mut warnings = Vec::new();
    if let Some(warning) = warning {
        tracing::warn!("{warning}");
        warnings.push(warning);
    }
    scene.previous = previous;

    let prompt = memory_prompt(&profile.effective_prompt(), &scene);
    check_token_budget(estimate_tokens(&prompt), cfg.memory.token_warning_threshold)?;
    let completion = CompletionRequest {
        connection,
        prompt,
        max_tokens: cfg.memory.max_tokens(),
    };

    let mut automatic_retries = 0u64;
    let mut user_retries = 0u32;
    let mut attempts = 0u32;
    let (uid, title) = loop {
        attempts += 1;
        tracing::info!(range = %range.label(), attempt = attempts, %lorebook, "generating memory");
        let step = generate(host, &completion)
            .and_then(|memory| review(cfg, host, range, memory, &mut user_retries))
            .and_then(|review| match review {
                Review::Commit(memory) => commit_entry(
                    cfg,
                    host,
                    &lorebook,
                    &book,
                    &scene,
                    &profile,
                    &memory,
                    METHOD_STRUCTURED,
                )
                .map(|(uid, title)| Step::Committed { uid, title }),
                Review::Retry => Ok(Step::Retry),
                Review::Cancel(reason) => Ok(Step::Cancelled(reason)),
            });
        match step {
            Ok(Step::Committed { uid, title }) => break (uid, title),
            Ok(Step::Retry) => {
                tracing::info!(retry = user_retries, max = MAX_USER_RETRIES, "regenerating memory at operator request");
            }
            Ok(Step::Cancelled(reason)) => {
                tracing::info!(%reason, "memory creation cancelled");
                return Ok(MemoryOutcome::Cancelled { reason });
            }
            Err(err) if err.is_retryable() && automatic_retries < cfg.retry.max_retries => {
                automatic_retries += 1;
                tracing::warn!(
                    attempt = attempts,
                    code = err.code(),
                    delay_ms = cfg.retry.retry_delay_ms,
                    "memory creation failed, retrying: {err}"
                );
                std::thread::sleep(Duration::from_millis(cfg.retry.retry_delay_ms));
            }
            Err(err) => {
                tracing::error!(attempts, code = err.code(), "memory creation failed: {err}");
                if let StmbError::AiResponse(ai) = &err {
                    engine.set_last_failure(Some(FailedMemory {
                        scene: scene.clone(),
                        profile: profile.clone(),
                        lorebook: lorebook.clone(),
                        code: ai.code.as_str().to_string(),
                        message: ai.message.clone(),
                        raw: ai.raw.clone(),
                    }));
                }
                return Err(err);
            }
        }
    };

    let side_prompts = finish(engine, host, &mut meta, &scene, &profile)?;
    tracing::info!(%title, uid, %lorebook, attempts, "memory created");
    Ok(MemoryOutcome::Committed(CommittedMemory {
        title,
        uid,
        lorebook,
        range,
        attempts,
        context_memories: scene.previous.len(),
        warnings,
        side_prompts,
    }))
}

/// Commit hand-corrected JSON for the last failed memory.
pub fn apply_manual_memory_json(
    engine: &Engine,
    host: &Host<'_>,
    corrected: &str,
) -> Result<MemoryOutcome, StmbError> {
    let _guard = engine.memory_flag.acquire_or_busy()?;
    let failure = engine.last_failure().ok_or_else(|| {
        StmbError::InvalidMemory("there is no failed memory to repair".to_string())
    })?;
    let memory = parse_model_json(corrected)?;
    let book = host.lorebooks.load(&failure.lorebook).map_err(|err| {
        StmbError::Lorebook(format!("failed to load lorebook {:?}: {err:#}", failure.lorebook))
    })?;
    let (uid, title) = commit_entry(
        &engine.config,
        host,
        &failure.lorebook,
        &book,
        &failure.scene,
        &failure.profile,
        &memory,
        METHOD_MANUAL_REPAIR,
    )?;
    let mut meta = host.metadata.load().map_err(StmbError::Other)?;
    let side_prompts = finish(engine, host, &mut meta, &failure.scene, &failure.profile)?;
    tracing::info!(%title, uid, lorebook = %failure.lorebook, "memory repaired manually");
    Ok(MemoryOutcome::Committed(CommittedMemory {
        title,
        uid,
        lorebook: failure.lorebook,
        range: failure.scene.range,
        attempts: 0,
        context_memories: failure.scene.previous.len(),
        warnings: Vec::new(),
        side_prompts,
    }))
}

fn generate(host: &Host<'_>, request: &CompletionRequest) -> Result<MemoryJson, StmbError> {
    let response = host
        .transport
        .complete(request)
        .map_err(StmbError::Transport)?;
    if let Some(truncated) = response.truncation() {
        return Err(truncated.into());
    }
    let text = if response.text.trim().is_empty() {
        unwrap_envelope(&response.raw)?
    } else {
        response.text
    };
    Ok(parse_model_json(&text)?)
}

fn review(
    cfg: &StmbConfig,
    host: &Host<'_>,
    range: SceneRange,
    memory: MemoryJson,
    user_retries: &mut u32,
) -> Result<Review, StmbError> {
    if !cfg.memory.show_memory_previews {
        return Ok(Review::Commit(memory));
    }
    let heading = format!("Memory preview (messages {})", range.label());
    match host.operator.present(&heading, &memory) {
        PreviewDecision::Accept => Ok(Review::Commit(memory)),
        PreviewDecision::Edit(edited) => {
            if edited.title.trim().is_empty() || edited.content.trim().is_empty() {
                return Err(StmbError::InvalidMemory(
                    "edited memory needs both a title and content".to_string(),
                ));
            }
            Ok(Review::Commit(edited))
        }
        PreviewDecision::Retry if *user_retries >= MAX_USER_RETRIES => Ok(Review::Cancel(format!(
            "maximum retry attempts ({MAX_USER_RETRIES}) reached"
        ))),
        PreviewDecision::Retry => {
            *user_retries += 1;
            Ok(Review::Retry)
        }
        PreviewDecision::Cancel => Ok(Review::Cancel("cancelled at preview".to_string())),
    }
}

fn memory_placement(profile: &ConnectionProfile, sequence: i64) -> EntryPlacement {
    EntryPlacement {
        activation: profile.const_vect_mode.activation(),
        position: profile.position,
        order: profile
            .order_mode
            .order_for(sequence, 0, profile.order_value, profile.reverse_start),
        prevent_recursion: profile.prevent_recursion,
        delay_until_recursion: profile.delay_until_recursion,
        outlet_name: profile.outlet_name.clone(),
    }
}

/// Write a new memory entry. `book` is untouched; the store gets a copy.
#[allow(clippy::too_many_arguments)]
fn commit_entry(
    cfg: &StmbConfig,
    host: &Host<'_>,
    name: &str,
    book: &Lorebook,
    scene: &CompiledScene,
    profile: &ConnectionProfile,
    memory: &MemoryJson,
    method: &str,
) -> Result<(u64, String), StmbError> {
    let mut updated = book.clone();
    let sequence = updated.next_memory_sequence();
    let title = render_title(
        &profile.title_format(&cfg.memory.title_format),
        &TitleContext {
            title: memory.title.trim(),
            sequence,
            range: scene.range,
            character: &scene.character,
            user: &scene.user,
        },
    );
    let mut entry = LorebookEntry {
        comment: title.clone(),
        content: memory.content.trim().to_string(),
        key: memory.keywords.clone(),
        stmemorybooks: true,
        scene_range: Some(scene.range),
        generation_method: Some(method.to_string()),
        ..LorebookEntry::default()
    };
    entry.apply_placement(&memory_placement(profile, sequence));
    entry.extra.insert("stmbProfile".to_string(), json!(profile.name));
    entry.extra.insert("stmbCreatedAt".to_string(), json!(now_rfc3339()));
    entry
        .extra
        .insert("stmbMessageCount".to_string(), json!(scene.message_count()));
    let uid = updated.create_entry(entry);
    host.lorebooks.save(name, &updated).map_err(|err| {
        StmbError::Other(err.context(format!("failed to add memory to lorebook {name:?}")))
    })?;
    Ok((uid, title))
}

/// Post-commit bookkeeping shared by the automatic and repair paths.
fn finish(
    engine: &Engine,
    host: &Host<'_>,
    meta: &mut ChatMetadata,
    scene: &CompiledScene,
    profile: &ConnectionProfile,
) -> Result<Option<AfterMemoryReport>, StmbError> {
    meta.markers.advance_watermark(scene.range.end);
    meta.markers.clear();
    meta.markers.clear_postponement();
    host.metadata.save(meta).map_err(StmbError::Other)?;
    engine.set_last_failure(None);

    match run_after_memory(engine, host, scene, profile) {
        Ok(report) => Ok((!report.is_empty()).then_some(report)),
        Err(err) => {
            tracing::warn!("after-memory side prompts failed: {err}");
            Ok(None)
        }
    }
}

/// Align recursion flags on every memory entry with the profile when the
/// oldest memory disagrees with it. Save failures are logged, not raised.
fn convert_existing_recursion(
    host: &Host<'_>,
    name: &str,
    book: &mut Lorebook,
    profile: &ConnectionProfile,
) -> usize {
    let target = (profile.prevent_recursion, profile.delay_until_recursion);
    let Some(earliest) = book.memory_entries().first().map(|e| (e.prevent_recursion, e.delay_until_recursion)) else {
        return 0;
    };
    if earliest == target {
        return 0;
    }
    let mut updated = 0;
    for entry in book.entries.values_mut().filter(|e| e.stmemorybooks) {
        if (entry.prevent_recursion, entry.delay_until_recursion) != target {
            entry.prevent_recursion = target.0;
            entry.delay_until_recursion = target.1;
            updated += 1;
        }
    }
    if updated > 0 {
        match host.lorebooks.save(name, book) {
            Ok(()) => tracing::info!(updated, lorebook = name, "updated recursion flags on memory entries"),
            Err(err) => tracing::warn!(lorebook = name, "failed to save recursion conversion: {err:#}"),
        }
    }
    updated
}
