//! Consolidate memories into arc entries.
//!
//! Candidates are fed to the model in passes of at most `max_items_per_pass`.
//! Whatever a pass leaves unassigned joins the front of the next pass, so
//! every selected memory ends up in exactly one arc or in the leftovers.

use crate::error::{AiErrorCode, AiResponseError, StmbError};
use crate::stmb::binding::require_strict;
use crate::stmb::compile::{check_token_budget, estimate_tokens};
use crate::stmb::config::ArcConfig;
use crate::stmb::engine::Engine;
use crate::stmb::host::Host;
use crate::stmb::json_repair::{ArcJson, parse_arc_json, unwrap_envelope};
use crate::stmb::lorebook::{
    EntryPlacement, Lorebook, LorebookEntry, OrderMode, SceneRange, parse_title_order,
};
use crate::stmb::profile::{FixedConnection, resolve_connection, validate_profile};
use crate::stmb::transport::CompletionRequest;
use crate::stmb::util::now_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};

pub const METHOD_ARC: &str = "arc-consolidation";

const DEFAULT_ARC_PROMPT: &str = r#"You are organizing a story's memories into narrative arcs.
Group the memories below into one or more arcs. An arc is a stretch of the story with a clear beginning, a through-line, and an outcome.
Leave out any memory that does not clearly belong to an arc.

Respond with ONLY valid JSON in this exact format:
{
  "arcs": [
    {
      "title": "Short arc title",
      "summary": "A summary of the arc in narrative prose.",
      "keywords": ["keyword1", "keyword2"],
      "member_ids": ["001", "002"]
    }
  ],
  "unassigned_memories": [{"id": "003"}]
}

Use the bracketed ids shown below in member_ids and unassigned_memories. When you return more than one arc, every arc must list its member_ids."#;

/// Tunables for one consolidation run, clamped to their legal ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcOptions {
    pub max_items_per_pass: usize,
    pub max_passes: u32,
    /// Advisory only: smaller arcs are logged, never dropped.
    pub min_assigned: usize,
    pub token_target: u64,
    pub order_mode: OrderMode,
    pub order_value: i64,
    pub reverse_start: i64,
    pub disable_originals: bool,
    pub prompt: Option<String>,
    pub profile_index: Option<usize>,
}

impl ArcOptions {
    pub fn from_config(cfg: &ArcConfig) -> Self {
        Self {
            max_items_per_pass: cfg.max_items_per_pass as usize,
            max_passes: u32::try_from(cfg.max_passes).unwrap_or(u32::MAX),
            min_assigned: cfg.min_assigned as usize,
            token_target: cfg.token_target,
            order_mode: cfg.order_mode,
            order_value: cfg.order_value,
            reverse_start: cfg.reverse_start,
            disable_originals: cfg.disable_originals,
            prompt: cfg.prompt.clone(),
            profile_index: None,
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.max_items_per_pass = self.max_items_per_pass.max(1);
        self.max_passes = self.max_passes.max(1);
        self.min_assigned = self.min_assigned.max(1);
        self.token_target = self.token_target.max(1000);
        self.order_value = self.order_value.clamp(0, 9999);
        self.reverse_start = self.reverse_start.clamp(100, 9999);
        self
    }
}

/// A memory offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ArcCandidate {
    pub uid: u64,
    pub title: String,
    pub content: String,
    pub keywords: Vec<String>,
    pub scene_range: Option<SceneRange>,
}

/// An arc with membership resolved to entry uids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedArc {
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub members: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArcAnalysis {
    pub arcs: Vec<ResolvedArc>,
    pub leftovers: Vec<u64>,
    pub passes: u32,
    pub raw: Vec<String>,
}

/// Context kept after a failed run so corrected JSON can be committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedArcRun {
    pub lorebook: String,
    pub selected: Vec<u64>,
    pub options: ArcOptions,
    pub code: String,
    pub message: String,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommittedArc {
    pub uid: u64,
    pub title: String,
    pub order: i64,
    pub members: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArcOutcome {
    pub lorebook: String,
    pub arcs: Vec<CommittedArc>,
    pub leftovers: Vec<u64>,
    pub passes: u32,
    pub disabled_originals: usize,
}

/// Enabled, non-arc memories in title order, then uid.
pub fn arc_candidates(book: &Lorebook) -> Vec<ArcCandidate> {
    let mut out = book
        .entries
        .values()
        .filter(|e| e.stmemorybooks && !e.stmb_arc && !e.disable)
        .map(|e| ArcCandidate {
            uid: e.uid,
            title: e.comment.clone(),
            content: e.content.clone(),
            keywords: e.key.clone(),
            scene_range: e.scene_range,
        })
        .collect::<Vec<_>>();
    out.sort_by_key(|c| (parse_title_order(&c.title).unwrap_or(0), c.uid));
    out
}

/// Id token the model sees for the item at `index` in a batch.
fn position_token(index: usize) -> String {
    format!("{:03}", index + 1)
}

pub fn build_arc_prompt(custom: Option<&str>, items: &[ArcCandidate]) -> String {
    let instructions = custom
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_ARC_PROMPT);
    let mut out = vec![instructions.to_string(), String::new(), "=== MEMORIES ===".to_string()];
    for (i, item) in items.iter().enumerate() {
        out.push(format!("[{}] {}", position_token(i), item.title));
        out.push(item.content.clone());
        if !item.keywords.is_empty() {
            out.push(format!("Keywords: {}", item.keywords.join(", ")));
        }
        out.push(String::new());
    }
    out.push("=== END MEMORIES ===".to_string());
    out.join("\n")
}

/// Maps a model id (raw uid, `007`, or `7`) back to a uid in `items`.
struct IdResolver(HashMap<String, u64>);

impl IdResolver {
    fn new(items: &[ArcCandidate]) -> Self {
        let mut map = HashMap::new();
        for (i, item) in items.iter().enumerate() {
            map.entry(item.uid.to_string()).or_insert(item.uid);
            map.entry(position_token(i)).or_insert(item.uid);
            map.entry((i + 1).to_string()).or_insert(item.uid);
        }
        Self(map)
    }

    fn resolve(&self, raw: &str) -> Option<u64> {
        let key = raw.trim().trim_start_matches('[').trim_end_matches(']');
        self.0.get(key).copied()
    }
}

/// Result of mapping one parsed response onto its batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PassResult {
    pub arcs: Vec<ResolvedArc>,
    /// Batch uids not claimed by any arc, in batch order.
    pub leftovers: Vec<u64>,
}

/// Resolve membership for one batch. A uid lands in at most one arc.
pub fn resolve_pass(
    items: &[ArcCandidate],
    parsed: &ArcJson,
    raw: &str,
) -> Result<PassResult, AiResponseError> {
    if parsed.arcs.len() > 1
        && parsed
            .arcs
            .iter()
            .any(|a| a.member_ids.as_ref().is_none_or(Vec::is_empty))
    {
        return Err(AiResponseError::new(
            AiErrorCode::Malformed,
            "multiple arcs require member_ids on every arc to avoid ambiguous assignment",
            raw,
        ));
    }
    let resolver = IdResolver::new(items);
    let unassigned = parsed
        .unassigned
        .iter()
        .filter_map(|id| resolver.resolve(id))
        .collect::<BTreeSet<_>>();
    let default_members = items
        .iter()
        .map(|i| i.uid)
        .filter(|uid| !unassigned.contains(uid))
        .collect::<Vec<_>>();

    let mut claimed = BTreeSet::new();
    let mut arcs = Vec::new();
    for draft in &parsed.arcs {
        let wanted: Vec<u64> = match draft.member_ids.as_deref() {
            Some(ids) if !ids.is_empty() => ids.iter().filter_map(|id| resolver.resolve(id)).collect(),
            _ => default_members.clone(),
        };
        let members = wanted
            .into_iter()
            .filter(|uid| claimed.insert(*uid))
            .collect::<Vec<_>>();
        if members.is_empty() {
            tracing::debug!(title = %draft.title, "arc resolved to no members; skipped");
            continue;
        }
        arcs.push(ResolvedArc {
            title: draft.title.clone(),
            summary: draft.summary.clone(),
            keywords: draft.keywords.clone(),
            members,
        });
    }
    let leftovers = items
        .iter()
        .map(|i| i.uid)
        .filter(|uid| !claimed.contains(uid))
        .collect();
    Ok(PassResult { arcs, leftovers })
}

/// Failure of a run, with the raw text of the pass that broke it.
#[derive(Debug)]
pub struct ArcRunError {
    pub error: StmbError,
    pub raw: String,
}

/// Run passes until the pool is empty, the pass budget runs out, or a pass
/// makes no progress. Any failing pass aborts the run.
pub fn run_arc_analysis(
    host: &Host<'_>,
    candidates: &[ArcCandidate],
    options: &ArcOptions,
    connection: &FixedConnection,
    max_tokens: Option<u64>,
) -> Result<ArcAnalysis, ArcRunError> {
    let fail = |error: StmbError, raw: &str| ArcRunError {
        error,
        raw: raw.to_string(),
    };
    let by_uid = candidates
        .iter()
        .map(|c| (c.uid, c))
        .collect::<HashMap<_, _>>();
    let mut pool = candidates.to_vec();
    let mut analysis = ArcAnalysis::default();

    while !pool.is_empty() && analysis.passes < options.max_passes {
        analysis.passes += 1;
        let take = options.max_items_per_pass.min(pool.len());
        let rest = pool.split_off(take);
        let batch = pool;

        let prompt = build_arc_prompt(options.prompt.as_deref(), &batch);
        check_token_budget(estimate_tokens(&prompt), options.token_target).map_err(|e| fail(e, ""))?;
        tracing::info!(pass = analysis.passes, items = batch.len(), "running arc analysis pass");

        let response = host
            .transport
            .complete(&CompletionRequest {
                connection: connection.clone(),
                prompt,
                max_tokens,
            })
            .map_err(|e| fail(StmbError::Transport(e), ""))?;
        if let Some(truncated) = response.truncation() {
            let raw = truncated.raw.clone();
            return Err(fail(truncated.into(), &raw));
        }
        let text = if response.text.trim().is_empty() {
            unwrap_envelope(&response.raw).map_err(|e| {
                let raw = e.raw.clone();
                fail(e.into(), &raw)
            })?
        } else {
            response.text
        };
        let parsed = parse_arc_json(&text).map_err(|e| fail(e.into(), &text))?;
        let result = resolve_pass(&batch, &parsed, &text).map_err(|e| fail(e.into(), &text))?;
        analysis.raw.push(text);

        let progressed = result.leftovers.len() < batch.len();
        for arc in &result.arcs {
            if arc.members.len() < options.min_assigned {
                tracing::info!(title = %arc.title, members = arc.members.len(), "arc is smaller than the suggested minimum");
            }
        }
        analysis.arcs.extend(result.arcs);
        pool = result
            .leftovers
            .iter()
            .filter_map(|uid| by_uid.get(uid).map(|c| (*c).clone()))
            .chain(rest)
            .collect();
        if !progressed {
            tracing::info!(pass = analysis.passes, "arc pass made no progress; stopping");
            break;
        }
    }

    analysis.leftovers = pool.iter().map(|c| c.uid).collect();
    if analysis.arcs.is_empty() {
        let raw = analysis.raw.join("\n\n");
        return Err(ArcRunError {
            error: AiResponseError::new(
                AiErrorCode::ArcNoUsableArcs,
                "no usable arcs were produced from the model response",
                raw.clone(),
            )
            .into(),
            raw,
        });
    }
    Ok(analysis)
}

fn member_ranges(book: &Lorebook, members: &[u64]) -> Vec<SceneRange> {
    let mut ranges = members
        .iter()
        .filter_map(|uid| book.entry_by_uid(*uid).and_then(|e| e.scene_range))
        .collect::<Vec<_>>();
    ranges.sort_by_key(|r| (r.start, r.end));
    ranges
}

/// Write arcs as new entries; optionally disable their members.
pub fn commit_arcs(
    host: &Host<'_>,
    name: &str,
    book: &Lorebook,
    arcs: &[ResolvedArc],
    options: &ArcOptions,
) -> Result<(Vec<CommittedArc>, usize), StmbError> {
    let mut updated = book.clone();
    let existing = updated.arc_count() as i64;
    let mut committed = Vec::new();
    let mut disabled = 0;
    for (i, arc) in arcs.iter().enumerate() {
        let sequence = i as i64 + 1;
        let number = existing + sequence;
        let order = options
            .order_mode
            .order_for(sequence, 100, options.order_value, options.reverse_start);
        let ranges = member_ranges(&updated, &arc.members);
        let span = ranges
            .first()
            .zip(ranges.iter().map(|r| r.end).max())
            .map(|(first, end)| SceneRange::new(first.start, end));
        let title = format!("[ARC {number:03}] {}", arc.title.trim());
        let mut entry = LorebookEntry {
            comment: title.clone(),
            content: arc.summary.trim().to_string(),
            key: arc.keywords.clone(),
            stmemorybooks: true,
            stmb_arc: true,
            scene_range: span,
            member_ranges: ranges,
            generation_method: Some(METHOD_ARC.to_string()),
            ..LorebookEntry::default()
        };
        entry.apply_placement(&EntryPlacement {
            order,
            ..EntryPlacement::default()
        });
        entry.extra.insert("stmbArcMembers".to_string(), json!(arc.members));
        entry.extra.insert("stmbCreatedAt".to_string(), json!(now_rfc3339()));
        let uid = updated.create_entry(entry);

        if options.disable_originals {
            for member in &arc.members {
                if let Some(original) = updated.entry_by_uid_mut(*member)
                    && !original.disable
                {
                    original.disable = true;
                    disabled += 1;
                }
            }
        }
        committed.push(CommittedArc {
            uid,
            title,
            order,
            members: arc.members.clone(),
        });
    }
    host.lorebooks.save(name, &updated).map_err(|err| {
        StmbError::Other(err.context(format!("failed to write arcs to lorebook {name:?}")))
    })?;
    Ok((committed, disabled))
}

/// Consolidate `selected` memories (all candidates when `None`).
pub fn consolidate_arcs(
    engine: &Engine,
    host: &Host<'_>,
    selected: Option<&[u64]>,
    options: &ArcOptions,
) -> Result<ArcOutcome, StmbError> {
    let _guard = engine.arc_flag.acquire_or_busy()?;
    let cfg = &engine.config;
    let options = options.clone().normalized();
    let meta = host.metadata.load().map_err(StmbError::Other)?;
    let (lorebook, book) = require_strict(cfg, host, &meta)?;

    let candidates = arc_candidates(&book)
        .into_iter()
        .filter(|c| selected.is_none_or(|ids| ids.contains(&c.uid)))
        .collect::<Vec<_>>();
    if candidates.is_empty() {
        return Err(StmbError::InvalidMemory(
            "select at least one memory to consolidate".to_string(),
        ));
    }

    let profile = cfg.profile(options.profile_index);
    let connection = resolve_connection(&profile.connection, &cfg.host.active);
    validate_profile(profile, &connection)?;

    let analysis = match run_arc_analysis(host, &candidates, &options, &connection, cfg.memory.max_tokens()) {
        Ok(analysis) => analysis,
        Err(ArcRunError { error, raw }) => {
            tracing::error!(code = error.code(), "arc analysis failed: {error}");
            if let StmbError::AiResponse(ai) = &error {
                engine.set_last_arc_failure(Some(FailedArcRun {
                    lorebook: lorebook.clone(),
                    selected: candidates.iter().map(|c| c.uid).collect(),
                    options: options.clone(),
                    code: ai.code.as_str().to_string(),
                    message: ai.message.clone(),
                    raw,
                }));
            }
            return Err(error);
        }
    };

    let (arcs, disabled_originals) = commit_arcs(host, &lorebook, &book, &analysis.arcs, &options)?;
    engine.set_last_arc_failure(None);
    tracing::info!(arcs = arcs.len(), leftovers = analysis.leftovers.len(), passes = analysis.passes, %lorebook, "arcs created");
    Ok(ArcOutcome {
        lorebook,
        arcs,
        leftovers: analysis.leftovers,
        passes: analysis.passes,
        disabled_originals,
    })
}

/// Commit hand-corrected arc JSON for the last failed run. Ids resolve
/// against the whole original selection.
pub fn apply_manual_arc_json(
    engine: &Engine,
    host: &Host<'_>,
    corrected: &str,
) -> Result<ArcOutcome, StmbError> {
    let _guard = engine.arc_flag.acquire_or_busy()?;
    let failure = engine.last_arc_failure().ok_or_else(|| {
        StmbError::InvalidMemory("there is no failed arc run to repair".to_string())
    })?;
    let corrected = corrected.trim();
    if corrected.is_empty() {
        return Err(StmbError::InvalidMemory("corrected JSON is empty".to_string()));
    }
    let book = host.lorebooks.load(&failure.lorebook).map_err(|err| {
        StmbError::Lorebook(format!("failed to load lorebook {:?}: {err:#}", failure.lorebook))
    })?;
    let items = arc_candidates(&book)
        .into_iter()
        .filter(|c| failure.selected.contains(&c.uid))
        .collect::<Vec<_>>();
    let parsed = parse_arc_json(corrected)?;
    if parsed.arcs.is_empty() {
        return Err(AiResponseError::new(
            AiErrorCode::ArcNoUsableArcs,
            "corrected JSON is missing arcs",
            corrected,
        )
        .into());
    }
    let result = resolve_pass(&items, &parsed, corrected)?;
    let (arcs, disabled_originals) =
        commit_arcs(host, &failure.lorebook, &book, &result.arcs, &failure.options)?;
    engine.set_last_arc_failure(None);
    tracing::info!(arcs = arcs.len(), lorebook = %failure.lorebook, "arcs repaired manually");
    Ok(ArcOutcome {
        lorebook: failure.lorebook,
        arcs,
        leftovers: result.leftovers,
        passes: 0,
        disabled_originals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmb::config::StmbConfig;
    use crate::stmb::json_repair::ArcDraft;
    use crate::stmb::testing::Fixture;
    use crate::stmb::transport::{CompletionResponse, CompletionTransport};
    use serde_json::Value;
    use std::sync::Mutex;

    fn items(n: u64) -> Vec<ArcCandidate> {
        (0..n)
            .map(|i| ArcCandidate {
                uid: 10 + i,
                title: format!("[{:03}] - M{i}", i + 1),
                content: format!("memory {i}"),
                keywords: Vec::new(),
                scene_range: Some(SceneRange::new(i as i64 * 10, i as i64 * 10 + 9)),
            })
            .collect()
    }

    fn draft(title: &str, ids: Option<&[&str]>) -> ArcDraft {
        ArcDraft {
            title: title.to_string(),
            summary: format!("{title} summary."),
            keywords: Vec::new(),
            member_ids: ids.map(|ids| ids.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Replay entries as model text.
    fn replies(values: Value) -> Value {
        let texts = values
            .as_array()
            .into_iter()
            .flatten()
            .map(|v| match v {
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            })
            .collect();
        Value::Array(texts)
    }

    fn seeded_fixture(count: u64, responses: Value) -> Fixture {
        let fx = Fixture::new(100, replies(responses));
        if let Ok(mut books) = fx.lorebooks.books.lock() {
            let book = books.get_mut("LTM").expect("book");
            for i in 0..count {
                book.create_entry(LorebookEntry {
                    comment: format!("[{:03}] - M{i}", i + 1),
                    content: format!("memory {i}"),
                    stmemorybooks: true,
                    scene_range: Some(SceneRange::new(i as i64 * 10, i as i64 * 10 + 9)),
                    ..LorebookEntry::default()
                });
            }
        }
        fx
    }

    fn engine() -> Engine {
        let mut cfg = StmbConfig::default();
        cfg.host.active.model = "test-model".to_string();
        Engine::new(cfg)
    }

    /// Reads the `[NNN]` tokens out of each prompt and answers by a fixed
    /// rule: first third to arc A, second third to arc B (by uid-ish ids
    /// mixed with sequence ids), the rest unassigned, plus one unknown id
    /// and one duplicate.
    struct RuleTransport {
        passes: Mutex<u32>,
    }

    impl CompletionTransport for RuleTransport {
        fn complete(&self, request: &CompletionRequest) -> anyhow::Result<CompletionResponse> {
            let tokens = request
                .prompt
                .lines()
                .filter_map(|l| l.strip_prefix('[').and_then(|r| r.get(..3)))
                .filter(|t| t.chars().all(|c| c.is_ascii_digit()))
                .map(str::to_string)
                .collect::<Vec<_>>();
            let pass = {
                let mut passes = self.passes.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
                *passes += 1;
                *passes
            };
            let third = tokens.len().div_ceil(3);
            let a = tokens.iter().take(third).cloned().collect::<Vec<_>>();
            let mut b = tokens
                .iter()
                .skip(third)
                .take(third)
                .map(|t| t.trim_start_matches('0').to_string())
                .collect::<Vec<_>>();
            b.extend(a.first().cloned());
            b.push("999".to_string());
            let rest = tokens.iter().skip(2 * third).map(|t| json!({"id": t})).collect::<Vec<_>>();
            let body = if pass % 4 == 0 {
                json!({"arcs": [], "unassigned_memories": rest})
            } else {
                json!({
                    "arcs": [
                        {"title": "A", "summary": "Arc A.", "keywords": [], "member_ids": a},
                        {"title": "B", "summary": "Arc B.", "keywords": [], "member_ids": b}
                    ],
                    "unassigned_memories": rest
                })
            };
            Ok(CompletionResponse {
                text: body.to_string(),
                raw: Value::Null,
            })
        }
    }

    #[test]
    fn every_item_lands_in_one_arc_or_the_leftovers() {
        for n in 1..=25u64 {
            for k in 1..=6usize {
                let candidates = items(n);
                let transport = RuleTransport {
                    passes: Mutex::new(0),
                };
                let fx = Fixture::new(1, json!([]));
                let options = ArcOptions {
                    max_items_per_pass: k,
                    max_passes: 50,
                    ..ArcOptions::from_config(&ArcConfig::default())
                };
                let host = Host {
                    transport: &transport,
                    ..fx.host()
                };
                let analysis = match run_arc_analysis(&host, &candidates, &options, &FixedConnection::default(), None) {
                    Ok(analysis) => analysis,
                    Err(err) => {
                        assert_eq!(err.error.code(), "ARC_NO_USABLE_ARCS", "n={n} k={k}");
                        continue;
                    }
                };
                let mut seen = analysis
                    .arcs
                    .iter()
                    .flat_map(|a| a.members.iter().copied())
                    .chain(analysis.leftovers.iter().copied())
                    .collect::<Vec<_>>();
                let total = seen.len();
                seen.sort_unstable();
                seen.dedup();
                assert_eq!(seen.len(), total, "duplicate item for n={n} k={k}");
                assert_eq!(seen, candidates.iter().map(|c| c.uid).collect::<Vec<_>>(), "n={n} k={k}");
            }
        }
    }

    #[test]
    fn ids_resolve_by_uid_padded_sequence_and_position() {
        let batch = items(3);
        let parsed = ArcJson {
            arcs: vec![draft("A", Some(&["10", "002", "3", "nope"]))],
            unassigned: Vec::new(),
        };
        let result = resolve_pass(&batch, &parsed, "").expect("resolve");
        assert_eq!(result.arcs[0].members, vec![10, 11, 12]);
        assert!(result.leftovers.is_empty());
    }

    #[test]
    fn single_arc_without_members_takes_all_assigned() {
        let batch = items(4);
        let parsed = ArcJson {
            arcs: vec![draft("A", None)],
            unassigned: vec!["004".to_string()],
        };
        let result = resolve_pass(&batch, &parsed, "").expect("resolve");
        assert_eq!(result.arcs[0].members, vec![10, 11, 12]);
        assert_eq!(result.leftovers, vec![13]);
    }

    #[test]
    fn multiple_arcs_without_members_are_rejected() {
        let batch = items(4);
        let parsed = ArcJson {
            arcs: vec![draft("A", Some(&["001"])), draft("B", None)],
            unassigned: Vec::new(),
        };
        let err = resolve_pass(&batch, &parsed, "raw").expect_err("ambiguous");
        assert_eq!(err.code, AiErrorCode::Malformed);
        assert_eq!(err.raw, "raw");
    }

    #[test]
    fn leftovers_carry_into_the_next_pass() {
        let fx = Fixture::new(1, replies(json!([
            {"arcs": [{"title": "A", "summary": "Arc A.", "member_ids": ["001"]}], "unassigned_memories": [{"id": "002"}]},
            {"arcs": [{"title": "B", "summary": "Arc B.", "member_ids": ["001", "002"]}]}
        ])));
        let options = ArcOptions {
            max_items_per_pass: 2,
            ..ArcOptions::from_config(&ArcConfig::default())
        };
        let analysis =
            run_arc_analysis(&fx.host(), &items(3), &options, &FixedConnection::default(), None).expect("analysis");
        assert_eq!(analysis.passes, 2);
        assert_eq!(analysis.arcs[1].members, vec![11, 12]);
        assert!(analysis.leftovers.is_empty());
        assert!(fx.transport.prompts()[1].contains("[001] [002] - M1"));
    }

    #[test]
    fn no_progress_stops_and_empty_output_is_an_error() {
        let fx = Fixture::new(1, replies(json!([{"arcs": [], "unassigned_memories": []}])));
        let err = run_arc_analysis(
            &fx.host(),
            &items(3),
            &ArcOptions::from_config(&ArcConfig::default()),
            &FixedConnection::default(),
            None,
        )
        .expect_err("no arcs");
        assert_eq!(err.error.code(), "ARC_NO_USABLE_ARCS");
        assert_eq!(fx.transport.remaining(), 0);
    }

    #[test]
    fn max_passes_bounds_the_run() {
        let fx = Fixture::new(1, replies(json!([
            {"arcs": [{"title": "A", "summary": "Arc A.", "member_ids": ["001"]}]},
            {"arcs": [{"title": "B", "summary": "Arc B.", "member_ids": ["001"]}]}
        ])));
        let options = ArcOptions {
            max_items_per_pass: 1,
            max_passes: 1,
            ..ArcOptions::from_config(&ArcConfig::default())
        };
        let analysis =
            run_arc_analysis(&fx.host(), &items(3), &options, &FixedConnection::default(), None).expect("analysis");
        assert_eq!(analysis.passes, 1);
        assert_eq!(analysis.leftovers, vec![11, 12]);
    }

    #[test]
    fn commit_orders_follow_mode() {
        let fx = seeded_fixture(0, json!([]));
        let book = Lorebook::default();
        let arcs = vec![
            ResolvedArc {
                title: "A".to_string(),
                summary: "a".to_string(),
                keywords: Vec::new(),
                members: Vec::new(),
            },
            ResolvedArc {
                title: "B".to_string(),
                summary: "b".to_string(),
                keywords: Vec::new(),
                members: Vec::new(),
            },
        ];
        let mut options = ArcOptions::from_config(&ArcConfig::default());
        let orders = |options: &ArcOptions| {
            commit_arcs(&fx.host(), "LTM", &book, &arcs, options)
                .expect("commit")
                .0
                .iter()
                .map(|a| a.order)
                .collect::<Vec<_>>()
        };
        assert_eq!(orders(&options), vec![101, 102]);
        options.order_mode = OrderMode::Manual;
        options.order_value = 42;
        assert_eq!(orders(&options), vec![42, 42]);
        options.order_mode = OrderMode::Reverse;
        options.reverse_start = 9999;
        assert_eq!(orders(&options), vec![9998, 9997]);
    }

    #[test]
    fn commit_orders_count_only_arcs_from_this_run() {
        let fx = seeded_fixture(0, json!([]));
        let mut book = Lorebook::default();
        book.create_entry(LorebookEntry {
            comment: "[ARC 001] Old".to_string(),
            content: "old arc".to_string(),
            stmemorybooks: true,
            stmb_arc: true,
            ..LorebookEntry::default()
        });
        let arcs = vec![ResolvedArc {
            title: "New".to_string(),
            summary: "n".to_string(),
            keywords: Vec::new(),
            members: Vec::new(),
        }];
        let mut options = ArcOptions::from_config(&ArcConfig::default());
        let (committed, _) = commit_arcs(&fx.host(), "LTM", &book, &arcs, &options).expect("auto");
        assert_eq!(committed[0].order, 101);
        assert_eq!(committed[0].title, "[ARC 002] New");

        options.order_mode = OrderMode::Reverse;
        options.reverse_start = 9999;
        let (committed, _) = commit_arcs(&fx.host(), "LTM", &book, &arcs, &options).expect("reverse");
        assert_eq!(committed[0].order, 9998);
    }

    #[test]
    fn options_are_clamped() {
        let options = ArcOptions {
            max_items_per_pass: 0,
            max_passes: 0,
            min_assigned: 0,
            token_target: 5,
            order_value: -4,
            reverse_start: 50,
            ..ArcOptions::from_config(&ArcConfig::default())
        }
        .normalized();
        assert_eq!(options.max_items_per_pass, 1);
        assert_eq!(options.max_passes, 1);
        assert_eq!(options.min_assigned, 1);
        assert_eq!(options.token_target, 1000);
        assert_eq!(options.order_value, 0);
        assert_eq!(options.reverse_start, 100);
    }

    #[test]
    fn consolidation_writes_arcs_and_disables_originals() {
        let engine = engine();
        let fx = seeded_fixture(3, json!([
            {"arcs": [{"title": "Journey", "summary": "They crossed the pass.", "keywords": ["pass"], "member_ids": ["001", "002"]}],
             "unassigned_memories": ["003"]}
        ]));
        let options = ArcOptions {
            disable_originals: true,
            ..ArcOptions::from_config(&engine.config.arcs)
        };
        let outcome = consolidate_arcs(&engine, &fx.host(), None, &options).expect("arcs");
        assert_eq!(outcome.arcs.len(), 1);
        assert_eq!(outcome.arcs[0].title, "[ARC 001] Journey");
        assert_eq!(outcome.leftovers, vec![2]);
        assert_eq!(outcome.disabled_originals, 2);

        let book = fx.lorebooks.get("LTM");
        let arc = book.entry_by_uid(outcome.arcs[0].uid).expect("arc");
        assert!(arc.stmb_arc);
        assert_eq!(arc.member_ranges, vec![SceneRange::new(0, 9), SceneRange::new(10, 19)]);
        assert_eq!(arc.scene_range, Some(SceneRange::new(0, 19)));
        assert!(book.entry_by_uid(0).expect("m0").disable);
        assert!(!book.entry_by_uid(2).expect("m2").disable);
        assert!(!engine.arc_flag.is_held());
    }

    #[test]
    fn failed_run_can_be_repaired_manually() {
        let engine = engine();
        let fx = seeded_fixture(2, json!(["{\"arcs\": [{\"title\": \"Half"]));
        let options = ArcOptions::from_config(&engine.config.arcs);
        let err = consolidate_arcs(&engine, &fx.host(), Some(&[0, 1]), &options).expect_err("fail");
        assert_eq!(err.code(), "UNBALANCED");
        let failure = engine.last_arc_failure().expect("slot");
        assert_eq!(failure.selected, vec![0, 1]);
        assert!(failure.raw.contains("Half"));

        let outcome = apply_manual_arc_json(
            &engine,
            &fx.host(),
            r#"{"arcs": [{"title": "Whole", "summary": "All of it.", "keywords": []}]}"#,
        )
        .expect("repair");
        assert_eq!(outcome.arcs[0].members, vec![0, 1]);
        assert!(engine.last_arc_failure().is_none());
        assert_eq!(fx.lorebooks.get("LTM").arc_count(), 1);
    }

    #[test]
    fn busy_arc_flag_rejects_second_run() {
        let engine = engine();
        let fx = seeded_fixture(2, json!([]));
        let _held = engine.arc_flag.try_acquire().expect("flag");
        let err = consolidate_arcs(&engine, &fx.host(), None, &ArcOptions::from_config(&engine.config.arcs))
            .expect_err("busy");
        assert!(matches!(err, StmbError::Busy(_)));
        assert!(!engine.is_memory_processing());
    }
}
