use crate::error::StmbError;
use crate::stmb::binding::{auto_create_lorebook, effective_lorebook_name};
use crate::stmb::config::AutoSummaryConfig;
use crate::stmb::engine::Engine;
use crate::stmb::host::{ChatMetadata, Host};
use crate::stmb::lorebook::SceneRange;
use crate::stmb::markers::SceneMarkers;

pub const POSTPONE_STEPS: [i64; 5] = [10, 20, 30, 40, 50];
const LOREBOOK_PROMPT_DISMISSED: &str = "lorebook selection was dismissed";

/// Host events the scheduler listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEvent {
    /// A reply landed. Group chats defer to `GroupTurnFinished`.
    MessageReceived { group_chat: bool },
    GroupTurnFinished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    DryRun,
    Busy,
    GroupTurnPending,
    BelowThreshold { since: i64, required: i64 },
    PostponedUntil(i64),
    NoLorebook(String),
    EmptyRange,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("auto-summary is disabled"),
            Self::DryRun => f.write_str("dry-run generation in progress"),
            Self::Busy => f.write_str("memory creation in progress"),
            Self::GroupTurnPending => f.write_str("waiting for the group turn to finish"),
            Self::BelowThreshold { since, required } => write!(
                f,
                "{since} messages since the last memory, need {required} ({} more)",
                required - since
            ),
            Self::PostponedUntil(at) => write!(f, "postponed until message {at}"),
            Self::NoLorebook(reason) => write!(f, "lorebook unavailable: {reason}"),
            Self::EmptyRange => f.write_str("no messages left outside the buffer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerDecision {
    Skip(SkipReason),
    /// The operator deferred by this many messages.
    Postponed(i64),
    /// The range is staged; hand off to the memory pipeline.
    Fire { range: SceneRange, lorebook: String },
}

/// Steps that need nothing but the markers: threshold, then postponement.
pub fn check_threshold(
    markers: &SceneMarkers,
    chat_len: i64,
    cfg: &AutoSummaryConfig,
) -> Result<(), SkipReason> {
    let since = (chat_len - 1) - markers.watermark();
    let required = cfg.interval as i64 + cfg.clamped_buffer() as i64;
    if since < required {
        return Err(SkipReason::BelowThreshold { since, required });
    }
    if let Some(at) = markers.auto_summary_next_prompt_at
        && chat_len < at
    {
        return Err(SkipReason::PostponedUntil(at));
    }
    Ok(())
}

/// `[watermark + 1, max(0, chat_len - 1 - buffer)]`, or `None` when empty.
pub fn fire_range(markers: &SceneMarkers, chat_len: i64, buffer: u64) -> Option<SceneRange> {
    let start = markers.watermark() + 1;
    let end = (chat_len - 1 - buffer as i64).max(0);
    (start <= end).then(|| SceneRange::new(start, end))
}

fn postpone_options(names: &[String]) -> Vec<String> {
    names
        .iter()
        .cloned()
        .chain(POSTPONE_STEPS.iter().map(|n| format!("Postpone {n} messages")))
        .collect()
}

enum Destination {
    Lorebook(String),
    Postpone(i64),
    Unavailable(String),
}

fn resolve_destination(
    engine: &Engine,
    host: &Host<'_>,
    meta: &mut ChatMetadata,
) -> Result<Destination, StmbError> {
    let cfg = &engine.config;
    if let Some(name) = effective_lorebook_name(cfg, meta) {
        if host.lorebooks.exists(&name) {
            return Ok(Destination::Lorebook(name));
        }
        return Ok(Destination::Unavailable(format!(
            "selected lorebook \"{name}\" not found"
        )));
    }
    if !cfg.auto_summary.manual_mode_enabled {
        if !cfg.auto_summary.auto_create_lorebook {
            return Ok(Destination::Unavailable(
                "no lorebook is bound to this chat".to_string(),
            ));
        }
        return match auto_create_lorebook(cfg, host, meta) {
            Ok(name) => Ok(Destination::Lorebook(name)),
            Err(StmbError::Lorebook(reason)) => Ok(Destination::Unavailable(reason)),
            Err(err) => Err(err),
        };
    }

    let names = host.lorebooks.list_names().map_err(StmbError::Other)?;
    let options = postpone_options(&names);
    let picked = host.operator.choose(
        "Auto-summary is enabled but there is no assigned lorebook for this chat. \
         Select a lorebook or postpone.",
        &options,
    );
    Ok(match picked {
        Some(i) if i < names.len() => {
            meta.manual_lorebook = Some(names[i].clone());
            Destination::Lorebook(names[i].clone())
        }
        Some(i) => match POSTPONE_STEPS.get(i - names.len()) {
            Some(&n) => Destination::Postpone(n),
            None => Destination::Unavailable(LOREBOOK_PROMPT_DISMISSED.to_string()),
        },
        None => Destination::Unavailable(LOREBOOK_PROMPT_DISMISSED.to_string()),
    })
}

/// Evaluate one chat event. On `Fire` the range is already staged and saved.
pub fn on_chat_event(
    engine: &Engine,
    host: &Host<'_>,
    event: ChatEvent,
) -> Result<SchedulerDecision, StmbError> {
    let cfg = &engine.config.auto_summary;
    if !cfg.enabled {
        return Ok(SchedulerDecision::Skip(SkipReason::Disabled));
    }
    if matches!(event, ChatEvent::MessageReceived { group_chat: true }) {
        return Ok(SchedulerDecision::Skip(SkipReason::GroupTurnPending));
    }
    if engine.is_dry_run() {
        return Ok(SchedulerDecision::Skip(SkipReason::DryRun));
    }
    if engine.is_memory_processing() {
        tracing::debug!("auto-summary skipped, memory creation in progress");
        return Ok(SchedulerDecision::Skip(SkipReason::Busy));
    }

    let chat_len = host.transcript.len_i64();
    let mut meta = host.metadata.load().map_err(StmbError::Other)?;
    if let Err(reason) = check_threshold(&meta.markers, chat_len, cfg) {
        tracing::debug!(%reason, "auto-summary not triggered");
        return Ok(SchedulerDecision::Skip(reason));
    }

    let lorebook = match resolve_destination(engine, host, &mut meta)? {
        Destination::Lorebook(name) => name,
        Destination::Postpone(n) => {
            meta.markers.auto_summary_next_prompt_at = Some(chat_len + n);
            host.metadata.save(&meta).map_err(StmbError::Other)?;
            tracing::info!(messages = n, until = chat_len + n, "auto-summary postponed");
            return Ok(SchedulerDecision::Postponed(n));
        }
        Destination::Unavailable(reason) => {
            tracing::info!(%reason, "auto-summary blocked");
            return Ok(SchedulerDecision::Skip(SkipReason::NoLorebook(reason)));
        }
    };

    meta.markers.clear_postponement();
    let Some(range) = fire_range(&meta.markers, chat_len, cfg.clamped_buffer()) else {
        host.metadata.save(&meta).map_err(StmbError::Other)?;
        return Ok(SchedulerDecision::Skip(SkipReason::EmptyRange));
    };
    meta.markers.set_range(range.start, range.end, chat_len)?;
    host.metadata.save(&meta).map_err(StmbError::Other)?;
    tracing::info!(range = %range.label(), %lorebook, "auto-summary triggered");
    Ok(SchedulerDecision::Fire { range, lorebook })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmb::config::StmbConfig;
    use crate::stmb::host::{MetadataStore, Operator, PreviewDecision, ScriptedOperator};
    use crate::stmb::json_repair::MemoryJson;
    use crate::stmb::testing::Fixture;
    use serde_json::json;

    fn enabled_engine() -> Engine {
        let mut cfg = StmbConfig::default();
        cfg.auto_summary.enabled = true;
        Engine::new(cfg)
    }

    fn markers_at(watermark: Option<i64>) -> SceneMarkers {
        SceneMarkers {
            highest_memory_processed: watermark,
            ..SceneMarkers::default()
        }
    }

    #[test]
    fn fires_exactly_at_interval_plus_buffer() {
        let cfg = AutoSummaryConfig {
            enabled: true,
            ..AutoSummaryConfig::default()
        };
        for watermark in [None, Some(0), Some(17), Some(300)] {
            let markers = markers_at(watermark);
            let w = markers.watermark();
            for chat_len in (w + 1).max(1)..(w + 120) {
                let fires = check_threshold(&markers, chat_len, &cfg).is_ok();
                assert_eq!(fires, (chat_len - 1) - w >= 52, "w={w} len={chat_len}");
                if fires {
                    let range = fire_range(&markers, chat_len, cfg.clamped_buffer()).expect("range");
                    assert_eq!(range, SceneRange::new(w + 1, (chat_len - 3).max(0)));
                }
            }
        }
    }

    #[test]
    fn buffer_is_clamped_and_end_never_negative() {
        let cfg = AutoSummaryConfig {
            interval: 1,
            buffer: 500,
            ..AutoSummaryConfig::default()
        };
        assert_eq!(cfg.clamped_buffer(), 50);
        assert_eq!(fire_range(&markers_at(None), 10, cfg.clamped_buffer()), Some(SceneRange::new(0, 0)));
        assert_eq!(fire_range(&markers_at(Some(0)), 10, cfg.clamped_buffer()), None);
    }

    #[test]
    fn postponement_holds_until_target() {
        let cfg = AutoSummaryConfig::default();
        let markers = SceneMarkers {
            auto_summary_next_prompt_at: Some(130),
            ..SceneMarkers::default()
        };
        assert_eq!(
            check_threshold(&markers, 120, &cfg),
            Err(SkipReason::PostponedUntil(130))
        );
        assert!(check_threshold(&markers, 130, &cfg).is_ok());
    }

    #[test]
    fn fires_and_stages_range_for_bound_lorebook() {
        let engine = enabled_engine();
        let fx = Fixture::new(120, json!([]));
        let decision =
            on_chat_event(&engine, &fx.host(), ChatEvent::MessageReceived { group_chat: false })
                .expect("decision");
        assert_eq!(
            decision,
            SchedulerDecision::Fire {
                range: SceneRange::new(0, 117),
                lorebook: "LTM".to_string()
            }
        );
        assert_eq!(fx.metadata.get().markers.staged_range(), Some(SceneRange::new(0, 117)));
    }

    #[test]
    fn skips_when_disabled_dry_run_or_group_pending() {
        let fx = Fixture::new(120, json!([]));
        let disabled = Engine::new(StmbConfig::default());
        assert_eq!(
            on_chat_event(&disabled, &fx.host(), ChatEvent::GroupTurnFinished).expect("skip"),
            SchedulerDecision::Skip(SkipReason::Disabled)
        );

        let engine = enabled_engine();
        assert_eq!(
            on_chat_event(&engine, &fx.host(), ChatEvent::MessageReceived { group_chat: true })
                .expect("skip"),
            SchedulerDecision::Skip(SkipReason::GroupTurnPending)
        );
        engine.on_generation_started(true);
        assert_eq!(
            on_chat_event(&engine, &fx.host(), ChatEvent::GroupTurnFinished).expect("skip"),
            SchedulerDecision::Skip(SkipReason::DryRun)
        );
        assert_eq!(fx.metadata.get().markers.staged_range(), None);
    }

    #[test]
    fn skips_while_memory_flag_is_held() {
        let engine = enabled_engine();
        let fx = Fixture::new(120, json!([]));
        let _guard = engine.memory_flag.try_acquire().expect("flag");
        assert_eq!(
            on_chat_event(&engine, &fx.host(), ChatEvent::GroupTurnFinished).expect("skip"),
            SchedulerDecision::Skip(SkipReason::Busy)
        );
    }

    #[test]
    fn auto_creates_lorebook_from_template() {
        let mut cfg = StmbConfig::default();
        cfg.auto_summary.enabled = true;
        cfg.auto_summary.auto_create_lorebook = true;
        let engine = Engine::new(cfg);
        let mut fx = Fixture::new(60, json!([]));
        fx.metadata = Default::default();
        let decision = on_chat_event(&engine, &fx.host(), ChatEvent::GroupTurnFinished).expect("fire");
        let SchedulerDecision::Fire { lorebook, .. } = decision else {
            panic!("expected fire, got {decision:?}");
        };
        assert_eq!(lorebook, "LTM - Ava - bridge");
        assert_eq!(fx.metadata.get().bound_lorebook.as_deref(), Some("LTM - Ava - bridge"));
        assert!(fx.lorebooks.books.lock().expect("books").contains_key("LTM - Ava - bridge"));
    }

    #[test]
    fn manual_mode_postpones_then_waits() {
        let mut cfg = StmbConfig::default();
        cfg.auto_summary.enabled = true;
        cfg.auto_summary.manual_mode_enabled = true;
        let engine = Engine::new(cfg);
        let mut fx = Fixture::new(60, json!([]));
        fx.metadata = Default::default();
        fx.operator = ScriptedOperator::new(false, Some("Postpone 20 messages".to_string()));
        assert_eq!(
            on_chat_event(&engine, &fx.host(), ChatEvent::GroupTurnFinished).expect("postpone"),
            SchedulerDecision::Postponed(20)
        );
        assert_eq!(fx.metadata.get().markers.auto_summary_next_prompt_at, Some(80));
        assert_eq!(
            on_chat_event(&engine, &fx.host(), ChatEvent::GroupTurnFinished).expect("wait"),
            SchedulerDecision::Skip(SkipReason::PostponedUntil(80))
        );
    }

    struct PickIndex(Option<usize>);

    impl Operator for PickIndex {
        fn confirm(&self, _prompt: &str) -> bool {
            false
        }

        fn choose(&self, _prompt: &str, _options: &[String]) -> Option<usize> {
            self.0
        }

        fn present(&self, _heading: &str, _record: &MemoryJson) -> PreviewDecision {
            PreviewDecision::Cancel
        }
    }

    #[test]
    fn dismissed_or_out_of_range_pick_blocks_without_postponing() {
        let mut cfg = StmbConfig::default();
        cfg.auto_summary.enabled = true;
        cfg.auto_summary.manual_mode_enabled = true;
        let engine = Engine::new(cfg);
        for pick in [None, Some(99)] {
            let mut fx = Fixture::new(60, json!([]));
            fx.metadata = Default::default();
            let operator = PickIndex(pick);
            let host = Host {
                operator: &operator,
                ..fx.host()
            };
            let decision = on_chat_event(&engine, &host, ChatEvent::GroupTurnFinished).expect("blocked");
            assert!(matches!(decision, SchedulerDecision::Skip(SkipReason::NoLorebook(_))));
            assert_eq!(fx.metadata.get().markers.auto_summary_next_prompt_at, None);
        }
    }

    #[test]
    fn manual_mode_selection_is_remembered_and_clears_postponement() {
        let mut cfg = StmbConfig::default();
        cfg.auto_summary.enabled = true;
        cfg.auto_summary.manual_mode_enabled = true;
        let engine = Engine::new(cfg);
        let mut fx = Fixture::new(60, json!([]));
        fx.metadata = Default::default();
        fx.metadata
            .save(&ChatMetadata {
                markers: SceneMarkers {
                    auto_summary_next_prompt_at: Some(55),
                    ..SceneMarkers::default()
                },
                ..ChatMetadata::default()
            })
            .expect("seed");
        fx.operator = ScriptedOperator::new(false, Some("LTM".to_string()));
        let decision = on_chat_event(&engine, &fx.host(), ChatEvent::GroupTurnFinished).expect("fire");
        assert!(matches!(decision, SchedulerDecision::Fire { .. }));
        let meta = fx.metadata.get();
        assert_eq!(meta.manual_lorebook.as_deref(), Some("LTM"));
        assert_eq!(meta.markers.auto_summary_next_prompt_at, None);
    }
}
