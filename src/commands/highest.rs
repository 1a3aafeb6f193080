use anyhow::Result;

use crate::commands::{ChatOptions, CommandReport, Session};
use crate::stmb::markers::HighestUpdate;

#[derive(Debug, Clone)]
pub struct SetHighestOptions {
    pub chat: ChatOptions,
    pub value: String,
}

/// `stmb-highest`: where the next memory starts.
pub fn run_show(opts: &ChatOptions) -> Result<CommandReport> {
    let session = Session::open(opts)?;
    let host = session.host();
    let mut report = CommandReport::new("stmb-highest");
    let meta = host.metadata.load()?;
    let markers = &meta.markers;
    let chat_len = host.transcript.len_i64();

    match markers.highest_memory_processed {
        Some(value) if markers.highest_memory_processed_manually_set => {
            report.detail(format!("highest memory processed: {value} (set manually)"));
        }
        Some(value) => report.detail(format!("highest memory processed: {value}")),
        None => report.detail("highest memory processed: none"),
    }
    match markers.compute_next_range(chat_len) {
        Some(range) => report.detail(format!("next memory covers messages {}", range.label())),
        None => report.detail("no new messages since the last memory"),
    }
    if let Some(range) = markers.staged_range() {
        report.detail(format!("staged scene: messages {}", range.label()));
    }
    let auto = &session.engine.config.auto_summary;
    if auto.enabled {
        let due = markers.watermark() + i64::try_from(auto.interval).unwrap_or(i64::MAX);
        report.detail(format!("auto-summary due after message {due}"));
        if let Some(at) = markers.auto_summary_next_prompt_at {
            report.detail(format!("auto-summary postponed until message {at}"));
        }
    }
    Ok(report)
}

/// `stmb-set-highest <n|none>`.
pub fn run_set(opts: &SetHighestOptions) -> Result<CommandReport> {
    let session = Session::open(&opts.chat)?;
    let host = session.host();
    let mut report = CommandReport::new("stmb-set-highest");
    let mut meta = host.metadata.load()?;

    let update = match meta
        .markers
        .set_highest_command(&opts.value, host.transcript.len_i64())
    {
        Ok(update) => update,
        Err(err) => {
            session.fail(&mut report, "markers", &err);
            return Ok(report);
        }
    };
    host.metadata.save(&meta)?;

    let message = match update {
        HighestUpdate::Cleared => {
            "highest memory processed cleared; the next memory starts at message 0".to_string()
        }
        HighestUpdate::Set(value) => format!("highest memory processed set to {value}"),
        HighestUpdate::Clamped { requested, applied } => format!(
            "highest memory processed set to {applied} (requested {requested}, clamped to the last message)"
        ),
    };
    tracing::info!("{message}");
    session.audit("markers", "ok", &message);
    report.detail(message);
    Ok(report)
}

