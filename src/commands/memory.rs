use anyhow::Result;

use crate::commands::{ChatOptions, CommandReport, Session};
use crate::error::StmbError;
use crate::stmb::lorebook::SceneRange;
use crate::stmb::pipeline::{MemoryOutcome, MemoryRequest, create_memory};
use crate::stmb::util::parse_index_range;

/// Which scene the memory covers.
#[derive(Debug, Clone)]
pub enum SceneSelection {
    /// Whatever is already staged in the chat metadata.
    Staged,
    /// `X-Y`, staged before generating.
    Range(String),
    /// Everything after the watermark.
    Next,
}

#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub chat: ChatOptions,
    pub selection: SceneSelection,
    pub context_memories: Option<u64>,
}

fn command_name(selection: &SceneSelection) -> &'static str {
    match selection {
        SceneSelection::Staged => "creatememory",
        SceneSelection::Range(_) => "scenememory",
        SceneSelection::Next => "nextmemory",
    }
}

fn stage(session: &Session, selection: &SceneSelection) -> Result<Option<SceneRange>, StmbError> {
    let host = session.host();
    let chat_len = host.transcript.len_i64();
    let mut meta = host.metadata.load()?;
    let range = match selection {
        SceneSelection::Staged => return Ok(meta.markers.staged_range()),
        SceneSelection::Range(raw) => {
            let (start, end) = parse_index_range(raw).ok_or_else(|| {
                StmbError::InvalidScene(format!("invalid range {raw:?}; use X-Y, e.g. 0-10"))
            })?;
            meta.markers.set_range(start, end, chat_len)?
        }
        SceneSelection::Next => {
            let Some(range) = meta.markers.compute_next_range(chat_len) else {
                return Err(StmbError::InvalidScene(
                    "no new messages since the last memory".to_string(),
                ));
            };
            meta.markers.set_range(range.start, range.end, chat_len)?
        }
    };
    host.metadata.save(&meta)?;
    Ok(Some(range))
}

/// Append the outcome of a memory run to `report`.
pub(crate) fn describe_outcome(session: &Session, report: &mut CommandReport, outcome: &MemoryOutcome) {
    match outcome {
        MemoryOutcome::Committed(memory) => {
            report.detail(format!(
                "created memory \"{}\" in {} (messages {}, uid {})",
                memory.title,
                memory.lorebook,
                memory.range.label(),
                memory.uid
            ));
            if memory.context_memories > 0 {
                report.detail(format!("context memories: {}", memory.context_memories));
            }
            for warning in &memory.warnings {
                report.detail(format!("warning: {warning}"));
            }
            if let Some(summary) = memory.side_prompts.as_ref().and_then(|r| r.summary()) {
                report.detail(format!("side prompts: {summary}"));
            }
            session.audit(
                "memory",
                "ok",
                &format!("committed {} in {}", memory.title, memory.lorebook),
            );
        }
        MemoryOutcome::Cancelled { reason } => {
            report.detail(format!("memory cancelled: {reason}"));
            session.audit("memory", "cancelled", reason);
        }
    }
}

pub fn run(opts: &MemoryOptions) -> Result<CommandReport> {
    let session = Session::open(&opts.chat)?;
    let mut report = CommandReport::new(command_name(&opts.selection));

    match stage(&session, &opts.selection) {
        Ok(Some(range)) => report.detail(format!("scene: messages {}", range.label())),
        Ok(None) => {}
        Err(err) => {
            session.fail(&mut report, "memory", &err);
            return Ok(report);
        }
    }

    let request = MemoryRequest {
        profile_index: session.profile_index,
        context_memories: opts.context_memories,
    };
    match create_memory(&session.engine, &session.host(), &request) {
        Ok(outcome) => describe_outcome(&session, &mut report, &outcome),
        Err(err) => session.fail(&mut report, "memory", &err),
    }
    session.close()?;
    Ok(report)
}
