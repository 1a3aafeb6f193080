use anyhow::Result;

use crate::commands::{ChatOptions, CommandReport, Session};
use crate::stmb::pipeline::{MemoryRequest, create_memory};
use crate::stmb::scheduler::{ChatEvent, SchedulerDecision, on_chat_event};
use crate::stmb::sideprompts::evaluate_trackers;

#[derive(Debug, Clone, Default)]
pub struct ChatEventOptions {
    pub chat: ChatOptions,
    /// The reply landed in a group chat.
    pub group: bool,
    /// Every group member has spoken.
    pub turn_finished: bool,
    /// The generation behind this event was a dry run.
    pub dry_run: bool,
}

/// Feed one host event to the scheduler, then to the interval trackers.
pub fn run(opts: &ChatEventOptions) -> Result<CommandReport> {
    let session = Session::open(&opts.chat)?;
    let mut report = CommandReport::new("chat-event");
    if opts.dry_run {
        session.engine.on_generation_started(true);
    }
    let event = if opts.turn_finished {
        ChatEvent::GroupTurnFinished
    } else {
        ChatEvent::MessageReceived {
            group_chat: opts.group,
        }
    };
    let host = session.host();

    match on_chat_event(&session.engine, &host, event) {
        Ok(SchedulerDecision::Skip(reason)) => report.detail(format!("auto-summary skipped: {reason}")),
        Ok(SchedulerDecision::Postponed(n)) => {
            report.detail(format!("auto-summary postponed by {n} messages"));
            session.audit("scheduler", "postponed", &format!("{n} messages"));
        }
        Ok(SchedulerDecision::Fire { range, lorebook }) => {
            report.detail(format!(
                "auto-summary triggered for messages {} into {lorebook}",
                range.label()
            ));
            let request = MemoryRequest {
                profile_index: session.profile_index,
                context_memories: None,
            };
            match create_memory(&session.engine, &host, &request) {
                Ok(outcome) => super::memory::describe_outcome(&session, &mut report, &outcome),
                Err(err) => session.fail(&mut report, "memory", &err),
            }
        }
        Err(err) => session.fail(&mut report, "scheduler", &err),
    }

    match evaluate_trackers(&session.engine, &host) {
        Ok(trackers) => {
            if let Some(summary) = trackers.summary() {
                report.detail(format!("trackers: {summary}"));
            }
            for skipped in &trackers.skipped {
                report.detail(format!("tracker skipped: {skipped}"));
            }
            for failure in &trackers.failed {
                report.issue(format!("tracker {} failed: {}", failure.name, failure.error));
            }
        }
        Err(err) => session.fail(&mut report, "sideprompt", &err),
    }
    session.close()?;
    Ok(report)
}
