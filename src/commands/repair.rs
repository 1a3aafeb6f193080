use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::commands::{ChatOptions, CommandReport, Session};
use crate::stmb::arcs::apply_manual_arc_json;
use crate::stmb::pipeline::apply_manual_memory_json;
use crate::stmb::util::truncate_with_ellipsis;

const RAW_PREVIEW_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTarget {
    Memory,
    Arcs,
}

#[derive(Debug, Clone)]
pub struct RepairOptions {
    pub chat: ChatOptions,
    pub target: RepairTarget,
    /// Corrected JSON. Without it the stored failure is shown instead.
    pub input: Option<PathBuf>,
}

fn show_failure(session: &Session, target: RepairTarget, report: &mut CommandReport) {
    let failure = match target {
        RepairTarget::Memory => session.engine.last_failure().map(|f| {
            (
                format!("memory for messages {} in {}", f.scene.range.label(), f.lorebook),
                f.code,
                f.message,
                f.raw,
            )
        }),
        RepairTarget::Arcs => session.engine.last_arc_failure().map(|f| {
            (
                format!("{} selected memories in {}", f.selected.len(), f.lorebook),
                f.code,
                f.message,
                f.raw,
            )
        }),
    };
    match failure {
        Some((what, code, message, raw)) => {
            report.detail(format!("last failure: {what}"));
            report.detail(format!("{code}: {message}"));
            report.detail(format!("raw response:\n{}", truncate_with_ellipsis(&raw, RAW_PREVIEW_CHARS)));
        }
        None => report.detail("nothing to repair"),
    }
}

pub fn run(opts: &RepairOptions) -> Result<CommandReport> {
    let session = Session::open(&opts.chat)?;
    let mut report = CommandReport::new(match opts.target {
        RepairTarget::Memory => "repair-memory",
        RepairTarget::Arcs => "repair-arcs",
    });

    let Some(path) = opts.input.as_ref() else {
        show_failure(&session, opts.target, &mut report);
        return Ok(report);
    };
    let corrected =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;

    let host = session.host();
    match opts.target {
        RepairTarget::Memory => match apply_manual_memory_json(&session.engine, &host, &corrected) {
            Ok(outcome) => super::memory::describe_outcome(&session, &mut report, &outcome),
            Err(err) => session.fail(&mut report, "memory", &err),
        },
        RepairTarget::Arcs => match apply_manual_arc_json(&session.engine, &host, &corrected) {
            Ok(outcome) => super::arcs::describe_outcome(&session, &mut report, &outcome),
            Err(err) => session.fail(&mut report, "arcs", &err),
        },
    }
    session.close()?;
    Ok(report)
}
