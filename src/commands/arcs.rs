use anyhow::Result;

use crate::commands::{ChatOptions, CommandReport, Session};
use crate::stmb::arcs::{ArcOptions, ArcOutcome, consolidate_arcs};
use crate::stmb::lorebook::OrderMode;

#[derive(Debug, Clone, Default)]
pub struct ArcsOptions {
    pub chat: ChatOptions,
    /// Memory uids to consolidate; every eligible memory when empty.
    pub uids: Vec<u64>,
    pub max_items_per_pass: Option<usize>,
    pub max_passes: Option<u32>,
    pub order_mode: Option<String>,
    pub order_value: Option<i64>,
    pub disable_originals: Option<bool>,
}

pub(crate) fn describe_outcome(session: &Session, report: &mut CommandReport, outcome: &ArcOutcome) {
    for arc in &outcome.arcs {
        report.detail(format!(
            "created \"{}\" (order {}, {} memories)",
            arc.title,
            arc.order,
            arc.members.len()
        ));
    }
    if !outcome.leftovers.is_empty() {
        report.detail(format!("{} memories left unassigned", outcome.leftovers.len()));
    }
    if outcome.disabled_originals > 0 {
        report.detail(format!("disabled {} original memories", outcome.disabled_originals));
    }
    session.audit(
        "arcs",
        "ok",
        &format!("{} arcs in {}", outcome.arcs.len(), outcome.lorebook),
    );
}

pub fn run(opts: &ArcsOptions) -> Result<CommandReport> {
    let session = Session::open(&opts.chat)?;
    let mut report = CommandReport::new("arcs");

    let mut options = ArcOptions::from_config(&session.engine.config.arcs);
    options.profile_index = session.profile_index;
    if let Some(max) = opts.max_items_per_pass {
        options.max_items_per_pass = max;
    }
    if let Some(max) = opts.max_passes {
        options.max_passes = max;
    }
    if let Some(raw) = opts.order_mode.as_deref() {
        let Some(mode) = OrderMode::parse(raw) else {
            report.issue(format!("invalid order mode `{raw}`; use auto, manual or reverse"));
            return Ok(report);
        };
        options.order_mode = mode;
    }
    if let Some(value) = opts.order_value {
        options.order_value = value;
    }
    if let Some(disable) = opts.disable_originals {
        options.disable_originals = disable;
    }

    let selected = (!opts.uids.is_empty()).then_some(opts.uids.as_slice());
    match consolidate_arcs(&session.engine, &session.host(), selected, &options) {
        Ok(outcome) => {
            report.detail(format!("{} pass(es) over {}", outcome.passes, outcome.lorebook));
            describe_outcome(&session, &mut report, &outcome);
        }
        Err(err) => {
            session.fail(&mut report, "arcs", &err);
            if session.engine.last_arc_failure().is_some() {
                report.detail("the raw response was kept; submit corrected JSON with repair-arcs");
            }
        }
    }
    session.close()?;
    Ok(report)
}
