use anyhow::Result;

use crate::commands::{ChatOptions, CommandReport, Session};
use crate::stmb::sideprompts::templates::ToggleOutcome;
use crate::stmb::sideprompts::{run_side_prompt, set_side_prompt_enabled};

#[derive(Debug, Clone)]
pub struct SidePromptOptions {
    pub chat: ChatOptions,
    /// `"Name" [X-Y]`, joined from the command line.
    pub args: String,
}

#[derive(Debug, Clone)]
pub struct ToggleOptions {
    pub chat: ChatOptions,
    pub target: String,
    pub enabled: bool,
}

/// `sideprompt "Name" [X-Y]`.
pub fn run(opts: &SidePromptOptions) -> Result<CommandReport> {
    let session = Session::open(&opts.chat)?;
    let mut report = CommandReport::new("sideprompt");

    match run_side_prompt(&session.engine, &session.host(), &opts.args) {
        Ok(run) => {
            if let Some(hint) = &run.hint {
                report.detail(hint.clone());
            }
            if run.lorebooks.is_empty() {
                report.detail(format!("\"{}\" was discarded in preview", run.name));
            } else {
                report.detail(format!(
                    "updated \"{}\" for messages {} in {}",
                    run.title,
                    run.range.label(),
                    run.lorebooks.join(", ")
                ));
            }
            session.audit(
                "sideprompt",
                "ok",
                &format!("{} ({})", run.name, run.range.label()),
            );
        }
        Err(err) => session.fail(&mut report, "sideprompt", &err),
    }
    session.close()?;
    Ok(report)
}

/// `sideprompt-on|off <name|all>`.
pub fn run_toggle(opts: &ToggleOptions) -> Result<CommandReport> {
    let session = Session::open(&opts.chat)?;
    let command = if opts.enabled { "sideprompt-on" } else { "sideprompt-off" };
    let state = if opts.enabled { "enabled" } else { "disabled" };
    let mut report = CommandReport::new(command);

    match set_side_prompt_enabled(&session.host(), &opts.target, opts.enabled) {
        Ok(ToggleOutcome::Changed { name }) => report.detail(format!("\"{name}\" {state}")),
        Ok(ToggleOutcome::AlreadySet { name }) => {
            report.detail(format!("\"{name}\" is already {state}"));
        }
        Ok(ToggleOutcome::All { changed }) => {
            report.detail(format!("{changed} side prompt(s) {state}"));
        }
        Err(err) => session.fail(&mut report, "sideprompt", &err),
    }
    Ok(report)
}

/// `sideprompt-list`: every template, most recently updated first.
pub fn run_list(opts: &ChatOptions) -> Result<CommandReport> {
    let session = Session::open(opts)?;
    let mut report = CommandReport::new("sideprompt-list");
    let doc = session.host().templates.load()?;

    for template in doc.list() {
        let mut triggers = Vec::new();
        if let Some(threshold) = template.interval_threshold() {
            triggers.push(format!("every {threshold} messages"));
        }
        if template.runs_after_memory() {
            triggers.push("after memory".to_string());
        }
        for command in template.triggers.commands.as_deref().unwrap_or_default() {
            triggers.push(format!("/{command}"));
        }
        report.detail(format!(
            "{} [{}] {}: {}",
            template.name,
            template.key,
            if template.enabled { "on" } else { "off" },
            if triggers.is_empty() {
                "no triggers".to_string()
            } else {
                triggers.join(", ")
            }
        ));
    }
    Ok(report)
}
