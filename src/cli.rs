use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::arcs::ArcsOptions;
use crate::commands::chat_event::ChatEventOptions;
use crate::commands::highest::SetHighestOptions;
use crate::commands::memory::{MemoryOptions, SceneSelection};
use crate::commands::repair::{RepairOptions, RepairTarget};
use crate::commands::sideprompt::{SidePromptOptions, ToggleOptions};
use crate::commands::{self, ChatOptions, CommandReport};

#[derive(Debug, Parser)]
#[command(name = "STMB", version, about = "Chat memory engine: scenes, memories, arcs and side prompts")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct GlobalArgs {
    /// Chat directory name under `<STMB_HOME>/chats`
    #[arg(long, global = true, default_value = "default")]
    chat: String,

    /// Connection profile name
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Answer yes to confirmations
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    /// Option label or index to pick when a choice is offered
    #[arg(long, global = true)]
    choose: Option<String>,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,
}

impl GlobalArgs {
    fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            chat: self.chat.clone(),
            profile: self.profile.clone(),
            yes: self.yes,
            choose: self.choose.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a memory from the staged scene
    Creatememory {
        /// Previous memories to include as context (0-7)
        #[arg(long)]
        context: Option<u64>,
    },
    /// Stage messages X-Y and create a memory from them
    Scenememory {
        range: String,
        #[arg(long)]
        context: Option<u64>,
    },
    /// Create a memory from everything after the last processed message
    Nextmemory {
        #[arg(long)]
        context: Option<u64>,
    },
    /// Run a side prompt: sideprompt "Name" [X-Y]
    Sideprompt {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Enable a side prompt, or all of them
    SidepromptOn { target: String },
    /// Disable a side prompt, or all of them
    SidepromptOff { target: String },
    /// List side prompt templates
    SidepromptList,
    /// Show the highest processed message
    StmbHighest,
    /// Set the highest processed message: <N|none>
    StmbSetHighest {
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Feed a host chat event to the scheduler and trackers
    ChatEvent {
        /// The reply belongs to a group chat
        #[arg(long)]
        group: bool,
        /// The group turn has finished
        #[arg(long)]
        turn_finished: bool,
        /// The generation was a dry run
        #[arg(long)]
        dry_run: bool,
    },
    /// Consolidate memories into arcs
    Arcs {
        /// Memory uids; every eligible memory when omitted
        uids: Vec<u64>,
        #[arg(long)]
        max_items: Option<usize>,
        #[arg(long)]
        max_passes: Option<u32>,
        /// auto, manual or reverse
        #[arg(long)]
        order_mode: Option<String>,
        #[arg(long)]
        order_value: Option<i64>,
        /// Disable the memories folded into an arc
        #[arg(long)]
        disable_originals: Option<bool>,
    },
    /// Show or repair the last failed memory
    RepairMemory {
        /// File with corrected JSON
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show or repair the last failed arc run
    RepairArcs {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "{}: {}",
        report.command,
        if report.ok { "ok" } else { "failed" }
    );
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}

fn memory(chat: ChatOptions, selection: SceneSelection, context: Option<u64>) -> MemoryOptions {
    MemoryOptions {
        chat,
        selection,
        context_memories: context,
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let chat = cli.global.chat_options();

    let report = match cli.command {
        Command::Creatememory { context } => {
            commands::memory::run(&memory(chat, SceneSelection::Staged, context))?
        }
        Command::Scenememory { range, context } => {
            commands::memory::run(&memory(chat, SceneSelection::Range(range), context))?
        }
        Command::Nextmemory { context } => {
            commands::memory::run(&memory(chat, SceneSelection::Next, context))?
        }
        Command::Sideprompt { args } => commands::sideprompt::run(&SidePromptOptions {
            chat,
            args: args.join(" "),
        })?,
        Command::SidepromptOn { target } => commands::sideprompt::run_toggle(&ToggleOptions {
            chat,
            target,
            enabled: true,
        })?,
        Command::SidepromptOff { target } => commands::sideprompt::run_toggle(&ToggleOptions {
            chat,
            target,
            enabled: false,
        })?,
        Command::SidepromptList => commands::sideprompt::run_list(&chat)?,
        Command::StmbHighest => commands::highest::run_show(&chat)?,
        Command::StmbSetHighest { value } => {
            commands::highest::run_set(&SetHighestOptions { chat, value })?
        }
        Command::ChatEvent {
            group,
            turn_finished,
            dry_run,
        } => commands::chat_event::run(&ChatEventOptions {
            chat,
            group,
            turn_finished,
            dry_run,
        })?,
        Command::Arcs {
            uids,
            max_items,
            max_passes,
            order_mode,
            order_value,
            disable_originals,
        } => commands::arcs::run(&ArcsOptions {
            chat,
            uids,
            max_items_per_pass: max_items,
            max_passes,
            order_mode,
            order_value,
            disable_originals,
        })?,
        Command::RepairMemory { file } => commands::repair::run(&RepairOptions {
            chat,
            target: RepairTarget::Memory,
            input: file,
        })?,
        Command::RepairArcs { file } => commands::repair::run(&RepairOptions {
            chat,
            target: RepairTarget::Arcs,
            input: file,
        })?,
    };

    print_report(&report, cli.global.json)?;
    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}
