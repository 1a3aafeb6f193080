use crate::error::StmbError;
use crate::stmb::host::Transcript;
use crate::stmb::lorebook::{Lorebook, SceneRange};
use crate::stmb::util::substitute_names;
use serde::{Deserialize, Serialize};

pub const ESTIMATED_OUTPUT_TOKENS: u64 = 300;

const CONTEXT_HEADER: &str = "=== PREVIOUS SCENE CONTEXT (DO NOT SUMMARIZE) ===";
const CONTEXT_FOOTER: &str = "=== END PREVIOUS SCENE CONTEXT - SUMMARIZE ONLY THE SCENE BELOW ===";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneLine {
    pub index: i64,
    pub speaker: String,
    pub text: String,
}

/// A prior memory shown to the model as context only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousMemory {
    pub title: String,
    pub content: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledScene {
    pub range: SceneRange,
    pub lines: Vec<SceneLine>,
    #[serde(default)]
    pub previous: Vec<PreviousMemory>,
    pub character: String,
    pub user: String,
    pub chat: String,
}

impl CompiledScene {
    pub fn message_count(&self) -> usize {
        self.lines.len()
    }

    /// `Speaker: text` per line.
    pub fn readable_text(&self) -> String {
        self.lines
            .iter()
            .map(|l| format!("{}: {}", l.speaker, l.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Scene body for a memory request, with the context block first.
    pub fn memory_scene_text(&self) -> String {
        let mut out = vec![String::new()];
        if !self.previous.is_empty() {
            out.push(CONTEXT_HEADER.to_string());
            out.push(
                "These are previous memories for context only. Do NOT include them in your new memory:"
                    .to_string(),
            );
            out.push(String::new());
            for (i, memory) in self.previous.iter().enumerate() {
                out.push(format!("Context {} - {}:", i + 1, memory.title));
                out.push(memory.content.clone());
                if !memory.keywords.is_empty() {
                    out.push(format!("Keywords: {}", memory.keywords.join(", ")));
                }
                out.push(String::new());
            }
            out.push(CONTEXT_FOOTER.to_string());
            out.push(String::new());
        }
        out.push("=== SCENE TRANSCRIPT ===".to_string());
        out.extend(self.lines.iter().map(|l| format!("{}: {}", l.speaker, l.text)));
        out.push(String::new());
        out.push("=== END SCENE ===".to_string());
        out.join("\n")
    }

    pub fn substitute(&self, template: &str) -> String {
        substitute_names(template, &self.character, &self.user)
    }
}

/// Collect visible, non-system messages in `range`.
pub fn compile_scene(transcript: &dyn Transcript, range: SceneRange) -> Result<CompiledScene, StmbError> {
    let len = transcript.len_i64();
    if range.start < 0 || range.start > range.end || range.end >= len {
        return Err(StmbError::InvalidScene(format!(
            "range {} does not fit a chat of {len} messages",
            range.label()
        )));
    }
    let mut lines = Vec::new();
    for index in range.start..=range.end {
        let Some(message) = usize::try_from(index).ok().and_then(|i| transcript.message(i)) else {
            continue;
        };
        if !message.is_countable() {
            continue;
        }
        let text = message.text.trim();
        if text.is_empty() {
            continue;
        }
        let speaker = if message.speaker.trim().is_empty() {
            "Unknown".to_string()
        } else {
            message.speaker.trim().to_string()
        };
        lines.push(SceneLine {
            index,
            speaker,
            text: text.to_string(),
        });
    }
    if lines.is_empty() {
        return Err(StmbError::InvalidScene(format!(
            "no visible messages in range {}",
            range.label()
        )));
    }
    Ok(CompiledScene {
        range,
        lines,
        previous: Vec::new(),
        character: transcript.character_name(),
        user: transcript.user_name(),
        chat: transcript.chat_name(),
    })
}

/// Up to `count` memories that end before `before`, oldest first. The
/// second value is a warning when fewer were available than asked for.
pub fn previous_memories(
    book: &Lorebook,
    before: Option<SceneRange>,
    count: usize,
) -> (Vec<PreviousMemory>, Option<String>) {
    if count == 0 {
        return (Vec::new(), None);
    }
    let eligible = book
        .memory_entries()
        .into_iter()
        .filter(|e| !e.disable)
        .filter(|e| match (before, e.scene_range) {
            (Some(scene), Some(range)) => range.end < scene.start,
            _ => true,
        })
        .collect::<Vec<_>>();
    let skip = eligible.len().saturating_sub(count);
    let picked = eligible
        .into_iter()
        .skip(skip)
        .map(|e| PreviousMemory {
            title: e.comment.clone(),
            content: e.content.clone(),
            keywords: e.key.clone(),
        })
        .collect::<Vec<_>>();
    let warning = (picked.len() < count).then(|| {
        format!(
            "only {} of {count} requested previous memories are available",
            picked.len()
        )
    });
    (picked, warning)
}

/// Full memory request: the profile prompt, then the scene.
pub fn memory_prompt(profile_prompt: &str, scene: &CompiledScene) -> String {
    format!(
        "{}\n\n{}",
        scene.substitute(profile_prompt),
        scene.memory_scene_text()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

/// Characters / 4, rounded up, plus a fixed output allowance.
pub fn estimate_tokens(prompt: &str) -> TokenEstimate {
    let chars = prompt.chars().count() as u64;
    let input = chars.div_ceil(4);
    TokenEstimate {
        input,
        output: ESTIMATED_OUTPUT_TOKENS,
        total: input + ESTIMATED_OUTPUT_TOKENS,
    }
}

pub fn check_token_budget(estimate: TokenEstimate, threshold: u64) -> Result<(), StmbError> {
    if estimate.total > threshold {
        return Err(StmbError::TokenWarning {
            tokens: estimate.total,
            threshold,
        });
    }
    Ok(())
}
