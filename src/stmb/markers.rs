use crate::error::StmbError;
use crate::stmb::lorebook::{MemoryRecord, SceneRange};
use serde::{Deserialize, Serialize};

/// Per-chat scene bookkeeping: the staged range, the watermark, and the
/// scheduler's postponement marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SceneMarkers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_memory_processed: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub highest_memory_processed_manually_set: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_summary_next_prompt_at: Option<i64>,
}

/// Result of `stmb-set-highest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HighestUpdate {
    Cleared,
    Set(i64),
    Clamped { requested: i64, applied: i64 },
}

impl SceneMarkers {
    /// Watermark, with "nothing processed" as -1.
    pub fn watermark(&self) -> i64 {
        self.highest_memory_processed.unwrap_or(-1)
    }

    pub fn staged_range(&self) -> Option<SceneRange> {
        match (self.scene_start, self.scene_end) {
            (Some(start), Some(end)) => Some(SceneRange::new(start, end)),
            _ => None,
        }
    }

    pub fn set_range(&mut self, start: i64, end: i64, chat_len: i64) -> Result<SceneRange, StmbError> {
        if start < 0 || start > end || end >= chat_len {
            return Err(StmbError::InvalidScene(format!(
                "range {start}-{end} is outside 0-{}",
                chat_len - 1
            )));
        }
        self.scene_start = Some(start);
        self.scene_end = Some(end);
        Ok(SceneRange::new(start, end))
    }

    pub fn clear(&mut self) {
        self.scene_start = None;
        self.scene_end = None;
    }

    /// `[watermark + 1, chat_len - 1]`, or `None` when nothing is new.
    pub fn compute_next_range(&self, chat_len: i64) -> Option<SceneRange> {
        let start = self.watermark() + 1;
        let end = chat_len - 1;
        (start <= end).then(|| SceneRange::new(start, end))
    }

    /// Record a committed scene. A pipeline-derived watermark never moves
    /// backwards; a manual one is replaced outright.
    pub fn advance_watermark(&mut self, end: i64) {
        let next = if self.highest_memory_processed_manually_set {
            end
        } else {
            self.watermark().max(end)
        };
        self.highest_memory_processed = Some(next);
        self.highest_memory_processed_manually_set = false;
    }

    /// Operator override. `None` resets history so the next range starts at 0.
    pub fn set_watermark_manually(&mut self, value: Option<i64>) {
        match value {
            Some(v) => {
                self.highest_memory_processed = Some(v);
                self.highest_memory_processed_manually_set = true;
            }
            None => {
                self.highest_memory_processed = None;
                self.highest_memory_processed_manually_set = false;
            }
        }
    }

    /// `stmb-set-highest <n|none>` against a chat of `chat_len` messages.
    pub fn set_highest_command(&mut self, raw: &str, chat_len: i64) -> Result<HighestUpdate, StmbError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(StmbError::InvalidScene(
                "missing argument; use stmb-set-highest <N|none>".to_string(),
            ));
        }
        if raw.eq_ignore_ascii_case("none") {
            self.set_watermark_manually(None);
            return Ok(HighestUpdate::Cleared);
        }
        let requested: i64 = raw.parse().map_err(|_| {
            StmbError::InvalidScene(format!(
                "invalid argument {raw:?}; use stmb-set-highest <N|none>"
            ))
        })?;
        let last = chat_len - 1;
        if last < 0 {
            return Err(StmbError::InvalidScene(
                "there are no messages in this chat yet".to_string(),
            ));
        }
        if requested < 0 {
            return Err(StmbError::InvalidScene(format!(
                "message ids out of range; valid range: 0-{last}"
            )));
        }
        let applied = requested.min(last);
        self.set_watermark_manually(Some(applied));
        if applied == requested {
            Ok(HighestUpdate::Set(applied))
        } else {
            Ok(HighestUpdate::Clamped { requested, applied })
        }
    }

    /// Drop a staged range that no longer fits the chat. Returns true when
    /// something was cleared.
    pub fn validate_against(&mut self, chat_len: i64) -> bool {
        let stale = match (self.scene_start, self.scene_end) {
            (None, None) => false,
            (Some(start), Some(end)) => start < 0 || start > end || end >= chat_len,
            _ => true,
        };
        if stale {
            self.clear();
        }
        stale
    }

    pub fn clear_postponement(&mut self) {
        self.auto_summary_next_prompt_at = None;
    }
}

/// Fails on the first existing memory whose range intersects `new`.
pub fn check_overlap(new: SceneRange, existing: &[MemoryRecord]) -> Result<(), StmbError> {
    for record in existing {
        let Some(range) = record.scene_range else {
            continue;
        };
        if new.overlaps(&range) {
            return Err(StmbError::SceneOverlap {
                title: record.title.clone(),
                start: range.start,
                end: range.end,
            });
        }
    }
    Ok(())
}
