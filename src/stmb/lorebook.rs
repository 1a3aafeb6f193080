use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How an entry gets activated. `link` maps to vectorized retrieval,
/// `blue` to always-on, `normal` to keyword triggering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstVectMode {
    #[default]
    Link,
    Blue,
    #[serde(alias = "green")]
    Normal,
}

impl ConstVectMode {
    pub fn activation(self) -> Activation {
        match self {
            Self::Link => Activation::Vectorized,
            Self::Blue => Activation::Constant,
            Self::Normal => Activation::Keyed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Keyed,
    Vectorized,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    #[default]
    Auto,
    Manual,
    Reverse,
}

impl OrderMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "reverse" => Some(Self::Reverse),
            _ => None,
        }
    }

    /// Order for the `sequence`-th record. `auto_base` is what auto mode
    /// adds the sequence to.
    pub fn order_for(self, sequence: i64, auto_base: i64, order_value: i64, reverse_start: i64) -> i64 {
        match self {
            Self::Auto => auto_base + sequence,
            Self::Manual => order_value,
            Self::Reverse => reverse_start - sequence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneRange {
    pub start: i64,
    pub end: i64,
}

impl SceneRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &SceneRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn label(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Checkpoint {
    pub last_msg_id: i64,
    pub last_run_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LorebookEntry {
    pub uid: u64,
    /// Entry title.
    pub comment: String,
    pub content: String,
    pub key: Vec<String>,
    pub order: i64,
    pub position: i64,
    pub activation: Activation,
    pub disable: bool,
    pub prevent_recursion: bool,
    pub delay_until_recursion: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outlet_name: Option<String>,
    pub stmemorybooks: bool,
    pub stmb_arc: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_range: Option<SceneRange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub member_ranges: Vec<SceneRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_method: Option<String>,
    /// Side-prompt watermarks keyed by template key, kept apart from `content`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub checkpoints: BTreeMap<String, Checkpoint>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl LorebookEntry {
    pub fn is_memory(&self) -> bool {
        self.stmemorybooks && !self.stmb_arc
    }

    pub fn apply_placement(&mut self, placement: &EntryPlacement) {
        self.activation = placement.activation;
        self.position = placement.position;
        self.order = placement.order;
        self.prevent_recursion = placement.prevent_recursion;
        self.delay_until_recursion = placement.delay_until_recursion;
        self.outlet_name = placement.outlet_name.clone();
    }

    /// Checkpoint for `key`, falling back to legacy flat fields.
    pub fn checkpoint(&self, key: &str) -> Option<Checkpoint> {
        self.checkpoint_with(key, &["tracker"])
    }

    /// Manual runs also accept the old scoreboard checkpoint.
    pub fn manual_checkpoint(&self, key: &str) -> Option<Checkpoint> {
        self.checkpoint_with(key, &["score", "tracker"])
    }

    fn checkpoint_with(&self, key: &str, legacy_kinds: &[&str]) -> Option<Checkpoint> {
        if let Some(cp) = self.checkpoints.get(key) {
            return Some(cp.clone());
        }
        let flat = |field: &str| {
            self.extra.get(&format!("STMB_sp_{key}_{field}")).or_else(|| {
                legacy_kinds
                    .iter()
                    .find_map(|kind| self.extra.get(&format!("STMB_{kind}_{field}")))
            })
        };
        let legacy_id = flat("lastMsgId").and_then(value_as_i64)?;
        let legacy_at = flat("lastRunAt")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Checkpoint {
            last_msg_id: legacy_id,
            last_run_at: legacy_at,
        })
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Placement metadata applied when writing an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlacement {
    pub activation: Activation,
    pub position: i64,
    pub order: i64,
    pub prevent_recursion: bool,
    pub delay_until_recursion: bool,
    pub outlet_name: Option<String>,
}

impl Default for EntryPlacement {
    fn default() -> Self {
        Self {
            activation: Activation::Vectorized,
            position: 0,
            order: 100,
            prevent_recursion: true,
            delay_until_recursion: false,
            outlet_name: None,
        }
    }
}

/// One write in a batch upsert.
#[derive(Debug, Clone)]
pub struct UpsertItem {
    pub title: String,
    pub content: String,
    pub placement: EntryPlacement,
    pub checkpoint: Option<(String, Checkpoint)>,
}

/// Memory view of an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub uid: u64,
    pub title: String,
    pub content: String,
    pub keywords: Vec<String>,
    pub scene_range: Option<SceneRange>,
    pub order: i64,
    pub disabled: bool,
}

impl From<&LorebookEntry> for MemoryRecord {
    fn from(entry: &LorebookEntry) -> Self {
        Self {
            uid: entry.uid,
            title: entry.comment.clone(),
            content: entry.content.clone(),
            keywords: entry.key.clone(),
            scene_range: entry.scene_range,
            order: entry.order,
            disabled: entry.disable,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lorebook {
    pub entries: BTreeMap<String, LorebookEntry>,
}

impl Lorebook {
    pub fn next_uid(&self) -> u64 {
        self.entries
            .values()
            .map(|e| e.uid + 1)
            .max()
            .unwrap_or(0)
    }

    /// Insert under a fresh uid. Never replaces an existing entry.
    pub fn create_entry(&mut self, mut entry: LorebookEntry) -> u64 {
        let uid = self.next_uid();
        entry.uid = uid;
        self.entries.insert(uid.to_string(), entry);
        uid
    }

    pub fn entry_by_uid(&self, uid: u64) -> Option<&LorebookEntry> {
        self.entries.get(&uid.to_string())
    }

    pub fn entry_by_uid_mut(&mut self, uid: u64) -> Option<&mut LorebookEntry> {
        self.entries.get_mut(&uid.to_string())
    }

    pub fn find_by_title(&self, title: &str) -> Option<&LorebookEntry> {
        self.entries.values().find(|e| e.comment == title)
    }

    pub fn upsert_by_title(&mut self, item: &UpsertItem) -> u64 {
        let existing = self
            .entries
            .values()
            .find(|e| e.comment == item.title)
            .map(|e| e.uid);
        let uid = match existing {
            Some(uid) => uid,
            None => self.create_entry(LorebookEntry {
                comment: item.title.clone(),
                ..LorebookEntry::default()
            }),
        };
        if let Some(entry) = self.entry_by_uid_mut(uid) {
            entry.content = item.content.clone();
            entry.apply_placement(&item.placement);
            if let Some((key, checkpoint)) = &item.checkpoint {
                entry.checkpoints.insert(key.clone(), checkpoint.clone());
            }
        }
        uid
    }

    pub fn batch_upsert(&mut self, items: &[UpsertItem]) -> Vec<u64> {
        items.iter().map(|item| self.upsert_by_title(item)).collect()
    }

    /// Memory entries (not arcs) sorted by title number, then uid.
    pub fn memory_entries(&self) -> Vec<&LorebookEntry> {
        let mut out = self
            .entries
            .values()
            .filter(|e| e.is_memory())
            .collect::<Vec<_>>();
        out.sort_by_key(|e| (parse_title_order(&e.comment).unwrap_or(i64::MAX), e.uid));
        out
    }

    pub fn memory_records(&self) -> Vec<MemoryRecord> {
        self.memory_entries()
            .into_iter()
            .map(MemoryRecord::from)
            .collect()
    }

    /// Sequence number for the next memory title.
    pub fn next_memory_sequence(&self) -> i64 {
        let memories = self.memory_entries();
        let highest = memories
            .iter()
            .filter_map(|e| parse_title_order(&e.comment))
            .max()
            .unwrap_or(0);
        highest.max(memories.len() as i64) + 1
    }

    pub fn arc_count(&self) -> usize {
        self.entries.values().filter(|e| e.stmb_arc).count()
    }
}

/// Order number embedded in a title: `[NNN]` anywhere, else a leading digit run.
pub fn parse_title_order(title: &str) -> Option<i64> {
    let mut rest = title;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        if let Some(close) = after.find(']') {
            let inner = &after[..close];
            if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                return inner.parse().ok();
            }
            rest = &after[close + 1..];
        } else {
            break;
        }
    }
    let digits = title
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Values available to a title format.
#[derive(Debug, Clone)]
pub struct TitleContext<'a> {
    pub title: &'a str,
    pub sequence: i64,
    pub range: SceneRange,
    pub character: &'a str,
    pub user: &'a str,
}

/// Render a title format such as `[000] - {{title}}`. The first run of two or
/// more zeros becomes the zero-padded sequence number.
pub fn render_title(format: &str, ctx: &TitleContext<'_>) -> String {
    let padded = pad_first_zero_run(format, ctx.sequence);
    padded
        .replace("{{title}}", ctx.title)
        .replace("{{scene}}", &ctx.range.label())
        .replace("{{char}}", ctx.character)
        .replace("{{user}}", ctx.user)
        .replace(
            "{{messages}}",
            &(ctx.range.end - ctx.range.start + 1).to_string(),
        )
        .trim()
        .to_string()
}

fn pad_first_zero_run(format: &str, sequence: i64) -> String {
    let bytes = format.as_bytes();
    let mut i = 0;
    let mut run = None;
    while i < bytes.len() {
        if bytes[i] != b'0' {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i] == b'0' {
            i += 1;
        }
        if i - start >= 2 {
            run = Some((start, i));
            break;
        }
    }
    let Some((start, end)) = run else {
        return format.to_string();
    };
    let width = end - start;
    format!(
        "{}{:0width$}{}",
        &format[..start],
        sequence,
        &format[end..],
        width = width
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory(uid: u64, title: &str, range: (i64, i64)) -> LorebookEntry {
        LorebookEntry {
            uid,
            comment: title.to_string(),
            content: format!("content of {title}"),
            stmemorybooks: true,
            scene_range: Some(SceneRange::new(range.0, range.1)),
            ..LorebookEntry::default()
        }
    }

    #[test]
    fn scene_ranges_overlap_inclusively() {
        let a = SceneRange::new(0, 10);
        assert!(a.overlaps(&SceneRange::new(10, 20)));
        assert!(a.overlaps(&SceneRange::new(3, 4)));
        assert!(!a.overlaps(&SceneRange::new(11, 20)));
    }

    #[test]
    fn parse_title_order_reads_bracket_or_prefix() {
        assert_eq!(parse_title_order("[007] - Ambush"), Some(7));
        assert_eq!(parse_title_order("Arc [12] notes"), Some(12));
        assert_eq!(parse_title_order("42 - Night"), Some(42));
        assert_eq!(parse_title_order("[x] Ambush"), None);
        assert_eq!(parse_title_order("Ambush"), None);
    }

    #[test]
    fn render_title_pads_sequence_and_fills_placeholders() {
        let ctx = TitleContext {
            title: "Ambush",
            sequence: 7,
            range: SceneRange::new(0, 117),
            character: "Ava",
            user: "Sam",
        };
        assert_eq!(render_title("[000] - {{title}}", &ctx), "[007] - Ambush");
        assert_eq!(
            render_title("{{char}}: {{title}} ({{scene}})", &ctx),
            "Ava: Ambush (0-117)"
        );
    }

    #[test]
    fn create_entry_never_replaces_existing() {
        let mut book = Lorebook::default();
        let first = book.create_entry(memory(0, "[001] - A", (0, 5)));
        let second = book.create_entry(memory(0, "[001] - A", (6, 9)));
        assert_ne!(first, second);
        assert_eq!(book.entries.len(), 2);
    }

    #[test]
    fn upsert_by_title_updates_in_place_and_records_checkpoint() {
        let mut book = Lorebook::default();
        let item = UpsertItem {
            title: "Status (STMB SidePrompt)".to_string(),
            content: "v1".to_string(),
            placement: EntryPlacement::default(),
            checkpoint: Some((
                "status".to_string(),
                Checkpoint {
                    last_msg_id: 10,
                    last_run_at: None,
                },
            )),
        };
        let uid = book.upsert_by_title(&item);
        let again = book.upsert_by_title(&UpsertItem {
            content: "v2".to_string(),
            ..item
        });
        assert_eq!(uid, again);
        let entry = book.entry_by_uid(uid).expect("entry");
        assert_eq!(entry.content, "v2");
        assert_eq!(entry.checkpoint("status").map(|c| c.last_msg_id), Some(10));
    }

    #[test]
    fn checkpoint_reads_legacy_flat_fields() {
        let raw = json!({
            "uid": 3,
            "comment": "Plot (STMB Tracker)",
            "content": "old",
            "STMB_tracker_lastMsgId": 41,
            "STMB_tracker_lastRunAt": "2024-01-01T00:00:00Z"
        });
        let entry: LorebookEntry = serde_json::from_value(raw).expect("entry");
        let cp = entry.checkpoint("plot").expect("legacy checkpoint");
        assert_eq!(cp.last_msg_id, 41);
        assert_eq!(cp.last_run_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn manual_checkpoint_falls_back_to_scoreboard_field() {
        let raw = json!({
            "uid": 4,
            "comment": "Score (STMB Scoreboard)",
            "content": "2-2",
            "STMB_score_lastMsgId": 57,
            "STMB_tracker_lastMsgId": 12
        });
        let entry: LorebookEntry = serde_json::from_value(raw).expect("entry");
        assert_eq!(entry.manual_checkpoint("score").map(|c| c.last_msg_id), Some(57));
        assert_eq!(entry.checkpoint("score").map(|c| c.last_msg_id), Some(12));

        let mut current = entry.clone();
        current.extra.insert("STMB_sp_score_lastMsgId".to_string(), json!(60));
        assert_eq!(current.manual_checkpoint("score").map(|c| c.last_msg_id), Some(60));
    }

    #[test]
    fn foreign_fields_round_trip() {
        let raw = json!({"uid": 1, "comment": "x", "content": "y", "selectiveLogic": 2});
        let entry: LorebookEntry = serde_json::from_value(raw).expect("entry");
        let back = serde_json::to_value(&entry).expect("value");
        assert_eq!(back["selectiveLogic"], 2);
        assert_eq!(back["stmbArc"], false);
    }

    #[test]
    fn memory_entries_skip_arcs_and_sort_by_title_number() {
        let mut book = Lorebook::default();
        book.create_entry(memory(0, "[002] - B", (6, 9)));
        book.create_entry(memory(0, "[001] - A", (0, 5)));
        book.create_entry(LorebookEntry {
            comment: "[001] Arc".to_string(),
            stmemorybooks: true,
            stmb_arc: true,
            ..LorebookEntry::default()
        });
        let titles = book
            .memory_entries()
            .into_iter()
            .map(|e| e.comment.clone())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["[001] - A", "[002] - B"]);
        assert_eq!(book.next_memory_sequence(), 3);
    }

    #[test]
    fn order_modes_follow_formulas() {
        assert_eq!(OrderMode::Auto.order_for(2, 100, 50, 9999), 102);
        assert_eq!(OrderMode::Manual.order_for(2, 100, 50, 9999), 50);
        assert_eq!(OrderMode::Reverse.order_for(2, 100, 50, 9999), 9997);
    }
}
