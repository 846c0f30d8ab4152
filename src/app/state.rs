use std::time::{Duration, Instant};

use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

use crate::model::{DraftKind, EntityId, EntryKind, EntryType, Field, FieldValue, Trip};
use crate::sync::notice::{Notice, Severity};
use crate::sync::FieldStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Trip,
    Day,
    Entry(EntryType),
    Todo,
}

/// One visible line of the itinerary outline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: EntityId,
    pub parent: Option<EntityId>,
    pub depth: usize,
    pub kind: RowKind,
    pub label: String,
    pub detail: Option<String>,
    pub completed: Option<bool>,
}

impl Row {
    /// The field `n` edits for this row.
    pub fn detail_field(&self) -> Option<Field> {
        match self.kind {
            RowKind::Trip => Some(Field::Description),
            RowKind::Day => Some(Field::Date),
            RowKind::Entry(EntryType::Place) => Some(Field::Address),
            RowKind::Entry(EntryType::Note) => Some(Field::Body),
            RowKind::Entry(EntryType::Todos) => Some(Field::Description),
            RowKind::Todo => None,
        }
    }
}

pub fn flatten(trip: &Trip) -> Vec<Row> {
    let mut rows = Vec::new();
    rows.push(Row {
        id: trip.id.clone(),
        parent: None,
        depth: 0,
        kind: RowKind::Trip,
        label: trip.title.clone(),
        detail: first_line(&trip.description),
        completed: None,
    });
    for (number, day) in trip.days.iter().enumerate() {
        let title = if day.title.trim().is_empty() {
            "(untitled day)"
        } else {
            day.title.as_str()
        };
        rows.push(Row {
            id: day.id.clone(),
            parent: Some(trip.id.clone()),
            depth: 1,
            kind: RowKind::Day,
            label: format!("Day {}: {title}", number + 1),
            detail: day.date.map(|date| date.to_string()),
            completed: None,
        });
        for entry in &day.entries {
            let detail = match &entry.kind {
                EntryKind::Place { address } => first_line(address),
                EntryKind::Note { body } => first_line(body),
                EntryKind::Todos { todos } => {
                    let done = todos.iter().filter(|todo| todo.completed).count();
                    Some(format!("{done}/{} done", todos.len()))
                }
            };
            rows.push(Row {
                id: entry.id.clone(),
                parent: Some(day.id.clone()),
                depth: 2,
                kind: RowKind::Entry(entry.kind.entry_type()),
                label: entry.title.clone(),
                detail,
                completed: None,
            });
            if let EntryKind::Todos { todos } = &entry.kind {
                for todo in todos {
                    rows.push(Row {
                        id: todo.id.clone(),
                        parent: Some(entry.id.clone()),
                        depth: 3,
                        kind: RowKind::Todo,
                        label: todo.title.clone(),
                        detail: None,
                        completed: Some(todo.completed),
                    });
                }
            }
        }
    }
    rows
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddKind {
    /// Day under the trip, note under a day, todo under a todo list.
    Default,
    Todos,
    Place,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditTarget {
    Field { entity: EntityId, field: Field },
    NewChild { parent: EntityId, kind: DraftKind },
}

impl EditTarget {
    /// Free-text fields are sent to the engine on every keystroke and
    /// debounced there. Everything else is applied on Enter.
    pub fn is_live(&self) -> bool {
        matches!(self, EditTarget::Field { field, .. } if field.is_free_text())
    }
}

#[derive(Debug, Clone)]
pub struct EditorState {
    pub target: EditTarget,
    pub label: String,
    buffer: String,
    cursor: usize,
    pub error: Option<String>,
}

impl EditorState {
    pub fn new<S: Into<String>>(target: EditTarget, label: S, buffer: String) -> Self {
        let cursor = buffer.len();
        Self {
            target,
            label: label.into(),
            buffer,
            cursor,
            error: None,
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Display width of the text left of the cursor.
    pub fn cursor_column(&self) -> usize {
        UnicodeWidthStr::width(&self.buffer[..self.cursor])
    }

    pub fn insert_char(&mut self, ch: char) -> bool {
        let mut scratch = [0u8; 4];
        let encoded = ch.encode_utf8(&mut scratch);
        self.buffer.insert_str(self.cursor, encoded);
        self.cursor += encoded.len();
        true
    }

    pub fn backspace(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        let prev = prev_grapheme_boundary(&self.buffer, self.cursor);
        self.buffer.drain(prev..self.cursor);
        self.cursor = prev;
        true
    }

    pub fn delete(&mut self) -> bool {
        if self.cursor >= self.buffer.len() {
            return false;
        }
        let next = next_grapheme_boundary(&self.buffer, self.cursor);
        self.buffer.drain(self.cursor..next);
        true
    }

    pub fn move_left(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor = prev_grapheme_boundary(&self.buffer, self.cursor);
        true
    }

    pub fn move_right(&mut self) -> bool {
        if self.cursor >= self.buffer.len() {
            return false;
        }
        self.cursor = next_grapheme_boundary(&self.buffer, self.cursor);
        true
    }

    pub fn move_home(&mut self) -> bool {
        let moved = self.cursor != 0;
        self.cursor = 0;
        moved
    }

    pub fn move_end(&mut self) -> bool {
        let moved = self.cursor != self.buffer.len();
        self.cursor = self.buffer.len();
        moved
    }
}

fn prev_grapheme_boundary(text: &str, cursor: usize) -> usize {
    text[..cursor]
        .grapheme_indices(true)
        .last()
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn next_grapheme_boundary(text: &str, cursor: usize) -> usize {
    text[cursor..]
        .graphemes(true)
        .next()
        .map(|grapheme| cursor + grapheme.len())
        .unwrap_or(text.len())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayState {
    ConfirmDelete { entity: EntityId, title: String },
}

#[derive(Debug, Clone)]
pub struct Toast {
    pub notice: Notice,
    pub shown_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub scheduled: usize,
    pub in_flight: usize,
}

pub struct AppState {
    pub rows: Vec<Row>,
    pub selected: usize,
    pub status_message: Option<String>,
    pub overlay: Option<OverlayState>,
    pub editor: Option<EditorState>,
    pub toasts: Vec<Toast>,
    pub sync: SyncSummary,
    /// Sync status of the selected row's title, for the status bar.
    pub selected_status: Option<FieldStatus>,
}

impl AppState {
    pub fn new(trip: &Trip) -> Self {
        Self {
            rows: flatten(trip),
            selected: 0,
            status_message: None,
            overlay: None,
            editor: None,
            toasts: Vec::new(),
            sync: SyncSummary::default(),
            selected_status: None,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn selected(&self) -> Option<&Row> {
        self.rows.get(self.selected)
    }

    pub fn selected_id(&self) -> Option<&EntityId> {
        self.selected().map(|row| &row.id)
    }

    pub fn row(&self, id: &EntityId) -> Option<&Row> {
        self.rows.iter().find(|row| &row.id == id)
    }

    /// Re-flattens the outline, keeping the selection on the same entity
    /// when it still exists.
    pub fn sync_rows(&mut self, trip: &Trip) {
        let keep = self.selected_id().cloned();
        self.rows = flatten(trip);
        match keep {
            Some(id) => self.select_id(&id),
            None => self.normalize_selection(),
        }
    }

    pub fn select_id(&mut self, id: &EntityId) {
        if let Some(idx) = self.rows.iter().position(|row| &row.id == id) {
            self.selected = idx;
        } else {
            self.normalize_selection();
        }
    }

    fn normalize_selection(&mut self) {
        if self.rows.is_empty() {
            self.selected = 0;
        } else if self.selected >= self.rows.len() {
            self.selected = self.rows.len() - 1;
        }
    }

    pub fn move_selection(&mut self, delta: isize) {
        if self.rows.is_empty() {
            return;
        }
        let len = self.rows.len() as isize;
        let next = (self.selected as isize + delta).clamp(0, len - 1);
        self.selected = next as usize;
    }

    /// Where `J`/`K` should move the selected row: its parent, the row id and
    /// the destination index. None at either end of the sibling list.
    pub fn sibling_move(&self, trip: &Trip, delta: isize) -> Option<(EntityId, EntityId, usize)> {
        let row = self.selected()?;
        let parent = row.parent.clone()?;
        let siblings = trip.child_ids(&parent)?;
        let from = siblings.iter().position(|id| id == &row.id)? as isize;
        let to = from + delta;
        if to < 0 || to >= siblings.len() as isize {
            return None;
        }
        Some((parent, row.id.clone(), to as usize))
    }

    /// Parent and kind for a new child created from the selected row.
    pub fn add_target(&self, kind: AddKind) -> Option<(EntityId, DraftKind)> {
        let row = self.selected()?;
        let day = self.enclosing_day(row);
        match (kind, row.kind) {
            (AddKind::Default, RowKind::Trip) => {
                Some((row.id.clone(), DraftKind::Day { date: None }))
            }
            (AddKind::Default, RowKind::Entry(EntryType::Todos)) => {
                Some((row.id.clone(), DraftKind::Todo))
            }
            (AddKind::Default, RowKind::Todo) => Some((row.parent.clone()?, DraftKind::Todo)),
            (AddKind::Default, _) => Some((
                day?,
                DraftKind::Entry {
                    entry_type: EntryType::Note,
                },
            )),
            (AddKind::Todos, _) => Some((
                day?,
                DraftKind::Entry {
                    entry_type: EntryType::Todos,
                },
            )),
            (AddKind::Place, _) => Some((
                day?,
                DraftKind::Entry {
                    entry_type: EntryType::Place,
                },
            )),
        }
    }

    fn enclosing_day(&self, row: &Row) -> Option<EntityId> {
        match row.kind {
            RowKind::Trip => None,
            RowKind::Day => Some(row.id.clone()),
            RowKind::Entry(_) => row.parent.clone(),
            RowKind::Todo => {
                let entry = self.row(row.parent.as_ref()?)?;
                entry.parent.clone()
            }
        }
    }

    pub fn editor(&self) -> Option<&EditorState> {
        self.editor.as_ref()
    }

    pub fn editor_mut(&mut self) -> Option<&mut EditorState> {
        self.editor.as_mut()
    }

    pub fn is_editing(&self) -> bool {
        self.editor.is_some()
    }

    pub fn begin_editor(&mut self, editor: EditorState) {
        self.editor = Some(editor);
    }

    pub fn close_editor(&mut self) -> Option<EditorState> {
        self.editor.take()
    }

    pub fn set_status_message<S: Into<String>>(&mut self, message: Option<S>) {
        self.status_message = message.map(Into::into);
    }

    pub fn overlay(&self) -> Option<&OverlayState> {
        self.overlay.as_ref()
    }

    pub fn open_confirm_delete(&mut self) {
        if let Some(row) = self.selected() {
            if row.kind != RowKind::Trip {
                self.overlay = Some(OverlayState::ConfirmDelete {
                    entity: row.id.clone(),
                    title: row.label.clone(),
                });
            }
        }
    }

    pub fn close_overlay(&mut self) -> Option<OverlayState> {
        self.overlay.take()
    }

    pub fn push_notices(&mut self, notices: Vec<Notice>, now: Instant) {
        self.toasts.extend(notices.into_iter().map(|notice| Toast {
            notice,
            shown_at: now,
        }));
    }

    /// Drops informational toasts older than `ttl`. Errors stay until
    /// dismissed.
    pub fn expire_toasts(&mut self, now: Instant, ttl: Duration) {
        self.toasts.retain(|toast| {
            toast.notice.severity == Severity::Error
                || now.saturating_duration_since(toast.shown_at) < ttl
        });
    }

    pub fn dismiss_latest_toast(&mut self) -> Option<Toast> {
        self.toasts.pop()
    }
}

/// Text to seed the editor with for `field` of `entity`.
pub fn editable_text(trip: &Trip, entity: &EntityId, field: Field) -> String {
    match trip.field(entity, field) {
        Some(FieldValue::Text(text)) => text,
        Some(FieldValue::Date(Some(date))) => date.to_string(),
        _ => String::new(),
    }
}

/// Cuts `text` to at most `width` columns, marking the cut with an ellipsis.
pub fn truncate_to_width(text: &str, width: usize) -> String {
    if UnicodeWidthStr::width(text) <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let mut out = String::new();
    let mut used = 0;
    for grapheme in text.graphemes(true) {
        let w = UnicodeWidthStr::width(grapheme);
        if used + w + 1 > width {
            break;
        }
        out.push_str(grapheme);
        used += w;
    }
    out.push('…');
    out
}
