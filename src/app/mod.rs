use std::cell::Cell;
use std::io::Stdout;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::widgets::ListState;
use ratatui::Terminal;

use crate::config::AppConfig;
use crate::model::{ChildDraft, DraftKind, EntityId, Field, FieldKey, FieldValue, Trip};
use crate::storage::TripStore;
use crate::sync::store::ChangeSet;
use crate::sync::transport::RemoteService;
use crate::sync::SyncEngine;
use crate::ui;

mod actions;
pub mod state;

use self::actions::{action_for_key, Action};
pub use state::{AddKind, AppState, EditTarget, EditorState, OverlayState, Row, RowKind};

pub struct App {
    pub config: Arc<AppConfig>,
    engine: SyncEngine,
    state: AppState,
    list_state: ListState,
    changes: Rc<Cell<ChangeSet>>,
    should_quit: bool,
    tick_rate: Duration,
}

impl App {
    pub fn new(config: Arc<AppConfig>, store: TripStore, trip_id: &EntityId) -> Result<Self> {
        let remote: Arc<dyn RemoteService> = Arc::new(store);
        let mut engine = SyncEngine::connect(remote, trip_id, &config.sync)
            .with_context(|| format!("opening trip {trip_id}"))?;

        let changes = Rc::new(Cell::new(ChangeSet::empty()));
        let sink = Rc::clone(&changes);
        engine.subscribe(Box::new(move |_trip: &Trip, change: ChangeSet| {
            sink.set(sink.get() | change)
        }));

        let state = AppState::new(engine.snapshot());
        let mut list_state = ListState::default();
        list_state.select(Some(state.selected));
        Ok(Self {
            tick_rate: config.sync.tick,
            config,
            engine,
            state,
            list_state,
            changes,
            should_quit: false,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let mut terminal = setup_terminal()?;
        let result = self.event_loop(&mut terminal);
        restore_terminal(&mut terminal)?;
        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            terminal
                .draw(|frame| {
                    if self.state.is_empty() {
                        self.list_state.select(None);
                    } else {
                        self.list_state.select(Some(self.state.selected));
                    }
                    ui::draw_app(frame, &self.state, &mut self.list_state);
                })
                .context("rendering frame")?;

            if self.should_quit {
                break;
            }

            let mut timeout = self
                .tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);
            let deadline = self.engine.next_deadline();
            if let Some(deadline) = deadline {
                timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
            }

            if event::poll(timeout).context("polling for terminal events")? {
                if let Event::Key(key) = event::read().context("reading terminal event")? {
                    self.handle_key(key);
                }
            }

            let edit_due = deadline.is_some_and(|deadline| deadline <= Instant::now());
            if edit_due || last_tick.elapsed() >= self.tick_rate {
                self.on_tick();
                last_tick = Instant::now();
            }
        }
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }

        if !self.handle_overlay_key(key) {
            if self.state.is_editing() {
                self.handle_editor_key(key);
            } else if let Some(action) = action_for_key(key) {
                self.handle_action(action);
            }
        }
        self.apply_engine_changes();
        self.refresh_sync_summary();
    }

    fn handle_action(&mut self, action: Action) {
        match action {
            Action::Quit => self.quit(),
            Action::SelectNext => self.state.move_selection(1),
            Action::SelectPrevious => self.state.move_selection(-1),
            Action::MoveDown => self.move_selected(1),
            Action::MoveUp => self.move_selected(-1),
            Action::EditTitle => self.begin_field_edit(Some(Field::Title)),
            Action::EditDetail => {
                let field = self.state.selected().and_then(Row::detail_field);
                self.begin_field_edit(field);
            }
            Action::ToggleTodo => self.toggle_todo(),
            Action::Add(kind) => self.begin_add(kind),
            Action::Delete => {
                if self.config.ui.confirm_delete {
                    self.state.open_confirm_delete();
                } else if let Some(id) = self.state.selected_id().cloned() {
                    self.delete(&id);
                }
            }
            Action::Refresh => {
                self.engine.refresh();
                self.state.set_status_message(Some("Refetching trip"));
            }
            Action::Dismiss => {
                if self.state.dismiss_latest_toast().is_none() {
                    self.state.set_status_message(None::<String>);
                }
            }
        }
    }

    fn on_tick(&mut self) {
        self.engine.tick();
        self.apply_engine_changes();

        let now = Instant::now();
        let notices = self.engine.take_notices();
        if !notices.is_empty() {
            self.state.push_notices(notices, now);
        }
        self.state.expire_toasts(now, self.config.ui.notice_ttl);
        self.refresh_sync_summary();
    }

    fn apply_engine_changes(&mut self) {
        let changes = self.changes.replace(ChangeSet::empty());
        if !changes.is_empty() {
            self.state.sync_rows(self.engine.snapshot());
        }
    }

    fn refresh_sync_summary(&mut self) {
        self.state.sync = state::SyncSummary {
            scheduled: self.engine.scheduled_edits(),
            in_flight: self.engine.pending_writes(),
        };
        self.state.selected_status = self
            .state
            .selected_id()
            .map(|id| self.engine.field_status(&FieldKey::new(id.clone(), Field::Title)));
    }

    fn quit(&mut self) {
        self.engine.flush_all();
        if !self.engine.wait_idle(self.config.sync.idle_timeout) {
            tracing::warn!(
                pending = self.engine.pending_writes(),
                "quitting with writes still in flight"
            );
        }
        self.should_quit = true;
    }

    fn move_selected(&mut self, delta: isize) {
        let Some((parent, item, to)) = self.state.sibling_move(self.engine.snapshot(), delta)
        else {
            return;
        };
        if let Err(err) = self.engine.move_sibling(&parent, &item, to) {
            tracing::warn!(%item, ?err, "move rejected");
            self.state.set_status_message(Some(err.to_string()));
        }
    }

    fn toggle_todo(&mut self) {
        let Some(row) = self.state.selected() else {
            return;
        };
        let (Some(done), id) = (row.completed, row.id.clone()) else {
            return;
        };
        if let Err(err) = self
            .engine
            .edit_field(&id, Field::Completed, FieldValue::Flag(!done))
        {
            self.state.set_status_message(Some(err.to_string()));
        }
    }

    fn begin_field_edit(&mut self, field: Option<Field>) {
        let (Some(field), Some(entity)) = (field, self.state.selected_id().cloned()) else {
            return;
        };
        let text = state::editable_text(self.engine.snapshot(), &entity, field);
        let label = match field {
            Field::Date => "Date (YYYY-MM-DD, empty clears)".to_string(),
            other => capitalise(&other.to_string()),
        };
        self.state.begin_editor(EditorState::new(
            EditTarget::Field { entity, field },
            label,
            text,
        ));
    }

    fn begin_add(&mut self, kind: AddKind) {
        let Some((parent, draft_kind)) = self.state.add_target(kind) else {
            self.state
                .set_status_message(Some("Nothing can be added here"));
            return;
        };
        let label = match &draft_kind {
            DraftKind::Day { .. } => "New day".to_string(),
            DraftKind::Entry { entry_type } => format!("New {entry_type}"),
            DraftKind::Todo => "New todo".to_string(),
        };
        self.state.begin_editor(EditorState::new(
            EditTarget::NewChild {
                parent,
                kind: draft_kind,
            },
            label,
            String::new(),
        ));
    }

    fn delete(&mut self, id: &EntityId) {
        match self.engine.delete_entity(id) {
            Ok(_) => self.state.set_status_message(None::<String>),
            Err(err) => self.state.set_status_message(Some(err.to_string())),
        }
    }

    fn handle_overlay_key(&mut self, key: KeyEvent) -> bool {
        let Some(OverlayState::ConfirmDelete { entity, .. }) = self.state.overlay().cloned() else {
            return false;
        };
        match key.code {
            KeyCode::Char('y') | KeyCode::Enter => {
                self.state.close_overlay();
                self.delete(&entity);
            }
            KeyCode::Char('n') | KeyCode::Esc => {
                self.state.close_overlay();
            }
            _ => {}
        }
        true
    }

    fn handle_editor_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            if key.code == KeyCode::Char('c') {
                self.state.close_editor();
                self.quit();
            }
            return;
        }

        let changed = match key.code {
            KeyCode::Esc => {
                self.finish_editing(false);
                return;
            }
            KeyCode::Enter => {
                self.finish_editing(true);
                return;
            }
            KeyCode::Backspace => self.with_editor(EditorState::backspace),
            KeyCode::Delete => self.with_editor(EditorState::delete),
            KeyCode::Char(ch)
                if !key.modifiers.intersects(KeyModifiers::ALT | KeyModifiers::SUPER) =>
            {
                self.with_editor(|editor| editor.insert_char(ch))
            }
            KeyCode::Left => {
                self.with_editor(EditorState::move_left);
                false
            }
            KeyCode::Right => {
                self.with_editor(EditorState::move_right);
                false
            }
            KeyCode::Home => {
                self.with_editor(EditorState::move_home);
                false
            }
            KeyCode::End => {
                self.with_editor(EditorState::move_end);
                false
            }
            _ => false,
        };
        if changed {
            self.push_live_edit();
        }
    }

    fn with_editor<F>(&mut self, f: F) -> bool
    where
        F: FnOnce(&mut EditorState) -> bool,
    {
        self.state.editor_mut().map(f).unwrap_or(false)
    }

    /// Sends the buffer to the engine for free-text fields. The engine
    /// debounces, so this runs on every keystroke.
    fn push_live_edit(&mut self) {
        let Some(editor) = self.state.editor() else {
            return;
        };
        if !editor.target.is_live() {
            return;
        }
        let EditTarget::Field { entity, field } = editor.target.clone() else {
            return;
        };
        let value = FieldValue::text(editor.buffer());
        let error = self
            .engine
            .edit_field(&entity, field, value)
            .err()
            .map(|err| err.to_string());
        if let Some(editor) = self.state.editor_mut() {
            editor.error = error;
        }
    }

    fn finish_editing(&mut self, accept: bool) {
        let Some(editor) = self.state.close_editor() else {
            return;
        };
        if !accept || editor.target.is_live() {
            return;
        }
        let text = editor.buffer().to_string();
        let result = match editor.target {
            EditTarget::Field { entity, field } => FieldValue::parse_for(field, &text)
                .map_err(Into::into)
                .and_then(|value| self.engine.edit_field(&entity, field, value)),
            EditTarget::NewChild { parent, kind } => {
                let draft = ChildDraft {
                    id: EntityId::generate(),
                    title: text,
                    kind,
                };
                self.engine.add_child(&parent, draft).map(|id| {
                    self.apply_engine_changes();
                    self.state.select_id(&id);
                })
            }
        };
        if let Err(err) = result {
            self.state.set_status_message(Some(err.to_string()));
        }
    }
}

fn capitalise(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode().context("enabling raw mode")?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)
        .context("switching to alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("creating terminal backend")?;
    terminal.hide_cursor().context("hiding cursor")?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    terminal.show_cursor().ok();
    disable_raw_mode().context("disabling raw mode")?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )
    .context("restoring screen state")?;
    Ok(())
}
