use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use super::state::AddKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    SelectNext,
    SelectPrevious,
    MoveDown,
    MoveUp,
    EditTitle,
    EditDetail,
    ToggleTodo,
    Add(AddKind),
    Delete,
    Refresh,
    Dismiss,
}

/// Maps a key press in the outline to an action. Editor and overlay keys are
/// handled before this is consulted.
pub fn action_for_key(key: KeyEvent) -> Option<Action> {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('c') => Some(Action::Quit),
            KeyCode::Char('r') => Some(Action::Refresh),
            _ => None,
        };
    }
    if key.modifiers.intersects(KeyModifiers::ALT | KeyModifiers::SUPER) {
        return None;
    }
    match key.code {
        KeyCode::Char('q') => Some(Action::Quit),
        KeyCode::Char('j') | KeyCode::Down => Some(Action::SelectNext),
        KeyCode::Char('k') | KeyCode::Up => Some(Action::SelectPrevious),
        KeyCode::Char('J') => Some(Action::MoveDown),
        KeyCode::Char('K') => Some(Action::MoveUp),
        KeyCode::Char('e') | KeyCode::Enter => Some(Action::EditTitle),
        KeyCode::Char('n') => Some(Action::EditDetail),
        KeyCode::Char(' ') => Some(Action::ToggleTodo),
        KeyCode::Char('a') => Some(Action::Add(AddKind::Default)),
        KeyCode::Char('t') => Some(Action::Add(AddKind::Todos)),
        KeyCode::Char('p') => Some(Action::Add(AddKind::Place)),
        KeyCode::Char('x') | KeyCode::Delete => Some(Action::Delete),
        KeyCode::Char('r') => Some(Action::Refresh),
        KeyCode::Esc => Some(Action::Dismiss),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use crossterm::event::KeyEventKind;

    use super::*;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        let mut key = KeyEvent::new(code, modifiers);
        key.kind = KeyEventKind::Press;
        key
    }

    #[test]
    fn capital_letters_move_items() {
        assert_eq!(
            action_for_key(press(KeyCode::Char('J'), KeyModifiers::SHIFT)),
            Some(Action::MoveDown)
        );
        assert_eq!(
            action_for_key(press(KeyCode::Char('k'), KeyModifiers::NONE)),
            Some(Action::SelectPrevious)
        );
    }

    #[test]
    fn modified_keys_do_not_trigger_plain_actions() {
        assert_eq!(
            action_for_key(press(KeyCode::Char('x'), KeyModifiers::ALT)),
            None
        );
        assert_eq!(
            action_for_key(press(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Action::Quit)
        );
        assert_eq!(
            action_for_key(press(KeyCode::Char('p'), KeyModifiers::NONE)),
            Some(Action::Add(AddKind::Place))
        );
    }
}
