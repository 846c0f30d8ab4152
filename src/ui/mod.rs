use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Frame;
use unicode_width::UnicodeWidthStr;

use crate::app::state::{
    truncate_to_width, AppState, EditTarget, EditorState, OverlayState, Row, RowKind, Toast,
};
use crate::model::EntryType;
use crate::sync::notice::Severity;
use crate::sync::FieldStatus;

const MAX_TOASTS: usize = 3;

pub fn draw_app(frame: &mut Frame, state: &AppState, list_state: &mut ListState) {
    let editor_height = if state.is_editing() { 3 } else { 0 };
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(3),
            Constraint::Length(editor_height),
            Constraint::Length(2),
        ])
        .split(frame.size());

    let outline_area = vertical[0];
    let text_width = outline_area.width.saturating_sub(4) as usize;
    let mut items = Vec::with_capacity(state.rows.len());
    for row in &state.rows {
        items.push(ListItem::new(outline_line(row, text_width)));
    }
    if items.is_empty() {
        items.push(ListItem::new("This trip is empty."));
    }

    let trip_title = state
        .rows
        .first()
        .map(|row| row.label.as_str())
        .unwrap_or("Trip");
    let list = List::new(items)
        .block(
            Block::default()
                .title(format!(" {trip_title} "))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .highlight_style(
            Style::default()
                .bg(Color::Blue)
                .fg(Color::Black)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("▸ ");
    frame.render_stateful_widget(list, outline_area, list_state);

    if let Some(editor) = state.editor() {
        render_editor(frame, editor, vertical[1]);
    }

    let status = build_status_line(state);
    let status_paragraph = Paragraph::new(status).style(Style::default().fg(Color::Gray));
    frame.render_widget(status_paragraph, vertical[2]);

    render_toasts(frame, &state.toasts, outline_area);
    render_overlay(frame, state);
}

fn outline_line(row: &Row, width: usize) -> Line<'static> {
    let indent = "  ".repeat(row.depth);
    let (marker, marker_style) = match row.kind {
        RowKind::Trip => ("", Style::default()),
        RowKind::Day => ("", Style::default().fg(Color::Yellow)),
        RowKind::Entry(EntryType::Place) => ("@ ", Style::default().fg(Color::Green)),
        RowKind::Entry(EntryType::Note) => ("¶ ", Style::default().fg(Color::Magenta)),
        RowKind::Entry(EntryType::Todos) => ("☰ ", Style::default().fg(Color::Cyan)),
        RowKind::Todo => match row.completed {
            Some(true) => ("[x] ", Style::default().fg(Color::Green)),
            _ => ("[ ] ", Style::default()),
        },
    };
    let label_style = match row.kind {
        RowKind::Trip | RowKind::Day => Style::default().add_modifier(Modifier::BOLD),
        RowKind::Todo if row.completed == Some(true) => Style::default()
            .fg(Color::Gray)
            .add_modifier(Modifier::CROSSED_OUT),
        _ => Style::default(),
    };

    let used = UnicodeWidthStr::width(indent.as_str()) + UnicodeWidthStr::width(marker);
    let room = width.saturating_sub(used);
    let label = truncate_to_width(&row.label, room);
    let mut spans = vec![
        Span::raw(indent),
        Span::styled(marker, marker_style),
        Span::styled(label.clone(), label_style),
    ];
    if let Some(detail) = &row.detail {
        let left = room.saturating_sub(UnicodeWidthStr::width(label.as_str()) + 3);
        if left > 1 {
            spans.push(Span::styled(
                format!(" · {}", truncate_to_width(detail, left)),
                Style::default().fg(Color::Gray),
            ));
        }
    }
    Line::from(spans)
}

fn render_editor(frame: &mut Frame, editor: &EditorState, area: Rect) {
    if area.height < 3 {
        return;
    }
    let hint = match editor.target {
        EditTarget::Field { .. } if editor.target.is_live() => "saves as you type · Enter/Esc close",
        EditTarget::Field { .. } => "Enter to apply · Esc to cancel",
        EditTarget::NewChild { .. } => "Enter to add · Esc to cancel",
    };
    let mut title = format!(" {} ({hint}) ", editor.label);
    let border = match &editor.error {
        Some(error) => {
            title = format!(" {}: {error} ", editor.label);
            Style::default().fg(Color::Red)
        }
        None => Style::default().fg(Color::Magenta),
    };
    let paragraph = Paragraph::new(editor.buffer().to_string()).block(
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(border),
    );
    frame.render_widget(Clear, area);
    frame.render_widget(paragraph, area);

    let inner_width = area.width.saturating_sub(2) as usize;
    if inner_width > 0 {
        let column = editor.cursor_column().min(inner_width - 1) as u16;
        frame.set_cursor(area.x + 1 + column, area.y + 1);
    }
}

fn build_status_line(state: &AppState) -> Text<'static> {
    let sync = if state.sync.scheduled == 0 && state.sync.in_flight == 0 {
        Span::styled("saved", Style::default().fg(Color::Green))
    } else {
        Span::styled(
            format!(
                "{} waiting · {} syncing",
                state.sync.scheduled, state.sync.in_flight
            ),
            Style::default().fg(Color::Yellow),
        )
    };
    let mut spans = vec![Span::raw("Sync: "), sync];
    if let Some(status) = state.selected_status {
        let (label, style) = match status {
            FieldStatus::Clean => ("clean", Style::default()),
            FieldStatus::Scheduled => ("editing", Style::default().fg(Color::Yellow)),
            FieldStatus::Syncing => ("syncing", Style::default().fg(Color::Cyan)),
            FieldStatus::RolledBack => ("reverted", Style::default().fg(Color::Red)),
        };
        spans.push(Span::raw(" | Title: "));
        spans.push(Span::styled(label, style.add_modifier(Modifier::BOLD)));
    }
    if let Some(message) = &state.status_message {
        spans.push(Span::raw(" | "));
        spans.push(Span::styled(
            message.clone(),
            Style::default().add_modifier(Modifier::ITALIC),
        ));
    }

    let help = if state.is_editing() {
        "typing… Enter to finish, Esc to leave"
    } else {
        "j/k select  J/K move  e title  n details  space toggle  a/t/p add  x delete  r refetch  q quit"
    };
    Text::from(vec![
        Line::from(spans),
        Line::from(Span::styled(help, Style::default().fg(Color::DarkGray))),
    ])
}

fn render_toasts(frame: &mut Frame, toasts: &[Toast], area: Rect) {
    let width = (area.width / 2).max(30).min(area.width);
    let mut y = area.y + 1;
    for toast in toasts.iter().rev().take(MAX_TOASTS) {
        let lines = textwrap_height(&toast.notice.message, width.saturating_sub(2));
        let height = lines + 2;
        if y + height > area.y + area.height {
            break;
        }
        let rect = Rect {
            x: area.x + area.width - width,
            y,
            width,
            height,
        };
        let color = match toast.notice.severity {
            Severity::Info => Color::Cyan,
            Severity::Warning => Color::Yellow,
            Severity::Error => Color::Red,
        };
        let paragraph = Paragraph::new(toast.notice.message.clone())
            .wrap(Wrap { trim: true })
            .block(
                Block::default()
                    .title(" Esc to dismiss ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(color)),
            );
        frame.render_widget(Clear, rect);
        frame.render_widget(paragraph, rect);
        y += height;
    }
}

/// Rough line count of `text` wrapped at `width` columns.
fn textwrap_height(text: &str, width: u16) -> u16 {
    let width = usize::from(width.max(1));
    let total = UnicodeWidthStr::width(text);
    (total.div_ceil(width)).clamp(1, 6) as u16
}

fn render_overlay(frame: &mut Frame, state: &AppState) {
    let Some(OverlayState::ConfirmDelete { title, .. }) = state.overlay() else {
        return;
    };
    let area = centered_rect(50, 25, frame.size());
    frame.render_widget(Clear, area);
    let paragraph = Paragraph::new(vec![
        Line::from(Span::styled(
            format!("Delete '{title}' and everything under it?"),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from(Span::styled(
            "y/Enter to delete • n/Esc to keep",
            Style::default().fg(Color::Gray),
        )),
    ])
    .block(
        Block::default()
            .title("Delete")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Red)),
    )
    .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, area);
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}
