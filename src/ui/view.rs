//! Terminal drawing.

use std::io::{self, Write};
use std::time::Instant;

use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute, queue};

use super::app::App;
use crate::config::Encoding;
use crate::mixer::{DisplayItem, LevelScale};

const LABEL_MIN: usize = 10;
const BAR_MIN: usize = 10;
const MUTE_LEN: usize = 2;
/// Width of " [ " + " ]" around the bar
const CAPS_LEN: usize = 5;

/// Column widths for one screen width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub label: usize,
    pub bar: usize,
}

impl Layout {
    /// Shrink labels before the bar, and drop the bar entirely when even
    /// minimal labels do not fit next to it.
    pub fn fit(width: usize, longest_label: usize) -> Self {
        let width = width as isize;
        let longest = longest_label as isize;
        let fixed = (MUTE_LEN + CAPS_LEN) as isize;

        let mut label = longest;
        let mut bar = width - label - fixed;
        if bar < BAR_MIN as isize {
            label = (LABEL_MIN as isize).max(label + bar - BAR_MIN as isize);
            bar = width - label - fixed;
            if bar <= 0 {
                label = width;
            }
            if label < LABEL_MIN as isize {
                label = longest.min(width);
            }
        }
        Self {
            label: label.max(0) as usize,
            bar: bar.max(0) as usize,
        }
    }
}

/// One item line: padded label, mute marker and level bar.
pub fn item_row(item: &DisplayItem, layout: Layout, width: usize, scale: &LevelScale) -> String {
    let mut row: String = item.label.chars().take(layout.label).collect();
    let pad = layout.label.saturating_sub(row.chars().count());
    row.extend(std::iter::repeat_n(' ', pad));

    if width > layout.label + MUTE_LEN {
        row.push_str(if item.muted { " M" } else { " -" });
        if layout.bar > 0 {
            let fill = (scale.position(item.level) * layout.bar as f64).round() as usize;
            let fill = fill.min(layout.bar);
            row.push_str(" [ ");
            row.extend(std::iter::repeat_n('#', fill));
            row.extend(std::iter::repeat_n('-', layout.bar - fill));
            row.push_str(" ]");
        }
    }
    row
}

/// Bottom line: connection state, then any transient message.
pub fn status_line(app: &App, now: Instant) -> String {
    let mut line = if app.is_degraded() {
        "session stopped [stale]".to_string()
    } else {
        app.state().to_string()
    };
    let hidden = app.snapshot().hidden;
    if hidden > 0 {
        line.push_str(&format!(" | {} hidden", hidden));
    }
    if let Some(status) = app.status(now) {
        line.push_str(" | ");
        line.push_str(status);
    }
    line
}

/// First visible row so that the focused item stays on screen.
fn scroll_offset(focused: Option<usize>, rows: usize) -> usize {
    match focused {
        Some(index) if rows > 0 && index >= rows => index + 1 - rows,
        _ => 0,
    }
}

/// Raw-mode alternate screen; restored on drop, including during unwinding.
pub struct Screen {
    out: io::Stdout,
    scale: LevelScale,
    encoding: Encoding,
}

impl Screen {
    pub fn enter(scale: LevelScale, encoding: Encoding) -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        let mut out = io::stdout();
        if let Err(e) = execute!(out, EnterAlternateScreen, cursor::Hide) {
            let _ = terminal::disable_raw_mode();
            return Err(e);
        }
        Ok(Self {
            out,
            scale,
            encoding,
        })
    }

    pub fn draw(&mut self, app: &App, now: Instant) -> io::Result<()> {
        let (cols, rows) = terminal::size()?;
        let (width, rows) = (cols as usize, rows as usize);
        let list_rows = rows.saturating_sub(1);

        queue!(self.out, Clear(ClearType::All))?;

        let items = &app.snapshot().items;
        let labels: Vec<String> = items
            .iter()
            .map(|item| self.encoding.sanitize(&item.label))
            .collect();
        let longest = labels.iter().map(|l| l.chars().count()).max().unwrap_or(0);
        let layout = Layout::fit(width, longest);
        let focused = app.focused_index();
        let offset = scroll_offset(focused, list_rows);

        if items.is_empty() && list_rows > 0 {
            queue!(self.out, cursor::MoveTo(0, 0), Print("(nothing to show)"))?;
        }

        for (row, index) in (offset..items.len()).take(list_rows).enumerate() {
            let mut item = items[index].clone();
            item.label = labels[index].clone();
            let text: String = item_row(&item, layout, width, &self.scale)
                .chars()
                .take(width)
                .collect();

            queue!(self.out, cursor::MoveTo(0, row as u16))?;
            if focused == Some(index) {
                // Highlight the label only
                let split = text
                    .char_indices()
                    .nth(layout.label)
                    .map_or(text.len(), |(i, _)| i);
                let (label, rest) = text.split_at(split);
                queue!(
                    self.out,
                    SetAttribute(Attribute::Reverse),
                    Print(label),
                    SetAttribute(Attribute::Reset),
                    Print(rest),
                )?;
            } else {
                queue!(self.out, Print(&text))?;
            }
        }

        if rows > 0 {
            let status: String = self
                .encoding
                .sanitize(&status_line(app, now))
                .chars()
                .take(width)
                .collect();
            queue!(
                self.out,
                cursor::MoveTo(0, (rows - 1) as u16),
                SetAttribute(Attribute::Dim),
                Print(status),
                SetAttribute(Attribute::Reset),
            )?;
        }
        self.out.flush()
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        let _ = execute!(self.out, cursor::Show, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}
