//! Keyboard bindings for history navigation.
//!
//! Ctrl/Cmd+Z undoes, Ctrl/Cmd+Shift+Z and Ctrl/Cmd+Y redo. Keys compare
//! case-insensitively because most platforms report `"Z"` while Shift is held.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCommand {
    Undo,
    Redo,
}

/// Modifier state of a key event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
}

impl Modifiers {
    #[must_use]
    pub fn ctrl() -> Self {
        Self { ctrl: true, ..Self::default() }
    }

    #[must_use]
    pub fn meta() -> Self {
        Self { meta: true, ..Self::default() }
    }

    #[must_use]
    pub fn with_shift(self) -> Self {
        Self { shift: true, ..self }
    }
}

impl HistoryCommand {
    /// Map a key event to a history command, if it is one.
    #[must_use]
    pub fn from_key(key: &str, modifiers: Modifiers) -> Option<Self> {
        if !(modifiers.ctrl || modifiers.meta) {
            return None;
        }
        if key.eq_ignore_ascii_case("z") {
            return Some(if modifiers.shift { Self::Redo } else { Self::Undo });
        }
        if key.eq_ignore_ascii_case("y") {
            return Some(Self::Redo);
        }
        None
    }
}

#[cfg(test)]
#[path = "shortcut_test.rs"]
mod tests;
