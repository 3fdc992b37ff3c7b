//! Input handling module
//!
//! Maps companion-window keyboard events to application actions.

use winit::event::{ElementState, KeyEvent};
use winit::keyboard::{Key, NamedKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    Quit,
    ToggleCubes,
}

/// Key presses only; releases and repeats map to nothing.
pub fn action_for_key(state: ElementState, repeat: bool, key: &Key) -> Option<AppAction> {
    if state != ElementState::Pressed || repeat {
        return None;
    }
    match key {
        Key::Named(NamedKey::Escape) => Some(AppAction::Quit),
        Key::Character(c) if c.eq_ignore_ascii_case("q") => Some(AppAction::Quit),
        Key::Character(c) if c.eq_ignore_ascii_case("c") => Some(AppAction::ToggleCubes),
        _ => None,
    }
}

pub fn handle_keyboard_input(event: &KeyEvent) -> Option<AppAction> {
    action_for_key(event.state, event.repeat, &event.logical_key)
}
