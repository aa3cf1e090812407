//! Global push-to-talk hotkey
//!
//! Key events are read directly from /dev/input/event* devices, bypassing
//! Wayland's compositor-level input isolation, and delivered as plain
//! [`KeyEvent`]s to the session loop. Combo matching and the PTT state
//! machine run there, on a single task.
//!
//! # Requirements
//! - User must be in the `input` group: `sudo usermod -aG input $USER`
//! - Log out and back in after adding to group

mod detector;
pub mod hook;
pub mod ptt;

pub use detector::ComboDetector;
pub use evdev::Key;
pub use hook::{install_hook, EvdevKeySource, HookHandle, KeySource};
pub use ptt::{reduce, PttEffect, PttEvent, PttState, StopReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotkeyError {
    /// No readable keyboard device; carries the instructions for fixing it.
    PermissionDenied(String),
    /// Another hook is already installed in this process.
    AlreadyActive,
    UnknownKey(String),
    EmptyCombo,
    DeviceError(String),
}

impl std::fmt::Display for HotkeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HotkeyError::PermissionDenied(e) => write!(f, "Permission denied: {}", e),
            HotkeyError::AlreadyActive => write!(f, "A hotkey hook is already active"),
            HotkeyError::UnknownKey(k) => write!(f, "Unknown key name: {:?}", k),
            HotkeyError::EmptyCombo => write!(f, "Hotkey combo is empty"),
            HotkeyError::DeviceError(e) => write!(f, "Input device error: {}", e),
        }
    }
}

impl std::error::Error for HotkeyError {}

/// A raw key event. `value`: 0 = released, 1 = pressed, 2 = repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub value: i32,
}

impl KeyEvent {
    pub fn press(key: Key) -> Self {
        Self { key, value: 1 }
    }

    pub fn release(key: Key) -> Self {
        Self { key, value: 0 }
    }

    pub fn repeat(key: Key) -> Self {
        Self { key, value: 2 }
    }
}

const NAMED_KEYS: &[(&str, Key)] = &[
    ("cmd_l", Key::KEY_LEFTMETA),
    ("cmd_r", Key::KEY_RIGHTMETA),
    ("alt_l", Key::KEY_LEFTALT),
    ("alt_r", Key::KEY_RIGHTALT),
    ("ctrl_l", Key::KEY_LEFTCTRL),
    ("ctrl_r", Key::KEY_RIGHTCTRL),
    ("shift_l", Key::KEY_LEFTSHIFT),
    ("shift_r", Key::KEY_RIGHTSHIFT),
    ("f13", Key::KEY_F13),
    ("f14", Key::KEY_F14),
    ("f15", Key::KEY_F15),
    ("space", Key::KEY_SPACE),
];

const LETTER_KEYS: [Key; 26] = [
    Key::KEY_A,
    Key::KEY_B,
    Key::KEY_C,
    Key::KEY_D,
    Key::KEY_E,
    Key::KEY_F,
    Key::KEY_G,
    Key::KEY_H,
    Key::KEY_I,
    Key::KEY_J,
    Key::KEY_K,
    Key::KEY_L,
    Key::KEY_M,
    Key::KEY_N,
    Key::KEY_O,
    Key::KEY_P,
    Key::KEY_Q,
    Key::KEY_R,
    Key::KEY_S,
    Key::KEY_T,
    Key::KEY_U,
    Key::KEY_V,
    Key::KEY_W,
    Key::KEY_X,
    Key::KEY_Y,
    Key::KEY_Z,
];

const DIGIT_KEYS: [Key; 10] = [
    Key::KEY_0,
    Key::KEY_1,
    Key::KEY_2,
    Key::KEY_3,
    Key::KEY_4,
    Key::KEY_5,
    Key::KEY_6,
    Key::KEY_7,
    Key::KEY_8,
    Key::KEY_9,
];

fn key_from_name(name: &str) -> Option<Key> {
    if let Some((_, key)) = NAMED_KEYS.iter().find(|(n, _)| *n == name) {
        return Some(*key);
    }
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c @ 'a'..='z'), None) => Some(LETTER_KEYS[(c as u8 - b'a') as usize]),
        (Some(c @ '0'..='9'), None) => Some(DIGIT_KEYS[(c as u8 - b'0') as usize]),
        _ => None,
    }
}

fn key_name(key: Key) -> String {
    if let Some((name, _)) = NAMED_KEYS.iter().find(|(_, k)| *k == key) {
        return (*name).to_string();
    }
    if let Some(i) = LETTER_KEYS.iter().position(|k| *k == key) {
        return ((b'a' + i as u8) as char).to_string();
    }
    if let Some(i) = DIGIT_KEYS.iter().position(|k| *k == key) {
        return ((b'0' + i as u8) as char).to_string();
    }
    format!("{:?}", key)
}

/// A hotkey: a single key or modifier(s) + key, all of which must be held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCombo {
    keys: Vec<Key>,
}

impl KeyCombo {
    /// Parse `"cmd_r"`, `"ctrl_l+shift_l+m"` and similar. Case-insensitive.
    pub fn parse(spec: &str) -> Result<Self, HotkeyError> {
        let mut keys = Vec::new();
        for part in spec.split('+') {
            let name = part.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            let key = key_from_name(&name).ok_or_else(|| HotkeyError::UnknownKey(name.clone()))?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return Err(HotkeyError::EmptyCombo);
        }
        Ok(Self { keys })
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn contains(&self, key: Key) -> bool {
        self.keys.contains(&key)
    }
}

impl std::fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.keys.iter().map(|k| key_name(*k)).collect();
        write!(f, "{}", parts.join("+"))
    }
}

impl std::str::FromStr for KeyCombo {
    type Err = HotkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_modifier() {
        let combo = KeyCombo::parse("cmd_r").unwrap();
        assert_eq!(combo.keys(), &[Key::KEY_RIGHTMETA]);
        assert_eq!(combo.to_string(), "cmd_r");
    }

    #[test]
    fn parse_modifier_plus_char() {
        let combo = KeyCombo::parse("Ctrl_L + Shift_L + m").unwrap();
        assert_eq!(
            combo.keys(),
            &[Key::KEY_LEFTCTRL, Key::KEY_LEFTSHIFT, Key::KEY_M]
        );
        assert_eq!(combo.to_string(), "ctrl_l+shift_l+m");
    }

    #[test]
    fn parse_digits_and_function_keys() {
        assert_eq!(KeyCombo::parse("7").unwrap().keys(), &[Key::KEY_7]);
        assert_eq!(KeyCombo::parse("f13").unwrap().keys(), &[Key::KEY_F13]);
    }

    #[test]
    fn parse_rejects_unknown_and_empty() {
        assert_eq!(
            KeyCombo::parse("hyper"),
            Err(HotkeyError::UnknownKey("hyper".into()))
        );
        assert_eq!(KeyCombo::parse(" + "), Err(HotkeyError::EmptyCombo));
    }

    #[test]
    fn duplicate_keys_collapse() {
        let combo = KeyCombo::parse("a+a").unwrap();
        assert_eq!(combo.keys().len(), 1);
    }
}
