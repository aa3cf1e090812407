//! Combo detection with a pressed-key set and an edge-trigger flag

use std::collections::HashSet;

use evdev::Key;

use super::KeyCombo;

/// Fires once per continuous hold of every key in the combo.
///
/// A press adds to the pressed set; the combo triggers when all required keys
/// are in it and the edge flag is clear. Releasing any required key clears
/// the flag so the next full press triggers again.
#[derive(Debug)]
pub struct ComboDetector {
    combo: KeyCombo,
    pressed: HashSet<Key>,
    fired: bool,
}

impl ComboDetector {
    pub fn new(combo: KeyCombo) -> Self {
        Self {
            combo,
            pressed: HashSet::new(),
            fired: false,
        }
    }

    pub fn combo(&self) -> &KeyCombo {
        &self.combo
    }

    /// Process a key event, returning true if the combo was triggered.
    ///
    /// * `value` - 0 = released, 1 = pressed, 2 = repeat
    pub fn process_key(&mut self, key: Key, value: i32) -> bool {
        match value {
            0 => {
                self.pressed.remove(&key);
                if self.combo.contains(key) {
                    self.fired = false;
                }
                false
            }
            1 => {
                self.pressed.insert(key);
                if self.fired || !self.combo.contains(key) {
                    return false;
                }
                if self.combo.keys().iter().all(|k| self.pressed.contains(k)) {
                    self.fired = true;
                    return true;
                }
                false
            }
            // Auto-repeat never triggers
            _ => false,
        }
    }

    /// Forget all held keys (device reconnect, session restart).
    pub fn reset(&mut self) {
        self.pressed.clear();
        self.fired = false;
    }
}
