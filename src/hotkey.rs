//! Global hotkey detection using evdev.
//!
//! Watches every keyboard for the configured combos and sends one
//! [`Trigger::Toggle`] per press. Releases and key repeats are ignored.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use evdev::{Device, EventType, InputEventKind, Key};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HotkeyConfig;
use crate::service::Trigger;

/// Highest key code worth searching when resolving names.
const MAX_KEY_CODE: u16 = 0x2ff;

/// Resolve a name like "KEY_LEFTALT" to its evdev key.
pub fn resolve_key(name: &str) -> Option<Key> {
    let found = (0..=MAX_KEY_CODE)
        .map(Key::new)
        .find(|key| format!("{key:?}") == name);
    if found.is_none() {
        warn!("Unknown key name: {name}");
    }
    found
}

fn resolve_combo(names: &[String]) -> Option<HashSet<Key>> {
    let combo: HashSet<Key> = names.iter().filter_map(|s| resolve_key(s)).collect();
    // A partially resolved combo would fire on a subset of the intended keys.
    (!combo.is_empty() && combo.len() == names.len()).then_some(combo)
}

#[derive(Default)]
struct PressedKeys {
    keys: HashSet<Key>,
    combo_held: bool,
}

impl PressedKeys {
    /// Apply one key event; true when a combo just became fully held.
    fn apply(&mut self, key: Key, value: i32, combos: &[HashSet<Key>]) -> bool {
        // 0 = release, 1 = press, 2 = repeat
        match value {
            1 => {
                self.keys.insert(key);
            }
            0 => {
                self.keys.remove(&key);
            }
            _ => return false,
        }

        let held = combos.iter().any(|combo| combo.is_subset(&self.keys));
        let fired = held && !self.combo_held;
        self.combo_held = held;
        fired
    }
}

pub struct HotkeyMonitor {
    combos: Vec<HashSet<Key>>,
    pressed: Arc<Mutex<PressedKeys>>,
    tx: mpsc::Sender<Trigger>,
}

impl HotkeyMonitor {
    pub fn new(config: &HotkeyConfig, tx: mpsc::Sender<Trigger>) -> Self {
        let combos: Vec<HashSet<Key>> = std::iter::once(&config.combo)
            .chain(config.alt_combos.iter())
            .filter_map(|names| resolve_combo(names))
            .collect();

        info!("Hotkey combos: {} configured", combos.len());

        Self {
            combos,
            pressed: Arc::new(Mutex::new(PressedKeys::default())),
            tx,
        }
    }

    /// Find all keyboard input devices.
    pub fn find_keyboards() -> Vec<Device> {
        evdev::enumerate()
            .map(|(_path, device)| device)
            .filter(|device| {
                device
                    .supported_keys()
                    .is_some_and(|keys| keys.contains(Key::KEY_A) && keys.contains(Key::KEY_ENTER))
            })
            .inspect(|device| info!("Found keyboard: {}", device.name().unwrap_or("unknown")))
            .collect()
    }

    async fn monitor_device(
        device: Device,
        combos: Vec<HashSet<Key>>,
        pressed: Arc<Mutex<PressedKeys>>,
        tx: mpsc::Sender<Trigger>,
    ) {
        let name = device.name().unwrap_or("unknown").to_string();
        debug!("Monitoring {name}");

        let mut events = match device.into_event_stream() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot create event stream for {name}: {e}");
                return;
            }
        };

        loop {
            let event = match events.next_event().await {
                Ok(event) => event,
                Err(e) => {
                    warn!("Device {name} disconnected: {e}");
                    break;
                }
            };
            if event.event_type() != EventType::KEY {
                continue;
            }
            let InputEventKind::Key(key) = event.kind() else {
                continue;
            };

            let fired = pressed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .apply(key, event.value(), &combos);
            if fired {
                debug!("Hotkey pressed");
                let _ = tx.try_send(Trigger::Toggle);
            }
        }
    }

    /// Monitor all keyboards until every device disconnects.
    pub async fn run(self) {
        if self.combos.is_empty() {
            warn!("No usable hotkey combo configured");
            return;
        }

        let keyboards = Self::find_keyboards();
        if keyboards.is_empty() {
            warn!(
                "No keyboards found, hotkey disabled. Make sure you're in the 'input' group: \
                 sudo usermod -aG input $USER"
            );
            return;
        }

        info!("Monitoring {} keyboard(s)", keyboards.len());

        let handles: Vec<_> = keyboards
            .into_iter()
            .map(|device| {
                tokio::spawn(Self::monitor_device(
                    device,
                    self.combos.clone(),
                    Arc::clone(&self.pressed),
                    self.tx.clone(),
                ))
            })
            .collect();

        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_key_names() {
        assert_eq!(resolve_key("KEY_F11"), Some(Key::KEY_F11));
        assert_eq!(resolve_key("KEY_LEFTALT"), Some(Key::KEY_LEFTALT));
        assert_eq!(resolve_key("KEY_NOPE"), None);
    }

    #[test]
    fn combo_with_unknown_key_is_dropped() {
        assert!(resolve_combo(&["KEY_LEFTALT".into(), "KEY_NOPE".into()]).is_none());
        assert_eq!(resolve_combo(&["KEY_LEFTALT".into(), "KEY_F11".into()]).unwrap().len(), 2);
    }

    #[test]
    fn fires_once_per_press_and_ignores_repeats() {
        let combo: HashSet<Key> = [Key::KEY_LEFTALT, Key::KEY_F11].into_iter().collect();
        let combos = vec![combo];
        let mut pressed = PressedKeys::default();

        assert!(!pressed.apply(Key::KEY_LEFTALT, 1, &combos));
        assert!(pressed.apply(Key::KEY_F11, 1, &combos));
        assert!(!pressed.apply(Key::KEY_F11, 2, &combos));
        assert!(!pressed.apply(Key::KEY_F11, 0, &combos));
        assert!(pressed.apply(Key::KEY_F11, 1, &combos));
    }
}
