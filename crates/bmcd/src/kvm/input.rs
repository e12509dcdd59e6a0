//! VNC input events translated into USB-HID reports.
use bmc_gadget::hid::{HidWriter, MAX_KEYS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Decoded client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Key { down: bool, keysym: u32 },
    Pointer { buttons: u8, x: u16, y: u16 },
    Wheel { delta: i8 },
}

/// VNC pointer-mask bits.
const BUTTON_LEFT: u8 = 1 << 0;
const BUTTON_MIDDLE: u8 = 1 << 1;
const BUTTON_RIGHT: u8 = 1 << 2;
const WHEEL_UP: u8 = 1 << 3;
const WHEEL_DOWN: u8 = 1 << 4;

/// Split a VNC pointer mask into HID buttons and a wheel step.
pub fn decode_pointer_mask(mask: u8) -> (u8, i8) {
    let mut buttons = 0;
    if mask & BUTTON_LEFT != 0 {
        buttons |= 1 << 0;
    }
    if mask & BUTTON_MIDDLE != 0 {
        buttons |= 1 << 1;
    }
    if mask & BUTTON_RIGHT != 0 {
        buttons |= 1 << 2;
    }
    let wheel = if mask & WHEEL_UP != 0 {
        1
    } else if mask & WHEEL_DOWN != 0 {
        -1
    } else {
        0
    };
    (buttons, wheel)
}

/// Pressed-key state mirrored into the boot keyboard report.
#[derive(Default)]
pub struct KeyboardState {
    modifiers: u8,
    keys: Vec<u8>,
}

impl KeyboardState {
    /// Apply one key event. Returns the report contents when it changed.
    pub fn apply(&mut self, down: bool, keysym: u32) -> Option<(u8, Vec<u8>)> {
        if let Some(modifier) = modifier_bit(keysym) {
            let before = self.modifiers;
            if down {
                self.modifiers |= modifier;
            } else {
                self.modifiers &= !modifier;
            }
            if self.modifiers == before {
                return None;
            }
            return Some((self.modifiers, self.keys.clone()));
        }

        let (usage, shifted) = keysym_to_usage(keysym)?;
        // A shifted symbol (e.g. '!') needs the shift modifier even when
        // the client never sent one.
        if down && shifted {
            self.modifiers |= MOD_LEFT_SHIFT;
        } else if !down && shifted {
            self.modifiers &= !MOD_LEFT_SHIFT;
        }

        if down {
            if self.keys.contains(&usage) {
                return None;
            }
            if self.keys.len() == MAX_KEYS {
                self.keys.remove(0);
            }
            self.keys.push(usage);
        } else {
            let before = self.keys.len();
            self.keys.retain(|k| *k != usage);
            if self.keys.len() == before && !shifted {
                return None;
            }
        }
        Some((self.modifiers, self.keys.clone()))
    }
}

/// Drain input events into the HID gadget devices. A write failure logs
/// and continues; the host side may simply not be polling yet.
pub async fn run_injector(
    ctx: CancellationToken,
    mut events: mpsc::Receiver<InputEvent>,
    mut keyboard: HidWriter,
    mut mouse: HidWriter,
) {
    let mut state = KeyboardState::default();
    loop {
        let event = tokio::select! {
            _ = ctx.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        let result = match event {
            InputEvent::Key { down, keysym } => match state.apply(down, keysym) {
                Some((modifiers, keys)) => keyboard.send_keys(modifiers, &keys).await,
                None => Ok(()),
            },
            InputEvent::Pointer { buttons, x, y } => mouse.send_pointer(buttons, x, y).await,
            InputEvent::Wheel { delta } => mouse.send_wheel(delta).await,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "hid write failed");
        }
    }
}

const MOD_LEFT_CTRL: u8 = 1 << 0;
const MOD_LEFT_SHIFT: u8 = 1 << 1;
const MOD_LEFT_ALT: u8 = 1 << 2;
const MOD_LEFT_GUI: u8 = 1 << 3;
const MOD_RIGHT_CTRL: u8 = 1 << 4;
const MOD_RIGHT_SHIFT: u8 = 1 << 5;
const MOD_RIGHT_ALT: u8 = 1 << 6;
const MOD_RIGHT_GUI: u8 = 1 << 7;

fn modifier_bit(keysym: u32) -> Option<u8> {
    Some(match keysym {
        0xFFE1 => MOD_LEFT_SHIFT,
        0xFFE2 => MOD_RIGHT_SHIFT,
        0xFFE3 => MOD_LEFT_CTRL,
        0xFFE4 => MOD_RIGHT_CTRL,
        0xFFE9 => MOD_LEFT_ALT,
        0xFFEA => MOD_RIGHT_ALT,
        0xFFEB => MOD_LEFT_GUI,
        0xFFEC => MOD_RIGHT_GUI,
        _ => return None,
    })
}

/// X11 keysym to HID usage code plus an implied-shift flag.
pub fn keysym_to_usage(keysym: u32) -> Option<(u8, bool)> {
    Some(match keysym {
        // Letters: usages 0x04..=0x1D; uppercase implies shift.
        0x61..=0x7A => ((keysym - 0x61 + 0x04) as u8, false),
        0x41..=0x5A => ((keysym - 0x41 + 0x04) as u8, true),
        // Digits: '1'..'9' then '0'.
        0x31..=0x39 => ((keysym - 0x31 + 0x1E) as u8, false),
        0x30 => (0x27, false),

        0x20 => (0x2C, false),      // space
        0x21 => (0x1E, true),       // !
        0x40 => (0x1F, true),       // @
        0x23 => (0x20, true),       // #
        0x24 => (0x21, true),       // $
        0x25 => (0x22, true),       // %
        0x5E => (0x23, true),       // ^
        0x26 => (0x24, true),       // &
        0x2A => (0x25, true),       // *
        0x28 => (0x26, true),       // (
        0x29 => (0x27, true),       // )
        0x2D => (0x2D, false),      // -
        0x5F => (0x2D, true),       // _
        0x3D => (0x2E, false),      // =
        0x2B => (0x2E, true),       // +
        0x5B => (0x2F, false),      // [
        0x7B => (0x2F, true),       // {
        0x5D => (0x30, false),      // ]
        0x7D => (0x30, true),       // }
        0x5C => (0x31, false),      // backslash
        0x7C => (0x31, true),       // |
        0x3B => (0x33, false),      // ;
        0x3A => (0x33, true),       // :
        0x27 => (0x34, false),      // '
        0x22 => (0x34, true),       // "
        0x60 => (0x35, false),      // `
        0x7E => (0x35, true),       // ~
        0x2C => (0x36, false),      // ,
        0x3C => (0x36, true),       // <
        0x2E => (0x37, false),      // .
        0x3E => (0x37, true),       // >
        0x2F => (0x38, false),      // /
        0x3F => (0x38, true),       // ?

        0xFF0D => (0x28, false),    // Return
        0xFF1B => (0x29, false),    // Escape
        0xFF08 => (0x2A, false),    // BackSpace
        0xFF09 => (0x2B, false),    // Tab
        0xFF13 => (0x48, false),    // Pause
        0xFF14 => (0x47, false),    // Scroll Lock
        0xFF50 => (0x4A, false),    // Home
        0xFF51 => (0x50, false),    // Left
        0xFF52 => (0x52, false),    // Up
        0xFF53 => (0x4F, false),    // Right
        0xFF54 => (0x51, false),    // Down
        0xFF55 => (0x4B, false),    // Page Up
        0xFF56 => (0x4E, false),    // Page Down
        0xFF57 => (0x4D, false),    // End
        0xFF63 => (0x49, false),    // Insert
        0xFFFF => (0x4C, false),    // Delete
        0xFF7F => (0x53, false),    // Num Lock
        0xFFE5 => (0x39, false),    // Caps Lock
        0xFF61 => (0x46, false),    // Print Screen

        // F1..F12
        0xFFBE..=0xFFC9 => ((keysym - 0xFFBE + 0x3A) as u8, false),

        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_and_capitals() {
        assert_eq!(keysym_to_usage('a' as u32), Some((0x04, false)));
        assert_eq!(keysym_to_usage('z' as u32), Some((0x1D, false)));
        assert_eq!(keysym_to_usage('A' as u32), Some((0x04, true)));
    }

    #[test]
    fn digits_wrap_zero() {
        assert_eq!(keysym_to_usage('1' as u32), Some((0x1E, false)));
        assert_eq!(keysym_to_usage('0' as u32), Some((0x27, false)));
    }

    #[test]
    fn function_and_navigation_keys() {
        assert_eq!(keysym_to_usage(0xFFBE), Some((0x3A, false))); // F1
        assert_eq!(keysym_to_usage(0xFFC9), Some((0x45, false))); // F12
        assert_eq!(keysym_to_usage(0xFF0D), Some((0x28, false))); // Return
        assert_eq!(keysym_to_usage(0xFF52), Some((0x52, false))); // Up
    }

    #[test]
    fn unknown_keysym_is_none() {
        assert_eq!(keysym_to_usage(0xFE03), None); // ISO_Level3_Shift
    }

    #[test]
    fn pointer_mask_decoding() {
        assert_eq!(decode_pointer_mask(0b0000_0001), (0b001, 0));
        assert_eq!(decode_pointer_mask(0b0000_0100), (0b100, 0));
        assert_eq!(decode_pointer_mask(0b0000_1000), (0, 1));
        assert_eq!(decode_pointer_mask(0b0001_0000), (0, -1));
        assert_eq!(decode_pointer_mask(0b0000_0101), (0b101, 0));
    }

    #[test]
    fn keyboard_state_tracks_keys_and_modifiers() {
        let mut state = KeyboardState::default();
        let (modifiers, keys) = state.apply(true, 0xFFE1).unwrap(); // Shift down
        assert_eq!(modifiers, MOD_LEFT_SHIFT);
        assert!(keys.is_empty());

        let (modifiers, keys) = state.apply(true, 'a' as u32).unwrap();
        assert_eq!(modifiers, MOD_LEFT_SHIFT);
        assert_eq!(keys, vec![0x04]);

        let (_, keys) = state.apply(false, 'a' as u32).unwrap();
        assert!(keys.is_empty());

        let (modifiers, _) = state.apply(false, 0xFFE1).unwrap();
        assert_eq!(modifiers, 0);
    }

    #[test]
    fn capital_letter_implies_shift() {
        let mut state = KeyboardState::default();
        let (modifiers, keys) = state.apply(true, 'A' as u32).unwrap();
        assert_eq!(modifiers, MOD_LEFT_SHIFT);
        assert_eq!(keys, vec![0x04]);
        let (modifiers, keys) = state.apply(false, 'A' as u32).unwrap();
        assert_eq!(modifiers, 0);
        assert!(keys.is_empty());
    }

    #[test]
    fn rollover_drops_oldest_key() {
        let mut state = KeyboardState::default();
        for key in ['a', 'b', 'c', 'd', 'e', 'f', 'g'] {
            state.apply(true, key as u32);
        }
        let (_, keys) = state.apply(true, 'h' as u32).unwrap();
        assert_eq!(keys.len(), MAX_KEYS);
        assert!(!keys.contains(&0x05)); // 'b' scrolled out
        assert!(keys.contains(&0x0B)); // 'h' present
    }
}
