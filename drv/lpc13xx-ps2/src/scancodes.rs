//! Scan code set 2 to USB keyboard usages.
//!
//! Keys with no place on the USB keyboard page (browser and media keys) get
//! usages from 0xEA up, which the keyboard page leaves undefined, so every
//! key still fits in one byte.

/// USB keyboard page usages for the keys the decoder treats specially.
pub mod usage {
    pub const A: u8 = 0x04;
    pub const CAPS_LOCK: u8 = 0x39;
    pub const PRINT_SCREEN: u8 = 0x46;
    pub const SCROLL_LOCK: u8 = 0x47;
    pub const PAUSE: u8 = 0x48;
    pub const NUM_LOCK: u8 = 0x53;
    pub const LEFT_CONTROL: u8 = 0xE0;
    pub const RIGHT_CONTROL: u8 = 0xE4;
}

pub const EXTENDED: u8 = 0xE0;
pub const BREAK: u8 = 0xF0;

/// Pause/Break has no break code; it sends this once, on press.
pub const PAUSE_SEQUENCE: [u8; 8] = [0xE1, 0x14, 0x77, 0xE1, 0xF0, 0x14, 0xF0, 0x77];

/// Single-byte make codes, sorted.
static BASE: [(u8, u8); 86] = [
    (0x01, 0x42), // F9
    (0x03, 0x3E), // F5
    (0x04, 0x3C), // F3
    (0x05, 0x3A), // F1
    (0x06, 0x3B), // F2
    (0x07, 0x45), // F12
    (0x09, 0x43), // F10
    (0x0A, 0x41), // F8
    (0x0B, 0x3F), // F6
    (0x0C, 0x3D), // F4
    (0x0D, 0x2B), // Tab
    (0x0E, 0x35), // `
    (0x11, 0xE2), // left Alt
    (0x12, 0xE1), // left Shift
    (0x14, 0xE0), // left Control
    (0x15, 0x14), // Q
    (0x16, 0x1E), // 1
    (0x1A, 0x1D), // Z
    (0x1B, 0x16), // S
    (0x1C, 0x04), // A
    (0x1D, 0x1A), // W
    (0x1E, 0x1F), // 2
    (0x21, 0x06), // C
    (0x22, 0x1B), // X
    (0x23, 0x07), // D
    (0x24, 0x08), // E
    (0x25, 0x21), // 4
    (0x26, 0x20), // 3
    (0x29, 0x2C), // space
    (0x2A, 0x19), // V
    (0x2B, 0x09), // F
    (0x2C, 0x17), // T
    (0x2D, 0x15), // R
    (0x2E, 0x22), // 5
    (0x31, 0x11), // N
    (0x32, 0x05), // B
    (0x33, 0x0B), // H
    (0x34, 0x0A), // G
    (0x35, 0x1C), // Y
    (0x36, 0x23), // 6
    (0x3A, 0x10), // M
    (0x3B, 0x0D), // J
    (0x3C, 0x18), // U
    (0x3D, 0x24), // 7
    (0x3E, 0x25), // 8
    (0x41, 0x36), // ,
    (0x42, 0x0E), // K
    (0x43, 0x0C), // I
    (0x44, 0x12), // O
    (0x45, 0x27), // 0
    (0x46, 0x26), // 9
    (0x49, 0x37), // .
    (0x4A, 0x38), // /
    (0x4B, 0x0F), // L
    (0x4C, 0x33), // ;
    (0x4D, 0x13), // P
    (0x4E, 0x2D), // -
    (0x52, 0x34), // '
    (0x54, 0x2F), // [
    (0x55, 0x2E), // =
    (0x58, 0x39), // Caps Lock
    (0x59, 0xE5), // right Shift
    (0x5A, 0x28), // Enter
    (0x5B, 0x30), // ]
    (0x5D, 0x31), // backslash
    (0x61, 0x64), // non-US backslash
    (0x66, 0x2A), // Backspace
    (0x69, 0x59), // keypad 1
    (0x6B, 0x5C), // keypad 4
    (0x6C, 0x5F), // keypad 7
    (0x70, 0x62), // keypad 0
    (0x71, 0x63), // keypad .
    (0x72, 0x5A), // keypad 2
    (0x73, 0x5D), // keypad 5
    (0x74, 0x5E), // keypad 6
    (0x75, 0x60), // keypad 8
    (0x76, 0x29), // Escape
    (0x77, 0x53), // Num Lock
    (0x78, 0x44), // F11
    (0x79, 0x57), // keypad +
    (0x7A, 0x5B), // keypad 3
    (0x7B, 0x56), // keypad -
    (0x7C, 0x55), // keypad *
    (0x7D, 0x61), // keypad 9
    (0x7E, 0x47), // Scroll Lock
    (0x83, 0x40), // F7
];

/// Make codes following an `E0` prefix, sorted.
static EXTENDED_CODES: [(u8, u8); 38] = [
    (0x10, 0xEA), // WWW search
    (0x11, 0xE6), // right Alt
    (0x14, 0xE4), // right Control
    (0x15, 0xF1), // previous track
    (0x18, 0xEB), // WWW favourites
    (0x1F, 0xE3), // left GUI
    (0x20, 0xEC), // WWW refresh
    (0x21, 0xF2), // volume down
    (0x23, 0xF3), // mute
    (0x27, 0xE7), // right GUI
    (0x28, 0xED), // WWW stop
    (0x2B, 0xF4), // calculator
    (0x2F, 0xF5), // apps
    (0x30, 0xEE), // WWW forward
    (0x32, 0xF6), // volume up
    (0x34, 0xF7), // play/pause
    (0x37, 0x6A), // power
    (0x38, 0xEF), // WWW back
    (0x3A, 0xF0), // WWW home
    (0x3B, 0xF8), // stop
    (0x3F, 0x69), // sleep
    (0x40, 0xF9), // my computer
    (0x48, 0xFA), // e-mail
    (0x4A, 0x54), // keypad /
    (0x4D, 0xFB), // next track
    (0x50, 0xFC), // media select
    (0x5A, 0x58), // keypad Enter
    (0x5E, 0x68), // wake
    (0x69, 0x4D), // End
    (0x6B, 0x50), // left arrow
    (0x6C, 0x4A), // Home
    (0x70, 0x49), // Insert
    (0x71, 0x4C), // Delete
    (0x72, 0x51), // down arrow
    (0x74, 0x4F), // right arrow
    (0x75, 0x52), // up arrow
    (0x7A, 0x4E), // Page Down
    (0x7D, 0x4B), // Page Up
];

/// Print Screen; arrives wrapped in fake shifts, which are dropped.
const EXTENDED_PRINT_SCREEN: u8 = 0x7C;

/// Codes that, after `E0`, are fake shifts keyboards emit around
/// navigation keys to undo the host's idea of Shift or Num Lock.
const FAKE_SHIFTS: [u8; 2] = [0x12, 0x59];

pub fn lookup(extended: bool, code: u8) -> Option<u8> {
    if extended && code == EXTENDED_PRINT_SCREEN {
        return Some(usage::PRINT_SCREEN);
    }
    let table: &[(u8, u8)] = if extended { &EXTENDED_CODES } else { &BASE };
    table
        .binary_search_by_key(&code, |&(make, _)| make)
        .ok()
        .map(|i| table[i].1)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decoded {
    /// Part of a longer sequence.
    Pending,
    Key { usage: u8, down: bool },
    /// The whole Pause sequence; it stands for a press and release.
    Pause,
    /// A fake shift.
    Ignored,
    /// A byte that doesn't fit any sequence we know.
    Unknown(u8),
}

/// Assembles prefixed scan code sequences one byte at a time.
#[derive(Copy, Clone, Debug, Default)]
pub struct ScanDecoder {
    extended: bool,
    release: bool,
    /// Bytes of `PAUSE_SEQUENCE` matched so far.
    pause: usize,
}

impl ScanDecoder {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True when no sequence is half-way through.
    pub fn is_clear(&self) -> bool {
        !self.extended && !self.release && self.pause == 0
    }

    pub fn feed(&mut self, byte: u8) -> Decoded {
        if self.pause > 0 {
            if PAUSE_SEQUENCE[self.pause] != byte {
                self.reset();
                return Decoded::Unknown(byte);
            }
            self.pause += 1;
            if self.pause == PAUSE_SEQUENCE.len() {
                self.reset();
                return Decoded::Pause;
            }
            return Decoded::Pending;
        }
        match byte {
            0xE1 if self.is_clear() => {
                self.pause = 1;
                Decoded::Pending
            }
            EXTENDED => {
                self.extended = true;
                Decoded::Pending
            }
            BREAK => {
                self.release = true;
                Decoded::Pending
            }
            code => {
                let (extended, down) = (self.extended, !self.release);
                self.reset();
                if extended && FAKE_SHIFTS.contains(&code) {
                    return Decoded::Ignored;
                }
                match lookup(extended, code) {
                    Some(usage) => Decoded::Key { usage, down },
                    None => Decoded::Unknown(code),
                }
            }
        }
    }
}
