// src/platform.rs
//! OS side effects: the success beep and synthetic key presses.
//!
//! The implementation is picked at compile time: Win32 on Windows, XTest on
//! Linux, and a terminal bell without key injection anywhere else. Everything
//! else talks to the [`Platform`] trait so tests can substitute a recorder.

use std::fmt;
use std::str::FromStr;

use crate::error::PlatformError;

pub trait Platform: Send + Sync {
    /// Audible notification. Failures are ignored.
    fn beep(&self);

    /// Press and release a single key.
    fn press_key(&self, key: Key) -> Result<(), PlatformError>;
}

/// Keys that can be injected, parsed case-insensitively from config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    /// `A`-`Z` or `0`-`9`
    Char(char),
    /// `F1`-`F24`
    Function(u8),
    Enter,
    Space,
    Escape,
    Tab,
}

impl Key {
    /// Windows virtual-key code.
    pub fn virtual_key(self) -> u16 {
        match self {
            Key::Char(c) => c as u16,
            Key::Function(n) => 0x70 + u16::from(n) - 1,
            Key::Enter => 0x0D,
            Key::Space => 0x20,
            Key::Escape => 0x1B,
            Key::Tab => 0x09,
        }
    }

    /// X11 keysym, as listed in `X11/keysymdef.h`.
    pub fn keysym(self) -> u64 {
        match self {
            // Lowercase letters name the unshifted key
            Key::Char(c) => u64::from(c.to_ascii_lowercase()),
            Key::Function(n) => 0xFFBE + u64::from(n) - 1,
            Key::Enter => 0xFF0D,
            Key::Space => 0x20,
            Key::Escape => 0xFF1B,
            Key::Tab => 0xFF09,
        }
    }
}

impl FromStr for Key {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let key = match upper.as_str() {
            "ENTER" | "RETURN" => Key::Enter,
            "SPACE" => Key::Space,
            "ESC" | "ESCAPE" => Key::Escape,
            "TAB" => Key::Tab,
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii_alphanumeric() => Key::Char(c),
                    (Some('F'), Some(_)) => match other[1..].parse::<u8>() {
                        Ok(n @ 1..=24) => Key::Function(n),
                        _ => return Err(PlatformError::UnknownKey(s.to_string())),
                    },
                    _ => return Err(PlatformError::UnknownKey(s.to_string())),
                }
            }
        };
        Ok(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Char(c) => write!(f, "{}", c),
            Key::Function(n) => write!(f, "F{}", n),
            Key::Enter => f.write_str("Enter"),
            Key::Space => f.write_str("Space"),
            Key::Escape => f.write_str("Escape"),
            Key::Tab => f.write_str("Tab"),
        }
    }
}

/// The platform implementation for the build target.
pub fn native() -> Box<dyn Platform> {
    Box::new(NativePlatform)
}

pub struct NativePlatform;

#[cfg(target_os = "windows")]
impl Platform for NativePlatform {
    fn beep(&self) {
        // Volume follows "System Sounds" in the mixer
        // SAFETY: Beep takes plain integers and has no memory requirements
        let _ = unsafe { windows::Win32::System::Diagnostics::Debug::Beep(4000, 500) };
    }

    fn press_key(&self, key: Key) -> Result<(), PlatformError> {
        win::send_key(key.virtual_key(), false)?;
        win::send_key(key.virtual_key(), true)
    }
}

#[cfg(target_os = "windows")]
mod win {
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        INPUT, INPUT_0, INPUT_KEYBOARD, KEYBD_EVENT_FLAGS, KEYBDINPUT, KEYEVENTF_KEYUP,
        SendInput, VIRTUAL_KEY,
    };

    use crate::error::PlatformError;

    pub(super) fn send_key(vk: u16, key_up: bool) -> Result<(), PlatformError> {
        let flags = if key_up {
            KEYEVENTF_KEYUP
        } else {
            KEYBD_EVENT_FLAGS(0)
        };
        let input = INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT {
                    wVk: VIRTUAL_KEY(vk),
                    wScan: 0,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        };
        // SAFETY: input is a valid KEYBDINPUT structure on the stack
        let sent = unsafe { SendInput(&[input], std::mem::size_of::<INPUT>() as i32) };
        if sent == 1 {
            Ok(())
        } else {
            Err(PlatformError::Injection(format!(
                "SendInput accepted {} of 1 events",
                sent
            )))
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn terminal_bell() {
    use std::io::Write;

    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(b"\x07");
    let _ = stdout.flush();
}

#[cfg(target_os = "linux")]
impl Platform for NativePlatform {
    fn beep(&self) {
        terminal_bell();
    }

    fn press_key(&self, key: Key) -> Result<(), PlatformError> {
        x11_keys::send_key(key.keysym())
    }
}

#[cfg(target_os = "linux")]
mod x11_keys {
    use x11::{xlib, xtest};

    use crate::error::PlatformError;

    /// Presses and releases the key bound to `keysym` on the X server named
    /// by `DISPLAY`. A display is opened per press; cards arrive seconds apart.
    pub(super) fn send_key(keysym: u64) -> Result<(), PlatformError> {
        // SAFETY: a null name makes XOpenDisplay read DISPLAY. The pointer is
        // released by XCloseDisplay below on every path.
        let display = unsafe { xlib::XOpenDisplay(std::ptr::null()) };
        if display.is_null() {
            let name = std::env::var("DISPLAY").unwrap_or_else(|_| "<unset>".to_string());
            return Err(PlatformError::Injection(format!(
                "XOpenDisplay failed; DISPLAY={name}"
            )));
        }

        // SAFETY: `display` is a valid non-null pointer returned by XOpenDisplay.
        let result = unsafe {
            let keycode = xlib::XKeysymToKeycode(display, keysym as xlib::KeySym);
            if keycode == 0 {
                Err(PlatformError::Injection(format!(
                    "no keycode for keysym {keysym:#x}"
                )))
            } else if xtest::XTestFakeKeyEvent(display, u32::from(keycode), xlib::True, 0) == 0
                || xtest::XTestFakeKeyEvent(display, u32::from(keycode), xlib::False, 0) == 0
            {
                Err(PlatformError::Injection(
                    "XTest extension rejected the key event".into(),
                ))
            } else {
                xlib::XFlush(display);
                Ok(())
            }
        };

        // SAFETY: `display` came from XOpenDisplay and is not used afterwards.
        unsafe { xlib::XCloseDisplay(display) };
        result
    }
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
impl Platform for NativePlatform {
    fn beep(&self) {
        terminal_bell();
    }

    fn press_key(&self, _key: Key) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Records calls instead of touching the OS.
    #[derive(Default)]
    pub struct MockPlatform {
        pub beeps: AtomicUsize,
        pub keys: Mutex<Vec<Key>>,
        pub should_fail: bool,
    }

    impl Platform for MockPlatform {
        fn beep(&self) {
            self.beeps.fetch_add(1, Ordering::SeqCst);
        }

        fn press_key(&self, key: Key) -> Result<(), PlatformError> {
            if self.should_fail {
                return Err(PlatformError::Injection("mock failure".into()));
            }
            self.keys.lock().unwrap().push(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys() {
        assert_eq!("f12".parse::<Key>().unwrap(), Key::Function(12));
        assert_eq!("F1".parse::<Key>().unwrap(), Key::Function(1));
        assert_eq!("a".parse::<Key>().unwrap(), Key::Char('A'));
        assert_eq!("7".parse::<Key>().unwrap(), Key::Char('7'));
        assert_eq!("Enter".parse::<Key>().unwrap(), Key::Enter);
        assert_eq!(" space ".parse::<Key>().unwrap(), Key::Space);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        for name in ["", "F0", "F25", "Fx", "ab", "-", "ctrl"] {
            assert!(
                matches!(name.parse::<Key>(), Err(PlatformError::UnknownKey(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_virtual_keys() {
        assert_eq!(Key::Char('A').virtual_key(), 0x41);
        assert_eq!(Key::Char('0').virtual_key(), 0x30);
        assert_eq!(Key::Function(1).virtual_key(), 0x70);
        assert_eq!(Key::Function(12).virtual_key(), 0x7B);
        assert_eq!(Key::Enter.virtual_key(), 0x0D);
    }

    #[test]
    fn test_keysyms() {
        assert_eq!(Key::Char('A').keysym(), 0x61);
        assert_eq!(Key::Char('Z').keysym(), 0x7A);
        assert_eq!(Key::Char('0').keysym(), 0x30);
        assert_eq!(Key::Char('9').keysym(), 0x39);
        assert_eq!(Key::Function(1).keysym(), 0xFFBE);
        assert_eq!(Key::Function(12).keysym(), 0xFFC9);
        assert_eq!(Key::Function(24).keysym(), 0xFFD5);
        assert_eq!(Key::Enter.keysym(), 0xFF0D);
        assert_eq!(Key::Space.keysym(), 0x20);
        assert_eq!(Key::Escape.keysym(), 0xFF1B);
        assert_eq!(Key::Tab.keysym(), 0xFF09);
    }

    #[test]
    fn test_keysym_follows_parsed_key() {
        let key: Key = "f12".parse().unwrap();
        assert_eq!(key.keysym(), 0xFFC9);
        let key: Key = "q".parse().unwrap();
        assert_eq!(key.keysym(), u64::from(b'q'));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for key in [Key::Function(5), Key::Char('Q'), Key::Tab] {
            assert_eq!(key.to_string().parse::<Key>().unwrap(), key);
        }
    }
}
