//! Stable key names for profile files.
//!
//! Profiles on disk refer to keys by name (`"CAPSLOCK"`, `"MOUSE_SIDE"`)
//! rather than raw evdev codes so they stay readable and editable. This
//! module is the single table mapping those names to codes and back. Codes
//! without a table entry round-trip through the `CODE_<n>` escape.

/// Schema name to evdev code. One entry per code; lookups by name are
/// case-insensitive.
const TABLE: &[(&str, u16)] = &[
    ("ESC", 1),
    ("1", 2),
    ("2", 3),
    ("3", 4),
    ("4", 5),
    ("5", 6),
    ("6", 7),
    ("7", 8),
    ("8", 9),
    ("9", 10),
    ("0", 11),
    ("MINUS", 12),
    ("EQUAL", 13),
    ("BACKSPACE", 14),
    ("TAB", 15),
    ("Q", 16),
    ("W", 17),
    ("E", 18),
    ("R", 19),
    ("T", 20),
    ("Y", 21),
    ("U", 22),
    ("I", 23),
    ("O", 24),
    ("P", 25),
    ("LEFTBRACE", 26),
    ("RIGHTBRACE", 27),
    ("ENTER", 28),
    ("CTRL", 29),
    ("A", 30),
    ("S", 31),
    ("D", 32),
    ("F", 33),
    ("G", 34),
    ("H", 35),
    ("J", 36),
    ("K", 37),
    ("L", 38),
    ("SEMICOLON", 39),
    ("APOSTROPHE", 40),
    ("GRAVE", 41),
    ("SHIFT", 42),
    ("BACKSLASH", 43),
    ("Z", 44),
    ("X", 45),
    ("C", 46),
    ("V", 47),
    ("B", 48),
    ("N", 49),
    ("M", 50),
    ("COMMA", 51),
    ("DOT", 52),
    ("SLASH", 53),
    ("RSHIFT", 54),
    ("NUM_STAR", 55),
    ("ALT", 56),
    ("SPACE", 57),
    ("CAPSLOCK", 58),
    ("F1", 59),
    ("F2", 60),
    ("F3", 61),
    ("F4", 62),
    ("F5", 63),
    ("F6", 64),
    ("F7", 65),
    ("F8", 66),
    ("F9", 67),
    ("F10", 68),
    ("NUMLOCK", 69),
    ("SCROLLLOCK", 70),
    ("NUM_7", 71),
    ("NUM_8", 72),
    ("NUM_9", 73),
    ("NUM_MINUS", 74),
    ("NUM_4", 75),
    ("NUM_5", 76),
    ("NUM_6", 77),
    ("NUM_PLUS", 78),
    ("NUM_1", 79),
    ("NUM_2", 80),
    ("NUM_3", 81),
    ("NUM_0", 82),
    ("NUM_DOT", 83),
    ("F11", 87),
    ("F12", 88),
    ("NUM_ENTER", 96),
    ("RCTRL", 97),
    ("NUM_SLASH", 98),
    ("PRINTSCREEN", 99),
    ("RALT", 100),
    ("HOME", 102),
    ("UP", 103),
    ("PAGEUP", 104),
    ("LEFT", 105),
    ("RIGHT", 106),
    ("END", 107),
    ("DOWN", 108),
    ("PAGEDOWN", 109),
    ("INSERT", 110),
    ("DELETE", 111),
    ("MUTE", 113),
    ("VOLUME_DOWN", 114),
    ("VOLUME_UP", 115),
    ("PAUSE", 119),
    ("META", 125),
    ("RMETA", 126),
    ("COMPOSE", 127),
    ("NEXT_TRACK", 163),
    ("PLAY_PAUSE", 164),
    ("PREV_TRACK", 165),
    ("STOP_TRACK", 166),
    ("F13", 183),
    ("F14", 184),
    ("F15", 185),
    ("F16", 186),
    ("F17", 187),
    ("F18", 188),
    ("F19", 189),
    ("F20", 190),
    ("F21", 191),
    ("F22", 192),
    ("F23", 193),
    ("F24", 194),
    ("MOUSE_LEFT", 272),
    ("MOUSE_RIGHT", 273),
    ("MOUSE_MIDDLE", 274),
    ("MOUSE_SIDE", 275),
    ("MOUSE_EXTRA", 276),
    ("MOUSE_FORWARD", 277),
    ("MOUSE_BACK", 278),
    ("MOUSE_TASK", 279),
];

/// Resolve a schema name to an evdev code. Accepts `CODE_<n>` escapes for
/// codes outside the table. Returns `None` for unknown names.
pub fn code_for(name: &str) -> Option<u16> {
    let upper = name.trim().to_ascii_uppercase();
    if let Some(raw) = upper.strip_prefix("CODE_") {
        return raw.parse::<u16>().ok();
    }
    TABLE
        .iter()
        .find(|(candidate, _)| *candidate == upper)
        .map(|(_, code)| *code)
}

/// Name a code for persistence. Codes outside the table become `CODE_<n>`.
pub fn name_for(code: u16) -> String {
    TABLE
        .iter()
        .find(|(_, candidate)| *candidate == code)
        .map(|(name, _)| (*name).to_string())
        .unwrap_or_else(|| format!("CODE_{}", code))
}
