//! Client encoding support: charset registry, byte-wise character boundary tracking and UCS-2
//! transcoding.
//!
//! The server reports the session encoding by name (`client_encoding`). For each known encoding a
//! small state machine classifies every byte of a string as either completing a character or
//! sitting in the middle of one. Consumers use this to find safe character boundaries when
//! scanning query text for placeholders and quotes, and to measure string length in characters.

use widestring::{U16Str, U16String};

const LINE_FEED: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';

/// Known client encodings. Numeric codes mirror the server's ordering; unlisted encodings behave
/// as single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    SqlAscii,
    EucJp,
    EucCn,
    EucKr,
    EucTw,
    Johab,
    Utf8,
    MuleInternal,
    Latin1,
    Latin2,
    Latin3,
    Latin4,
    Latin5,
    Latin6,
    Latin7,
    Latin8,
    Latin9,
    Latin10,
    Win1256,
    Win1258,
    Win874,
    Koi8R,
    Win1251,
    Win866,
    Iso8859_5,
    Iso8859_6,
    Iso8859_7,
    Iso8859_8,
    Sjis,
    Big5,
    Gbk,
    Uhc,
    Win1250,
    Gb18030,
    Tcvn,
    Alt,
    Win,
    Other,
}

/// Name table used to resolve the server reported encoding name.
const CHARSET_NAMES: &[(&str, Charset)] = &[
    ("SQL_ASCII", Charset::SqlAscii),
    ("EUC_JP", Charset::EucJp),
    ("EUC_CN", Charset::EucCn),
    ("EUC_KR", Charset::EucKr),
    ("EUC_TW", Charset::EucTw),
    ("JOHAB", Charset::Johab),
    ("UTF8", Charset::Utf8),
    ("MULE_INTERNAL", Charset::MuleInternal),
    ("LATIN1", Charset::Latin1),
    ("LATIN2", Charset::Latin2),
    ("LATIN3", Charset::Latin3),
    ("LATIN4", Charset::Latin4),
    ("LATIN5", Charset::Latin5),
    ("LATIN6", Charset::Latin6),
    ("LATIN7", Charset::Latin7),
    ("LATIN8", Charset::Latin8),
    ("LATIN9", Charset::Latin9),
    ("LATIN10", Charset::Latin10),
    ("WIN1256", Charset::Win1256),
    ("WIN1258", Charset::Win1258),
    ("WIN874", Charset::Win874),
    ("KOI8", Charset::Koi8R),
    ("WIN1251", Charset::Win1251),
    ("WIN866", Charset::Win866),
    ("ISO_8859_5", Charset::Iso8859_5),
    ("ISO_8859_6", Charset::Iso8859_6),
    ("ISO_8859_7", Charset::Iso8859_7),
    ("ISO_8859_8", Charset::Iso8859_8),
    ("SJIS", Charset::Sjis),
    ("BIG5", Charset::Big5),
    ("GBK", Charset::Gbk),
    ("UHC", Charset::Uhc),
    ("WIN1250", Charset::Win1250),
    ("GB18030", Charset::Gb18030),
    ("UNICODE", Charset::Utf8),
    ("TCVN", Charset::Tcvn),
    ("ALT", Charset::Alt),
    ("WIN", Charset::Win),
];

impl Charset {
    /// Resolve an encoding name reported by the server. Exact (case insensitive) matches win;
    /// otherwise the longest table name contained in the reported string is used, so that e.g.
    /// `UTF8_BOM` still resolves. Unknown names resolve to [`Charset::Other`].
    pub fn from_name(name: &str) -> Charset {
        for &(candidate, code) in CHARSET_NAMES {
            if name.eq_ignore_ascii_case(candidate) {
                return code;
            }
        }
        let upper = name.to_ascii_uppercase();
        let mut best: Option<(usize, Charset)> = None;
        for &(candidate, code) in CHARSET_NAMES {
            if upper.contains(candidate) && best.map_or(true, |(len, _)| candidate.len() >= len) {
                best = Some((candidate.len(), code));
            }
        }
        best.map(|(_, code)| code).unwrap_or(Charset::Other)
    }

    /// Canonical name of the encoding.
    pub fn name(self) -> &'static str {
        CHARSET_NAMES
            .iter()
            .find(|(_, code)| *code == self)
            .map(|(name, _)| *name)
            .unwrap_or("OTHER")
    }

    /// Upper bound of bytes a single character may occupy in the encoding.
    pub fn max_bytes_per_char(self) -> u8 {
        match self {
            Charset::Utf8 => 6,
            Charset::EucTw => 4,
            Charset::EucJp | Charset::Gb18030 => 3,
            Charset::Sjis
            | Charset::Big5
            | Charset::Gbk
            | Charset::Uhc
            | Charset::EucCn
            | Charset::EucKr
            | Charset::Johab => 2,
            _ => 1,
        }
    }
}

/// Advances the character boundary state machine by one byte.
///
/// A return of `0` means `byte` is a complete single byte character, `1` means it is the final
/// byte of a multibyte character, any larger value means the scanner is mid-character. A byte is
/// a character boundary exactly when the returned state is below `2`.
pub fn char_state(state: u32, byte: u8, charset: Charset) -> u32 {
    let c = byte as u32;
    if byte == 0 {
        return 0;
    }
    match charset {
        Charset::Utf8 => {
            if state < 2 && c >= 0x80 {
                if c >= 0xfc {
                    6
                } else if c >= 0xf8 {
                    5
                } else if c >= 0xf0 {
                    4
                } else if c >= 0xe0 {
                    3
                } else if c >= 0xc0 {
                    2
                } else {
                    // Continuation byte without a lead byte, treat as a boundary.
                    0
                }
            } else if state > 2 && c > 0x7f {
                state - 1
            } else {
                0
            }
        }
        Charset::Sjis => {
            if state < 2 && c > 0x80 && !(c > 0x9f && c < 0xe0) {
                2
            } else if state == 2 {
                1
            } else {
                0
            }
        }
        Charset::Big5 => {
            if state < 2 && c > 0xa0 {
                2
            } else if state == 2 {
                1
            } else {
                0
            }
        }
        Charset::Gbk | Charset::Uhc => {
            if state < 2 && c > 0x7f {
                2
            } else if state == 2 {
                1
            } else {
                0
            }
        }
        Charset::EucJp => {
            // 0x8f leads JIS X 0212, 0x8e leads half width katakana.
            if state < 3 && c == 0x8f {
                3
            } else if state != 2 && (c == 0x8e || c > 0xa0) {
                2
            } else if state == 2 {
                1
            } else {
                0
            }
        }
        Charset::EucCn | Charset::EucKr | Charset::Johab => {
            if state < 2 && c > 0xa0 {
                2
            } else if state == 2 {
                1
            } else {
                0
            }
        }
        Charset::EucTw => {
            if state < 4 && c == 0x8e {
                4
            } else if state == 4 && c > 0xa0 {
                3
            } else if (state == 3 || state < 2) && c > 0xa0 {
                2
            } else if state == 2 {
                1
            } else {
                0
            }
        }
        Charset::Gb18030 => {
            if state < 2 && c > 0x80 {
                2
            } else if state == 2 {
                if (0x30..=0x39).contains(&c) {
                    3
                } else {
                    1
                }
            } else if state == 3 {
                if (0x30..=0x39).contains(&c) {
                    1
                } else {
                    3
                }
            } else {
                0
            }
        }
        _ => 0,
    }
}

/// Walks a byte string while tracking character boundaries of the session encoding. Replacement
/// for raw pointer scans over multibyte text.
#[derive(Debug, Clone)]
pub struct EncodedStr<'a> {
    bytes: &'a [u8],
    charset: Charset,
    state: u32,
    pos: usize,
}

impl<'a> EncodedStr<'a> {
    pub fn new(bytes: &'a [u8], charset: Charset) -> Self {
        EncodedStr {
            bytes,
            charset,
            state: 0,
            pos: 0,
        }
    }

    /// Byte position of the scanner, i.e. the index of the byte the next call to
    /// [`Self::next_byte`] returns.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Next byte together with a flag telling whether the byte completes a character. `None` at
    /// the end of input.
    pub fn next_byte(&mut self) -> Option<(u8, bool)> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        self.state = char_state(self.state, byte, self.charset);
        Some((byte, self.state < 2))
    }

    /// `true` if the scanner currently sits in the middle of a multibyte character.
    pub fn mid_character(&self) -> bool {
        self.state >= 2
    }
}

/// Length of `bytes` in characters of the given encoding.
pub fn mbs_len(bytes: &[u8], charset: Charset) -> usize {
    let mut len = 0;
    let mut state = 0;
    for &byte in bytes {
        state = char_state(state, byte, charset);
        if state < 2 {
            len += 1;
        }
    }
    len
}

/// Finds the first occurrence of the ASCII character `needle` which sits on a character boundary.
pub fn mbs_find(bytes: &[u8], needle: u8, charset: Charset) -> Option<usize> {
    let mut state = 0;
    for (index, &byte) in bytes.iter().enumerate() {
        state = char_state(state, byte, charset);
        if state == 0 && byte == needle {
            return Some(index);
        }
    }
    None
}

/// Encodes a UCS-2 string as UTF-8. Code points up to `0x7f` become one byte (optionally ASCII
/// lowered for identifier folding), up to `0x7ff` two bytes, everything else three bytes.
pub fn ucs2_to_utf8(input: &U16Str, lower_identifier: bool) -> Vec<u8> {
    let mut utf8 = Vec::with_capacity(input.len() * 3);
    for &unit in input.as_slice() {
        if unit == 0 {
            break;
        }
        if unit & 0xff80 == 0 {
            let byte = unit as u8;
            utf8.push(if lower_identifier {
                byte.to_ascii_lowercase()
            } else {
                byte
            });
        } else if unit & 0xf800 == 0 {
            utf8.push(0xc0 | (unit >> 6) as u8);
            utf8.push(0x80 | (unit & 0x3f) as u8);
        } else {
            utf8.push(0xe0 | (unit >> 12) as u8);
            utf8.push(0x80 | ((unit >> 6) & 0x3f) as u8);
            utf8.push(0x80 | (unit & 0x3f) as u8);
        }
    }
    utf8
}

/// Decodes UTF-8 into a caller supplied UCS-2 buffer, by leading byte classification.
///
/// Returns the number of UCS-2 units of the complete conversion, which may exceed the buffer
/// length; the buffer then holds a truncated prefix. A terminating zero is written behind the
/// converted units when it fits. With `lf_conv` set, a carriage return is inserted before every
/// line feed not already preceded by one.
pub fn utf8_to_ucs2_lf(input: &[u8], lf_conv: bool, out: &mut [u16]) -> usize {
    let mut written = 0;
    let mut emit = |unit: u16, out: &mut [u16]| {
        if written < out.len() {
            out[written] = unit;
        }
        written += 1;
    };
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        if byte == 0 {
            break;
        }
        if byte.is_ascii() {
            if lf_conv && byte == LINE_FEED && (i == 0 || input[i - 1] != CARRIAGE_RETURN) {
                emit(u16::from(CARRIAGE_RETURN), out);
            }
            emit(u16::from(byte), out);
            i += 1;
        } else if byte & 0xe0 == 0xe0 {
            // 3 byte code
            let unit = (u16::from(byte & 0x0f) << 12)
                | (u16::from(*input.get(i + 1).unwrap_or(&0) & 0x3f) << 6)
                | u16::from(*input.get(i + 2).unwrap_or(&0) & 0x3f);
            emit(unit, out);
            i += 3;
        } else {
            // 2 byte code
            let unit = (u16::from(byte & 0x1f) << 6) | u16::from(*input.get(i + 1).unwrap_or(&0) & 0x3f);
            emit(unit, out);
            i += 2;
        }
    }
    if written < out.len() {
        out[written] = 0;
    }
    written
}

/// Decoding convenience over [`utf8_to_ucs2_lf`] allocating the output.
pub fn utf8_to_ucs2_string(input: &[u8], lf_conv: bool) -> U16String {
    let mut buf = vec![0u16; input.len() * 2 + 1];
    let len = utf8_to_ucs2_lf(input, lf_conv, &mut buf);
    buf.truncate(len);
    U16String::from_vec(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use widestring::U16String;

    #[test]
    fn resolve_exact_name() {
        assert_eq!(Charset::Utf8, Charset::from_name("UTF8"));
        assert_eq!(Charset::Utf8, Charset::from_name("utf8"));
        assert_eq!(Charset::Sjis, Charset::from_name("SJIS"));
    }

    #[test_case(Charset::Utf8, 6)]
    #[test_case(Charset::EucTw, 4)]
    #[test_case(Charset::EucJp, 3)]
    #[test_case(Charset::Sjis, 2)]
    #[test_case(Charset::Latin1, 1)]
    fn char_width_upper_bound(charset: Charset, expected: u8) {
        assert_eq!(expected, charset.max_bytes_per_char());
    }

    #[test]
    fn resolve_by_longest_substring() {
        // LATIN10 must win over LATIN1 on substring matching.
        assert_eq!(Charset::Latin10, Charset::from_name("X_LATIN10_Y"));
    }

    #[test]
    fn unknown_name_is_other() {
        assert_eq!(Charset::Other, Charset::from_name("KLINGON"));
        assert_eq!(1, Charset::Other.max_bytes_per_char());
    }

    #[test]
    fn utf8_character_boundaries() {
        // Two three-byte CJK characters.
        let bytes = [0xe6, 0x97, 0xa5, 0xe6, 0x9c, 0xac];
        assert_eq!(2, mbs_len(&bytes, Charset::Utf8));
        assert_eq!(6, mbs_len(&bytes, Charset::SqlAscii));
    }

    #[test]
    fn sjis_trail_byte_is_not_a_boundary() {
        // 0x81 0x5c is a single Shift-JIS character whose trail byte is ASCII backslash. A naive
        // scan would find the backslash; the boundary aware scan must not.
        let bytes = [0x81, 0x5c, b'\\'];
        assert_eq!(Some(2), mbs_find(&bytes, b'\\', Charset::Sjis));
    }

    #[test]
    fn gb18030_four_byte_sequence() {
        let bytes = [0x81, 0x30, 0x81, 0x30];
        assert_eq!(1, mbs_len(&bytes, Charset::Gb18030));
    }

    #[test]
    fn ucs2_utf8_round_trip_is_identity() {
        let text = U16String::from_str("It's 10 o'clock – 日本語");
        let utf8 = ucs2_to_utf8(&text, false);
        let mut buf = vec![0u16; text.len() + 1];
        let len = utf8_to_ucs2_lf(&utf8, false, &mut buf);
        assert_eq!(text.len(), len);
        assert_eq!(text.as_slice(), &buf[..len]);
    }

    #[test]
    fn lower_identifier_folds_ascii_only() {
        let text = U16String::from_str("MyTable日");
        let utf8 = ucs2_to_utf8(&text, true);
        assert_eq!("mytable日".as_bytes(), utf8.as_slice());
    }

    /// Two CJK characters, six input bytes, must decode to exactly two units plus terminator.
    #[test]
    fn utf8_to_ucs2_cjk_length() {
        let input = [0xe6, 0x97, 0xa5, 0xe6, 0x9c, 0xac];
        let mut buf = [0xffffu16; 10];
        let len = utf8_to_ucs2_lf(&input, false, &mut buf);
        assert_eq!(2, len);
        assert_eq!([0x65e5, 0x672c, 0], buf[..3]);
    }

    #[test]
    fn lf_conversion_inserts_carriage_return() {
        let mut buf = [0u16; 16];
        let len = utf8_to_ucs2_lf(b"a\nb", true, &mut buf);
        assert_eq!(4, len);
        assert_eq!(U16String::from_str("a\r\nb").as_slice(), &buf[..len]);
    }

    #[test]
    fn lf_conversion_leaves_existing_crlf_alone() {
        let mut buf = [0u16; 16];
        let len = utf8_to_ucs2_lf(b"a\r\nb", true, &mut buf);
        assert_eq!(4, len);
    }

    #[test]
    fn truncated_output_still_reports_full_length() {
        let mut buf = [0u16; 2];
        let len = utf8_to_ucs2_lf(b"abcdef", false, &mut buf);
        assert_eq!(6, len);
        assert_eq!([b'a' as u16, b'b' as u16], buf);
    }
}
