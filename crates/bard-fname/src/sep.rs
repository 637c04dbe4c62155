//! Separator configuration and token escaping.

use crate::{FnameError, Result};

/// The two separator characters used in directory and file names.
///
/// `field` splits descriptor tokens, `eid` splits the components inside an
/// EID token. They must differ, and neither may be a character that needs
/// escaping anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Separators {
    pub field: char,
    pub eid: char,
}

impl Default for Separators {
    fn default() -> Self {
        Self {
            field: '_',
            eid: '-',
        }
    }
}

impl Separators {
    pub fn new(field: char, eid: char) -> Result<Self> {
        if field == eid
            || !field.is_ascii_graphic()
            || !eid.is_ascii_graphic()
            || field == '%'
            || eid == '%'
            || field == '/'
            || eid == '/'
        {
            return Err(FnameError::BadSeparators);
        }
        Ok(Self { field, eid })
    }

    /// Escape a free-form name component (a `dtn` SSP or node name) so it
    /// cannot collide with the separators or the path syntax.
    pub fn escape(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            if c == '%' || c == '/' || c == self.field || c == self.eid {
                for b in c.to_string().as_bytes() {
                    out.push_str(&format!("%{b:02X}"));
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Reverse [`Self::escape`].
    pub fn unescape(&self, s: &str) -> Option<String> {
        let mut bytes = Vec::with_capacity(s.len());
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c == '%' {
                let hi = chars.next()?;
                let lo = chars.next()?;
                let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
                bytes.push(byte);
            } else {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
        String::from_utf8(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_separators() {
        let sep = Separators::default();
        assert_eq!(sep.field, '_');
        assert_eq!(sep.eid, '-');
    }

    #[test]
    fn rejects_degenerate_separators() {
        assert!(Separators::new('_', '_').is_err());
        assert!(Separators::new('%', '-').is_err());
        assert!(Separators::new('/', '-').is_err());
        assert!(Separators::new('\n', '-').is_err());
        assert!(Separators::new('.', ':').is_ok());
    }

    #[test]
    fn escape_round_trip() {
        let sep = Separators::default();
        for s in [
            "plain",
            "//alpha.example/mail",
            "with_underscore",
            "with-dash",
            "100%",
            "mixed_%-/end",
        ] {
            let escaped = sep.escape(s);
            assert!(!escaped.contains('/'));
            assert!(!escaped.contains(sep.field));
            assert!(!escaped.contains(sep.eid));
            assert_eq!(sep.unescape(&escaped).as_deref(), Some(s));
        }
    }
}
