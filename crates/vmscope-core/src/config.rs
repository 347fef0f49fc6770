//! The per-VM configuration file.
//!
//! A line-oriented text format keyed by VM name:
//!
//! ```text
//! # my guest
//! winxpsp2 {
//!     ostype = "Windows";
//!     win_tasks = 0x88;
//!     win_pdbase = 0x18;
//! }
//! ```
//!
//! Parsing is a pure function from the file contents to a settings map; no
//! state survives the call.

use std::collections::HashMap;

/// The settings block for one VM.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    /// The `ostype` key ("Linux" or "Windows").
    pub ostype: Option<String>,

    /// The `sysmap` key: path to the guest kernel's System.map.
    pub sysmap: Option<String>,

    /// Every numeric key (the `linux_*` and `win_*` offsets).
    pub offsets: HashMap<String, u64>,
}

/// A configuration syntax error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("config line {line}: {message}")]
pub struct ConfigError {
    /// 1-based line number of the offending token.
    pub line: usize,

    /// What went wrong.
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Num(u64),
    LBrace,
    RBrace,
    Semi,
    Eq,
}

fn err(line: usize, message: &'static str) -> ConfigError {
    ConfigError { line, message }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1usize;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '{' => {
                chars.next();
                tokens.push((line, Token::LBrace));
            }
            '}' => {
                chars.next();
                tokens.push((line, Token::RBrace));
            }
            ';' => {
                chars.next();
                tokens.push((line, Token::Semi));
            }
            '=' => {
                chars.next();
                tokens.push((line, Token::Eq));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\n') | None => return Err(err(line, "unterminated string")),
                        Some(c) => s.push(c),
                    }
                }
                tokens.push((line, Token::Str(s)));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }

                let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
                {
                    u64::from_str_radix(hex, 16)
                } else {
                    s.parse()
                };

                match value {
                    Ok(value) => tokens.push((line, Token::Num(value))),
                    Err(_) => return Err(err(line, "malformed number")),
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '/' || c == '.' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || "_-./".contains(c) {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((line, Token::Ident(s)));
            }
            _ => return Err(err(line, "unexpected character")),
        }
    }

    Ok(tokens)
}

/// Parses a configuration file into a map from VM name to its settings.
pub fn parse(input: &str) -> Result<HashMap<String, ConfigEntry>, ConfigError> {
    let tokens = tokenize(input)?;
    let mut iter = tokens.into_iter().peekable();
    let mut entries = HashMap::new();

    while let Some((line, token)) = iter.next() {
        let name = match token {
            Token::Ident(name) | Token::Str(name) => name,
            _ => return Err(err(line, "expected VM name")),
        };

        match iter.next() {
            Some((_, Token::LBrace)) => (),
            Some((line, _)) => return Err(err(line, "expected '{'")),
            None => return Err(err(line, "expected '{'")),
        }

        let mut entry = ConfigEntry::default();

        loop {
            let (line, token) = iter.next().ok_or(err(line, "unexpected end of file"))?;

            let key = match token {
                Token::RBrace => break,
                Token::Ident(key) => key,
                _ => return Err(err(line, "expected key or '}'")),
            };

            match iter.next() {
                Some((_, Token::Eq)) => (),
                Some((line, _)) => return Err(err(line, "expected '='")),
                None => return Err(err(line, "expected '='")),
            }

            let (line, value) = iter.next().ok_or(err(line, "expected value"))?;

            match (key.as_str(), value) {
                ("ostype", Token::Str(s)) | ("ostype", Token::Ident(s)) => {
                    entry.ostype = Some(s);
                }
                ("sysmap", Token::Str(s)) | ("sysmap", Token::Ident(s)) => {
                    entry.sysmap = Some(s);
                }
                ("ostype" | "sysmap", _) => return Err(err(line, "expected string value")),
                (_, Token::Num(n)) => {
                    entry.offsets.insert(key, n);
                }
                _ => return Err(err(line, "expected numeric value")),
            }

            match iter.next() {
                Some((_, Token::Semi)) => (),
                Some((line, _)) => return Err(err(line, "expected ';'")),
                None => return Err(err(line, "expected ';'")),
            }
        }

        entries.insert(name, entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_file() -> Result<(), ConfigError> {
        let entries = parse(
            r#"
            # test guests
            winxpsp2 {
                ostype = "Windows";
                win_tasks = 0x88;
                win_pdbase = 0x18;
                win_pid = 0x84;
            }

            "debian-squeeze" {
                sysmap = "/boot/System.map-2.6.32";
                ostype = "Linux";
                linux_tasks = 0x240;
                linux_mm = 0x268;
                linux_pid = 556;
                linux_pgd = 0x40;
            }
            "#,
        )?;

        assert_eq!(entries.len(), 2);

        let win = &entries["winxpsp2"];
        assert_eq!(win.ostype.as_deref(), Some("Windows"));
        assert_eq!(win.offsets["win_tasks"], 0x88);
        assert_eq!(win.offsets["win_pdbase"], 0x18);

        let linux = &entries["debian-squeeze"];
        assert_eq!(linux.ostype.as_deref(), Some("Linux"));
        assert_eq!(linux.sysmap.as_deref(), Some("/boot/System.map-2.6.32"));
        assert_eq!(linux.offsets["linux_pid"], 556);
        Ok(())
    }

    #[test]
    fn bareword_strings_and_decimal_numbers() -> Result<(), ConfigError> {
        let entries = parse("vm1 { ostype = Linux; linux_tasks = 1024; }")?;

        assert_eq!(entries["vm1"].ostype.as_deref(), Some("Linux"));
        assert_eq!(entries["vm1"].offsets["linux_tasks"], 1024);
        Ok(())
    }

    #[test]
    fn comments_run_to_end_of_line() -> Result<(), ConfigError> {
        let entries = parse("vm1 { # ostype = Linux;\n linux_mm = 0x10; }")?;

        assert_eq!(entries["vm1"].ostype, None);
        assert_eq!(entries["vm1"].offsets["linux_mm"], 0x10);
        Ok(())
    }

    #[test]
    fn missing_semicolon_is_reported_with_line() {
        let result = parse("vm1 {\n linux_mm = 0x10\n}");

        let error = result.unwrap_err();
        assert_eq!(error.line, 3);
        assert_eq!(error.message, "expected ';'");
    }

    #[test]
    fn string_value_for_offset_key_is_rejected() {
        assert!(parse(r#"vm1 { linux_mm = "oops"; }"#).is_err());
    }

    #[test]
    fn unterminated_string_is_rejected() {
        assert!(parse("vm1 { ostype = \"Linux; }").is_err());
    }
}
