//! Turns a user line into an executor submission.
//!
//! Raw input forms:
//! - `^|<sequence>`: a C-style escaped string, sent as is
//! - `Ctrl-x`, `Ctrl+x`, `^x`: the control byte of `x`

use std::sync::LazyLock;

use chatterm_core::OutputStream;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{commands::MSG_NOT_READY, message::CommandOutput, session::Session};

static CTRL_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:Ctrl[-+]|\^)(?P<char>\S)$").expect("ctrl sequence regex is hardcoded")
});

const RAW_PREFIX: &str = "^|";

/// Why a line was not submitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("You must pass a cmdline to /run. E.g.: \"/run pwd\"")]
    Empty,
    #[error("Invalid raw input")]
    InvalidRaw,
}

/// A line ready for [`Executor::exec`](chatterm_core::Executor::exec).
///
/// Raw submissions may hold any bytes, others are the UTF-8 line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub cmdline: Vec<u8>,
    pub is_raw: bool,
}

/// Parse a trimmed user line.
///
/// # Errors
/// Returns error for an empty line or a malformed `^|` sequence.
pub fn parse_line(line: &str) -> Result<Submission, RunError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(RunError::Empty);
    }
    if let Some(raw) = line.strip_prefix(RAW_PREFIX) {
        let raw = raw.replace('\n', "\\n");
        let quoted = if raw.contains('"') {
            raw
        } else {
            format!("\"{raw}\"")
        };
        let cmdline = unquote(&quoted).ok_or(RunError::InvalidRaw)?;
        return Ok(Submission {
            cmdline,
            is_raw: true,
        });
    }
    if let Some(caps) = CTRL_SEQUENCE.captures(line) {
        let upper = caps["char"].to_uppercase();
        let byte = upper.as_bytes()[0] & 0x3F;
        return Ok(Submission {
            cmdline: vec![byte],
            is_raw: true,
        });
    }
    Ok(Submission {
        cmdline: line.as_bytes().to_vec(),
        is_raw: false,
    })
}

/// Unquote a double-quoted C-style string literal into bytes.
fn unquote(s: &str) -> Option<Vec<u8>> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = Vec::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\n' => return None,
            '\\' => match chars.next()? {
                'a' => out.push(0x07),
                'b' => out.push(0x08),
                'f' => out.push(0x0C),
                'n' => out.push(b'\n'),
                'r' => out.push(b'\r'),
                't' => out.push(b'\t'),
                'v' => out.push(0x0B),
                '\\' => out.push(b'\\'),
                '"' => out.push(b'"'),
                'x' => out.push(u8::try_from(hex(&mut chars, 2)?).ok()?),
                'u' => push_char(&mut out, hex(&mut chars, 4)?)?,
                'U' => push_char(&mut out, hex(&mut chars, 8)?)?,
                d @ '0'..='7' => {
                    let mut value = d.to_digit(8)?;
                    for _ in 0..2 {
                        value = value * 8 + chars.next()?.to_digit(8)?;
                    }
                    out.push(u8::try_from(value).ok()?);
                }
                _ => return None,
            },
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    Some(out)
}

fn hex(chars: &mut std::str::Chars<'_>, digits: usize) -> Option<u32> {
    let mut value = 0u32;
    for _ in 0..digits {
        value = value * 16 + chars.next()?.to_digit(16)?;
    }
    Some(value)
}

fn push_char(out: &mut Vec<u8>, code: u32) -> Option<()> {
    let c = char::from_u32(code)?;
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    Some(())
}

/// Run `line` in `session`, replying through `output`.
///
/// Never blocks: per-call output is relayed by a separate task that drops
/// `output` once the executor's stream ends.
pub fn run(session: &Session, ctx: &CancellationToken, output: CommandOutput, line: &str) {
    if !session.ready {
        let _ = output.try_send(MSG_NOT_READY.to_string());
        return;
    }
    let submission = match parse_line(line) {
        Ok(submission) => submission,
        Err(e) => {
            let _ = output.try_send(e.to_string());
            return;
        }
    };
    tracing::debug!(
        session = %session.key,
        is_raw = submission.is_raw,
        "Submitting cmdline"
    );
    if let Some(stream) = session
        .executor
        .exec(ctx, &submission.cmdline, submission.is_raw)
    {
        tokio::spawn(relay(stream, output));
    }
}

/// Forward an executor stream into a reply stream. Waits while the reply
/// stream is full, so the executor's stream fills up in turn.
pub async fn relay(mut stream: OutputStream, output: CommandOutput) {
    while let Some(text) = stream.recv().await {
        if output.send(text).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn raw(cmdline: impl AsRef<[u8]>) -> Submission {
        Submission {
            cmdline: cmdline.as_ref().to_vec(),
            is_raw: true,
        }
    }

    #[test]
    fn test_plain_line() {
        assert_eq!(
            parse_line("  ls -l  "),
            Ok(Submission {
                cmdline: b"ls -l".to_vec(),
                is_raw: false
            })
        );
        assert_eq!(parse_line("   "), Err(RunError::Empty));
    }

    #[test]
    fn test_raw_sequence() {
        assert_eq!(parse_line("^|pwd\\n"), Ok(raw("pwd\n")));
        assert_eq!(parse_line("^|\\x03pwd\\n"), Ok(raw("\u{3}pwd\n")));
        assert_eq!(parse_line("^|a\\tb\\101\\u00e9"), Ok(raw("a\tbAé")));
    }

    #[test]
    fn test_raw_literal_newline_is_kept() {
        assert_eq!(parse_line("^|echo 1\necho 2"), Ok(raw("echo 1\necho 2")));
    }

    #[test]
    fn test_raw_with_quotes_must_be_quoted() {
        assert_eq!(parse_line("^|\"say \\\"hi\\\"\""), Ok(raw("say \"hi\"")));
        assert_eq!(parse_line("^|say \"hi\""), Err(RunError::InvalidRaw));
    }

    #[test]
    fn test_invalid_raw() {
        assert_eq!(parse_line("^|bad\\q"), Err(RunError::InvalidRaw));
        assert_eq!(parse_line("^|\\x4"), Err(RunError::InvalidRaw));
        assert_eq!(parse_line("^|\\u12"), Err(RunError::InvalidRaw));
    }

    #[test]
    fn test_raw_bytes_need_not_be_utf8() {
        assert_eq!(parse_line("^|\\xff\\xfe"), Ok(raw([0xffu8, 0xfe])));
        assert_eq!(parse_line("^|\\377x"), Ok(raw([0xff, b'x'])));
    }

    #[test]
    fn test_ctrl_sequences() {
        assert_eq!(parse_line("^C"), Ok(raw("\u{3}")));
        assert_eq!(parse_line("^c"), Ok(raw("\u{3}")));
        assert_eq!(parse_line("Ctrl-Z"), Ok(raw("\u{1a}")));
        assert_eq!(parse_line("ctrl+d"), Ok(raw("\u{4}")));
        assert_eq!(parse_line("^["), Ok(raw("\u{1b}")));
        assert!(!parse_line("^CC").unwrap().is_raw);
        assert!(!parse_line("Ctrl C").unwrap().is_raw);
    }
}
