use std::borrow::Cow;

const ESC: char = '\u{1b}';

/// Strips terminal escape sequences and control characters from a message.
///
/// Newlines and tabs survive; everything else below U+0020 (and DEL) is
/// dropped so a log line cannot repaint the terminal.
pub fn sanitize_message(input: &str) -> Cow<'_, str> {
    if !input.chars().any(|ch| is_unsafe(ch)) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == ESC {
            skip_escape(&mut chars);
            continue;
        }
        if ch == '\r' {
            if chars.peek() != Some(&'\n') {
                out.push('\n');
            }
            continue;
        }
        if !is_unsafe(ch) {
            out.push(ch);
        }
    }
    Cow::Owned(out)
}

/// First non-empty line of `input`, sanitized, whitespace-collapsed and cut
/// to `max_chars` characters with a trailing ellipsis.
pub fn summary_line(input: &str, max_chars: usize) -> String {
    let head = input.lines().map(str::trim).find(|line| !line.is_empty()).unwrap_or("");
    let cleaned = sanitize_message(head);
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate(&collapsed, max_chars)
}

pub fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let mut out: String = value.chars().take(keep).collect();
    out.push('…');
    out
}

fn is_unsafe(ch: char) -> bool {
    match ch {
        '\n' | '\t' => false,
        _ => ch.is_control(),
    }
}

/// Consumes the rest of an escape sequence whose ESC was already read.
fn skip_escape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    match chars.peek() {
        // CSI: parameters and intermediates up to a final byte in @..~
        Some('[') => {
            chars.next();
            for ch in chars.by_ref() {
                if ('@'..='~').contains(&ch) {
                    break;
                }
            }
        }
        // OSC: terminated by BEL or ST (ESC \)
        Some(']') => {
            chars.next();
            while let Some(ch) = chars.next() {
                if ch == '\u{7}' {
                    break;
                }
                if ch == ESC {
                    if chars.peek() == Some(&'\\') {
                        chars.next();
                    }
                    break;
                }
            }
        }
        Some(_) => {
            chars.next();
        }
        None => {}
    }
}
