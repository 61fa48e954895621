#![forbid(unsafe_code)]

//! Shared safety helpers used by the tubeconvert binaries and the HTTP layer.

use anyhow::{Result, bail};
use nix::unistd::Uid;

const MAX_FILENAME_CHARS: usize = 150;
const FALLBACK_FILENAME: &str = "audio";

/// Fails fast when a binary is started as root. The server spawns external
/// tools on behalf of anonymous callers, so it should never hold root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// True when `value` is a non-empty run of `[A-Za-z0-9_-]`. Job ids and any
/// other caller-provided path segment must pass this before touching a store
/// or the filesystem.
pub fn is_safe_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Turns a human title into something every common filesystem accepts.
///
/// Path separators, reserved punctuation and control characters become `_`,
/// runs of whitespace collapse to one space, and leading/trailing dots or
/// spaces are dropped so Windows does not choke on the result.
pub fn sanitize_filename(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_space = false;
    for c in title.chars() {
        let mapped = match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => ' ',
            c if c.is_control() => '_',
            c => c,
        };
        if mapped == ' ' {
            if last_was_space {
                continue;
            }
            last_was_space = true;
        } else {
            last_was_space = false;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches(|c: char| c == '.' || c == ' ');
    let limited: String = trimmed.chars().take(MAX_FILENAME_CHARS).collect();
    let limited = limited.trim_end_matches(|c: char| c == '.' || c == ' ');
    if limited.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        limited.to_string()
    }
}

/// ASCII-only variant of [`sanitize_filename`] for the plain `filename=`
/// parameter of `Content-Disposition`.
pub fn ascii_filename(name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| if c.is_ascii() && c != '%' { c } else { '_' })
        .collect();
    sanitize_filename(&ascii)
}
