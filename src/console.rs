//! User-facing status messages.
//!
//! Each severity has its own marker so degraded and fatal conditions stand
//! out in the terminal. Warnings and errors are also emitted as `debug`
//! tracing events, so they reach the log only when `RUST_LOG` asks for it
//! and are not printed twice by the default filter.

/// Marker for completed steps.
pub const SUCCESS: &str = "✓";
/// Marker for progress messages.
pub const INFO: &str = "-";
/// Marker for detail lines.
pub const DETAIL: &str = "+";
/// Marker for degraded-mode warnings.
pub const WARNING: &str = "!";
/// Marker for fatal errors.
pub const ERROR: &str = "✗";

/// Print a success message.
pub fn success(msg: impl AsRef<str>) {
    println!("{} {}", SUCCESS, msg.as_ref());
}

/// Print a progress message.
pub fn info(msg: impl AsRef<str>) {
    println!("{} {}", INFO, msg.as_ref());
}

/// Print a detail message.
pub fn detail(msg: impl AsRef<str>) {
    println!("{} {}", DETAIL, msg.as_ref());
}

/// Print a warning about a degraded but non-fatal condition.
pub fn warning(msg: impl AsRef<str>) {
    let msg = msg.as_ref();
    tracing::debug!(severity = "warning", "{}", msg);
    println!("{} {}", WARNING, msg);
}

/// Print an error to stderr.
pub fn error(msg: impl AsRef<str>) {
    let msg = msg.as_ref();
    tracing::debug!(severity = "error", "{}", msg);
    eprintln!("{} {}", ERROR, msg);
}

/// Print an indented list item.
pub fn item(msg: impl AsRef<str>) {
    println!("  → {}", msg.as_ref());
}

/// Print an empty line.
pub fn blank() {
    println!();
}

/// Print text inside a box.
pub fn banner(lines: &[&str]) {
    let width = lines
        .iter()
        .map(|l| l.chars().count())
        .max()
        .unwrap_or(0)
        + 4;

    println!("╔{}╗", "═".repeat(width));
    for line in lines {
        let pad = width - 2 - line.chars().count();
        println!("║  {}{}║", line, " ".repeat(pad));
    }
    println!("╚{}╝", "═".repeat(width));
}
