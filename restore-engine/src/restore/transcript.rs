//! Human readable record of what a restore did.
//!
//! Separate from the tracing log: the transcript is the operator-facing
//! account of every command and path touched, written to stdout by default.
//! Write failures are ignored so a closed pipe never aborts a restore.

use chrono::Local;
use std::fmt::Display;
use std::io::Write;

/// `title` underlined with `=`
pub fn section_title(title: &str) -> String {
    format!("{}\n{}\n", title, "=".repeat(title.chars().count()))
}

/// Prefix every line of `text` with `indent` spaces
pub fn indent_lines(text: &str, indent: usize) -> String {
    let pad = " ".repeat(indent);
    text.lines()
        .map(|line| format!("{}{}", pad, line))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Transcript<W: Write> {
    out: W,
}

impl<W: Write> Transcript<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn banner(&mut self, what: &str) {
        let now = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.line(format!("# {} at {}", what, now));
    }

    pub fn section(&mut self, title: &str) {
        let _ = write!(self.out, "\n{}\n", section_title(title));
    }

    pub fn line(&mut self, text: impl Display) {
        let _ = writeln!(self.out, "{}", text);
    }

    pub fn blank(&mut self) {
        let _ = writeln!(self.out);
    }

    /// Command output, indented and set off by blank lines
    pub fn output(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let _ = write!(self.out, "\n{}\n\n", indent_lines(text.trim_end(), 4));
    }

    pub fn flush(&mut self) {
        let _ = self.out.flush();
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_title() {
        assert_eq!(section_title("Restoring"), "Restoring\n=========\n");
    }

    #[test]
    fn test_indent_lines() {
        assert_eq!(indent_lines("a\nb", 2), "  a\n  b");
    }

    #[test]
    fn test_transcript_layout() {
        let mut transcript = Transcript::new(Vec::new());
        transcript.section("Restoring databases");
        transcript.line("database: shop");
        transcript.output("line one\nline two\n");
        transcript.output("   ");

        let text = String::from_utf8(transcript.into_inner()).unwrap_or_default();
        assert_eq!(
            text,
            "\nRestoring databases\n===================\n\ndatabase: shop\n\n    line one\n    line two\n\n"
        );
    }
}
