// src/ini.rs
//
// Job-file reader. Flat text: `[section]` headers open jobs (the literal
// name `global` targets the defaults descriptor), `key=value` or bare
// `key` lines feed the option schema, `;` lines and blanks are skipped.
// Option errors inside a section are collected, not aborted, so users see
// every mistake at once; a section with any error is dropped whole.

use anyhow::{Context as _, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

use crate::builder::add_job;
use crate::context::{HarnessContext, JobHandle};

/// Line source with a one-line pushback buffer, so the section loop can
/// return a peeked `[header]` line without positional seeking.
pub struct LineReader<R: BufRead> {
    inner: R,
    pushback: Option<String>,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, pushback: None }
    }

    pub fn next_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.pushback.take() {
            return Ok(Some(line));
        }

        let mut buf = String::new();
        let n = self.inner.read_line(&mut buf).context("read job file")?;
        if n == 0 {
            return Ok(None);
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    pub fn push_back(&mut self, line: String) {
        debug_assert!(self.pushback.is_none());
        self.pushback = Some(line);
    }
}

/// A line is empty-or-comment when, before any non-whitespace character,
/// it either ends or hits a `;`.
fn is_empty_or_comment(line: &str) -> bool {
    for c in line.chars() {
        if c == ';' {
            return true;
        }
        if !c.is_whitespace() && !c.is_control() {
            return false;
        }
    }
    true
}

/// Parse a `[name]` header from a trimmed line. `name` excludes `]`.
fn section_name(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('[')?;
    let end = rest.find(']')?;
    let name = &rest[..end];
    (!name.is_empty()).then_some(name)
}

/// Parse one job file into the harness context. `separate_stonewall` marks
/// the first job of this file as a barrier, which is how multiple job
/// files on one command line run in sequence.
///
/// Returns the number of sections dropped for option or build errors; a
/// missing or unreadable file is the only hard failure.
pub fn parse_jobs_file(
    ctx: &mut HarnessContext,
    path: &Path,
    separate_stonewall: bool,
) -> Result<usize> {
    let f = File::open(path)
        .with_context(|| format!("cannot open job file {}", path.display()))?;
    let mut reader = LineReader::new(BufReader::new(f));

    let mut pending_stonewall = separate_stonewall;
    let mut dropped = 0;

    while let Some(line) = reader.next_line()? {
        if is_empty_or_comment(&line) {
            continue;
        }
        let Some(name) = section_name(&line) else {
            // Stray option outside any section; ignored like the header
            // scan it failed to be.
            continue;
        };
        let name = name.to_string();
        let global = name == "global";
        debug!(section = %name, global, "job file section");

        let handle = ctx.get_new_job(global)?;

        if !global && pending_stonewall {
            ctx.worker_mut(handle).stonewall = true;
            pending_stonewall = false;
        }

        let mut errors = 0usize;
        while let Some(line) = reader.next_line()? {
            if is_empty_or_comment(&line) {
                continue;
            }
            let trimmed = line.trim();
            if trimmed.starts_with('[') {
                reader.push_back(line);
                break;
            }

            // Keep parsing on error so every bad option in the section is
            // reported in one pass.
            if let Err(e) = ctx.apply_option_line(handle, trimmed) {
                ctx.log_err(&format!("{}", e));
                errors += 1;
            }
        }

        if errors == 0 {
            if let Err(e) = add_job(ctx, handle, &name, 0) {
                ctx.log_err(&format!("job {} dropped: {}", name, e));
                dropped += 1;
            }
        } else {
            ctx.log_err(&format!("job {} dropped", name));
            ctx.put_job(handle);
            dropped += 1;
        }
    }

    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_empty_or_comment() {
        assert!(is_empty_or_comment(""));
        assert!(is_empty_or_comment("   "));
        assert!(is_empty_or_comment("; a comment"));
        assert!(is_empty_or_comment("   ; indented comment"));
        assert!(!is_empty_or_comment("rw=read"));
        assert!(!is_empty_or_comment("rw=read ; not a comment line"));
    }

    #[test]
    fn test_section_name() {
        assert_eq!(section_name("[job]"), Some("job"));
        assert_eq!(section_name("  [job]"), Some("job"));
        assert_eq!(section_name("[/dev/sda]"), Some("/dev/sda"));
        assert_eq!(section_name("[]"), None);
        assert_eq!(section_name("[unterminated"), None);
        assert_eq!(section_name("rw=read"), None);
    }

    #[test]
    fn test_line_reader_pushback() {
        let mut r = LineReader::new(Cursor::new("one\ntwo\nthree\n"));
        assert_eq!(r.next_line().unwrap().as_deref(), Some("one"));
        let two = r.next_line().unwrap().unwrap();
        r.push_back(two);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("two"));
        assert_eq!(r.next_line().unwrap().as_deref(), Some("three"));
        assert_eq!(r.next_line().unwrap(), None);
    }

    #[test]
    fn test_line_reader_strips_crlf() {
        let mut r = LineReader::new(Cursor::new("a\r\nb"));
        assert_eq!(r.next_line().unwrap().as_deref(), Some("a"));
        assert_eq!(r.next_line().unwrap().as_deref(), Some("b"));
    }
}
