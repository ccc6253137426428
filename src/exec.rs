//! External command templates.
//!
//! Backend pipelines (image creation, ECC, blanking, burning) are
//! driven by user-configurable command templates. A template is a
//! command line containing `%name` placeholders expanded before
//! execution; unknown placeholders are left intact so templates can
//! pass literal percent signs to the tool they invoke.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Error, Result};

/// Placeholder set for one expansion. Longest names match first, so
/// `%j1` wins over `%j`.
pub struct TextMacros {
    pairs: Vec<(&'static str, String)>,
}

impl TextMacros {
    pub fn new() -> Self {
        TextMacros { pairs: Vec::new() }
    }

    pub fn set(mut self, name: &'static str, value: impl Into<String>) -> Self {
        debug_assert!(name.starts_with('%'));
        self.pairs.push((name, value.into()));
        self
    }

    /// The standard parallelism macros `%j` and `%j1`.
    pub fn with_parallelism(self) -> Self {
        let j = num_cpus::get().max(1);
        self.set("%j", j.to_string()).set("%j1", j.saturating_sub(1).max(1).to_string())
    }

    fn expand(&self, template: &str) -> String {
        let mut sorted: Vec<&(&'static str, String)> = self.pairs.iter().collect();
        sorted.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));

        let mut out = String::with_capacity(template.len());
        let bytes = template.as_bytes();
        let mut i = 0;
        'outer: while i < bytes.len() {
            if bytes[i] == b'%' {
                for (name, value) in &sorted {
                    if template[i..].starts_with(*name) {
                        out.push_str(value);
                        i += name.len();
                        continue 'outer;
                    }
                }
            }
            let ch = template[i..].chars().next().expect("in-bounds char");
            out.push(ch);
            i += ch.len_utf8();
        }
        out
    }
}

impl Default for TextMacros {
    fn default() -> Self {
        TextMacros::new()
    }
}

/// Expand `template` with `macros`.
pub fn expand_template(template: &str, macros: &TextMacros) -> String {
    macros.expand(template)
}

/// Split a command line into arguments, honoring single and double
/// quotes.
fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    for ch in line.chars() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Expand and execute a command template. Each stdout line is handed to
/// `stdout_line` (progress parsers hook in here); stderr is collected
/// into the error on failure.
pub fn execute_template(
    template: &str,
    macros: &TextMacros,
    mut stdout_line: Option<&mut dyn FnMut(&str)>,
) -> Result<()> {
    let command_line = macros.expand(template);
    let args = split_command_line(&command_line);
    if args.is_empty() {
        return Ok(());
    }
    debug!(command = %command_line, "executing template");

    let mut child = Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::io(e, &args[0]))?;

    if let Some(stdout) = child.stdout.take() {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = line.map_err(|e| Error::io(e, &args[0]))?;
            if let Some(callback) = stdout_line.as_mut() {
                callback(&line);
            }
        }
    }

    let mut stderr_text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        use std::io::Read;
        let _ = stderr.read_to_string(&mut stderr_text);
    }

    let status = child.wait().map_err(|e| Error::io(e, &args[0]))?;
    if !status.success() {
        let detail = if stderr_text.trim().is_empty() {
            format!("'{}' exited with {}", args[0], status)
        } else {
            format!("'{}' exited with {}: {}", args[0], status, stderr_text.trim())
        };
        return Err(Error::io(std::io::Error::other(detail), &args[0]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_placeholders() {
        let macros = TextMacros::new()
            .set("%device", "/dev/sr0")
            .set("%image", "/tmp/v.iso")
            .set("%number", "3");
        let expanded =
            expand_template("burn dev=%device -n %number %image", &macros);
        assert_eq!(expanded, "burn dev=/dev/sr0 -n 3 /tmp/v.iso");
    }

    #[test]
    fn unknown_placeholders_stay_intact() {
        let macros = TextMacros::new().set("%device", "/dev/sr0");
        let expanded = expand_template("tool %device %unknown 100%%done", &macros);
        assert_eq!(expanded, "tool /dev/sr0 %unknown 100%%done");
    }

    #[test]
    fn longest_macro_wins() {
        let macros = TextMacros::new().set("%j", "8").set("%j1", "7");
        assert_eq!(expand_template("-p %j1 -q %j", &macros), "-p 7 -q 8");
    }

    #[test]
    fn split_honors_quotes() {
        let args = split_command_line("mkisofs -V 'My Backup' -o \"a b.iso\" dir");
        assert_eq!(args, vec!["mkisofs", "-V", "My Backup", "-o", "a b.iso", "dir"]);
    }

    #[test]
    fn executes_and_streams_stdout() {
        let mut lines = Vec::new();
        let macros = TextMacros::new().set("%number", "7");
        execute_template("echo volume-%number", &macros, Some(&mut |l: &str| {
            lines.push(l.to_string());
        }))
        .unwrap();
        assert_eq!(lines, vec!["volume-7".to_string()]);
    }

    #[test]
    fn failing_command_is_an_error() {
        let macros = TextMacros::new();
        assert!(execute_template("false", &macros, None).is_err());
    }

    #[test]
    fn empty_template_is_a_no_op() {
        let macros = TextMacros::new();
        execute_template("", &macros, None).unwrap();
    }
}
