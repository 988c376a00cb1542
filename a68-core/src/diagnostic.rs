//! Diagnostics ledger.
//!
//! Diagnostics are composed from a small positional template language,
//! counted per class, and appended to the chain of the source line they
//! anchor to. Rendering prints a line with caret rows underneath and the
//! texts after it.
//!
//! Template characters:
//!
//! | char | argument              | renders as                                  |
//! |------|-----------------------|---------------------------------------------|
//! | `@`  | (anchoring node)      | grammar name of the node                    |
//! | `A`  | [`Arg::Attribute`]    | grammar name of the attribute               |
//! | `B`  | [`Arg::Attribute`]    | keyword spelling, quoted                    |
//! | `D`  | [`Arg::Int`]          | decimal                                     |
//! | `E`  | [`Arg::Os`]           | ` (lower-cased os error)`                   |
//! | `L`  | [`Arg::Line`]         | `in this line`, `in line N`, or `in standard environment` |
//! | `M`  | [`Arg::Moid`]         | mode, through the cycle-safe printer        |
//! | `S`  | (anchoring node)      | quoted symbol of the node                   |
//! | `U`  | [`Arg::Text`]         | text as is                                  |
//! | `Z`  | [`Arg::Text`]         | text, quoted                                |
//!
//! Any other character is copied.

use std::io::{self, Write};

use crate::arena::Arena;
use crate::error::Abend;
use crate::moids::{MOID_ERROR_WIDTH, Modes};
use crate::postulate::PostulateLedger;
use crate::registry::{Attribute, LineId, MoidId, MoidKind, NodeId, Registry, SourceLine};

/// Per-class ceiling on rendered diagnostics.
pub const MAX_ERRORS: usize = 10;

/// Continuation rows printed for one long source line.
const MAX_CONTINUATIONS: usize = 9;

const TAB_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
    SyntaxError,
    MathError,
    RuntimeError,
    /// Used by scan errors and the suppression marker; prints no label.
    Suppress,
}

impl Severity {
    pub fn label(self) -> Option<&'static str> {
        match self {
            Severity::Warning => Some("warning"),
            Severity::Error => Some("error"),
            Severity::SyntaxError => Some("syntax error"),
            Severity::MathError => Some("math error"),
            Severity::RuntimeError => Some("runtime error"),
            Severity::Suppress => None,
        }
    }

    fn is_error_class(self) -> bool {
        matches!(self, Severity::Error | Severity::SyntaxError)
    }
}

/// Template argument.
#[derive(Debug, Clone)]
pub enum Arg {
    Attribute(Attribute),
    Int(i64),
    Line(LineId),
    Moid(MoidId),
    Text(String),
    Os(String),
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub text: String,
    /// Character the caret row marks.
    pub column: usize,
    pub node: Option<NodeId>,
    /// Position in the owning line's chain, from 1.
    pub number: usize,
}

/// Which diagnostics a rendering includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Render {
    All,
    Runtime,
}

/// What the ledger decided for one incoming diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Compose(Severity),
    /// The class just hit its ceiling: emit the marker text instead.
    Marker(Severity, &'static str),
    Drop,
}

#[derive(Debug, Clone, Default)]
pub struct DiagnosticsLedger {
    pub error_count: usize,
    pub warning_count: usize,
    pub no_warnings: bool,
    pub quiet: bool,
}

impl DiagnosticsLedger {
    pub fn new(no_warnings: bool, quiet: bool) -> Self {
        DiagnosticsLedger {
            error_count: 0,
            warning_count: 0,
            no_warnings,
            quiet,
        }
    }

    /// Applies configuration and ceilings, and counts the diagnostic.
    /// Counters keep growing past the ceiling even though nothing more is
    /// rendered.
    pub fn admit(&mut self, severity: Severity, forced: bool) -> Admission {
        if severity == Severity::Warning && ((self.no_warnings && !forced) || self.quiet) {
            return Admission::Drop;
        }
        let admission = if severity.is_error_class() {
            match self.error_count {
                n if n == MAX_ERRORS => {
                    Admission::Marker(Severity::Error, "further error diagnostics suppressed")
                }
                n if n > MAX_ERRORS => Admission::Drop,
                _ => Admission::Compose(severity),
            }
        } else if severity == Severity::Warning {
            match self.warning_count {
                n if n == MAX_ERRORS => {
                    Admission::Marker(Severity::Warning, "further warning diagnostics suppressed")
                }
                n if n > MAX_ERRORS => Admission::Drop,
                _ => Admission::Compose(severity),
            }
        } else {
            Admission::Compose(severity)
        };
        if severity == Severity::Warning {
            self.warning_count += 1;
        } else {
            self.error_count += 1;
        }
        admission
    }
}

/// Renders a template. The anchoring node feeds `@`, `S` and `L`.
pub fn compose(
    registry: &Registry,
    ledger: &mut PostulateLedger,
    arena: &Arena,
    node: Option<NodeId>,
    template: &str,
    args: &[Arg],
) -> Result<String, Abend> {
    let mut text = String::new();
    let mut args = args.iter();
    let scope = node.and_then(|n| registry[n].scope);
    for ch in template.chars() {
        match ch {
            '@' => {
                let name = node.and_then(|n| registry[n].attribute.non_terminal());
                text.push_str(name.unwrap_or("construct"));
            }
            'A' => match args.next() {
                Some(Arg::Attribute(a)) => text.push_str(a.non_terminal().unwrap_or("construct")),
                _ => text.push_str("construct"),
            },
            'B' => match args.next() {
                Some(Arg::Attribute(a)) => match a.keyword() {
                    Some(keyword) => {
                        text.push('"');
                        text.push_str(keyword);
                        text.push('"');
                    }
                    None => text.push_str("keyword"),
                },
                _ => text.push_str("keyword"),
            },
            'D' => {
                if let Some(Arg::Int(value)) = args.next() {
                    text.push_str(&value.to_string());
                }
            }
            'E' => {
                if let Some(Arg::Os(message)) = args.next() {
                    text.push_str(" (");
                    text.push_str(&message.to_lowercase());
                    text.push(')');
                }
            }
            'L' => {
                if let Some(Arg::Line(line)) = args.next() {
                    let number = registry[*line].number;
                    if number == 0 {
                        text.push_str("in standard environment");
                    } else if node.is_some_and(|n| registry[registry[n].line].number == number) {
                        text.push_str("in this line");
                    } else {
                        text.push_str(&format!("in line {number}"));
                    }
                }
            }
            'M' => {
                let moid = match args.next() {
                    Some(Arg::Moid(moid)) => Some(*moid),
                    _ => None,
                };
                match moid {
                    Some(moid) if registry[moid].kind != MoidKind::Error => {
                        let mut modes = Modes::new(registry, ledger, arena);
                        text.push_str(&modes.to_string(moid, MOID_ERROR_WIDTH, scope)?);
                    }
                    _ => text.push_str("unresolved"),
                }
            }
            'S' => match node {
                Some(n) if !registry[n].symbol.is_empty() => {
                    text.push('"');
                    text.push_str(&registry[n].symbol);
                    text.push('"');
                }
                _ => text.push_str("symbol"),
            },
            'U' => {
                if let Some(Arg::Text(s)) = args.next() {
                    text.push_str(s);
                }
            }
            'Z' => {
                if let Some(Arg::Text(s)) = args.next() {
                    text.push('"');
                    text.push_str(s);
                    text.push('"');
                }
            }
            other => text.push(other),
        }
    }
    Ok(text)
}

/// The "detected in ..." clause naming the phrase that encloses `node`.
pub fn detected_in(
    registry: &Registry,
    ledger: &mut PostulateLedger,
    arena: &Arena,
    node: NodeId,
    line_number: u32,
) -> Result<Option<String>, Abend> {
    let Some(nest) = registry[node].nest else {
        return Ok(None);
    };
    let n = &registry[nest];
    let Some(name) = n.attribute.non_terminal() else {
        return Ok(None);
    };
    let nest_line = registry[n.line].number;
    if nest_line == 0 {
        return Ok(Some(format!("detected in {name}")));
    }
    let symbol: String = n.symbol.chars().take(64).collect();
    let place = if nest_line == line_number {
        "in this line".to_string()
    } else {
        format!("in line {nest_line}")
    };
    let text = match n.moid {
        Some(moid) => {
            let mut modes = Modes::new(registry, ledger, arena);
            let mode = modes.to_string(moid, MOID_ERROR_WIDTH, n.scope)?;
            format!("detected in {mode} {name} starting at \"{symbol}\" {place}")
        }
        None => format!("detected in {name} starting at \"{symbol}\" {place}"),
    };
    Ok(Some(text))
}

/// Formats the full record text, `<cmd>: [<file>: ]<severity>: <k>: <text>.`
pub fn record_text(
    command_name: &str,
    filename: Option<&str>,
    severity: Severity,
    number: usize,
    body: &str,
    detected: Option<&str>,
) -> String {
    let mut text = String::from(command_name);
    text.push_str(": ");
    if let Some(filename) = filename {
        text.push_str(filename);
        text.push_str(": ");
    }
    if let Some(label) = severity.label() {
        text.push_str(label);
        text.push_str(": ");
    }
    text.push_str(&format!("{number:x}: {body}"));
    if let Some(detected) = detected {
        text.push_str(&format!(" ({detected})"));
    }
    text.push('.');
    text
}

/// Formats a diagnostic that has no source line to attach to.
pub fn unanchored_text(command_name: &str, severity: Severity, body: &str) -> String {
    match severity.label() {
        Some(label) => format!("{command_name}: {label}: {body}."),
        None => format!("{command_name}: {body}."),
    }
}

/// Suffix pointing at the offending character of a line diagnostic.
pub fn detected_at(line: &str, column: usize) -> Option<String> {
    let ch = line.chars().nth(column)?;
    if ch.is_control() || ch.is_whitespace() {
        return None;
    }
    if ch == '"' {
        Some(" (detected at quote-character)".to_string())
    } else {
        Some(format!(" (detected at character \"{ch}\")"))
    }
}

/// First non-blank character at or after `column`, or of the line when the
/// column is blank to the end.
pub fn mark_column(text: &str, column: Option<usize>) -> usize {
    let chars: Vec<char> = text.chars().collect();
    let first_graphic = |from: usize| (from..chars.len()).find(|&i| !chars[i].is_whitespace());
    column
        .and_then(first_graphic)
        .or_else(|| first_graphic(0))
        .unwrap_or(0)
}

fn digit_to_char(k: usize) -> char {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    DIGITS.get(k).map(|&b| b as char).unwrap_or('*')
}

/// Word-wraps a diagnostic text to `width` columns.
pub fn pretty_diag(out: &mut dyn Write, text: &str, width: usize) -> io::Result<()> {
    let mut column = 0;
    for word in text.split(' ') {
        let len = word.chars().count();
        if column > 0 && column + 1 + len > width {
            writeln!(out)?;
            column = 0;
        } else if column > 0 {
            write!(out, " ")?;
            column += 1;
        }
        write!(out, "{word}")?;
        column += len;
    }
    writeln!(out)
}

/// One physical row of a rendered line: display text plus the character
/// indices it covers.
struct Row {
    display: String,
    columns: Vec<(usize, usize)>,
}

fn layout_rows(text: &str, capacity: usize) -> Vec<Row> {
    let capacity = capacity.max(1);
    let chars: Vec<char> = text.trim_end_matches(['\n', '\r']).chars().collect();
    let mut rows = Vec::new();
    let mut row = Row {
        display: String::new(),
        columns: Vec::new(),
    };
    let mut pos = 0;
    let mut index = 0;
    while index < chars.len() {
        // Keep runs of graphic characters together when they fit a row.
        let run_end = if chars[index].is_whitespace() {
            index + 1
        } else {
            (index..chars.len())
                .find(|&i| chars[i].is_whitespace())
                .unwrap_or(chars.len())
        };
        let pieces: Vec<(usize, String)> = if run_end - index > capacity {
            vec![(index, chars[index].to_string())]
        } else {
            (index..run_end)
                .map(|i| {
                    let shown = if chars[i] == '\t' {
                        " ".repeat(TAB_WIDTH - (pos % TAB_WIDTH))
                    } else if chars[i].is_control() {
                        "?".to_string()
                    } else {
                        chars[i].to_string()
                    };
                    (i, shown)
                })
                .collect()
        };
        let width: usize = pieces.iter().map(|(_, s)| s.chars().count()).sum();
        if pos + width > capacity && !row.columns.is_empty() {
            rows.push(row);
            row = Row {
                display: String::new(),
                columns: Vec::new(),
            };
            pos = 0;
            continue;
        }
        for (i, shown) in pieces {
            let len = shown.chars().count();
            row.columns.push((i, len));
            row.display.push_str(&shown);
            pos += len;
            index = i + 1;
        }
    }
    rows.push(row);
    rows
}

/// Prints a source line with caret rows and, per `what`, its diagnostics.
/// `where_column` marks the node under evaluation with `-`.
pub fn write_source_line(
    out: &mut dyn Write,
    line: &SourceLine,
    where_column: Option<usize>,
    what: Render,
    width: usize,
) -> io::Result<()> {
    let prefix = if line.number == 0 {
        "      ".to_string()
    } else {
        format!("{:<5} ", line.number % 100_000)
    };
    let rows = layout_rows(&line.text, width.saturating_sub(prefix.len()));
    let where_column = where_column.map(|c| mark_column(&line.text, Some(c)));
    for (k, row) in rows.iter().enumerate() {
        if k == 0 {
            write!(out, "{prefix}{}", row.display)?;
        } else {
            write!(out, ".{k:<5}{}", row.display)?;
        }
        writeln!(out)?;
        let mut marks = String::new();
        let mut any = false;
        for (column, len) in &row.columns {
            let here: Vec<&Diagnostic> = line
                .diagnostics
                .iter()
                .filter(|d| d.column == *column)
                .collect();
            let mark = if where_column == Some(*column) {
                Some('-')
            } else if here.is_empty() {
                None
            } else if here.len() == 1 {
                Some(digit_to_char(here[0].number))
            } else {
                Some('*')
            };
            match mark {
                Some(mark) => {
                    any = true;
                    marks.push(mark);
                    marks.push_str(&" ".repeat(len.saturating_sub(1)));
                }
                None => marks.push_str(&" ".repeat(*len)),
            }
        }
        if any {
            writeln!(out, "      {}", marks.trim_end())?;
        }
        if k + 1 == MAX_CONTINUATIONS && rows.len() > MAX_CONTINUATIONS {
            writeln!(out, "...")?;
            break;
        }
    }
    for diagnostic in &line.diagnostics {
        let shown = match what {
            Render::All => true,
            Render::Runtime => diagnostic.severity == Severity::RuntimeError,
        };
        if shown {
            pretty_diag(out, &diagnostic.text, width)?;
        }
    }
    Ok(())
}

/// Whether a line carries diagnostics of the requested class.
pub fn line_has(line: &SourceLine, what: Render) -> bool {
    line.diagnostics.iter().any(|d| match what {
        Render::All => true,
        Render::Runtime => d.severity == Severity::RuntimeError,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MemoryBudgets;

    fn line_with(text: &str, diagnostics: Vec<(usize, Severity, &str)>) -> SourceLine {
        SourceLine {
            text: text.to_string(),
            filename: "prog.a68".to_string(),
            number: 3,
            diagnostics: diagnostics
                .into_iter()
                .enumerate()
                .map(|(i, (column, severity, text))| Diagnostic {
                    severity,
                    text: text.to_string(),
                    column,
                    node: None,
                    number: i + 1,
                })
                .collect(),
            list: true,
        }
    }

    fn render(line: &SourceLine, where_column: Option<usize>, what: Render, width: usize) -> String {
        let mut out = Vec::new();
        write_source_line(&mut out, line, where_column, what, width).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn ceiling_emits_one_marker_and_keeps_counting() {
        let mut ledger = DiagnosticsLedger::new(false, false);
        let admissions: Vec<Admission> = (0..15)
            .map(|_| ledger.admit(Severity::SyntaxError, false))
            .collect();
        let composed = admissions
            .iter()
            .filter(|a| matches!(a, Admission::Compose(_)))
            .count();
        let markers: Vec<&Admission> = admissions
            .iter()
            .filter(|a| matches!(a, Admission::Marker(..)))
            .collect();
        assert_eq!(composed, MAX_ERRORS);
        assert_eq!(
            markers,
            vec![&Admission::Marker(
                Severity::Error,
                "further error diagnostics suppressed"
            )]
        );
        assert_eq!(ledger.error_count, 15);
    }

    #[test]
    fn warnings_have_their_own_ceiling() {
        let mut ledger = DiagnosticsLedger::new(false, false);
        for _ in 0..MAX_ERRORS {
            ledger.admit(Severity::Error, false);
        }
        assert_eq!(
            ledger.admit(Severity::Warning, false),
            Admission::Compose(Severity::Warning)
        );
    }

    #[test]
    fn configured_warnings_are_dropped_uncounted() {
        let mut ledger = DiagnosticsLedger::new(true, false);
        assert_eq!(ledger.admit(Severity::Warning, false), Admission::Drop);
        assert_eq!(ledger.warning_count, 0);
        assert_eq!(
            ledger.admit(Severity::Warning, true),
            Admission::Compose(Severity::Warning)
        );
        let mut quiet = DiagnosticsLedger::new(false, true);
        assert_eq!(quiet.admit(Severity::Warning, true), Admission::Drop);
    }

    #[test]
    fn composes_template_characters() {
        let arena = Arena::init(&MemoryBudgets::default()).unwrap();
        let mut registry = Registry::new();
        let mut ledger = PostulateLedger::new();
        let line = registry
            .new_source_line(&arena, "INT x = y", "prog.a68", 4)
            .unwrap();
        let other = registry.new_source_line(&arena, "", "prog.a68", 9).unwrap();
        let node = registry
            .new_node(&arena, Attribute::Identifier, "y", line, 8)
            .unwrap();
        let int = registry.new_moid(&arena, MoidKind::Standard, "INT").unwrap();
        let text = compose(
            &registry,
            &mut ledger,
            &arena,
            Some(node),
            "tag S declared L, A B, M, D times, U Z E",
            &[
                Arg::Line(other),
                Arg::Attribute(Attribute::ModeDeclaration),
                Arg::Attribute(Attribute::ModeSymbol),
                Arg::Moid(int),
                Arg::Int(3),
                Arg::Text("plain".into()),
                Arg::Text("quoted".into()),
                Arg::Os("No Such File".into()),
            ],
        )
        .unwrap();
        assert_eq!(
            text,
            "tag \"y\" declared in line 9, mode-declaration \"MODE\", INT, 3 times, plain \"quoted\"  (no such file)"
        );
    }

    #[test]
    fn record_text_uses_hex_sequence_number() {
        let text = record_text("a68", None, Severity::SyntaxError, 11, "oops", None);
        assert_eq!(text, "a68: syntax error: b: oops.");
        let text = record_text(
            "a68",
            Some("prelude/modes.a68"),
            Severity::Suppress,
            1,
            "stop",
            Some("detected in unit"),
        );
        assert_eq!(text, "a68: prelude/modes.a68: 1: stop (detected in unit).");
    }

    #[test]
    fn renders_digit_and_star_marks() {
        let line = line_with(
            "print ((1, 2)",
            vec![
                (0, Severity::SyntaxError, "a68: syntax error: 1: first."),
                (6, Severity::Error, "a68: error: 2: second."),
                (6, Severity::Warning, "a68: warning: 3: third."),
            ],
        );
        let text = render(&line, None, Render::All, 80);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "3     print ((1, 2)");
        assert_eq!(lines[1], "      1     *");
        assert_eq!(lines[2], "a68: syntax error: 1: first.");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn marks_node_under_evaluation() {
        let line = line_with("x := y / 0", vec![(5, Severity::RuntimeError, "boom.")]);
        let text = render(&line, Some(7), Render::Runtime, 80);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "           1 -");
        assert_eq!(lines[2], "boom.");
    }

    #[test]
    fn wraps_long_lines_onto_continuation_rows() {
        let text = "word ".repeat(30);
        let line = line_with(&text, vec![]);
        let rendered = render(&line, None, Render::All, 40);
        let rows: Vec<&str> = rendered.lines().collect();
        assert!(rows.len() > 1);
        assert!(rows[1].starts_with(".1"));
        assert!(rows.iter().all(|r| r.chars().count() <= 40));
    }

    #[test]
    fn runaway_lines_stop_after_nine_rows() {
        let text = "x ".repeat(400);
        let line = line_with(&text, vec![]);
        let rendered = render(&line, None, Render::All, 20);
        let rows: Vec<&str> = rendered.lines().collect();
        assert_eq!(rows.len(), MAX_CONTINUATIONS + 1);
        assert_eq!(rows.last(), Some(&"..."));
    }

    #[test]
    fn mark_column_skips_blanks() {
        assert_eq!(mark_column("   BEGIN", None), 3);
        assert_eq!(mark_column("a   b", Some(1)), 4);
        assert_eq!(mark_column("ab   ", Some(3)), 0);
    }

    #[test]
    fn detected_at_names_the_character() {
        assert_eq!(
            detected_at("PR heap=\"1 PR", 8).as_deref(),
            Some(" (detected at quote-character)")
        );
        assert_eq!(
            detected_at("abc", 1).as_deref(),
            Some(" (detected at character \"b\")")
        );
        assert_eq!(detected_at("a c", 1), None);
    }
}
