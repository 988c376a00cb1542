//! Tokeniser.
//!
//! [`lex`] turns one source text into tokens, directive texts and problems
//! without touching the session. [`tokenise`] reads the program (and the
//! prelude files ahead of it), records every source line, lexes each file
//! and links the resulting token nodes into one chain.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::diagnostic::{Arg, Severity};
use crate::error::{Abend, Fatal};
use crate::options::{DirectiveItem, interpret_items, isolate_items};
use crate::registry::{Attribute, LineId, NodeId, Status};
use crate::session::{Pragmat, SOURCE_EXTENSIONS, Session};

/// A token and the byte offset where it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub attribute: Attribute,
    pub text: String,
    pub start: usize,
}

/// The text between `PR` and the closing `PR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub text: String,
    /// Byte offset of the first character of `text`.
    pub start: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    UnworthyCharacter(char),
    UnterminatedComment,
    UnterminatedString,
    UnterminatedPragmat,
}

impl ProblemKind {
    /// Unterminated constructs swallow the rest of the file; they end the
    /// scan.
    pub fn is_fatal(self) -> bool {
        !matches!(self, ProblemKind::UnworthyCharacter(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub kind: ProblemKind,
    pub start: usize,
}

#[derive(Debug, Default)]
pub struct LexResult {
    pub tokens: Vec<Token>,
    pub directives: Vec<Directive>,
    pub problems: Vec<Problem>,
}

/// Byte offsets of line starts, for mapping offsets to (line, column).
#[derive(Debug)]
pub struct LineMap<'src> {
    source: &'src str,
    starts: Vec<usize>,
}

impl<'src> LineMap<'src> {
    pub fn new(source: &'src str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        LineMap { source, starts }
    }

    /// Zero-based line index and character column of a byte offset.
    pub fn position(&self, offset: usize) -> (usize, usize) {
        let line = match self.starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let start = self.starts[line];
        let column = self.source[start..offset.min(self.source.len())]
            .chars()
            .count();
        (line, column)
    }

    /// Line texts without their terminators.
    pub fn lines(&self) -> impl Iterator<Item = &'src str> + '_ {
        let source = self.source;
        self.starts.iter().enumerate().filter_map(move |(k, &start)| {
            let end = self.starts.get(k + 1).copied().unwrap_or(source.len());
            if start == source.len() && k > 0 {
                return None;
            }
            Some(source[start..end].trim_end_matches(['\n', '\r']))
        })
    }
}

/// Lexes a source string.
pub fn lex(source: &str) -> LexResult {
    let mut lexer = Lexer {
        source,
        chars: source.as_bytes(),
        index: 0,
        result: LexResult::default(),
    };
    lexer.run();
    lexer.result
}

struct Lexer<'src> {
    source: &'src str,
    chars: &'src [u8],
    index: usize,
    result: LexResult,
}

impl Lexer<'_> {
    fn run(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_whitespace() {
                self.consume_char();
                continue;
            }
            let start = self.index;
            let attribute = match ch {
                b'(' => Attribute::OpenSymbol,
                b')' => Attribute::CloseSymbol,
                b'[' => Attribute::SubSymbol,
                b']' => Attribute::BusSymbol,
                b',' => Attribute::CommaSymbol,
                b';' => Attribute::SemicolonSymbol,
                b'=' => Attribute::EqualsSymbol,
                b':' => Attribute::ColonSymbol,
                b'.' => Attribute::PointSymbol,
                b'#' => {
                    self.consume_char();
                    if !self.skip_until(b"#") {
                        self.problem(ProblemKind::UnterminatedComment, start);
                        return;
                    }
                    continue;
                }
                b'"' => {
                    if !self.lex_string(start) {
                        return;
                    }
                    continue;
                }
                b'0'..=b'9' => {
                    self.lex_number(start);
                    continue;
                }
                b'A'..=b'Z' => {
                    if !self.lex_bold_word(start) {
                        return;
                    }
                    continue;
                }
                b'a'..=b'z' => {
                    self.lex_identifier(start);
                    continue;
                }
                _ => {
                    let ch = self.source[start..].chars().next().unwrap_or('?');
                    self.index += ch.len_utf8();
                    self.problem(ProblemKind::UnworthyCharacter(ch), start);
                    continue;
                }
            };
            self.consume_char();
            self.push(attribute, start);
        }
    }

    fn push(&mut self, attribute: Attribute, start: usize) {
        let text = self.source[start..self.index].to_string();
        trace!(?attribute, %text, "token");
        self.result.tokens.push(Token {
            attribute,
            text,
            start,
        });
    }

    fn problem(&mut self, kind: ProblemKind, start: usize) {
        self.result.problems.push(Problem { kind, start });
    }

    /// Skips past the next occurrence of `end`; false when the text runs out.
    fn skip_until(&mut self, end: &[u8]) -> bool {
        match find(&self.chars[self.index..], end) {
            Some(at) => {
                self.index += at + end.len();
                true
            }
            None => {
                self.index = self.chars.len();
                false
            }
        }
    }

    /// `"..."` with `""` standing for one quote; no line breaks inside.
    fn lex_string(&mut self, start: usize) -> bool {
        self.consume_char();
        let mut text = String::new();
        loop {
            match self.peek_char() {
                Some(b'"') if self.peek_next() == Some(b'"') => {
                    text.push('"');
                    self.index += 2;
                }
                Some(b'"') => {
                    self.consume_char();
                    break;
                }
                Some(b'\n') | None => {
                    self.problem(ProblemKind::UnterminatedString, start);
                    return false;
                }
                Some(_) => {
                    let ch = self.source[self.index..].chars().next().unwrap_or('?');
                    text.push(ch);
                    self.index += ch.len_utf8();
                }
            }
        }
        self.result.tokens.push(Token {
            attribute: Attribute::StringDenotation,
            text,
            start,
        });
        true
    }

    fn lex_number(&mut self, start: usize) {
        while matches!(self.peek_char(), Some(b'0'..=b'9')) {
            self.consume_char();
        }
        self.push(Attribute::IntDenotation, start);
    }

    /// Keywords, mode indicants, and the comment and pragmat brackets.
    fn lex_bold_word(&mut self, start: usize) -> bool {
        while matches!(self.peek_char(), Some(b'A'..=b'Z' | b'0'..=b'9' | b'_')) {
            self.consume_char();
        }
        let word = &self.source[start..self.index];
        match word {
            "CO" | "COMMENT" => {
                if !self.skip_until_word(word) {
                    self.problem(ProblemKind::UnterminatedComment, start);
                    return false;
                }
            }
            "PR" | "PRAGMAT" => {
                let text_start = self.index;
                if !self.skip_until_word(word) {
                    self.problem(ProblemKind::UnterminatedPragmat, start);
                    return false;
                }
                let text_end = self.index - word.len();
                self.result.directives.push(Directive {
                    text: self.source[text_start..text_end].to_string(),
                    start: text_start,
                });
            }
            _ => {
                let attribute = Attribute::from_keyword(word).unwrap_or(Attribute::BoldTag);
                self.push(attribute, start);
            }
        }
        true
    }

    /// Like [`Self::skip_until`], but only matches the word standing alone.
    fn skip_until_word(&mut self, word: &str) -> bool {
        let word = word.as_bytes();
        loop {
            let Some(at) = find(&self.chars[self.index..], word) else {
                self.index = self.chars.len();
                return false;
            };
            let begin = self.index + at;
            let end = begin + word.len();
            let bold = |b: Option<&u8>| matches!(b, Some(b'A'..=b'Z' | b'0'..=b'9' | b'_'));
            let before = if begin == 0 { None } else { self.chars.get(begin - 1) };
            if !bold(before) && !bold(self.chars.get(end)) {
                self.index = end;
                return true;
            }
            self.index = begin + 1;
        }
    }

    /// Lower-case tags; blanks inside a tag are not significant, so
    /// `read input` spells `readinput`.
    fn lex_identifier(&mut self, start: usize) {
        let mut text = String::new();
        loop {
            while let Some(ch @ (b'a'..=b'z' | b'0'..=b'9' | b'_')) = self.peek_char() {
                text.push(ch as char);
                self.consume_char();
            }
            let mut ahead = self.index;
            while matches!(self.chars.get(ahead), Some(b' ' | b'\t')) {
                ahead += 1;
            }
            match self.chars.get(ahead) {
                Some(b'a'..=b'z' | b'0'..=b'9') if ahead > self.index => self.index = ahead,
                _ => break,
            }
        }
        self.result.tokens.push(Token {
            attribute: Attribute::Identifier,
            text,
            start,
        });
    }

    fn peek_char(&self) -> Option<u8> {
        self.chars.get(self.index).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.chars.get(self.index + 1).copied()
    }

    fn consume_char(&mut self) {
        if self.index < self.chars.len() {
            self.index += 1;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ---------------------------------------------------------------------
// Session glue
// ---------------------------------------------------------------------

/// Finds the source, trying the silent extensions in order.
pub fn locate_source(source: &Path) -> Option<PathBuf> {
    SOURCE_EXTENSIONS.iter().find_map(|ext| {
        let candidate = if ext.is_empty() {
            source.to_path_buf()
        } else {
            let mut name = source.as_os_str().to_owned();
            name.push(".");
            name.push(ext);
            PathBuf::from(name)
        };
        candidate.is_file().then_some(candidate)
    })
}

/// Prelude files in a stable order.
pub fn prelude_files(dir: &Path) -> Result<Vec<PathBuf>, Abend> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Abend::new("cannot read prelude directory")
                .with_info(format!("{}: {e}", dir.display()))
        })?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|e| e == "a68") {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

/// Reads the program and the prelude, records their lines and links every
/// token into the session's token chain.
pub fn tokenise(session: &mut Session) -> Result<(), Fatal> {
    let requested = session.options.source.clone();
    let Some(path) = locate_source(&requested) else {
        let name = requested.display().to_string();
        return Err(session
            .scan_error(None, None, "cannot find source file Z", &[Arg::Text(name)])
            .into());
    };
    let (text, replaced) = match fs::read(&path) {
        Ok(bytes) => decode(bytes),
        Err(e) => {
            let name = path.display().to_string();
            let os = crate::error::os_error_text(&e);
            return Err(session
                .scan_error(None, None, "cannot read source file ZE", &[Arg::Text(name), Arg::Os(os)])
                .into());
        }
    };
    session.artifacts.source = path.clone();

    let mut chain = Vec::new();
    if let Some(dir) = session.options.prelude.clone() {
        for file in prelude_files(&dir)? {
            let prelude = fs::read(&file)
                .map_err(|e| Abend::io("cannot read prelude file", &file, &e))?;
            let (prelude, replaced) = decode(prelude);
            debug!(file = %file.display(), "scanning prelude");
            let before = chain.len();
            scan_file(session, &file, &prelude, false, replaced, &mut chain)?;
            separate(session, &mut chain, before)?;
        }
    }
    let before = chain.len();
    scan_file(session, &path, &text, true, replaced, &mut chain)?;
    if chain.len() == before {
        session.diagnostic_line(Severity::Error, None, None, "source file is empty", &[])?;
    }

    for pair in chain.windows(2) {
        session.registry[pair[0]].next = Some(pair[1]);
        session.registry[pair[1]].previous = Some(pair[0]);
    }
    session.top_token = chain.first().copied();
    debug!(tokens = chain.len(), lines = session.registry.line_count(), "tokenised");
    Ok(())
}

/// Ends a prelude file's tokens with a `;` unless it already has one.
fn separate(session: &mut Session, chain: &mut Vec<NodeId>, before: usize) -> Result<(), Abend> {
    let Some(&last) = chain.last() else {
        return Ok(());
    };
    if chain.len() == before || session.registry[last].attribute == Attribute::SemicolonSymbol {
        return Ok(());
    }
    let line = session.registry[last].line;
    let column = session.registry[last].column;
    let arena = &session.arena;
    let node = session
        .registry
        .new_node(arena, Attribute::SemicolonSymbol, ";", line, column)?;
    session.registry[node].status.insert(Status::PRELUDE);
    chain.push(node);
    Ok(())
}

/// Decodes file contents, reporting whether invalid UTF-8 was replaced.
fn decode(bytes: Vec<u8>) -> (String, bool) {
    match String::from_utf8(bytes) {
        Ok(text) => (text, false),
        Err(e) => (String::from_utf8_lossy(e.as_bytes()).into_owned(), true),
    }
}

fn scan_file(
    session: &mut Session,
    path: &Path,
    text: &str,
    numbered: bool,
    replaced: bool,
    chain: &mut Vec<NodeId>,
) -> Result<(), Fatal> {
    let filename = path.display().to_string();
    let map = LineMap::new(text);
    let mut lines: Vec<LineId> = Vec::new();
    for (k, line) in map.lines().enumerate() {
        let number = if numbered { k as u32 + 1 } else { 0 };
        let arena = &session.arena;
        lines.push(
            session
                .registry
                .new_source_line(arena, line, filename.as_str(), number)?,
        );
    }
    if replaced {
        for (k, line) in map.lines().enumerate() {
            if let Some(column) = line.chars().position(|c| c == char::REPLACEMENT_CHARACTER) {
                session.diagnostic_line(
                    Severity::Warning,
                    Some(lines[k]),
                    Some(column),
                    "invalid utf-8 sequence replaced",
                    &[],
                )?;
            }
        }
    }
    let result = lex(text);

    for token in &result.tokens {
        let (line, column) = map.position(token.start);
        let arena = &session.arena;
        let node = session.registry.new_node(
            arena,
            token.attribute,
            token.text.as_str(),
            lines[line],
            column,
        )?;
        if !numbered {
            session.registry[node].status.insert(Status::PRELUDE);
        }
        chain.push(node);
    }

    for problem in &result.problems {
        let (line, column) = map.position(problem.start);
        let line = Some(lines[line]);
        let (template, args) = match problem.kind {
            ProblemKind::UnworthyCharacter(ch) => (
                "unworthy character Z",
                vec![Arg::Text(format!("{}", ch.escape_default()))],
            ),
            ProblemKind::UnterminatedComment => ("end of file in comment", Vec::new()),
            ProblemKind::UnterminatedString => ("unterminated string", Vec::new()),
            ProblemKind::UnterminatedPragmat => ("end of file in pragmat", Vec::new()),
        };
        if problem.kind.is_fatal() {
            return Err(session.scan_error(line, Some(column), template, &args).into());
        }
        session.diagnostic_line(Severity::SyntaxError, line, Some(column), template, &args)?;
    }

    for directive in &result.directives {
        let (line, column) = map.position(directive.start);
        let line = lines[line];
        session.pragmats.push(Pragmat {
            line,
            column,
            text: directive.text.trim().to_string(),
        });
        apply_directive(session, &map, &lines, directive)?;
    }
    Ok(())
}

/// Applies the memory options of one directive to the session budgets.
fn apply_directive(
    session: &mut Session,
    map: &LineMap<'_>,
    lines: &[LineId],
    directive: &Directive,
) -> Result<(), Fatal> {
    let (line, column) = map.position(directive.start);
    let line = lines[line];
    let items = match isolate_items(&directive.text) {
        Ok(items) => items,
        Err(quote) => {
            let (quote_line, quote_column) = map.position(directive.start + quote.offset);
            return Err(session
                .scan_error(
                    Some(lines[quote_line]),
                    Some(quote_column),
                    "unterminated string in pragmat",
                    &[],
                )
                .into());
        }
    };
    for item in interpret_items(&items) {
        match item {
            DirectiveItem::Budget(budget, size) => {
                if session.budgets.set(budget, size) {
                    debug!(budget = budget.name(), size, "directive changed a memory budget");
                }
            }
            DirectiveItem::Raised(budget, size) => {
                session.budgets.set(budget, size);
                session.diagnostic_line(
                    Severity::Warning,
                    Some(line),
                    Some(column),
                    "option U raised to minimum D",
                    &[Arg::Text(budget.name().to_string()), Arg::Int(size as i64)],
                )?;
            }
            DirectiveItem::Invalid(text) => session.diagnostic_line(
                Severity::Error,
                Some(line),
                Some(column),
                "invalid option value Z",
                &[Arg::Text(text)],
            )?,
            DirectiveItem::Unknown(text) => session.diagnostic_line(
                Severity::Warning,
                Some(line),
                Some(column),
                "unrecognised option Z",
                &[Arg::Text(text)],
            )?,
        }
    }
    Ok(())
}
