//! Session configuration.
//!
//! [`Options`] is built once by the command line front end and is never
//! mutated afterwards. The only values a program may still change are the
//! memory budgets, through a `PR heap=64M PR` directive; those live in the
//! session and are seeded from [`Options::budgets`].

use std::path::PathBuf;

pub const KILOBYTE: usize = 1024;
pub const MEGABYTE: usize = 1024 * KILOBYTE;
pub const GIGABYTE: usize = 1024 * MEGABYTE;

/// Smallest accepted budget, also the default reserve between the two
/// arena growth fronts.
pub const MIN_MEM_SIZE: usize = 128 * KILOBYTE;

/// Largest accepted budget; four of them still fit the address space.
pub const MAX_MEM_SIZE: usize = isize::MAX as usize / 4;

/// Default optimisation level handed to the external compiler.
pub const DEFAULT_OPT_LEVEL: u8 = 2;

pub const DEFAULT_LINE_WIDTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    Heap,
    Handles,
    Frame,
    Stack,
    Overhead,
}

impl Budget {
    pub fn from_name(name: &str) -> Option<Budget> {
        match name.to_ascii_lowercase().as_str() {
            "heap" => Some(Budget::Heap),
            "handles" => Some(Budget::Handles),
            "frame" => Some(Budget::Frame),
            "stack" => Some(Budget::Stack),
            "overhead" => Some(Budget::Overhead),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Budget::Heap => "heap",
            Budget::Handles => "handles",
            Budget::Frame => "frame",
            Budget::Stack => "stack",
            Budget::Overhead => "overhead",
        }
    }
}

/// The four region sizes plus the reserve margin, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudgets {
    pub heap: usize,
    pub handles: usize,
    pub frame: usize,
    pub stack: usize,
    pub overhead: usize,
}

impl Default for MemoryBudgets {
    fn default() -> Self {
        MemoryBudgets {
            heap: 24 * MEGABYTE,
            handles: 4 * MEGABYTE,
            frame: 3 * MEGABYTE,
            stack: MEGABYTE,
            overhead: MIN_MEM_SIZE,
        }
    }
}

impl MemoryBudgets {
    pub fn get(&self, budget: Budget) -> usize {
        match budget {
            Budget::Heap => self.heap,
            Budget::Handles => self.handles,
            Budget::Frame => self.frame,
            Budget::Stack => self.stack,
            Budget::Overhead => self.overhead,
        }
    }

    /// Sets one budget and reports whether its value changed.
    pub fn set(&mut self, budget: Budget, value: usize) -> bool {
        let slot = match budget {
            Budget::Heap => &mut self.heap,
            Budget::Handles => &mut self.handles,
            Budget::Frame => &mut self.frame,
            Budget::Stack => &mut self.stack,
            Budget::Overhead => &mut self.overhead,
        };
        let changed = *slot != value;
        *slot = value;
        changed
    }

    /// Whether any of the four region budgets differs. The reserve alone
    /// does not count as a layout change.
    pub fn regions_differ(&self, other: &MemoryBudgets) -> bool {
        self.heap != other.heap
            || self.handles != other.handles
            || self.frame != other.frame
            || self.stack != other.stack
    }
}

/// Parses `64`, `512k`, `256M` or `2G` into a byte count.
pub fn parse_size(text: &str) -> Result<usize, String> {
    let text = text.trim();
    let (digits, multiplier) = match text.chars().last() {
        Some('k') | Some('K') => (&text[..text.len() - 1], KILOBYTE),
        Some('m') | Some('M') => (&text[..text.len() - 1], MEGABYTE),
        Some('g') | Some('G') => (&text[..text.len() - 1], GIGABYTE),
        _ => (text, 1),
    };
    let value: usize = digits
        .parse()
        .map_err(|_| format!("\"{text}\" is not a valid size"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("\"{text}\" is too large"))
}

/// Listing sections; each one is independently switched on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingOptions {
    pub source: bool,
    pub tree: bool,
    pub object: bool,
    pub moids: bool,
    pub standard_environment: bool,
    pub refinements: bool,
    pub pragmats: bool,
}

impl ListingOptions {
    pub fn any(&self) -> bool {
        self.source
            || self.tree
            || self.object
            || self.moids
            || self.standard_environment
            || self.refinements
            || self.pragmats
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Source file as named on the command line.
    pub source: PathBuf,
    /// Name used as prefix of every message.
    pub command_name: String,
    pub budgets: MemoryBudgets,
    pub optimise: bool,
    pub opt_level: u8,
    pub keep: bool,
    pub rerun: bool,
    /// Build only; package the result as a script instead of running it.
    pub compile: bool,
    /// The source is a script produced by a previous `compile`.
    pub run_script: bool,
    /// Seconds, 0 is unlimited.
    pub time_limit: u64,
    pub no_warnings: bool,
    pub quiet: bool,
    pub portcheck: bool,
    pub verbose: bool,
    /// Write the machine-readable diagnostics stream.
    pub tui: bool,
    pub listing: ListingOptions,
    pub line_width: usize,
    pub compiler: String,
    pub linker: String,
    pub tuning: Vec<String>,
    /// Directory of `.a68` mode-declaration files loaded ahead of the program.
    pub prelude: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            source: PathBuf::new(),
            command_name: "a68".to_string(),
            budgets: MemoryBudgets::default(),
            optimise: false,
            opt_level: DEFAULT_OPT_LEVEL,
            keep: false,
            rerun: false,
            compile: false,
            run_script: false,
            time_limit: 0,
            no_warnings: false,
            quiet: false,
            portcheck: false,
            verbose: false,
            tui: false,
            listing: ListingOptions::default(),
            line_width: DEFAULT_LINE_WIDTH,
            compiler: "cc".to_string(),
            linker: "ld".to_string(),
            tuning: Vec::new(),
            prelude: None,
        }
    }
}

impl Options {
    pub fn for_source(source: impl Into<PathBuf>) -> Self {
        Options {
            source: source.into(),
            ..Options::default()
        }
    }

    /// Native compilation is requested by optimising, by building a script,
    /// or by rerunning a previously built module.
    pub fn native(&self) -> bool {
        self.optimise || self.compile || self.rerun || self.run_script
    }
}

/// An unterminated quote in a directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnterminatedQuote {
    /// Byte offset of the opening quote.
    pub offset: usize,
}

/// Splits directive text into items at white space, honouring `"..."`.
pub fn isolate_items(text: &str) -> Result<Vec<String>, UnterminatedQuote> {
    let mut items = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(start, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if ch == '"' {
            chars.next();
            let mut item = String::new();
            let mut closed = false;
            for (_, c) in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                item.push(c);
            }
            if !closed {
                return Err(UnterminatedQuote { offset: start });
            }
            items.push(item);
        } else {
            let mut item = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                item.push(c);
                chars.next();
            }
            items.push(item);
        }
    }
    Ok(items)
}

/// One interpreted directive item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveItem {
    Budget(Budget, usize),
    /// Recognised budget name with a value below the minimum; raised.
    Raised(Budget, usize),
    Invalid(String),
    Unknown(String),
}

/// Interprets directive items. Accepts `heap=64M`, `--heap=64M` and
/// `heap 64M`, case-insensitively.
pub fn interpret_items(items: &[String]) -> Vec<DirectiveItem> {
    let mut result = Vec::new();
    let mut index = 0;
    while index < items.len() {
        let item = items[index].trim_start_matches('-');
        let (name, value) = match item.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (item, None),
        };
        let Some(budget) = Budget::from_name(name) else {
            result.push(DirectiveItem::Unknown(items[index].clone()));
            index += 1;
            continue;
        };
        let value = match value {
            Some(value) => value,
            None => {
                index += 1;
                match items.get(index) {
                    Some(value) => value.clone(),
                    None => {
                        result.push(DirectiveItem::Invalid(items[index - 1].clone()));
                        break;
                    }
                }
            }
        };
        match parse_size(&value) {
            Ok(size) if size < MIN_MEM_SIZE => {
                result.push(DirectiveItem::Raised(budget, MIN_MEM_SIZE))
            }
            Ok(size) if size <= MAX_MEM_SIZE => result.push(DirectiveItem::Budget(budget, size)),
            Ok(_) | Err(_) => result.push(DirectiveItem::Invalid(value)),
        }
        index += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes_with_suffixes() {
        assert_eq!(parse_size("64").unwrap(), 64);
        assert_eq!(parse_size("512k").unwrap(), 512 * KILOBYTE);
        assert_eq!(parse_size("256M").unwrap(), 256 * MEGABYTE);
        assert_eq!(parse_size("2G").unwrap(), 2 * GIGABYTE);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn isolates_quoted_items() {
        let items = isolate_items(r#"heap=64M  "frame 4M" stack=1M"#).unwrap();
        assert_eq!(items, vec!["heap=64M", "frame 4M", "stack=1M"]);
    }

    #[test]
    fn reports_unterminated_quote() {
        let error = isolate_items(r#"heap=64M "frame"#).unwrap_err();
        assert_eq!(error.offset, 9);
    }

    #[test]
    fn interprets_budget_forms() {
        let items: Vec<String> = ["HEAP=64M", "--frame=4M", "stack", "2M", "portcheck"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let interpreted = interpret_items(&items);
        assert_eq!(
            interpreted,
            vec![
                DirectiveItem::Budget(Budget::Heap, 64 * MEGABYTE),
                DirectiveItem::Budget(Budget::Frame, 4 * MEGABYTE),
                DirectiveItem::Budget(Budget::Stack, 2 * MEGABYTE),
                DirectiveItem::Unknown("portcheck".to_string()),
            ]
        );
    }

    #[test]
    fn small_budgets_are_raised_to_the_minimum() {
        let items = vec!["heap=1k".to_string()];
        assert_eq!(
            interpret_items(&items),
            vec![DirectiveItem::Raised(Budget::Heap, MIN_MEM_SIZE)]
        );
    }

    #[test]
    fn oversized_budgets_are_invalid() {
        let items = vec!["heap=9000000000G".to_string(), "stack=lots".to_string()];
        assert_eq!(
            interpret_items(&items),
            vec![
                DirectiveItem::Invalid("9000000000G".to_string()),
                DirectiveItem::Invalid("lots".to_string()),
            ]
        );
    }

    #[test]
    fn reserve_alone_is_not_a_layout_change() {
        let base = MemoryBudgets::default();
        let mut other = base;
        assert!(other.set(Budget::Overhead, 2 * MIN_MEM_SIZE));
        assert!(!base.regions_differ(&other));
        assert!(other.set(Budget::Heap, 32 * MEGABYTE));
        assert!(base.regions_differ(&other));
    }
}
