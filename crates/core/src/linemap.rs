//! Generated-line to source-line mapping for preprocessed bundles
//!
//! The preprocessor flattens includes into one file per source kind and
//! marks every splice with a `#line <n> "<file>"` directive. A [`LineTable`]
//! is built once from that output after each build and is never mutated;
//! [`ErrorLocationMapper`] swaps in a whole new table on the next build.

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Which half of the bundle a line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Agent,
    Device,
}

impl SourceKind {
    /// File name used when the preprocessed output carries no directive
    pub fn default_file_name(self) -> &'static str {
        match self {
            SourceKind::Agent => "agent.nut",
            SourceKind::Device => "device.nut",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Agent => f.write_str("Agent"),
            SourceKind::Device => f.write_str("Device"),
        }
    }
}

/// Original position of a generated line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    /// 1-based line in `file`
    pub line: usize,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

fn line_directive() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*#line\s+(\d+)(?:\s+"([^"]*)")?"#).expect("valid #line pattern")
    })
}

/// Immutable `(kind, generated line) -> original location` snapshot of one build
#[derive(Debug, Default, Clone)]
pub struct LineTable {
    entries: HashMap<(SourceKind, usize), SourceLocation>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from explicit entries (keys are 0-based generated lines)
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = ((SourceKind, usize), SourceLocation)>,
    {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Build from the preprocessed agent and device sources
    pub fn from_preprocessed(agent_code: &str, device_code: &str) -> Self {
        let mut entries = HashMap::new();
        Self::scan(SourceKind::Agent, agent_code, &mut entries);
        Self::scan(SourceKind::Device, device_code, &mut entries);
        Self { entries }
    }

    // The line after `#line N "f"` is line N of `f`. Lines before the first
    // directive keep their own numbering in the kind's default file.
    fn scan(
        kind: SourceKind,
        code: &str,
        entries: &mut HashMap<(SourceKind, usize), SourceLocation>,
    ) {
        let mut file = kind.default_file_name().to_string();
        let mut next_line = 1usize;

        for (generated, text) in code.lines().enumerate() {
            if let Some(caps) = line_directive().captures(text) {
                if let Ok(n) = caps[1].parse::<usize>() {
                    next_line = n;
                }
                if let Some(name) = caps.get(2) {
                    file = name.as_str().to_string();
                }
                continue;
            }
            entries.insert((kind, generated), SourceLocation::new(file.clone(), next_line));
            next_line += 1;
        }
    }

    pub fn lookup(&self, kind: SourceKind, generated_line: usize) -> Option<&SourceLocation> {
        self.entries.get(&(kind, generated_line))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Holds the line table of the most recent build
#[derive(Debug, Default, Clone)]
pub struct ErrorLocationMapper {
    table: Option<Arc<LineTable>>,
}

impl ErrorLocationMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot wholesale
    pub fn install(&mut self, table: LineTable) {
        tracing::debug!("Installing line table with {} entries", table.len());
        self.table = Some(Arc::new(table));
    }

    /// Current snapshot, shared with readers that outlive the next build
    pub fn snapshot(&self) -> Option<Arc<LineTable>> {
        self.table.clone()
    }

    /// Map a 0-based generated line; `None` when no build is installed or the
    /// line is unmapped
    pub fn lookup(&self, kind: SourceKind, generated_line: usize) -> Option<SourceLocation> {
        self.table
            .as_ref()
            .and_then(|table| table.lookup(kind, generated_line))
            .cloned()
    }
}
