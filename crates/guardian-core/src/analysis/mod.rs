//! Syntax analysis layer
//!
//! Reduces action content to a language-agnostic list of findings. Python,
//! Rust and TypeScript go through tree-sitter grammars; shell commands go
//! through a small tokenizer. Validators only ever look at [`SourceFacts`].

pub mod patterns;
mod python;
mod rust;
pub mod shell;
mod typescript;

use crate::action::{context_keys, Action, ActionType};
use crate::error::AnalysisError;
use crate::types::Location;
use serde::{Deserialize, Serialize};
use std::fmt;
use tree_sitter::{Language, Node, Parser, Tree};

/// Deepest syntax tree the walkers accept
pub const MAX_NESTING: usize = 200;

/// Language of the content under inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLanguage {
    Python,
    Rust,
    TypeScript,
    Shell,
    #[default]
    Unknown,
}

impl SourceLanguage {
    /// Parse a language name as found in an action's `language` context key
    pub fn from_name(name: &str) -> SourceLanguage {
        match name.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => SourceLanguage::Python,
            "rust" | "rs" => SourceLanguage::Rust,
            "typescript" | "ts" | "javascript" | "js" => SourceLanguage::TypeScript,
            "shell" | "sh" | "bash" | "zsh" => SourceLanguage::Shell,
            _ => SourceLanguage::Unknown,
        }
    }

    /// Map a file path to a language by extension
    pub fn from_path(path: &str) -> SourceLanguage {
        let extension = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("py") | Some("pyi") => SourceLanguage::Python,
            Some("rs") => SourceLanguage::Rust,
            Some("ts") | Some("mts") | Some("js") | Some("mjs") | Some("cjs") => {
                SourceLanguage::TypeScript
            }
            Some("sh") | Some("bash") | Some("zsh") => SourceLanguage::Shell,
            _ => SourceLanguage::Unknown,
        }
    }

    /// Detect the language of an action.
    ///
    /// Order: `language` context key, extension of the first target file,
    /// shell command action type, then content heuristics for code actions.
    pub fn detect(action: &Action) -> SourceLanguage {
        if let Some(name) = action.context().str(context_keys::LANGUAGE) {
            let language = SourceLanguage::from_name(name);
            if language != SourceLanguage::Unknown {
                return language;
            }
        }
        if let Some(path) = action.context().strings(context_keys::TARGET_FILES).first() {
            let language = SourceLanguage::from_path(path);
            if language != SourceLanguage::Unknown {
                return language;
            }
        }
        match action.action_type() {
            ActionType::ShellCommand => SourceLanguage::Shell,
            ActionType::CodeGeneration | ActionType::FileEdit => {
                patterns::guess_language(action.content())
            }
            ActionType::FileDelete | ActionType::Custom(_) => SourceLanguage::Unknown,
        }
    }

    /// Whether this language is inspected through a syntax tree
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            SourceLanguage::Python | SourceLanguage::Rust | SourceLanguage::TypeScript
        )
    }
}

impl fmt::Display for SourceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceLanguage::Python => "python",
            SourceLanguage::Rust => "rust",
            SourceLanguage::TypeScript => "typescript",
            SourceLanguage::Shell => "shell",
            SourceLanguage::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Why a function body counts as a stub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubKind {
    /// `pass` only
    Pass,
    /// `...` only
    Ellipsis,
    /// Docstring and nothing else
    DocstringOnly,
    /// `{}` with parameters that are never used
    EmptyBody,
    /// `todo!()` / `unimplemented!()`
    TodoMacro,
    /// Raises a not-implemented error and nothing else
    NotImplemented,
    /// Returns a literal while ignoring every parameter
    ConstantReturn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionFact {
    pub name: String,
    pub public: bool,
    pub doc: Option<String>,
    pub params: Vec<String>,
    /// All parameters and the return type carry type annotations
    pub annotated: bool,
    pub stub: Option<StubKind>,
    /// Abstract, overload or protocol declaration; stubs are expected there
    pub abstract_like: bool,
    /// Body contains an error handler
    pub handles_errors: bool,
    pub deprecated: bool,
    pub line_count: usize,
    pub in_test_scope: bool,
}

impl FunctionFact {
    pub fn is_documented(&self) -> bool {
        self.doc.as_deref().map_or(false, |d| !d.trim().is_empty())
    }

    /// Dunder methods such as `__init__`
    pub fn is_dunder(&self) -> bool {
        self.name.len() > 4 && self.name.starts_with("__") && self.name.ends_with("__")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFact {
    /// Callee text with whitespace collapsed, e.g. `shutil.rmtree`
    pub callee: String,
    /// Raw argument text
    pub arguments: String,
    /// String literal arguments, unquoted
    pub string_args: Vec<String>,
    /// Sits under a confirmation conditional or after a guard clause
    pub guarded: bool,
    /// Sits inside a try body
    pub in_try: bool,
    pub in_test_scope: bool,
    pub enclosing_function: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopFact {
    /// Iterated expression, empty for condition loops
    pub iterable: String,
    /// An enclosing loop iterates the same expression
    pub nested_same_iterable: bool,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalKind {
    /// Module-level list/dict/set bound to a lowercase name
    MutableLiteral,
    /// Python `global` statement
    GlobalStatement,
    /// Rust `static mut`
    StaticMut,
    /// Static holding interior mutability (Mutex, RefCell, atomics)
    SyncStatic,
}

/// A structural observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum Pattern {
    Function(FunctionFact),
    TestFunction { name: String },
    ErrorHandler,
    SwallowedError,
    BareExcept,
    Raise {
        exception: String,
        message: Option<String>,
        /// The message is a string literal rather than a computed value
        literal: bool,
    },
    Call(CallFact),
    Loop(LoopFact),
    MutableGlobal { name: String, kind: GlobalKind },
    Comment { text: String },
    ModuleDoc,
    VersionMarker,
    DeprecationMarker,
    Unwrap { method: String, in_test_scope: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub pattern: Pattern,
    pub location: Location,
}

/// Everything the validators know about a piece of content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFacts {
    pub language: SourceLanguage,
    pub line_count: usize,
    pub findings: Vec<Finding>,
    /// Inclusive line ranges of test functions, classes and modules
    pub test_ranges: Vec<(usize, usize)>,
}

impl SourceFacts {
    /// Facts for content that is not inspected structurally
    pub fn text(source: &str, language: SourceLanguage) -> Self {
        let mut facts = Self {
            language,
            line_count: source.lines().count(),
            findings: Vec::new(),
            test_ranges: Vec::new(),
        };
        facts.add_text_markers(source);
        facts
    }

    pub fn functions(&self) -> impl Iterator<Item = (&FunctionFact, Location)> {
        self.findings.iter().filter_map(|f| match &f.pattern {
            Pattern::Function(function) => Some((function, f.location)),
            _ => None,
        })
    }

    pub fn calls(&self) -> impl Iterator<Item = (&CallFact, Location)> {
        self.findings.iter().filter_map(|f| match &f.pattern {
            Pattern::Call(call) => Some((call, f.location)),
            _ => None,
        })
    }

    pub fn loops(&self) -> impl Iterator<Item = (&LoopFact, Location)> {
        self.findings.iter().filter_map(|f| match &f.pattern {
            Pattern::Loop(fact) => Some((fact, f.location)),
            _ => None,
        })
    }

    /// Findings whose pattern satisfies a predicate
    pub fn matching<'a>(&'a self, predicate: impl Fn(&Pattern) -> bool + 'a) -> impl Iterator<Item = &'a Finding> {
        self.findings.iter().filter(move |f| predicate(&f.pattern))
    }

    pub fn has(&self, predicate: impl Fn(&Pattern) -> bool) -> bool {
        self.findings.iter().any(|f| predicate(&f.pattern))
    }

    pub fn function_named(&self, name: &str) -> Option<&FunctionFact> {
        self.functions().map(|(f, _)| f).find(|f| f.name == name)
    }

    pub fn has_tests(&self) -> bool {
        self.has(|p| matches!(p, Pattern::TestFunction { .. }))
    }

    pub fn in_test_scope(&self, line: usize) -> bool {
        self.test_ranges
            .iter()
            .any(|(start, end)| (*start..=*end).contains(&line))
    }

    fn push(&mut self, pattern: Pattern, location: Location) {
        self.findings.push(Finding { pattern, location });
    }

    /// Version and deprecation markers found in the raw text
    fn add_text_markers(&mut self, source: &str) {
        for (index, line) in source.lines().enumerate() {
            if patterns::VERSION_MARKER.is_match(line) {
                self.push(Pattern::VersionMarker, Location::line(index + 1));
            }
            if patterns::DEPRECATION_MARKER.is_match(line) {
                self.push(Pattern::DeprecationMarker, Location::line(index + 1));
            }
        }
    }

    fn finish(mut self, source: &str) -> Self {
        self.add_text_markers(source);
        self.findings.sort_by_key(|f| f.location);
        self.test_ranges.sort_unstable();
        self
    }
}

/// Analyze an action's content in its detected language
pub fn inspect(action: &Action) -> Result<SourceFacts, AnalysisError> {
    analyze(action.content(), SourceLanguage::detect(action))
}

/// Analyze source in a known language
pub fn analyze(source: &str, language: SourceLanguage) -> Result<SourceFacts, AnalysisError> {
    let facts = match language {
        SourceLanguage::Python => python::analyze(source)?,
        SourceLanguage::Rust => rust::analyze(source)?,
        SourceLanguage::TypeScript => typescript::analyze(source)?,
        SourceLanguage::Shell => shell::analyze(source),
        SourceLanguage::Unknown => return Ok(SourceFacts::text(source, language)),
    };
    Ok(facts.finish(source))
}

/// Parse with a fresh parser and reject trees containing error nodes
pub(crate) fn parse(language: Language, name: &str, source: &str) -> Result<Tree, AnalysisError> {
    let mut parser = Parser::new();
    parser
        .set_language(language)
        .map_err(|e| AnalysisError::ParserUnavailable {
            language: name.to_string(),
            reason: e.to_string(),
        })?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| AnalysisError::Unparseable {
            language: name.to_string(),
            reason: "parser produced no tree".to_string(),
        })?;

    let depth = nesting_depth(&tree);
    if depth > MAX_NESTING {
        return Err(AnalysisError::TooDeep {
            language: name.to_string(),
            limit: MAX_NESTING,
        });
    }

    if tree.root_node().has_error() {
        let reason = match first_error(&tree) {
            Some(node) => format!("syntax error near {}", location(node)),
            None => "syntax error".to_string(),
        };
        return Err(AnalysisError::Unparseable {
            language: name.to_string(),
            reason,
        });
    }
    Ok(tree)
}

/// Depth of the tree, counted up to one past [`MAX_NESTING`]
fn nesting_depth(tree: &Tree) -> usize {
    let mut cursor = tree.walk();
    let (mut depth, mut deepest) = (0, 0);
    loop {
        deepest = deepest.max(depth);
        if deepest > MAX_NESTING {
            return deepest;
        }
        if cursor.goto_first_child() {
            depth += 1;
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return deepest;
            }
            depth -= 1;
        }
    }
}

/// First error or missing node, following the erroneous branch down
fn first_error(tree: &Tree) -> Option<Node<'_>> {
    let mut cursor = tree.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            return Some(node);
        }
        if !cursor.goto_first_child() {
            return None;
        }
        while !cursor.node().has_error() {
            if !cursor.goto_next_sibling() {
                return None;
            }
        }
    }
}

pub(crate) fn location(node: Node<'_>) -> Location {
    let point = node.start_position();
    Location::new(point.row + 1, point.column + 1)
}

pub(crate) fn line_span(node: Node<'_>) -> (usize, usize) {
    (node.start_position().row + 1, node.end_position().row + 1)
}

pub(crate) fn text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

pub(crate) fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

/// Collapse runs of whitespace into single spaces
pub(crate) fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip quotes and string prefixes from a literal
pub(crate) fn unquote(literal: &str) -> String {
    let trimmed = literal.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let stripped = ["\"\"\"", "'''", "\"", "'", "`"]
        .iter()
        .find_map(|quote| {
            trimmed
                .strip_prefix(quote)
                .and_then(|rest| rest.strip_suffix(quote))
        })
        .unwrap_or(trimmed);
    stripped.to_string()
}

/// Walk state shared by the tree-sitter walkers
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope {
    pub in_test: bool,
    pub in_try: bool,
    pub guarded: bool,
    pub function: Option<String>,
    pub loop_iterables: Vec<String>,
    pub abstract_class: bool,
    pub depth: usize,
}

impl Scope {
    /// Scope of the true branch of a conditional on `condition`; the else
    /// branch keeps the enclosing scope
    pub fn under_condition(&self, condition: &str) -> Scope {
        let mut scope = self.clone();
        scope.guarded |= patterns::confirmation(condition) == patterns::Confirmation::Affirmed;
        scope
    }
}
