// Snippet wrapping
//
// Turns one unit of user source into the class the remote agent loads and
// runs, keeps the registry of everything defined so far, and answers
// offset-translation and dependency queries for the console.

use serde::Serialize;

pub type SnippetId = u32;

/// Method every generated wrapper exposes; the bridge invokes it.
pub const ENTRY_METHOD: &str = "doIt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SnippetKind {
    Expression,
    Statement,
    Declaration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SnippetStatus {
    /// Registered but not yet run.
    Pending,
    Valid,
    /// Replaced by a later definition of the same name, or dropped.
    Overwritten,
    Rejected,
    /// Sentinel for string-only wraps with no registered snippet behind
    /// them.
    Nonexistent,
}

#[derive(Debug, Clone)]
pub struct Snippet {
    pub id: SnippetId,
    pub kind: SnippetKind,
    pub status: SnippetStatus,
    pub source: String,
    pub class_name: String,
    /// Name introduced by a declaration; what dependents refer to.
    pub declared_name: Option<String>,
    /// Identifiers the source mentions, for redefinition warnings.
    pub references: Vec<String>,
}

/// The compiled/translated form of one snippet (or of raw text).
#[derive(Debug, Clone)]
pub struct Wrapper {
    pub kind: SnippetKind,
    pub status: SnippetStatus,
    pub source: String,
    pub wrapped: String,
    pub class_name: String,
    prologue_len: usize,
}

impl Wrapper {
    /// Map an offset in the original source to the corresponding offset in
    /// the wrapped text. `None` outside the source.
    pub fn translate_position(&self, original: usize) -> Option<usize> {
        (original <= self.source.len()).then_some(self.prologue_len + original)
    }
}

/// Wrap raw text in isolation. Empty input is normalized by appending a
/// statement terminator; input that does not resolve to exactly one unit
/// yields `None`. The result carries the `Nonexistent` status sentinel
/// until a registry entry backs it.
pub fn wrap_input(text: &str, class_name: &str) -> Option<Wrapper> {
    let normalized = if text.trim().is_empty() {
        ";".to_string()
    } else {
        text.to_string()
    };

    let mut units = split_units(&normalized);
    if units.len() != 1 {
        return None;
    }
    let source = units.remove(0);
    let kind = classify(&source);
    let (wrapped, prologue_len) = generate(kind, &source, class_name);

    Some(Wrapper {
        kind,
        status: SnippetStatus::Nonexistent,
        source,
        wrapped,
        class_name: class_name.to_string(),
        prologue_len,
    })
}

fn generate(kind: SnippetKind, source: &str, class_name: &str) -> (String, usize) {
    match kind {
        SnippetKind::Expression => {
            let prologue = format!(
                "public class {class_name} {{\n    public static Object {ENTRY_METHOD}() throws Throwable {{\n        return "
            );
            let wrapped = format!("{prologue}{source};\n    }}\n}}\n");
            let prologue_len = prologue.len();
            (wrapped, prologue_len)
        }
        SnippetKind::Statement => {
            let prologue = format!(
                "public class {class_name} {{\n    public static Object {ENTRY_METHOD}() throws Throwable {{\n        "
            );
            let wrapped = format!("{prologue}{source}\n        return null;\n    }}\n}}\n");
            let prologue_len = prologue.len();
            (wrapped, prologue_len)
        }
        SnippetKind::Declaration => {
            let prologue = format!("public class {class_name} {{\n    ");
            let wrapped = format!(
                "{prologue}{source}\n\n    public static Object {ENTRY_METHOD}() throws Throwable {{\n        return null;\n    }}\n}}\n"
            );
            let prologue_len = prologue.len();
            (wrapped, prologue_len)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    LineComment,
    BlockComment,
    Str,
    TextBlock,
    Chr,
}

/// Lexical state machine over the delimiters that matter for unit
/// splitting; content bytes above ASCII never collide with them.
struct Scanner {
    mode: Mode,
    brace: i32,
    group: i32, // parens and brackets
}

impl Scanner {
    fn new() -> Self {
        Self {
            mode: Mode::Code,
            brace: 0,
            group: 0,
        }
    }

    /// Consume the token starting at `i`; returns the index after it.
    fn step(&mut self, bytes: &[u8], i: usize) -> usize {
        let b = bytes[i];
        match self.mode {
            Mode::LineComment => {
                if b == b'\n' {
                    self.mode = Mode::Code;
                }
                i + 1
            }
            Mode::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    self.mode = Mode::Code;
                    i + 2
                } else {
                    i + 1
                }
            }
            Mode::Str => match b {
                b'\\' => i + 2,
                b'"' => {
                    self.mode = Mode::Code;
                    i + 1
                }
                _ => i + 1,
            },
            Mode::TextBlock => match b {
                b'\\' => i + 2,
                b'"' if bytes.get(i + 1) == Some(&b'"') && bytes.get(i + 2) == Some(&b'"') => {
                    self.mode = Mode::Code;
                    i + 3
                }
                _ => i + 1,
            },
            Mode::Chr => match b {
                b'\\' => i + 2,
                b'\'' => {
                    self.mode = Mode::Code;
                    i + 1
                }
                _ => i + 1,
            },
            Mode::Code => match b {
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    self.mode = Mode::LineComment;
                    i + 2
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    self.mode = Mode::BlockComment;
                    i + 2
                }
                b'"' if bytes.get(i + 1) == Some(&b'"') && bytes.get(i + 2) == Some(&b'"') => {
                    self.mode = Mode::TextBlock;
                    i + 3
                }
                b'"' => {
                    self.mode = Mode::Str;
                    i + 1
                }
                b'\'' => {
                    self.mode = Mode::Chr;
                    i + 1
                }
                b'(' | b'[' => {
                    self.group += 1;
                    i + 1
                }
                b')' | b']' => {
                    self.group -= 1;
                    i + 1
                }
                b'{' => {
                    self.brace += 1;
                    i + 1
                }
                b'}' => {
                    self.brace -= 1;
                    i + 1
                }
                _ => i + 1,
            },
        }
    }
}

/// Split source text into top-level units: statements end at `;`, brace
/// bodies end at their closing `}` unless the next token chains onto the
/// same construct (else/catch/finally/while, or trailing punctuation such
/// as `;` after an array initializer).
pub fn split_units(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut scanner = Scanner::new();
    let mut units = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let in_code = scanner.mode == Mode::Code;
        let b = bytes[i];
        let at_top = scanner.brace == 0 && scanner.group == 0;
        let next = scanner.step(bytes, i);

        if in_code {
            if b == b';' && at_top {
                push_unit(text, &mut units, start, next);
                start = next;
            } else if b == b'}' && scanner.brace == 0 && scanner.group == 0 && closes_unit(bytes, next)
            {
                push_unit(text, &mut units, start, next);
                start = next;
            }
        }
        i = next;
    }

    push_unit(text, &mut units, start, bytes.len());
    units
}

/// Whether input forms a lexically closed region: no open brace/group,
/// string, or comment. The console uses this to decide between evaluating
/// and asking for another line.
pub fn is_complete(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut scanner = Scanner::new();
    let mut i = 0usize;
    while i < bytes.len() {
        i = scanner.step(bytes, i);
    }
    scanner.mode == Mode::Code && scanner.brace <= 0 && scanner.group <= 0
}

fn push_unit(text: &str, units: &mut Vec<String>, start: usize, end: usize) {
    let unit = text[start..end].trim();
    if !unit.is_empty() && !is_commentary(unit) {
        units.push(unit.to_string());
    }
}

/// Whole-unit check for text that is only comments and whitespace; such
/// residue (e.g. a trailing line comment) is not a unit.
fn is_commentary(unit: &str) -> bool {
    let bytes = unit.as_bytes();
    let mut scanner = Scanner::new();
    let mut i = 0usize;
    while i < bytes.len() {
        if scanner.mode == Mode::Code {
            let b = bytes[i];
            let comment_ahead =
                b == b'/' && matches!(bytes.get(i + 1), Some(b'/') | Some(b'*'));
            if !b.is_ascii_whitespace() && !comment_ahead {
                return false;
            }
        }
        i = scanner.step(bytes, i);
    }
    true
}

fn closes_unit(bytes: &[u8], from: usize) -> bool {
    let mut i = from;
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'/' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            continue;
        }
        break;
    }
    if i >= bytes.len() {
        return true;
    }
    let b = bytes[i];
    if b == b'@' {
        return true;
    }
    if b.is_ascii_alphabetic() || b == b'_' || b == b'$' {
        let mut j = i;
        while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_' || bytes[j] == b'$')
        {
            j += 1;
        }
        !matches!(&bytes[i..j], b"else" | b"catch" | b"finally" | b"while")
    } else {
        // Trailing punctuation (';' after an initializer, '.', an
        // operator): the construct continues.
        false
    }
}

const DECL_STARTERS: &[&str] = &[
    "class",
    "interface",
    "enum",
    "record",
    "import",
    "public",
    "protected",
    "private",
    "static",
    "final",
    "abstract",
    "strictfp",
    "sealed",
    "void",
    "var",
];

const STMT_STARTERS: &[&str] = &[
    "if",
    "while",
    "for",
    "do",
    "try",
    "switch",
    "return",
    "throw",
    "break",
    "continue",
    "assert",
    "synchronized",
    "yield",
];

const PRIMITIVES: &[&str] = &[
    "int", "long", "short", "byte", "char", "boolean", "float", "double",
];

const JAVA_KEYWORDS: &[&str] = &[
    "abstract",
    "assert",
    "boolean",
    "break",
    "byte",
    "case",
    "catch",
    "char",
    "class",
    "const",
    "continue",
    "default",
    "do",
    "double",
    "else",
    "enum",
    "extends",
    "final",
    "finally",
    "float",
    "for",
    "goto",
    "if",
    "implements",
    "import",
    "instanceof",
    "int",
    "interface",
    "long",
    "native",
    "new",
    "package",
    "private",
    "protected",
    "public",
    "record",
    "return",
    "short",
    "static",
    "strictfp",
    "super",
    "switch",
    "synchronized",
    "this",
    "throw",
    "throws",
    "transient",
    "try",
    "var",
    "void",
    "volatile",
    "while",
    "yield",
];

pub fn classify(unit: &str) -> SnippetKind {
    let trimmed = unit.trim();
    if trimmed == ";" || trimmed.starts_with('{') {
        return SnippetKind::Statement;
    }
    if trimmed.starts_with('@') {
        return SnippetKind::Declaration;
    }

    let first = leading_word(trimmed);
    if DECL_STARTERS.contains(&first) || PRIMITIVES.contains(&first) {
        // A primitive can also start an expression like `int.class`; the
        // member shape check below disambiguates.
        if PRIMITIVES.contains(&first) && !looks_like_member(trimmed) {
            return if trimmed.ends_with(';') {
                SnippetKind::Statement
            } else {
                SnippetKind::Expression
            };
        }
        return SnippetKind::Declaration;
    }
    if STMT_STARTERS.contains(&first) {
        return SnippetKind::Statement;
    }
    if looks_like_member(trimmed) {
        return SnippetKind::Declaration;
    }
    if trimmed.ends_with(';') {
        SnippetKind::Statement
    } else {
        SnippetKind::Expression
    }
}

fn leading_word(s: &str) -> &str {
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
        .unwrap_or(s.len());
    &s[..end]
}

/// "Type name ..." shape: a type token (possibly dotted, generic, or an
/// array) followed by an identifier that is not a keyword.
fn looks_like_member(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0usize;

    let first = leading_word(s);
    if first.is_empty() {
        return false;
    }
    if JAVA_KEYWORDS.contains(&first) && !PRIMITIVES.contains(&first) && first != "var" {
        return false;
    }

    while i < bytes.len()
        && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'$' | b'.'))
    {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'<' {
        let mut depth = 0i32;
        while i < bytes.len() {
            match bytes[i] {
                b'<' => depth += 1,
                b'>' => {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }
    loop {
        let mut j = i;
        while j < bytes.len() && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        if j + 1 < bytes.len() && bytes[j] == b'[' && bytes[j + 1] == b']' {
            i = j + 2;
        } else {
            break;
        }
    }

    let mut j = i;
    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
        j += 1;
    }
    if j == i || j >= bytes.len() {
        return false;
    }
    let b = bytes[j];
    if !(b.is_ascii_alphabetic() || b == b'_' || b == b'$') {
        return false;
    }
    let second = leading_word(&s[j..]);
    !JAVA_KEYWORDS.contains(&second)
}

/// Name a declaration introduces, if the shape reveals one.
pub fn declared_name(unit: &str) -> Option<String> {
    let tokens = header_tokens(unit);

    if let Some(pos) = tokens.iter().position(|t| {
        matches!(
            t.as_str(),
            "class" | "interface" | "enum" | "record"
        )
    }) {
        return tokens
            .get(pos + 1)
            .filter(|t| is_identifier(t))
            .cloned();
    }

    if tokens.first().map(String::as_str) == Some("import") {
        if tokens.iter().any(|t| t == "*") {
            return None;
        }
        let last = tokens.iter().rev().find(|t| is_identifier(t))?;
        return Some(last.clone());
    }

    // Method: identifier before the first '('. Variable: identifier
    // before '=' or the closing ';'.
    for (i, token) in tokens.iter().enumerate() {
        if token == "(" {
            return tokens
                .get(i.checked_sub(1)?)
                .filter(|t| is_identifier(t) && !JAVA_KEYWORDS.contains(&t.as_str()))
                .cloned();
        }
        if token == "=" || token == ";" {
            return tokens
                .get(i.checked_sub(1)?)
                .filter(|t| is_identifier(t) && !JAVA_KEYWORDS.contains(&t.as_str()))
                .cloned();
        }
    }
    tokens
        .last()
        .filter(|t| is_identifier(t) && !JAVA_KEYWORDS.contains(&t.as_str()))
        .cloned()
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Idents and single-char symbols up to the first body brace.
fn header_tokens(unit: &str) -> Vec<String> {
    let bytes = unit.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'{' {
            break;
        }
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'$' {
            let mut j = i;
            while j < bytes.len()
                && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_' || bytes[j] == b'$')
            {
                j += 1;
            }
            tokens.push(unit[i..j].to_string());
            i = j;
        } else {
            tokens.push((b as char).to_string());
            i += 1;
        }
    }
    tokens
}

/// Identifiers the source mentions outside strings and comments, in first
/// appearance order, keywords and literals excluded.
pub fn scan_identifiers(src: &str) -> Vec<String> {
    let bytes = src.as_bytes();
    let mut scanner = Scanner::new();
    let mut seen = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        if scanner.mode == Mode::Code && (b.is_ascii_alphabetic() || b == b'_' || b == b'$') {
            let mut j = i;
            while j < bytes.len()
                && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_' || bytes[j] == b'$')
            {
                j += 1;
            }
            let word = &src[i..j];
            if !JAVA_KEYWORDS.contains(&word)
                && !matches!(word, "true" | "false" | "null")
                && !seen.iter().any(|s| s == word)
            {
                seen.push(word.to_string());
            }
            i = j;
        } else {
            i = scanner.step(bytes, i);
        }
    }
    seen
}

/// Everything defined in this session, in definition order.
#[derive(Debug, Default)]
pub struct SnippetRegistry {
    snippets: Vec<Snippet>,
    next_id: SnippetId,
}

impl SnippetRegistry {
    pub fn new() -> Self {
        Self {
            snippets: Vec::new(),
            next_id: 1,
        }
    }

    /// Class name the next registered snippet will compile under.
    pub fn next_class_name(&self) -> String {
        format!("$Unit{}", self.next_id)
    }

    /// Back a wrapper with a registry entry; the snippet starts `Pending`.
    pub fn register(&mut self, wrapper: &Wrapper) -> SnippetId {
        let id = self.next_id;
        self.next_id += 1;

        let declared = if wrapper.kind == SnippetKind::Declaration {
            declared_name(&wrapper.source)
        } else {
            None
        };
        let mut references = scan_identifiers(&wrapper.source);
        if let Some(name) = &declared {
            references.retain(|r| r != name);
        }

        self.snippets.push(Snippet {
            id,
            kind: wrapper.kind,
            status: SnippetStatus::Pending,
            source: wrapper.source.clone(),
            class_name: wrapper.class_name.clone(),
            declared_name: declared,
            references,
        });
        id
    }

    pub fn get(&self, id: SnippetId) -> Option<&Snippet> {
        self.snippets.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snippet> {
        self.snippets.iter()
    }

    pub fn set_status(&mut self, id: SnippetId, status: SnippetStatus) {
        if let Some(snippet) = self.snippets.iter_mut().find(|s| s.id == id) {
            snippet.status = status;
        }
    }

    /// Promote a snippet to `Valid`; earlier valid declarations of the
    /// same name become `Overwritten`. Returns the replaced ids.
    pub fn mark_valid(&mut self, id: SnippetId) -> Vec<SnippetId> {
        let declared = match self.get(id) {
            Some(snippet) => snippet.declared_name.clone(),
            None => return Vec::new(),
        };

        let mut replaced = Vec::new();
        if let Some(name) = declared {
            for snippet in &mut self.snippets {
                if snippet.id != id
                    && snippet.status == SnippetStatus::Valid
                    && snippet.declared_name.as_deref() == Some(name.as_str())
                {
                    snippet.status = SnippetStatus::Overwritten;
                    replaced.push(snippet.id);
                }
            }
        }
        self.set_status(id, SnippetStatus::Valid);
        replaced
    }

    /// Wrapping for a registered snippet, status derived from its live
    /// state.
    pub fn wrap(&self, id: SnippetId) -> Option<Wrapper> {
        let snippet = self.get(id)?;
        let (wrapped, prologue_len) = generate(snippet.kind, &snippet.source, &snippet.class_name);
        Some(Wrapper {
            kind: snippet.kind,
            status: snippet.status,
            source: snippet.source.clone(),
            wrapped,
            class_name: snippet.class_name.clone(),
            prologue_len,
        })
    }

    /// Persistent snippets that reference the given declaration.
    pub fn dependents(&self, id: SnippetId) -> Vec<SnippetId> {
        let Some(name) = self.get(id).and_then(|s| s.declared_name.clone()) else {
            return Vec::new();
        };
        self.snippets
            .iter()
            .filter(|s| {
                s.id != id
                    && s.kind == SnippetKind::Declaration
                    && s.status == SnippetStatus::Valid
                    && s.references.iter().any(|r| r == &name)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Retire a snippet; returns the dependents that referenced it, or
    /// `None` for an unknown id.
    pub fn drop_snippet(&mut self, id: SnippetId) -> Option<Vec<SnippetId>> {
        self.get(id)?;
        let dependents = self.dependents(id);
        self.set_status(id, SnippetStatus::Overwritten);
        Some(dependents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_wraps_as_one_statement() {
        let wrapper = wrap_input("", "$Unit1").unwrap();
        assert_eq!(wrapper.kind, SnippetKind::Statement);
        assert_eq!(wrapper.source, ";");
        assert_eq!(wrapper.status, SnippetStatus::Nonexistent);
    }

    #[test]
    fn two_statements_do_not_wrap() {
        assert!(wrap_input("int x = 5; int y = 6;", "$Unit1").is_none());
    }

    #[test]
    fn expression_wraps_with_return() {
        let wrapper = wrap_input("1 + 1", "$Unit3").unwrap();
        assert_eq!(wrapper.kind, SnippetKind::Expression);
        assert!(wrapper.wrapped.contains("return 1 + 1;"));
        assert!(wrapper.wrapped.starts_with("public class $Unit3"));
    }

    #[test]
    fn translate_position_lands_inside_the_wrapper() {
        let wrapper = wrap_input("x * 2", "$Unit1").unwrap();
        let at_start = wrapper.translate_position(0).unwrap();
        assert_eq!(&wrapper.wrapped[at_start..at_start + 5], "x * 2");
        let at_end = wrapper.translate_position(wrapper.source.len()).unwrap();
        assert_eq!(at_end, at_start + wrapper.source.len());
        assert_eq!(wrapper.translate_position(wrapper.source.len() + 1), None);
    }

    #[test]
    fn split_keeps_if_else_together() {
        let units = split_units("if (x > 0) { a(); } else { b(); }");
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn split_separates_two_method_declarations() {
        let units = split_units("void f() {}\nvoid g() {}");
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], "void f() {}");
        assert_eq!(units[1], "void g() {}");
    }

    #[test]
    fn delimiters_inside_strings_and_comments_are_inert() {
        let units = split_units("String s = \"a;b\"; // trailing; comment");
        assert_eq!(units.len(), 1);
        let units = split_units("int x = 1; /* not; a; split */ int y = 2;");
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn comment_only_residue_is_not_a_unit() {
        let units = split_units("int x = 1; // done");
        assert_eq!(units.len(), 1);
        assert!(split_units("/* nothing here */").is_empty());
    }

    #[test]
    fn array_initializer_stays_one_unit() {
        let units = split_units("int[] a = {1, 2, 3};");
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn do_while_stays_one_unit() {
        let units = split_units("do { tick(); } while (running);");
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn classification_covers_the_three_kinds() {
        assert_eq!(classify("1 + 1"), SnippetKind::Expression);
        assert_eq!(classify("System.out.println(42)"), SnippetKind::Expression);
        assert_eq!(classify("x = 5;"), SnippetKind::Statement);
        assert_eq!(classify("if (x) { y(); }"), SnippetKind::Statement);
        assert_eq!(classify("int x = 5;"), SnippetKind::Declaration);
        assert_eq!(classify("void f() {}"), SnippetKind::Declaration);
        assert_eq!(classify("class Point {}"), SnippetKind::Declaration);
        assert_eq!(classify("List<String> names;"), SnippetKind::Declaration);
        assert_eq!(classify("new StringBuilder()"), SnippetKind::Expression);
    }

    #[test]
    fn declared_names_are_extracted() {
        assert_eq!(declared_name("class Point { int x; }").as_deref(), Some("Point"));
        assert_eq!(declared_name("int count = 0;").as_deref(), Some("count"));
        assert_eq!(declared_name("String greet(String who) { return who; }").as_deref(), Some("greet"));
        assert_eq!(declared_name("List<String> names;").as_deref(), Some("names"));
        assert_eq!(declared_name("import java.util.List;").as_deref(), Some("List"));
        assert_eq!(declared_name("import java.util.*;"), None);
    }

    #[test]
    fn identifier_scan_skips_strings_and_keywords() {
        let ids = scan_identifiers("int total = base + other; // plus; fudge\nString s = \"ghost\";");
        assert!(ids.contains(&"total".to_string()));
        assert!(ids.contains(&"base".to_string()));
        assert!(ids.contains(&"other".to_string()));
        assert!(!ids.contains(&"ghost".to_string()));
        assert!(!ids.contains(&"fudge".to_string()));
        assert!(!ids.contains(&"int".to_string()));
    }

    #[test]
    fn incomplete_input_is_detected() {
        assert!(!is_complete("void f() {"));
        assert!(!is_complete("String s = \"unterminated"));
        assert!(!is_complete("f(1,"));
        assert!(is_complete("void f() {}"));
        assert!(is_complete("1 + 1"));
    }

    #[test]
    fn registry_tracks_redefinition() {
        let mut registry = SnippetRegistry::new();

        let first = wrap_input("int x = 5;", &registry.next_class_name()).unwrap();
        let first_id = registry.register(&first);
        assert_eq!(registry.mark_valid(first_id), Vec::<SnippetId>::new());

        let second = wrap_input("int x = 7;", &registry.next_class_name()).unwrap();
        let second_id = registry.register(&second);
        let replaced = registry.mark_valid(second_id);

        assert_eq!(replaced, vec![first_id]);
        assert_eq!(registry.get(first_id).unwrap().status, SnippetStatus::Overwritten);
        assert_eq!(registry.get(second_id).unwrap().status, SnippetStatus::Valid);
    }

    #[test]
    fn dependents_follow_declared_names() {
        let mut registry = SnippetRegistry::new();

        let base = wrap_input("int base = 2;", &registry.next_class_name()).unwrap();
        let base_id = registry.register(&base);
        registry.mark_valid(base_id);

        let derived = wrap_input("int doubled = base * 2;", &registry.next_class_name()).unwrap();
        let derived_id = registry.register(&derived);
        registry.mark_valid(derived_id);

        assert_eq!(registry.dependents(base_id), vec![derived_id]);
        assert_eq!(registry.dependents(derived_id), Vec::<SnippetId>::new());
    }

    #[test]
    fn wrap_reflects_live_status() {
        let mut registry = SnippetRegistry::new();
        let wrapper = wrap_input("int x = 1;", &registry.next_class_name()).unwrap();
        let id = registry.register(&wrapper);

        assert_eq!(registry.wrap(id).unwrap().status, SnippetStatus::Pending);
        registry.mark_valid(id);
        assert_eq!(registry.wrap(id).unwrap().status, SnippetStatus::Valid);
        assert!(registry.wrap(999).is_none());
    }

    #[test]
    fn dropping_reports_dependents() {
        let mut registry = SnippetRegistry::new();
        let base = wrap_input("int base = 2;", &registry.next_class_name()).unwrap();
        let base_id = registry.register(&base);
        registry.mark_valid(base_id);

        let user = wrap_input("int twice = base + base;", &registry.next_class_name()).unwrap();
        let user_id = registry.register(&user);
        registry.mark_valid(user_id);

        let dependents = registry.drop_snippet(base_id).unwrap();
        assert_eq!(dependents, vec![user_id]);
        assert_eq!(registry.get(base_id).unwrap().status, SnippetStatus::Overwritten);
        assert_eq!(registry.drop_snippet(999), None);
    }
}
