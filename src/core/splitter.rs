//! Purpose: Split SQL documents into top-level statements and attribute a source range to each.
//! Exports: `Statement`, `split_statements`, `statement_at`, `uses_server_cursor`, `first_keyword`.
//! Role: Front of the execution pipeline; every batch starts from one `Statement`.
//! Invariants: Statements never split inside strings, quoted identifiers, dollar quotes, or comments.
//! Invariants: Procedural bodies of CREATE statements (BEGIN ... END) stay one statement;
//! nested IF/CASE/LOOP blocks are matched to their own `END`.
//! Invariants: Statements that are only comments, whitespace, or `;` are dropped.
//! Invariants: Unterminated quotes and comments are parse errors; nothing is split on failure.
use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::selection::{LineIndex, Selection, compute_selections};

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Statement {
    pub text: String,
    pub selection: Selection,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TokenKind {
    Whitespace,
    Comment,
    Quoted,
    Word,
    Open,
    Close,
    Semicolon,
    Other,
}

#[derive(Clone, Copy, Debug)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.rest().chars().nth(offset)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek(0)?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn next_token(&mut self) -> Result<Option<Token>, Error> {
        let start = self.pos;
        let Some(ch) = self.peek(0) else {
            return Ok(None);
        };

        let kind = if ch.is_whitespace() {
            while self.peek(0).is_some_and(char::is_whitespace) {
                self.bump();
            }
            TokenKind::Whitespace
        } else if self.rest().starts_with("--") {
            while let Some(ch) = self.bump() {
                if ch == '\n' {
                    break;
                }
            }
            TokenKind::Comment
        } else if self.rest().starts_with("/*") {
            self.block_comment(start)?;
            TokenKind::Comment
        } else if ch == '\'' {
            self.quoted('\'', false, start)?;
            TokenKind::Quoted
        } else if (ch == 'E' || ch == 'e') && self.peek(1) == Some('\'') {
            self.bump();
            self.quoted('\'', true, start)?;
            TokenKind::Quoted
        } else if ch == '"' || ch == '`' {
            self.quoted(ch, false, start)?;
            TokenKind::Quoted
        } else if ch == '$' && self.dollar_tag().is_some() {
            self.dollar_quoted(start)?;
            TokenKind::Quoted
        } else if is_word_start(ch) {
            while self.peek(0).is_some_and(is_word_char) {
                self.bump();
            }
            TokenKind::Word
        } else {
            self.bump();
            match ch {
                '(' => TokenKind::Open,
                ')' => TokenKind::Close,
                ';' => TokenKind::Semicolon,
                _ => TokenKind::Other,
            }
        };

        Ok(Some(Token {
            kind,
            start,
            end: self.pos,
        }))
    }

    fn block_comment(&mut self, start: usize) -> Result<(), Error> {
        self.pos += 2;
        let mut depth = 1;
        while depth > 0 {
            if self.rest().starts_with("/*") {
                depth += 1;
                self.pos += 2;
            } else if self.rest().starts_with("*/") {
                depth -= 1;
                self.pos += 2;
            } else if self.bump().is_none() {
                return Err(self.unterminated("block comment", start));
            }
        }
        Ok(())
    }

    /// Consumes a quoted run; a doubled quote char is an escaped quote.
    fn quoted(&mut self, quote: char, backslash_escapes: bool, start: usize) -> Result<(), Error> {
        self.bump();
        loop {
            match self.bump() {
                None => {
                    let what = if quote == '\'' {
                        "string literal"
                    } else {
                        "quoted identifier"
                    };
                    return Err(self.unterminated(what, start));
                }
                Some('\\') if backslash_escapes => {
                    self.bump();
                }
                Some(ch) if ch == quote => {
                    if self.peek(0) == Some(quote) {
                        self.bump();
                    } else {
                        return Ok(());
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// `$tag$` at the current position, tag empty or an identifier not starting with a digit.
    fn dollar_tag(&self) -> Option<&'a str> {
        let rest = self.rest();
        let body = &rest[1..];
        let close = body.find('$')?;
        let tag = &body[..close];
        let valid = match tag.chars().next() {
            None => true,
            Some(first) => is_word_start(first) && tag.chars().all(is_word_char),
        };
        valid.then(|| &rest[..close + 2])
    }

    fn dollar_quoted(&mut self, start: usize) -> Result<(), Error> {
        let Some(delimiter) = self.dollar_tag() else {
            return Ok(());
        };
        self.pos += delimiter.len();
        match self.rest().find(delimiter) {
            Some(found) => {
                self.pos += found + delimiter.len();
                Ok(())
            }
            None => Err(self.unterminated("dollar-quoted string", start)),
        }
    }

    fn unterminated(&self, what: &str, start: usize) -> Error {
        let at = LineIndex::new(self.input).selection(start, start);
        Error::new(ErrorKind::Parse)
            .with_message(format!(
                "unterminated {what} starting at line {}, column {}",
                at.start_line + 1,
                at.start_column + 1
            ))
            .with_offset(start as u64)
    }
}

fn is_word_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_'
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

fn tokenize(text: &str) -> Result<Vec<Token>, Error> {
    let mut lexer = Lexer::new(text);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

/// A construct opened inside a CREATE body and still waiting for its `END`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Block {
    Declare,
    Begin,
    If,
    Case,
    /// `FOR`/`WHILE` seen, `LOOP`/`DO` not yet.
    LoopHeader,
    Loop,
}

/// Nesting tracker deciding whether a `;` ends the current statement.
#[derive(Default)]
struct Depth {
    parens: i32,
    is_create: bool,
    open: Vec<Block>,
}

impl Depth {
    fn at_top_level(&self) -> bool {
        self.parens <= 0 && self.open.is_empty()
    }

    fn in_body(&self) -> bool {
        self.open.contains(&Block::Begin)
    }

    fn word(&mut self, word: &str, next_word: Option<&str>) -> WordEffect {
        let upper = word.to_ascii_uppercase();
        match upper.as_str() {
            "CREATE" => {
                self.is_create = true;
            }
            "DECLARE" if self.is_create && !self.in_body() => {
                if self.open.last() != Some(&Block::Declare) {
                    self.open.push(Block::Declare);
                }
            }
            "BEGIN" if self.is_create => {
                if self.open.last() == Some(&Block::Declare) {
                    self.open.pop();
                }
                self.open.push(Block::Begin);
            }
            "END" => {
                let closes = next_word.and_then(|next| {
                    match next.to_ascii_uppercase().as_str() {
                        "IF" => Some(Block::If),
                        "CASE" => Some(Block::Case),
                        "FOR" | "WHILE" | "LOOP" | "REPEAT" => Some(Block::Loop),
                        _ => None,
                    }
                });
                match closes {
                    Some(block) => {
                        self.close(block);
                        return WordEffect::SkipNextWord;
                    }
                    None => {
                        self.open.pop();
                    }
                }
            }
            "CASE" if self.is_create => self.open.push(Block::Case),
            "IF" if self.in_body() => self.open.push(Block::If),
            "FOR" | "WHILE" if self.in_body() => self.open.push(Block::LoopHeader),
            "LOOP" | "DO" if self.open.last() == Some(&Block::LoopHeader) => {
                self.open.pop();
                self.open.push(Block::Loop);
            }
            "LOOP" | "REPEAT" if self.in_body() => self.open.push(Block::Loop),
            _ => {}
        }
        WordEffect::None
    }

    /// Closes the innermost open `block` and anything left open inside it.
    fn close(&mut self, block: Block) {
        if let Some(at) = self.open.iter().rposition(|open| *open == block) {
            self.open.truncate(at);
        }
    }

    /// A `;` inside a body; a loop header that reaches one was not a loop (`FOR UPDATE`).
    fn statement_end(&mut self) {
        if self.open.last() == Some(&Block::LoopHeader) {
            self.open.pop();
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WordEffect {
    None,
    SkipNextWord,
}

/// Byte spans of raw statements, including ones that will be dropped.
fn statement_spans(text: &str, tokens: &[Token]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut depth = Depth::default();
    let mut start: Option<usize> = None;
    let mut skip_word = false;

    for (idx, token) in tokens.iter().enumerate() {
        if start.is_none() {
            if token.kind == TokenKind::Whitespace {
                continue;
            }
            start = Some(token.start);
        }
        match token.kind {
            TokenKind::Open => depth.parens += 1,
            TokenKind::Close => depth.parens -= 1,
            TokenKind::Word if skip_word => skip_word = false,
            TokenKind::Word => {
                let next = next_word(text, &tokens[idx + 1..]);
                let word = &text[token.start..token.end];
                skip_word = depth.word(word, next) == WordEffect::SkipNextWord;
            }
            TokenKind::Semicolon if depth.at_top_level() => {
                if let Some(begin) = start.take() {
                    spans.push((begin, token.end));
                }
                depth = Depth::default();
                skip_word = false;
            }
            TokenKind::Semicolon => depth.statement_end(),
            _ => {}
        }
    }
    if let Some(begin) = start {
        let end = begin + text[begin..].trim_end().len();
        spans.push((begin, end));
    }
    spans
}

fn next_word<'t>(text: &'t str, tokens: &[Token]) -> Option<&'t str> {
    tokens
        .iter()
        .find(|token| !matches!(token.kind, TokenKind::Whitespace | TokenKind::Comment))
        .filter(|token| token.kind == TokenKind::Word)
        .map(|token| &text[token.start..token.end])
}

fn is_blank_statement(tokens: &[Token], span: (usize, usize)) -> bool {
    tokens
        .iter()
        .filter(|token| token.start >= span.0 && token.end <= span.1)
        .all(|token| {
            matches!(
                token.kind,
                TokenKind::Whitespace | TokenKind::Comment | TokenKind::Semicolon
            )
        })
}

/// Splits `text` into executable statements, each paired with its source range.
pub fn split_statements(text: &str) -> Result<Vec<Statement>, Error> {
    let tokens = tokenize(text)?;
    let spans = statement_spans(text, &tokens);
    // Blank spans stay in the search so a later statement never matches inside a dropped comment.
    let texts: Vec<&str> = spans.iter().map(|&(start, end)| &text[start..end]).collect();
    let selections = compute_selections(&texts, text)?;
    Ok(spans
        .into_iter()
        .zip(texts)
        .zip(selections)
        .filter(|((span, _), _)| !is_blank_statement(&tokens, *span))
        .map(|((_, statement), selection)| Statement {
            text: statement.to_string(),
            selection,
        })
        .collect())
}

/// The statement whose range contains `(line, column)`, if any.
pub fn statement_at(text: &str, line: usize, column: usize) -> Result<Option<Statement>, Error> {
    Ok(split_statements(text)?
        .into_iter()
        .find(|statement| statement.selection.contains(line, column)))
}

/// First keyword of a statement, uppercased, skipping comments and leading parentheses.
pub fn first_keyword(sql: &str) -> Result<Option<String>, Error> {
    let tokens = tokenize(sql)?;
    Ok(tokens
        .iter()
        .find(|token| {
            !matches!(
                token.kind,
                TokenKind::Whitespace | TokenKind::Comment | TokenKind::Open
            )
        })
        .filter(|token| token.kind == TokenKind::Word)
        .map(|token| sql[token.start..token.end].to_ascii_uppercase()))
}

/// True for a row-returning SELECT that can stream through a named server cursor.
///
/// `SELECT ... INTO` materializes into a table, and CTEs cannot be declared as cursors,
/// so both run on a plain cursor.
pub fn uses_server_cursor(sql: &str) -> Result<bool, Error> {
    if first_keyword(sql)?.as_deref() != Some("SELECT") {
        return Ok(false);
    }
    let tokens = tokenize(sql)?;
    let mut level = 0i32;
    for token in &tokens {
        match token.kind {
            TokenKind::Open => level += 1,
            TokenKind::Close => level -= 1,
            TokenKind::Word if level <= 0 => {
                if sql[token.start..token.end].eq_ignore_ascii_case("INTO") {
                    return Ok(false);
                }
            }
            _ => {}
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::{first_keyword, split_statements, statement_at, uses_server_cursor};
    use crate::core::error::ErrorKind;
    use crate::core::selection::Selection;

    fn selections(text: &str) -> Vec<(usize, usize, usize, usize)> {
        split_statements(text)
            .expect("split")
            .into_iter()
            .map(|s| {
                let Selection {
                    start_line,
                    start_column,
                    end_line,
                    end_column,
                } = s.selection;
                (start_line, start_column, end_line, end_column)
            })
            .collect()
    }

    fn texts(text: &str) -> Vec<String> {
        split_statements(text)
            .expect("split")
            .into_iter()
            .map(|s| s.text)
            .collect()
    }

    #[test]
    fn two_simple_statements() {
        assert_eq!(
            selections("select 1;\nselect 2;"),
            vec![(0, 0, 0, 9), (1, 0, 1, 9)]
        );
    }

    #[test]
    fn empty_statements_are_dropped_without_shifting_ranges() {
        let text = "select * from\nt1;\nselect * from t2;;;\n;  ;\nselect version(); select * from\nt3 ;\nselect * from t2\n";
        assert_eq!(
            selections(text),
            vec![
                (0, 0, 1, 3),
                (2, 0, 2, 17),
                (4, 0, 4, 17),
                (4, 18, 5, 4),
                (6, 0, 6, 16),
            ]
        );
        assert_eq!(texts(text)[3], "select * from\nt3 ;");
        assert_eq!(texts(text)[4], "select * from t2");
    }

    #[test]
    fn dollar_quoted_block_is_one_statement() {
        let text = "DO $$\nBEGIN\nRAISE NOTICE 'Hello world 1';\nRAISE NOTICE 'Hello world 2';\nEND $$;\nselect * from t1;";
        assert_eq!(selections(text), vec![(0, 0, 4, 7), (5, 0, 5, 17)]);
    }

    #[test]
    fn comment_only_statements_are_dropped() {
        let text = "select * from t1;\n-- test\n-- test\n;select * from t1;\n-- test\n-- test;";
        assert_eq!(selections(text), vec![(0, 0, 0, 17), (3, 1, 3, 18)]);
    }

    #[test]
    fn hash_is_not_a_boundary() {
        assert_eq!(texts("select 42 # 24;"), vec!["select 42 # 24;"]);
    }

    #[test]
    fn quotes_and_comments_hide_semicolons() {
        let text = "select 'a;b', \"c;d\", E'it\\'s;' /* x; /* y; */ */ from t; select $tag$ ; $tag$;";
        assert_eq!(texts(text).len(), 2);
        assert_eq!(texts("select 'it''s; fine';"), vec!["select 'it''s; fine';"]);
    }

    #[test]
    fn create_bodies_stay_together() {
        let trigger = "CREATE TRIGGER t AFTER INSERT ON a BEGIN\n  INSERT INTO b VALUES (1);\n  UPDATE c SET n = n + 1;\nEND;\nselect 1;";
        let parts = texts(trigger);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with("END;"));

        let procedure = "CREATE PROCEDURE p() BEGIN\nIF x THEN SELECT 1; END IF;\nWHILE y DO SET y = 0; END WHILE;\nEND;\nselect 2;";
        assert_eq!(texts(procedure).len(), 2);

        let looped = "CREATE FUNCTION f() BEGIN\nLOOP SELECT 1; END LOOP;\nFOR r IN q LOOP SELECT 2; END LOOP;\nEND;\nselect 3;";
        assert_eq!(texts(looped).len(), 2);

        let case_then_if = "CREATE PROCEDURE p() BEGIN\nSELECT CASE WHEN 1 THEN 2 END;\nIF x THEN SELECT 1; END IF;\nSELECT 3;\nEND;\nselect 4;";
        let parts = texts(case_then_if);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with("SELECT 3;\nEND;"));
        assert_eq!(parts[1], "select 4;");

        let locking = "CREATE PROCEDURE q() BEGIN\nSELECT n FROM t FOR UPDATE;\nEND;\nselect 5;";
        assert_eq!(texts(locking).len(), 2);

        let declared = "CREATE FUNCTION g() RETURNS int DECLARE n int; BEGIN\nCASE n WHEN 1 THEN SELECT 1; END CASE;\nEND;\nselect 6;";
        assert_eq!(texts(declared).len(), 2);
    }

    #[test]
    fn transaction_begin_does_not_glue_statements() {
        assert_eq!(texts("BEGIN; insert into t values (1); COMMIT;").len(), 3);
        assert_eq!(
            texts("select case when 1 then 2 end; select 1;").len(),
            2
        );
    }

    #[test]
    fn statements_repeated_in_dropped_comments_keep_their_own_range() {
        let text = "select 1; -- select 2;\n;\nselect 2;";
        let statements = split_statements(text).expect("split");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].text, "select 2;");
        assert_eq!(statements[1].selection, Selection::new(2, 0, 2, 9));
    }

    #[test]
    fn parenthesized_semicolons_do_not_split() {
        assert_eq!(texts("select f(';', (1;2)); select 2;").len(), 2);
    }

    #[test]
    fn unterminated_constructs_are_parse_errors() {
        for text in ["select 'abc", "select \"abc", "select 1 /* open", "do $x$ begin"] {
            let err = split_statements(text).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Parse, "{text}");
        }
    }

    #[test]
    fn positional_parameters_are_not_dollar_quotes() {
        assert_eq!(texts("select $1, $2; select 2;").len(), 2);
    }

    #[test]
    fn resplitting_joined_statements_is_stable() {
        let text = "select 1; -- one\n/* two */ select 2;\n\nDO $$ BEGIN END $$;\nselect 'x;y'";
        let first = texts(text);
        let joined: String = first.concat();
        assert_eq!(texts(&joined), first);
    }

    #[test]
    fn statement_under_cursor() {
        let text = "select 1;\nselect 2;\nselect 3;";
        let found = statement_at(text, 1, 4).expect("split").expect("statement");
        assert_eq!(found.text, "select 2;");
        assert!(statement_at(text, 5, 0).expect("split").is_none());
    }

    #[test]
    fn server_cursor_eligibility() {
        assert!(uses_server_cursor("select * from t").expect("classify"));
        assert!(uses_server_cursor("/* c */ (select 1)").expect("classify"));
        assert!(uses_server_cursor("select x from (select 1 into y) s").expect("classify"));
        assert!(!uses_server_cursor("select * into t2 from t").expect("classify"));
        assert!(!uses_server_cursor("with q as (select 1) select * from q").expect("classify"));
        assert!(!uses_server_cursor("EXPLAIN select 1").expect("classify"));
        assert!(!uses_server_cursor("insert into t select 1").expect("classify"));
        assert_eq!(
            first_keyword("-- c\n  update t set a = 1").expect("keyword"),
            Some("UPDATE".to_string())
        );
        assert_eq!(first_keyword("  ;").expect("keyword"), None);
    }
}
