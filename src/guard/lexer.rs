//! Token-level checks.
//!
//! These run on the SQLite token stream rather than raw text, so string
//! literals, quoted identifiers and comments can never trigger or hide a
//! keyword match.

use sqlparser::dialect::SQLiteDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

/// Keywords that never belong in a read-only query, wherever they appear.
///
/// `REPLACE` is deliberately absent: `replace()` is an ordinary string function.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "ATTACH", "DETACH", "PRAGMA", "VACUUM",
    "CREATE", "REINDEX", "TRUNCATE", "GRANT", "REVOKE",
];

/// Significant tokens of one candidate
pub(crate) struct TokenStream {
    tokens: Vec<Token>,
    has_comments: bool,
}

impl TokenStream {
    pub(crate) fn tokenize(sql: &str) -> Result<Self, String> {
        let dialect = SQLiteDialect {};
        let raw = Tokenizer::new(&dialect, sql)
            .tokenize()
            .map_err(|e| e.to_string())?;

        let mut has_comments = false;
        let tokens = raw
            .into_iter()
            .filter(|token| match token {
                Token::Whitespace(Whitespace::SingleLineComment { .. })
                | Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                    has_comments = true;
                    false
                }
                Token::Whitespace(_) | Token::EOF => false,
                _ => true,
            })
            .collect();

        Ok(TokenStream {
            tokens,
            has_comments,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::SemiColon))
    }

    pub(crate) fn has_comments(&self) -> bool {
        self.has_comments
    }

    /// True when anything but further terminators follows the first `;`
    pub(crate) fn has_trailing_statement(&self) -> bool {
        self.tokens
            .iter()
            .skip_while(|t| !matches!(t, Token::SemiColon))
            .any(|t| !matches!(t, Token::SemiColon))
    }

    /// Distinct forbidden keywords appearing as unquoted words, in order of appearance
    pub(crate) fn forbidden_keywords(&self) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        for token in &self.tokens {
            if let Token::Word(word) = token {
                if word.quote_style.is_some() {
                    continue;
                }
                let upper = word.value.to_ascii_uppercase();
                if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) && !found.contains(&upper) {
                    found.push(upper);
                }
            }
        }
        found
    }

    /// True when a second statement starts at depth zero without a `;`
    /// in between, e.g. `SELECT a FROM t SELECT b FROM u`
    pub(crate) fn has_adjacent_statement(&self) -> bool {
        let mut depth = 0usize;
        let mut selects = 0usize;
        let mut previous: Option<&Token> = None;

        for (idx, token) in self.tokens.iter().enumerate() {
            match token {
                Token::LParen => depth += 1,
                Token::RParen => depth = depth.saturating_sub(1),
                Token::SemiColon => break,
                Token::Word(word) if depth == 0 && word.quote_style.is_none() => {
                    if word.keyword == Keyword::WITH && idx > 0 {
                        return true;
                    }
                    if word.keyword == Keyword::SELECT && !previous.is_some_and(is_set_operator) {
                        selects += 1;
                    }
                }
                _ => {}
            }
            previous = Some(token);
        }
        selects > 1
    }
}

/// Tokens that legitimately join two SELECTs into one query
fn is_set_operator(token: &Token) -> bool {
    matches!(
        token,
        Token::Word(word) if matches!(
            word.keyword,
            Keyword::UNION | Keyword::INTERSECT | Keyword::EXCEPT | Keyword::ALL | Keyword::DISTINCT
        )
    )
}
