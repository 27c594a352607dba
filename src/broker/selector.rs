use std::collections::HashMap;
use std::iter::Peekable;
use std::str::CharIndices;

use crate::utils::error::TransportError;

/// Property filter of the form `name = 'value' [AND name = 'value']*`.
///
/// Single quotes inside a value are written twice, as in SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSelector {
    source: String,
    clauses: Vec<(String, String)>,
}

impl MessageSelector {
    pub fn parse(selector: &str) -> Result<Self, TransportError> {
        let mut parser = Parser {
            source: selector,
            chars: selector.char_indices().peekable(),
        };
        let mut clauses = Vec::new();
        loop {
            parser.skip_whitespace();
            let name = parser.identifier()?;
            parser.skip_whitespace();
            parser.expect('=')?;
            parser.skip_whitespace();
            let value = parser.quoted()?;
            clauses.push((name, value));
            parser.skip_whitespace();
            if parser.at_end() {
                break;
            }
            parser.keyword("AND")?;
        }
        Ok(Self {
            source: selector.to_string(),
            clauses,
        })
    }

    /// Builds `name = 'value'`, quoting the value.
    pub fn equals(name: &str, value: &str) -> Result<Self, TransportError> {
        Self::parse(&format!("{name} = '{}'", value.replace('\'', "''")))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, properties: &HashMap<String, String>) -> bool {
        self.clauses
            .iter()
            .all(|(name, value)| properties.get(name) == Some(value))
    }
}

struct Parser<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> TransportError {
        TransportError::InvalidSelector {
            selector: self.source.to_string(),
            reason: reason.into(),
        }
    }

    fn at_end(&mut self) -> bool {
        self.chars.peek().is_none()
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn identifier(&mut self) -> Result<String, TransportError> {
        let mut name = String::new();
        match self.chars.next_if(|(_, c)| c.is_alphabetic() || *c == '_' || *c == '$') {
            Some((_, c)) => name.push(c),
            None => return Err(self.error("expected a property name")),
        }
        while let Some((_, c)) = self
            .chars
            .next_if(|(_, c)| c.is_alphanumeric() || matches!(*c, '_' | '$' | '.'))
        {
            name.push(c);
        }
        Ok(name)
    }

    fn expect(&mut self, expected: char) -> Result<(), TransportError> {
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            _ => Err(self.error(format!("expected '{expected}'"))),
        }
    }

    fn quoted(&mut self) -> Result<String, TransportError> {
        self.expect('\'')?;
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\'')) => {
                    if self.chars.next_if(|(_, c)| *c == '\'').is_some() {
                        value.push('\'');
                    } else {
                        return Ok(value);
                    }
                }
                Some((_, c)) => value.push(c),
                None => return Err(self.error("unterminated string literal")),
            }
        }
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), TransportError> {
        let word = self.identifier()?;
        if !word.eq_ignore_ascii_case(keyword) {
            return Err(self.error(format!("expected {keyword} but found {word}")));
        }
        match self.chars.peek() {
            Some((_, c)) if c.is_whitespace() => Ok(()),
            _ => Err(self.error(format!("expected whitespace after {keyword}"))),
        }
    }
}
