//! Tokenizer output.

use serde::Deserialize;

use crate::engine::Error;
use crate::engine::Result;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum TokenType {
    Identifier,
    NumericConstant,
    StringConstant,
    Operator,
    Keyword,
    Comment,
}

impl TryFrom<u8> for TokenType {
    type Error = String;

    fn try_from(raw: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::Identifier,
            1 => Self::NumericConstant,
            2 => Self::StringConstant,
            3 => Self::Operator,
            4 => Self::Keyword,
            5 => Self::Comment,
            other => return Err(format!("unknown token type {}", other)),
        })
    }
}

/// One token: byte offset of its start and its kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub offset: u32,
    pub kind: TokenType,
}

/// Tokens of a script as parallel offset/type columns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ScriptTokens {
    pub offsets: Vec<u32>,
    pub types: Vec<TokenType>,
}

impl ScriptTokens {
    /// Decodes the JSON emitted by the tokenizer.
    pub fn from_json(json: &str) -> Result<Self> {
        let tokens: Self = serde_json::from_str(json).map_err(|e| Error::Decode(e.to_string()))?;
        if tokens.offsets.len() != tokens.types.len() {
            return Err(Error::Decode(format!(
                "{} token offsets but {} token types",
                tokens.offsets.len(),
                tokens.types.len()
            )));
        }
        Ok(tokens)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Token> + '_ {
        self.offsets
            .iter()
            .zip(&self.types)
            .map(|(&offset, &kind)| Token { offset, kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_columns() {
        let tokens = ScriptTokens::from_json(r#"{"offsets":[0,7],"types":[4,1]}"#).unwrap();
        let all: Vec<_> = tokens.iter().collect();
        assert_eq!(
            all,
            vec![
                Token { offset: 0, kind: TokenType::Keyword },
                Token { offset: 7, kind: TokenType::NumericConstant },
            ]
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            ScriptTokens::from_json(r#"{"offsets":[0],"types":[]}"#),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            ScriptTokens::from_json(r#"{"offsets":[0],"types":[9]}"#),
            Err(Error::Decode(_))
        ));
    }
}
