use std::mem;

use crate::errors::SyntaxError;
use crate::types::{OutputRedirect, Pipeline, Stage, Token};

/// Consumes a token sequence into a `Pipeline`.
///
/// A `Pipe` finalizes the active stage and opens the next one; words join
/// the active stage's argv; redirection tokens set its paths (a repeated
/// redirection in the same direction replaces the earlier one).
/// `Background` must be the final token before `End`.
pub fn parse(tokens: Vec<Token>) -> Result<Pipeline, SyntaxError> {
    let mut stages: Vec<Stage> = vec![];
    let mut stage = Stage::default();
    let mut background = false;

    for token in tokens {
        if background && token != Token::End {
            return Err(SyntaxError::BackgroundNotLast);
        }
        match token {
            Token::Word(word) => stage.argv.push(word),
            Token::RedirectIn(path) => stage.input = Some(path),
            Token::RedirectOut { path, append } => {
                stage.output = Some(OutputRedirect { path, append });
            }
            Token::Pipe | Token::End => {
                if stage.argv.is_empty() {
                    return Err(SyntaxError::MissingCommand);
                }
                stages.push(mem::take(&mut stage));
            }
            Token::Background => background = true,
        }
    }

    Ok(Pipeline { stages, background })
}
