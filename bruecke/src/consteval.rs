//! Constant expression evaluation for array sizes, enumerator values,
//! bitfield widths, and `static const` declarations. Implements the C
//! operator set from `?:` down to unary, with C wrapping semantics on
//! 64-bit signed intermediates.

use crate::error::ParseError;
use crate::lexer::Tok;
use crate::parser::Parser;

/// Binding strength for binary operators; higher binds tighter. The
/// conditional operator sits below all of these.
fn binary_prec(tok: &Tok) -> Option<u8> {
    Some(match tok {
        Tok::OrOr => 1,
        Tok::AndAnd => 2,
        Tok::Pipe => 3,
        Tok::Caret => 4,
        Tok::Amp => 5,
        Tok::EqEq | Tok::Ne => 6,
        Tok::Lt | Tok::Le | Tok::Gt | Tok::Ge => 7,
        Tok::Shl | Tok::Shr => 8,
        Tok::Plus | Tok::Minus => 9,
        Tok::Star | Tok::Slash | Tok::Percent => 10,
        _ => return None,
    })
}

impl Parser<'_, '_> {
    /// Evaluates a constant expression, leaving the first token that is
    /// not part of it in the stream.
    pub(crate) fn const_expr(&mut self) -> Result<i64, ParseError> {
        self.ternary_expr()
    }

    fn ternary_expr(&mut self) -> Result<i64, ParseError> {
        let cond = self.binary_expr(1)?;
        match self.lex.next()? {
            Some(Tok::Question) => {
                let on_true = self.ternary_expr()?;
                self.expect(Tok::Colon, "expected : in conditional expression")?;
                let on_false = self.ternary_expr()?;
                Ok(if cond != 0 { on_true } else { on_false })
            }
            Some(_) => {
                self.lex.put_back();
                Ok(cond)
            }
            None => Ok(cond),
        }
    }

    fn binary_expr(&mut self, min_prec: u8) -> Result<i64, ParseError> {
        let mut lhs = self.unary_expr()?;

        while let Some(tok) = self.lex.next()? {
            let Some(prec) = binary_prec(&tok) else {
                self.lex.put_back();
                break;
            };
            if prec < min_prec {
                self.lex.put_back();
                break;
            }
            let rhs = self.binary_expr(prec + 1)?;
            lhs = self.apply_binary(&tok, lhs, rhs)?;
        }

        Ok(lhs)
    }

    fn apply_binary(&self, op: &Tok, lhs: i64, rhs: i64) -> Result<i64, ParseError> {
        Ok(match op {
            Tok::OrOr => (lhs != 0 || rhs != 0) as i64,
            Tok::AndAnd => (lhs != 0 && rhs != 0) as i64,
            Tok::Pipe => lhs | rhs,
            Tok::Caret => lhs ^ rhs,
            Tok::Amp => lhs & rhs,
            Tok::EqEq => (lhs == rhs) as i64,
            Tok::Ne => (lhs != rhs) as i64,
            Tok::Lt => (lhs < rhs) as i64,
            Tok::Le => (lhs <= rhs) as i64,
            Tok::Gt => (lhs > rhs) as i64,
            Tok::Ge => (lhs >= rhs) as i64,
            Tok::Shl => lhs.wrapping_shl(rhs as u32),
            Tok::Shr => lhs.wrapping_shr(rhs as u32),
            Tok::Plus => lhs.wrapping_add(rhs),
            Tok::Minus => lhs.wrapping_sub(rhs),
            Tok::Star => lhs.wrapping_mul(rhs),
            Tok::Slash | Tok::Percent if rhs == 0 => {
                return Err(self.err("divide by zero in constant expression"));
            }
            Tok::Slash => lhs.wrapping_div(rhs),
            Tok::Percent => lhs.wrapping_rem(rhs),
            _ => unreachable!("not a binary operator"),
        })
    }

    fn unary_expr(&mut self) -> Result<i64, ParseError> {
        match self.lex.require()? {
            Tok::Not => Ok((self.unary_expr()? == 0) as i64),
            Tok::Tilde => Ok(!self.unary_expr()?),
            Tok::Plus => self.unary_expr(),
            Tok::Minus => Ok(self.unary_expr()?.wrapping_neg()),
            Tok::Num(n) => Ok(n),
            Tok::OpenParen => {
                let value = self.ternary_expr()?;
                self.expect(Tok::CloseParen, "missing ) in constant expression")?;
                Ok(value)
            }
            Tok::Ident(word) if word == "sizeof" => {
                self.expect(Tok::OpenParen, "invalid sizeof")?;
                let ty = self.parse_type_spec()?;
                self.expect(Tok::CloseParen, "invalid sizeof")?;
                match ty.byte_size(&self.reg.arena) {
                    Some(size) => Ok(size as i64),
                    None => {
                        let name = ty.name(&self.reg.arena).to_string();
                        Err(self.err(format!("can't calculate the size of {name}")))
                    }
                }
            }
            Tok::Ident(name) => match self.reg.constant(&name) {
                Some(value) => Ok(value),
                None => Err(self.err(format!("use of undefined constant {name}"))),
            },
            _ => Err(self.err("unexpected token in constant expression")),
        }
    }
}
