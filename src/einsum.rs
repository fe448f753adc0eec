//! Contraction expressions and their reversal
//!
//! A contraction expression `a_1,...,a_k->out` names every axis of every
//! operand with a single-letter label. Labels that appear in several operands
//! are multiplied together, labels missing from `out` are summed over.
//!
//! The gradient of such a contraction with respect to operand `j` is again a
//! contraction: the output gradient contracted with every other operand,
//! producing the labels of operand `j`:
//!
//! ```text
//! forward:  ij,jk->ik
//! wrt 0:    ik,jk->ij
//! wrt 1:    ik,ij->jk
//! ```

use std::fmt;

use crate::error::{BackwardError, Result};

/// A parsed contraction expression in explicit (`->`) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EinsumExpr {
    pub inputs: Vec<Vec<char>>,
    pub output: Vec<char>,
}

impl EinsumExpr {
    /// Parses `in_1,in_2,...->out`. Whitespace is ignored.
    pub fn parse(equation: &str) -> Result<Self> {
        let compact: String = equation.chars().filter(|c| !c.is_whitespace()).collect();
        let (lhs, rhs) = compact.split_once("->").ok_or_else(|| {
            BackwardError::InvalidExpression(format!("'{equation}' has no '->' (implicit output is not supported)"))
        })?;
        if rhs.contains("->") {
            return Err(BackwardError::InvalidExpression(format!(
                "'{equation}' has more than one '->'"
            )));
        }

        let parse_term = |term: &str| -> Result<Vec<char>> {
            term.chars()
                .map(|c| {
                    if c.is_ascii_alphabetic() {
                        Ok(c)
                    } else {
                        Err(BackwardError::InvalidExpression(format!(
                            "'{equation}' contains unsupported label '{c}'"
                        )))
                    }
                })
                .collect()
        };

        let inputs = lhs.split(',').map(parse_term).collect::<Result<Vec<_>>>()?;
        let output = parse_term(rhs)?;
        Ok(Self { inputs, output })
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Checks that the expression is computable as a forward contraction:
    /// output labels are unique and each appears in some input.
    pub fn validate(&self) -> Result<()> {
        if let Some(label) = first_repeated(&self.output) {
            return Err(BackwardError::InvalidExpression(format!(
                "'{self}' repeats label '{label}' in its output"
            )));
        }
        for label in &self.output {
            if !self.inputs.iter().any(|term| term.contains(label)) {
                return Err(BackwardError::InvalidExpression(format!(
                    "output label '{label}' of '{self}' appears in no input"
                )));
            }
        }
        Ok(())
    }

    /// Returns `true` when some operand repeats a label (a diagonal or trace).
    pub fn has_repeated_input_labels(&self) -> bool {
        self.inputs.iter().any(|term| first_repeated(term).is_some())
    }

    /// Builds the contraction computing the gradient of operand `target`.
    ///
    /// Returns the indices of the forward operands the gradient consumes (all
    /// operands except `target`, in order) and the reversed expression, whose
    /// first operand is the output gradient.
    pub fn reverse_wrt(&self, target: usize) -> Result<(Vec<usize>, EinsumExpr)> {
        if target >= self.inputs.len() {
            return Err(BackwardError::InvalidExpression(format!(
                "'{self}' has no operand {target}"
            )));
        }
        if let Some(label) = first_repeated(&self.inputs[target]) {
            return Err(BackwardError::UnsupportedExpressionShape(format!(
                "operand {target} of '{self}' repeats label '{label}'"
            )));
        }

        let operands: Vec<usize> = (0..self.inputs.len()).filter(|&i| i != target).collect();
        let mut inputs = Vec::with_capacity(self.inputs.len());
        inputs.push(self.output.clone());
        inputs.extend(operands.iter().map(|&i| self.inputs[i].clone()));
        let reversed = EinsumExpr {
            inputs,
            output: self.inputs[target].clone(),
        };

        reversed.validate().map_err(|e| match e {
            BackwardError::InvalidExpression(msg) => BackwardError::UnsupportedExpressionShape(
                format!("gradient of operand {target} of '{self}' is not a contraction: {msg}"),
            ),
            other => other,
        })?;
        Ok((operands, reversed))
    }

    /// Whether the gradient of every operand is expressible as a contraction.
    pub fn is_reversible(&self) -> bool {
        self.validate().is_ok()
            && !self.has_repeated_input_labels()
            && (0..self.inputs.len()).all(|i| self.reverse_wrt(i).is_ok())
    }
}

impl fmt::Display for EinsumExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<String> = self.inputs.iter().map(|t| t.iter().collect()).collect();
        let output: String = self.output.iter().collect();
        write!(f, "{}->{}", inputs.join(","), output)
    }
}

impl std::str::FromStr for EinsumExpr {
    type Err = BackwardError;

    fn from_str(s: &str) -> Result<Self> {
        EinsumExpr::parse(s)
    }
}

fn first_repeated(term: &[char]) -> Option<char> {
    term.iter()
        .enumerate()
        .find(|&(i, c)| term[..i].contains(c))
        .map(|(_, c)| *c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ij,jk->ik", 0, vec![1], "ik,jk->ij")]
    #[case("ij,jk->ik", 1, vec![0], "ik,ij->jk")]
    #[case("bij,bjk->bik", 1, vec![0], "bik,bij->bjk")]
    #[case("i,i->", 0, vec![1], ",i->i")]
    #[case("ij->ji", 0, vec![], "ji->ij")]
    #[case("ab,bc,cd->ad", 1, vec![0, 2], "ad,ab,cd->bc")]
    fn test_reverse_wrt(
        #[case] equation: &str,
        #[case] target: usize,
        #[case] operands: Vec<usize>,
        #[case] expected: &str,
    ) {
        let expr = EinsumExpr::parse(equation).unwrap();
        let (aux, reversed) = expr.reverse_wrt(target).unwrap();
        assert_eq!(aux, operands);
        assert_eq!(reversed.to_string(), expected);
    }

    #[test]
    fn test_parse_ignores_whitespace() {
        let expr = EinsumExpr::parse(" ij , jk -> ik ").unwrap();
        assert_eq!(expr.to_string(), "ij,jk->ik");
        assert_eq!(expr.num_inputs(), 2);
    }

    #[rstest]
    #[case("ij,jk")]
    #[case("ij->i->j")]
    #[case("i1,1->i")]
    #[case("...i->i")]
    fn test_parse_rejects(#[case] equation: &str) {
        assert!(matches!(
            EinsumExpr::parse(equation),
            Err(BackwardError::InvalidExpression(_))
        ));
    }

    #[test]
    fn test_repeated_label_is_rejected() {
        let expr = EinsumExpr::parse("ii->i").unwrap();
        assert!(expr.has_repeated_input_labels());
        assert!(matches!(
            expr.reverse_wrt(0),
            Err(BackwardError::UnsupportedExpressionShape(_))
        ));
        assert!(!expr.is_reversible());
    }

    #[test]
    fn test_summed_away_label_is_rejected() {
        // the gradient would need to broadcast `j`, which no operand provides
        let expr = EinsumExpr::parse("ij->i").unwrap();
        assert!(matches!(
            expr.reverse_wrt(0),
            Err(BackwardError::UnsupportedExpressionShape(_))
        ));
        assert!(!expr.is_reversible());
    }

    #[rstest]
    #[case("ij,jk->ik", 0)]
    #[case("ij,jk->ik", 1)]
    #[case("bij,bjk->bik", 0)]
    #[case("ab,bc,cd->ad", 2)]
    #[case("ij->ji", 0)]
    fn test_double_reversal(#[case] equation: &str, #[case] target: usize) {
        let forward = EinsumExpr::parse(equation).unwrap();
        let (_, once) = forward.reverse_wrt(target).unwrap();
        // reversing w.r.t. the output-gradient operand gives back a contraction
        // producing the forward output from operand `target` and the others
        let (aux, twice) = once.reverse_wrt(0).unwrap();
        assert_eq!(aux, (1..forward.num_inputs()).collect::<Vec<_>>());
        assert_eq!(twice.output, forward.output);
        assert_eq!(twice.inputs[0], forward.inputs[target]);
        let others: Vec<Vec<char>> = (0..forward.num_inputs())
            .filter(|&i| i != target)
            .map(|i| forward.inputs[i].clone())
            .collect();
        assert_eq!(&twice.inputs[1..], others.as_slice());
    }

    #[test]
    fn test_target_out_of_range() {
        let expr = EinsumExpr::parse("ij,jk->ik").unwrap();
        assert!(matches!(expr.reverse_wrt(2), Err(BackwardError::InvalidExpression(_))));
    }
}
