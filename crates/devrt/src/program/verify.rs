use std::collections::{HashMap, HashSet};
use std::fmt;

use super::{Function, Instruction, Operand, Operation, Program, UnaryOp, PROGRAM_FORMAT_VERSION};
use crate::shape::{DType, Shape};

/// Structural or typing problem found in a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub function: Option<String>,
    pub instruction: Option<usize>,
    pub message: String,
}

impl VerifyError {
    fn program(message: impl Into<String>) -> Self {
        Self {
            function: None,
            instruction: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.function, self.instruction) {
            (Some(function), Some(index)) => {
                write!(f, "@{function} instruction #{index}: {}", self.message)
            }
            (Some(function), None) => write!(f, "@{function}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Checks that `program` is well formed: the entry exists, values are defined
/// exactly once before use, and each operation's operands agree with its
/// declared output.
pub fn verify(program: &Program) -> Result<(), VerifyError> {
    if program.format_version != PROGRAM_FORMAT_VERSION {
        return Err(VerifyError::program(format!(
            "unsupported format version '{}'",
            program.format_version
        )));
    }

    let mut names = HashSet::new();
    for function in &program.functions {
        if !names.insert(function.name.as_str()) {
            return Err(VerifyError::program(format!(
                "function '{}' is defined more than once",
                function.name
            )));
        }
    }
    if !names.contains(program.entry.as_str()) {
        return Err(VerifyError::program(format!(
            "entry function '{}' not found",
            program.entry
        )));
    }

    for function in &program.functions {
        verify_function(function)?;
    }
    Ok(())
}

fn verify_function(function: &Function) -> Result<(), VerifyError> {
    let fail = |instruction: Option<usize>, message: String| VerifyError {
        function: Some(function.name.clone()),
        instruction,
        message,
    };

    if function.parameters.len() != function.parameter_ids.len() {
        return Err(fail(
            None,
            format!(
                "{} parameter shapes for {} parameter ids",
                function.parameters.len(),
                function.parameter_ids.len()
            ),
        ));
    }
    if function.results.len() != function.result_ids.len() {
        return Err(fail(
            None,
            format!(
                "{} result shapes for {} result ids",
                function.results.len(),
                function.result_ids.len()
            ),
        ));
    }

    let mut defined: HashMap<_, &Shape> = HashMap::new();
    for (id, shape) in function.parameter_ids.iter().zip(&function.parameters) {
        if shape.checked_byte_size().is_none() {
            return Err(fail(
                None,
                format!("parameter %{} has an oversized shape", id.0),
            ));
        }
        if defined.insert(*id, shape).is_some() {
            return Err(fail(None, format!("parameter %{} is declared twice", id.0)));
        }
    }

    for (index, instruction) in function.body.iter().enumerate() {
        let mut operand_shapes = Vec::with_capacity(instruction.operands.len());
        for operand in &instruction.operands {
            match operand {
                Operand::Value(id) => match defined.get(id) {
                    Some(shape) => operand_shapes.push(*shape),
                    None => {
                        return Err(fail(
                            Some(index),
                            format!("operand %{} is used before definition", id.0),
                        ));
                    }
                },
                Operand::Literal(literal) => {
                    if !literal.is_well_formed() {
                        return Err(fail(
                            Some(index),
                            format!(
                                "literal of shape {} carries {} bytes",
                                literal.shape,
                                literal.byte_len()
                            ),
                        ));
                    }
                    operand_shapes.push(&literal.shape);
                }
            }
        }

        check_instruction(instruction, &operand_shapes).map_err(|msg| fail(Some(index), msg))?;

        let previous = defined.insert(instruction.id, &instruction.output);
        if previous.is_some() {
            return Err(fail(
                Some(index),
                format!("value %{} is defined more than once", instruction.id.0),
            ));
        }
    }

    for (position, (id, expected)) in function
        .result_ids
        .iter()
        .zip(&function.results)
        .enumerate()
    {
        match defined.get(id) {
            Some(found) if *found == expected => {}
            Some(found) => {
                return Err(fail(
                    None,
                    format!(
                        "result {position} is declared {expected} but %{} is {found}",
                        id.0
                    ),
                ));
            }
            None => {
                return Err(fail(
                    None,
                    format!("result {position} refers to undefined value %{}", id.0),
                ));
            }
        }
    }
    Ok(())
}

fn check_instruction(instruction: &Instruction, operands: &[&Shape]) -> Result<(), String> {
    let output = &instruction.output;
    if output.checked_byte_size().is_none() {
        return Err(format!("output shape {output} overflows"));
    }

    let expect_arity = |n: usize| {
        if operands.len() == n {
            Ok(())
        } else {
            Err(format!(
                "{} expects {n} operand(s), got {}",
                instruction.op.name(),
                operands.len()
            ))
        }
    };

    match &instruction.op {
        Operation::Constant(literal) => {
            expect_arity(0)?;
            if !literal.is_well_formed() {
                return Err(format!(
                    "constant of shape {} carries {} bytes",
                    literal.shape,
                    literal.byte_len()
                ));
            }
            if &literal.shape != output {
                return Err(format!(
                    "constant is {} but output is {output}",
                    literal.shape
                ));
            }
        }
        Operation::Unary(op) => {
            expect_arity(1)?;
            same_shape(operands[0], output)?;
            if output.dtype == DType::Pred {
                return Err(format!("{} is not defined for pred", instruction.op.name()));
            }
            let transcendental = matches!(
                op,
                UnaryOp::Exp | UnaryOp::Log | UnaryOp::Sqrt | UnaryOp::Tanh
            );
            if transcendental && !output.dtype.is_float() {
                return Err(format!(
                    "{} requires a floating-point operand, got {}",
                    instruction.op.name(),
                    output.dtype
                ));
            }
        }
        Operation::Binary(_) => {
            expect_arity(2)?;
            same_shape(operands[0], output)?;
            same_shape(operands[1], output)?;
            if output.dtype == DType::Pred {
                return Err(format!("{} is not defined for pred", instruction.op.name()));
            }
        }
        Operation::Convert(dtype) => {
            expect_arity(1)?;
            if output.dtype != *dtype {
                return Err(format!("convert to {dtype} declares output {output}"));
            }
            if operands[0].dims != output.dims {
                return Err(format!(
                    "convert changes dimensions from {} to {output}",
                    operands[0]
                ));
            }
        }
        Operation::Reshape => {
            expect_arity(1)?;
            if operands[0].dtype != output.dtype || !operands[0].same_element_count(output) {
                return Err(format!("cannot reshape {} into {output}", operands[0]));
            }
        }
        Operation::Infeed => expect_arity(0)?,
        Operation::Outfeed => {
            expect_arity(1)?;
            same_shape(operands[0], output)?;
        }
    }
    Ok(())
}

fn same_shape(operand: &Shape, output: &Shape) -> Result<(), String> {
    if operand == output {
        Ok(())
    } else {
        Err(format!("operand {operand} does not match output {output}"))
    }
}
