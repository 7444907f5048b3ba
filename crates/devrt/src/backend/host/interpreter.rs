//! Reference interpreter for the program IR.
//!
//! Values are dense little-endian [`Literal`]s; each instruction decodes its
//! operands, computes elementwise, and re-encodes. Platforms without a
//! native code generator stage through this module.

use std::collections::HashMap;

use crate::backend::{BackendError, BackendResult};
use crate::program::{
    BinaryOp, Function, Instruction, Literal, Operand, Operation, Program, UnaryOp, ValueId,
};
use crate::shape::{DType, Shape};

/// Element types the interpreter computes on.
pub const SUPPORTED_DTYPES: [DType; 7] = [
    DType::Pred,
    DType::S32,
    DType::S64,
    DType::U8,
    DType::U32,
    DType::F32,
    DType::F64,
];

/// Source and sink for in-program `infeed`/`outfeed` instructions.
pub trait FeedPort {
    fn infeed(&self, shape: &Shape) -> BackendResult<Literal>;
    fn outfeed(&self, value: Literal) -> BackendResult<()>;
}

/// Rejects programs that use element types the interpreter cannot compute.
pub fn check_supported(program: &Program) -> BackendResult<()> {
    let check = |shape: &Shape, what: &str| {
        if SUPPORTED_DTYPES.contains(&shape.dtype) {
            Ok(())
        } else {
            Err(BackendError::compilation(format!(
                "{what} uses unsupported element type {}",
                shape.dtype
            )))
        }
    };
    for function in &program.functions {
        for shape in function.parameters.iter().chain(&function.results) {
            check(shape, &format!("function @{} signature", function.name))?;
        }
        for (index, instruction) in function.body.iter().enumerate() {
            let what = format!(
                "@{} instruction #{index} ({})",
                function.name,
                instruction.op.name()
            );
            check(&instruction.output, &what)?;
            for operand in &instruction.operands {
                if let Operand::Literal(literal) = operand {
                    check(&literal.shape, &what)?;
                }
            }
        }
    }
    Ok(())
}

/// Evaluates `function` on `inputs`, returning one literal per result.
pub fn run_function(
    function: &Function,
    inputs: Vec<Literal>,
    feeds: &dyn FeedPort,
) -> BackendResult<Vec<Literal>> {
    if function.parameter_ids.len() != inputs.len() {
        return Err(BackendError::execution(format!(
            "function @{} expects {} inputs, got {}",
            function.name,
            function.parameter_ids.len(),
            inputs.len()
        )));
    }

    let mut values: HashMap<ValueId, Literal> = HashMap::new();
    for (param_id, input) in function.parameter_ids.iter().zip(inputs) {
        values.insert(*param_id, input);
    }

    for (instr_index, instruction) in function.body.iter().enumerate() {
        let mut operands = Vec::with_capacity(instruction.operands.len());
        for operand in &instruction.operands {
            let value = match operand {
                Operand::Value(id) => values
                    .get(id)
                    .cloned()
                    .ok_or_else(|| BackendError::execution("operand value missing"))?,
                Operand::Literal(lit) => lit.clone(),
            };
            operands.push(value);
        }
        let output = execute_instruction(instruction, &operands, feeds)
            .map_err(|err| augment_error(err, &function.name, instr_index, instruction))?;
        values.insert(instruction.id, output);
    }

    function
        .result_ids
        .iter()
        .map(|id| {
            values
                .get(id)
                .cloned()
                .ok_or_else(|| BackendError::execution("missing function result value"))
        })
        .collect()
}

fn augment_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    instruction: &Instruction,
) -> BackendError {
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!(
                "{message} (at function `{function_name}` instruction #{instruction_index}, {} -> {})",
                instruction.op.name(),
                instruction.output
            ),
        },
        other => other,
    }
}

fn execute_instruction(
    instruction: &Instruction,
    operands: &[Literal],
    feeds: &dyn FeedPort,
) -> BackendResult<Literal> {
    let output = &instruction.output;
    match &instruction.op {
        Operation::Constant(literal) => Ok(literal.clone()),
        Operation::Unary(op) => {
            let input = decode(expect_operand(operands, 0)?)?;
            encode(output, unary(*op, input)?)
        }
        Operation::Binary(op) => {
            let lhs = decode(expect_operand(operands, 0)?)?;
            let rhs = decode(expect_operand(operands, 1)?)?;
            encode(output, binary(*op, lhs, rhs)?)
        }
        Operation::Convert(dtype) => {
            let input = decode(expect_operand(operands, 0)?)?;
            encode(output, convert(input, *dtype)?)
        }
        Operation::Reshape => {
            let input = expect_operand(operands, 0)?;
            Ok(Literal {
                shape: output.clone(),
                bytes: input.bytes.clone(),
            })
        }
        Operation::Infeed => {
            let value = feeds
                .infeed(output)
                .map_err(|err| BackendError::execution(format!("infeed: {err}")))?;
            if &value.shape != output {
                return Err(BackendError::execution(format!(
                    "infeed delivered {} but the program expects {output}",
                    value.shape
                )));
            }
            Ok(value)
        }
        Operation::Outfeed => {
            let value = expect_operand(operands, 0)?.clone();
            feeds
                .outfeed(value.clone())
                .map_err(|err| BackendError::execution(format!("outfeed: {err}")))?;
            Ok(value)
        }
    }
}

fn expect_operand(operands: &[Literal], index: usize) -> BackendResult<&Literal> {
    operands
        .get(index)
        .ok_or_else(|| BackendError::execution(format!("missing operand #{index}")))
}

#[derive(Debug, Clone, PartialEq)]
enum ArrayData {
    Pred(Vec<u8>),
    S32(Vec<i32>),
    S64(Vec<i64>),
    U8(Vec<u8>),
    U32(Vec<u32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

fn decode(literal: &Literal) -> BackendResult<ArrayData> {
    if !literal.is_well_formed() {
        return Err(BackendError::execution(format!(
            "value of shape {} carries {} bytes",
            literal.shape,
            literal.byte_len()
        )));
    }
    let bytes = literal.bytes.as_ref();
    let data = match literal.shape.dtype {
        DType::Pred => ArrayData::Pred(bytes.to_vec()),
        DType::U8 => ArrayData::U8(bytes.to_vec()),
        DType::S32 => ArrayData::S32(chunks::<4, _>(bytes, i32::from_le_bytes)),
        DType::U32 => ArrayData::U32(chunks::<4, _>(bytes, u32::from_le_bytes)),
        DType::F32 => ArrayData::F32(chunks::<4, _>(bytes, f32::from_le_bytes)),
        DType::S64 => ArrayData::S64(chunks::<8, _>(bytes, i64::from_le_bytes)),
        DType::F64 => ArrayData::F64(chunks::<8, _>(bytes, f64::from_le_bytes)),
        other => {
            return Err(BackendError::unimplemented(
                "decode",
                format!("element type {other} is not supported by the host interpreter"),
            ));
        }
    };
    Ok(data)
}

fn chunks<const N: usize, T>(bytes: &[u8], from_le: fn([u8; N]) -> T) -> Vec<T> {
    bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut raw = [0u8; N];
            raw.copy_from_slice(chunk);
            from_le(raw)
        })
        .collect()
}

fn encode(shape: &Shape, data: ArrayData) -> BackendResult<Literal> {
    let bytes: Vec<u8> = match (&data, shape.dtype) {
        (ArrayData::Pred(v), DType::Pred) | (ArrayData::U8(v), DType::U8) => v.clone(),
        (ArrayData::S32(v), DType::S32) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        (ArrayData::S64(v), DType::S64) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        (ArrayData::U32(v), DType::U32) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        (ArrayData::F32(v), DType::F32) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        (ArrayData::F64(v), DType::F64) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        _ => {
            return Err(BackendError::execution(format!(
                "computed value does not match declared output {shape}"
            )));
        }
    };
    let literal = Literal::new(shape.clone(), bytes);
    if !literal.is_well_formed() {
        return Err(BackendError::execution(format!(
            "computed {} bytes for output {shape}",
            literal.byte_len()
        )));
    }
    Ok(literal)
}

fn unary(op: UnaryOp, input: ArrayData) -> BackendResult<ArrayData> {
    fn float<T: num_like::Float>(op: UnaryOp, values: Vec<T>) -> Vec<T> {
        values
            .into_iter()
            .map(|x| match op {
                UnaryOp::Neg => -x,
                UnaryOp::Abs => x.abs(),
                UnaryOp::Exp => x.exp(),
                UnaryOp::Log => x.ln(),
                UnaryOp::Sqrt => x.sqrt(),
                UnaryOp::Tanh => x.tanh(),
            })
            .collect()
    }

    let transcendental = matches!(
        op,
        UnaryOp::Exp | UnaryOp::Log | UnaryOp::Sqrt | UnaryOp::Tanh
    );
    let result = match input {
        ArrayData::F32(v) => ArrayData::F32(float(op, v)),
        ArrayData::F64(v) => ArrayData::F64(float(op, v)),
        _ if transcendental => {
            return Err(BackendError::execution(
                "transcendental functions require floating-point operands",
            ));
        }
        ArrayData::S32(v) => ArrayData::S32(match op {
            UnaryOp::Neg => v.into_iter().map(i32::wrapping_neg).collect(),
            _ => v.into_iter().map(i32::wrapping_abs).collect(),
        }),
        ArrayData::S64(v) => ArrayData::S64(match op {
            UnaryOp::Neg => v.into_iter().map(i64::wrapping_neg).collect(),
            _ => v.into_iter().map(i64::wrapping_abs).collect(),
        }),
        ArrayData::U8(v) => ArrayData::U8(match op {
            UnaryOp::Neg => v.into_iter().map(u8::wrapping_neg).collect(),
            _ => v,
        }),
        ArrayData::U32(v) => ArrayData::U32(match op {
            UnaryOp::Neg => v.into_iter().map(u32::wrapping_neg).collect(),
            _ => v,
        }),
        ArrayData::Pred(_) => {
            return Err(BackendError::execution(
                "arithmetic is not defined for pred",
            ));
        }
    };
    Ok(result)
}

fn binary(op: BinaryOp, lhs: ArrayData, rhs: ArrayData) -> BackendResult<ArrayData> {
    fn float<T: num_like::Float>(op: BinaryOp, a: &[T], b: &[T]) -> Vec<T> {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                BinaryOp::Maximum => x.max(y),
                BinaryOp::Minimum => x.min(y),
            })
            .collect()
    }

    fn int<T: num_like::Int>(op: BinaryOp, a: &[T], b: &[T]) -> BackendResult<Vec<T>> {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| match op {
                BinaryOp::Add => Ok(x.wrapping_add(y)),
                BinaryOp::Sub => Ok(x.wrapping_sub(y)),
                BinaryOp::Mul => Ok(x.wrapping_mul(y)),
                BinaryOp::Div => x.checked_div(y).ok_or_else(|| {
                    if y == T::ZERO {
                        BackendError::execution("integer division by zero")
                    } else {
                        BackendError::execution("integer division overflow")
                    }
                }),
                BinaryOp::Maximum => Ok(if x >= y { x } else { y }),
                BinaryOp::Minimum => Ok(if x <= y { x } else { y }),
            })
            .collect()
    }

    let result = match (&lhs, &rhs) {
        (ArrayData::F32(a), ArrayData::F32(b)) if a.len() == b.len() => {
            ArrayData::F32(float(op, a, b))
        }
        (ArrayData::F64(a), ArrayData::F64(b)) if a.len() == b.len() => {
            ArrayData::F64(float(op, a, b))
        }
        (ArrayData::S32(a), ArrayData::S32(b)) if a.len() == b.len() => {
            ArrayData::S32(int(op, a, b)?)
        }
        (ArrayData::S64(a), ArrayData::S64(b)) if a.len() == b.len() => {
            ArrayData::S64(int(op, a, b)?)
        }
        (ArrayData::U8(a), ArrayData::U8(b)) if a.len() == b.len() => ArrayData::U8(int(op, a, b)?),
        (ArrayData::U32(a), ArrayData::U32(b)) if a.len() == b.len() => {
            ArrayData::U32(int(op, a, b)?)
        }
        _ => {
            return Err(BackendError::execution(
                "binary operands must share element type and size",
            ));
        }
    };
    Ok(result)
}

enum Widened {
    Int(Vec<i128>),
    Float(Vec<f64>),
}

fn widen(data: ArrayData) -> Widened {
    match data {
        ArrayData::Pred(v) => Widened::Int(v.into_iter().map(|x| i128::from(x != 0)).collect()),
        ArrayData::U8(v) => Widened::Int(v.into_iter().map(i128::from).collect()),
        ArrayData::S32(v) => Widened::Int(v.into_iter().map(i128::from).collect()),
        ArrayData::U32(v) => Widened::Int(v.into_iter().map(i128::from).collect()),
        ArrayData::S64(v) => Widened::Int(v.into_iter().map(i128::from).collect()),
        ArrayData::F32(v) => Widened::Float(v.into_iter().map(f64::from).collect()),
        ArrayData::F64(v) => Widened::Float(v),
    }
}

/// Float to integer conversions saturate (NaN becomes zero); integer to
/// integer conversions wrap.
fn convert(input: ArrayData, dtype: DType) -> BackendResult<ArrayData> {
    macro_rules! narrow {
        ($values:expr, $ty:ty) => {
            match $values {
                Widened::Int(v) => v.into_iter().map(|x| x as $ty).collect(),
                Widened::Float(v) => v.into_iter().map(|x| x as $ty).collect(),
            }
        };
    }

    let widened = widen(input);
    let result = match dtype {
        DType::Pred => ArrayData::Pred(match widened {
            Widened::Int(v) => v.into_iter().map(|x| u8::from(x != 0)).collect(),
            Widened::Float(v) => v.into_iter().map(|x| u8::from(x != 0.0)).collect(),
        }),
        DType::U8 => ArrayData::U8(narrow!(widened, u8)),
        DType::S32 => ArrayData::S32(narrow!(widened, i32)),
        DType::U32 => ArrayData::U32(narrow!(widened, u32)),
        DType::S64 => ArrayData::S64(narrow!(widened, i64)),
        DType::F32 => ArrayData::F32(narrow!(widened, f32)),
        DType::F64 => ArrayData::F64(narrow!(widened, f64)),
        other => {
            return Err(BackendError::unimplemented(
                "convert",
                format!("conversion to {other} is not supported by the host interpreter"),
            ));
        }
    };
    Ok(result)
}

mod num_like {
    use std::ops::{Add, Div, Mul, Neg, Sub};

    pub trait Float:
        Copy
        + Add<Output = Self>
        + Sub<Output = Self>
        + Mul<Output = Self>
        + Div<Output = Self>
        + Neg<Output = Self>
    {
        fn abs(self) -> Self;
        fn exp(self) -> Self;
        fn ln(self) -> Self;
        fn sqrt(self) -> Self;
        fn tanh(self) -> Self;
        fn max(self, other: Self) -> Self;
        fn min(self, other: Self) -> Self;
    }

    pub trait Int: Copy + PartialOrd + PartialEq {
        const ZERO: Self;
        fn wrapping_add(self, rhs: Self) -> Self;
        fn wrapping_sub(self, rhs: Self) -> Self;
        fn wrapping_mul(self, rhs: Self) -> Self;
        fn checked_div(self, rhs: Self) -> Option<Self>;
    }

    macro_rules! impl_float {
        ($($ty:ty),*) => {$(
            impl Float for $ty {
                fn abs(self) -> Self { <$ty>::abs(self) }
                fn exp(self) -> Self { <$ty>::exp(self) }
                fn ln(self) -> Self { <$ty>::ln(self) }
                fn sqrt(self) -> Self { <$ty>::sqrt(self) }
                fn tanh(self) -> Self { <$ty>::tanh(self) }
                fn max(self, other: Self) -> Self { <$ty>::max(self, other) }
                fn min(self, other: Self) -> Self { <$ty>::min(self, other) }
            }
        )*};
    }

    macro_rules! impl_int {
        ($($ty:ty),*) => {$(
            impl Int for $ty {
                const ZERO: Self = 0;
                fn wrapping_add(self, rhs: Self) -> Self { <$ty>::wrapping_add(self, rhs) }
                fn wrapping_sub(self, rhs: Self) -> Self { <$ty>::wrapping_sub(self, rhs) }
                fn wrapping_mul(self, rhs: Self) -> Self { <$ty>::wrapping_mul(self, rhs) }
                fn checked_div(self, rhs: Self) -> Option<Self> { <$ty>::checked_div(self, rhs) }
            }
        )*};
    }

    impl_float!(f32, f64);
    impl_int!(i32, i64, u8, u32);
}
