//! Program representation accepted by `RuntimeClient::compile`.
//!
//! The client layer treats a [`Program`] as opaque input; platforms lower it
//! to their executable form. Programs are SSA: every instruction defines one
//! value, identified by a [`ValueId`], typed by a dense [`Shape`].

mod builder;
mod verify;

use std::{fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

use crate::shape::{DType, Shape};

pub use builder::{BuildError, ProgramBuilder};
pub use verify::{verify, VerifyError};

/// Program format version enforced by this crate.
pub const PROGRAM_FORMAT_VERSION: &str = "devrt.ir.v1";

fn default_format_version() -> String {
    PROGRAM_FORMAT_VERSION.to_string()
}

/// Unique identifier for SSA values within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Dense array payload: a shape plus little-endian element bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal {
    pub shape: Shape,
    pub bytes: Arc<[u8]>,
}

impl Literal {
    pub fn new(shape: Shape, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            shape,
            bytes: bytes.into(),
        }
    }

    pub fn from_f32(dims: impl Into<Vec<usize>>, values: &[f32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Shape::new(DType::F32, dims), bytes)
    }

    pub fn from_f64(dims: impl Into<Vec<usize>>, values: &[f64]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Shape::new(DType::F64, dims), bytes)
    }

    pub fn from_s32(dims: impl Into<Vec<usize>>, values: &[i32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Shape::new(DType::S32, dims), bytes)
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` when the payload length matches the shape.
    pub fn is_well_formed(&self) -> bool {
        self.shape.checked_byte_size() == Some(self.bytes.len())
    }

    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.shape.dtype != DType::F32 || !self.is_well_formed() {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }

    pub fn to_s32_vec(&self) -> Option<Vec<i32>> {
        if self.shape.dtype != DType::S32 || !self.is_well_formed() {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

impl Serialize for Literal {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Literal", 2)?;
        state.serialize_field("shape", &self.shape)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Literal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct LiteralHelper {
            shape: Shape,
            bytes: Vec<u8>,
        }

        let helper = LiteralHelper::deserialize(deserializer)?;
        Ok(Literal {
            shape: helper.shape,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

/// Declarative form of the supported operations.
///
/// `Infeed` pops the next value from the executing device's infeed queue;
/// `Outfeed` pushes its operand to the outfeed queue and forwards it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(Literal),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Convert(DType),
    Reshape,
    Infeed,
    Outfeed,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::Unary(UnaryOp::Neg) => "neg",
            Operation::Unary(UnaryOp::Abs) => "abs",
            Operation::Unary(UnaryOp::Exp) => "exp",
            Operation::Unary(UnaryOp::Log) => "log",
            Operation::Unary(UnaryOp::Sqrt) => "sqrt",
            Operation::Unary(UnaryOp::Tanh) => "tanh",
            Operation::Binary(BinaryOp::Add) => "add",
            Operation::Binary(BinaryOp::Sub) => "sub",
            Operation::Binary(BinaryOp::Mul) => "mul",
            Operation::Binary(BinaryOp::Div) => "div",
            Operation::Binary(BinaryOp::Maximum) => "maximum",
            Operation::Binary(BinaryOp::Minimum) => "minimum",
            Operation::Convert(_) => "convert",
            Operation::Reshape => "reshape",
            Operation::Infeed => "infeed",
            Operation::Outfeed => "outfeed",
        }
    }
}

/// Operand reference in an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    Literal(Literal),
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: Shape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<Shape>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<Shape>,
    pub result_ids: Vec<ValueId>,
    pub body: Vec<Instruction>,
}

impl Function {
    /// Returns `true` when the function touches a feed queue.
    pub fn uses_feeds(&self) -> bool {
        self.body
            .iter()
            .any(|inst| matches!(inst.op, Operation::Infeed | Operation::Outfeed))
    }
}

/// Complete module: a set of functions and the name of the entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_format_version")]
    pub format_version: String,
    pub entry: String,
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("program format version '{found}' does not match expected '{expected}'")]
    FormatVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            format_version: PROGRAM_FORMAT_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    /// Wraps a single function as the entry point of a new program.
    pub fn from_entry(function: Function) -> Self {
        Self::new(function.name.clone()).with_functions(vec![function])
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == self.entry)
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = serde_json::from_str(src)?;
        program.format_version = normalize_format_version(program.format_version)?;
        Ok(program)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ProgramSerdeError> {
        bincode::serialize(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, ProgramSerdeError> {
        let mut program: Program = bincode::deserialize(bytes)?;
        program.format_version = normalize_format_version(program.format_version)?;
        Ok(program)
    }
}

fn normalize_format_version(version: String) -> Result<String, ProgramSerdeError> {
    if version.is_empty() {
        return Ok(PROGRAM_FORMAT_VERSION.to_string());
    }
    if version == PROGRAM_FORMAT_VERSION {
        Ok(version)
    } else {
        Err(ProgramSerdeError::FormatVersionMismatch {
            found: version,
            expected: PROGRAM_FORMAT_VERSION,
        })
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "program @{} (format_version = {}) {{",
            self.entry, self.format_version
        )?;
        for function in &self.functions {
            fmt_function(function, f)?;
        }
        writeln!(f, "}}")
    }
}

fn fmt_function(function: &Function, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let params = function
        .parameter_ids
        .iter()
        .zip(function.parameters.iter())
        .map(|(id, shape)| format!("%{}: {}", id.0, shape))
        .collect::<Vec<_>>()
        .join(", ");
    writeln!(f, "  func @{}({}) {{", function.name, params)?;
    for instruction in &function.body {
        let operands = instruction
            .operands
            .iter()
            .map(|operand| match operand {
                Operand::Value(id) => format!("%{}", id.0),
                Operand::Literal(lit) => format!("literal({})", lit.shape),
            })
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            f,
            "    %{} = {}({}) -> {}",
            instruction.id.0,
            instruction.op.name(),
            operands,
            instruction.output
        )?;
    }
    let results = function
        .result_ids
        .iter()
        .map(|id| format!("%{}", id.0))
        .collect::<Vec<_>>()
        .join(", ");
    writeln!(f, "    return {results}")?;
    writeln!(f, "  }}")
}
