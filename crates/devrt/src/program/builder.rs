use std::collections::HashMap;

use thiserror::Error;

use super::{Function, Instruction, Operand, Operation, ValueId};
use crate::shape::Shape;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("result value %{} was never defined", .0 .0)]
    UnknownResult(ValueId),
}

/// Lightweight builder for constructing functions programmatically.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, Shape)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, Shape>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, shape: Shape) -> ValueId {
        let id = self.next_id();
        self.value_types.insert(id, shape.clone());
        self.parameters.push((id, shape));
        id
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<Operand>, output: Shape) -> ValueId {
        let id = self.next_id();
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn value_type(&self, id: ValueId) -> Option<&Shape> {
        self.value_types.get(&id)
    }

    pub fn finish(
        self,
        name: impl Into<String>,
        result_ids: Vec<ValueId>,
    ) -> Result<Function, BuildError> {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let shape = self
                .value_types
                .get(id)
                .ok_or(BuildError::UnknownResult(*id))?;
            results.push(shape.clone());
        }
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Ok(Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            result_ids,
            body: self.instructions,
        })
    }

    fn next_id(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }
}
