use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};
use crate::hashing::Fingerprinter;
use crate::program::{verify, Function, Program};
use crate::shape::Shape;

use super::interpreter;

pub const PROGRAM_ARTIFACT_VERSION: u32 = 1;

/// Executable form of a program for platforms that run it through the
/// reference interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramArtifact {
    pub artifact_version: u32,
    pub program: Program,
    pub parameter_shapes: Vec<Shape>,
    pub result_shapes: Vec<Shape>,
}

impl ProgramArtifact {
    /// Lowers a verified program, rejecting element types the interpreter
    /// cannot compute.
    pub fn lower(program: &Program) -> BackendResult<Self> {
        interpreter::check_supported(program)?;
        let entry = program.entry_function().ok_or_else(|| {
            BackendError::compilation(format!("entry function '{}' not found", program.entry))
        })?;
        Ok(Self {
            artifact_version: PROGRAM_ARTIFACT_VERSION,
            program: program.clone(),
            parameter_shapes: entry.parameters.clone(),
            result_shapes: entry.results.clone(),
        })
    }

    pub fn entry(&self) -> BackendResult<&Function> {
        self.program
            .entry_function()
            .ok_or_else(|| BackendError::execution("artifact lost its entry function"))
    }

    /// Fingerprint over the platform name and the program's binary form.
    pub fn fingerprint(&self, platform: &str) -> BackendResult<String> {
        let bytes = self
            .program
            .to_bincode_bytes()
            .map_err(|err| BackendError::compilation(format!("fingerprint encoding: {err}")))?;
        Ok(Fingerprinter::new()
            .segment(platform.as_bytes())
            .segment(&bytes)
            .finish_hex())
    }

    pub fn to_bytes(&self) -> BackendResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|err| BackendError::device(format!("artifact encoding failed: {err}")))
    }

    /// Decodes and re-validates an artifact. Every failure is `Corrupt`.
    pub fn from_bytes(bytes: &[u8]) -> BackendResult<Self> {
        let artifact: ProgramArtifact = bincode::deserialize(bytes)
            .map_err(|err| BackendError::corrupt(format!("artifact decoding failed: {err}")))?;
        if artifact.artifact_version != PROGRAM_ARTIFACT_VERSION {
            return Err(BackendError::corrupt(format!(
                "artifact version {} does not match expected {}",
                artifact.artifact_version, PROGRAM_ARTIFACT_VERSION
            )));
        }
        verify(&artifact.program)
            .map_err(|err| BackendError::corrupt(format!("artifact program is invalid: {err}")))?;
        let relowered = Self::lower(&artifact.program)
            .map_err(|err| BackendError::corrupt(err.to_string()))?;
        if relowered.parameter_shapes != artifact.parameter_shapes
            || relowered.result_shapes != artifact.result_shapes
        {
            return Err(BackendError::corrupt(
                "artifact signature disagrees with its program",
            ));
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgramBuilder;
    use crate::shape::DType;

    fn identity() -> Program {
        let mut builder = ProgramBuilder::new();
        let x = builder.add_parameter(Shape::new(DType::F32, [4]));
        Program::from_entry(builder.finish("main", vec![x]).unwrap())
    }

    #[test]
    fn bytes_round_trip_with_same_fingerprint() {
        let artifact = ProgramArtifact::lower(&identity()).unwrap();
        let decoded = ProgramArtifact::from_bytes(&artifact.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, artifact);
        assert_eq!(
            decoded.fingerprint("host").unwrap(),
            artifact.fingerprint("host").unwrap()
        );
        assert_ne!(
            artifact.fingerprint("host").unwrap(),
            artifact.fingerprint("cuda").unwrap()
        );
    }

    #[test]
    fn garbage_and_foreign_versions_are_corrupt() {
        assert!(matches!(
            ProgramArtifact::from_bytes(&[1, 2, 3]),
            Err(BackendError::Corrupt { .. })
        ));
        let mut artifact = ProgramArtifact::lower(&identity()).unwrap();
        artifact.artifact_version = 99;
        let bytes = artifact.to_bytes().unwrap();
        assert!(matches!(
            ProgramArtifact::from_bytes(&bytes),
            Err(BackendError::Corrupt { .. })
        ));
    }
}
