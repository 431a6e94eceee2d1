//! Compiled stack-machine programs and their on-disk artifact format.
//!
//! Artifact layout: `SPAD` magic, u32 LE format version, u64 LE payload
//! length, SHA-256 of the payload, then the rkyv-archived `CompiledScript`.
//! Loading checks length and digest before validating the archive.

use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

use super::builtins::Builtin;

const ARTIFACT_MAGIC: &[u8; 4] = b"SPAD";
const ARTIFACT_VERSION: u32 = 2;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = 16 + DIGEST_LEN;

/// Target type of a `Coerce` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Double,
    Bool,
    String,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Instr {
    PushInt(i64),
    PushDouble(f64),
    PushBool(bool),
    PushStr(String),
    PushNull,
    /// Push the value of a variable slot.
    Load(u32),
    /// Store the top of stack into a slot, leaving it on the stack.
    Store(u32),
    /// Convert the top of stack to a declared type or fault.
    Coerce(ValueType),
    Neg,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Jump(u32),
    /// Pop a bool and jump when it is false.
    JumpIfFalse(u32),
    /// Pop a bool and jump when it is true.
    JumpIfTrue(u32),
    /// Fault unless the top of stack is a bool.
    AssertBool,
    Call {
        builtin: Builtin,
        argc: u32,
    },
    Pop,
    /// Pop a value and raise it as an exception.
    Throw,
    /// Pop the submission result.
    SetResult,
    Halt,
}

/// Source position of an instruction, for stack frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// One compiled unit: a reference file or the submission itself.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub instrs: Vec<Instr>,
    /// Parallel to `instrs`.
    pub positions: Vec<Position>,
    /// Whether faults in this unit surface as `ReferenceLoadException`.
    pub is_reference: bool,
}

/// The executable unit: references first, submission last.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CompiledScript {
    pub units: Vec<Program>,
    /// Number of variable slots shared by all units.
    pub slots: u32,
}

impl CompiledScript {
    /// Encode as an artifact.
    pub fn to_artifact(&self) -> Result<Vec<u8>> {
        let archived = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| Error::Serialization(format!("failed to encode program: {}", e)))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + archived.len());
        bytes.extend_from_slice(ARTIFACT_MAGIC);
        bytes.extend_from_slice(&ARTIFACT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(archived.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&Sha256::digest(archived.as_slice()));
        bytes.extend_from_slice(&archived);
        Ok(bytes)
    }

    /// Decode and validate an artifact.
    pub fn from_artifact(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != ARTIFACT_MAGIC {
            return Err(Error::Serialization(
                "not a scriptpad artifact (bad magic)".to_string(),
            ));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != ARTIFACT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported artifact version {} (expected {})",
                version, ARTIFACT_VERSION
            )));
        }

        if bytes.len() < HEADER_LEN {
            return Err(Error::Serialization(
                "corrupt artifact: truncated header".to_string(),
            ));
        }
        let mut declared = [0u8; 8];
        declared.copy_from_slice(&bytes[8..16]);
        let declared = u64::from_le_bytes(declared);
        let payload = &bytes[HEADER_LEN..];
        if payload.len() as u64 != declared {
            return Err(Error::Serialization(format!(
                "corrupt artifact: payload is {} bytes, header says {}",
                payload.len(),
                declared
            )));
        }
        if Sha256::digest(payload).as_slice() != &bytes[16..HEADER_LEN] {
            return Err(Error::Serialization(
                "corrupt artifact: checksum mismatch".to_string(),
            ));
        }

        // The payload sits at an arbitrary offset of the buffer; realign it.
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(payload.len());
        aligned.extend_from_slice(payload);

        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Serialization(format!("corrupt artifact: {}", e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_artifact()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_artifact(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CompiledScript {
        CompiledScript {
            units: vec![Program {
                name: "<submission>".to_string(),
                instrs: vec![
                    Instr::PushInt(1),
                    Instr::PushDouble(2.5),
                    Instr::Add,
                    Instr::Call {
                        builtin: Builtin::Dump,
                        argc: 1,
                    },
                    Instr::SetResult,
                    Instr::Halt,
                ],
                positions: vec![Position { line: 1, column: 1 }; 6],
                is_reference: false,
            }],
            slots: 0,
        }
    }

    #[test]
    fn test_artifact_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("script.spad");

        let script = sample();
        script.save(&path).unwrap();
        assert_eq!(CompiledScript::load(&path).unwrap(), script);
    }

    #[test]
    fn test_rejects_foreign_bytes() {
        let err = CompiledScript::from_artifact(b"\x7fELF....").unwrap_err();
        assert!(err.to_string().contains("bad magic"));

        let mut bytes = sample().to_artifact().unwrap();
        bytes[4] = 99;
        let err = CompiledScript::from_artifact(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported artifact version"));
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let bytes = sample().to_artifact().unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(CompiledScript::from_artifact(truncated).is_err());

        let err = CompiledScript::from_artifact(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.to_string().contains("header says"));

        let err = CompiledScript::from_artifact(&bytes[..12]).unwrap_err();
        assert!(err.to_string().contains("truncated header"));
    }

    #[test]
    fn test_rejects_corrupted_payload() {
        let mut bytes = sample().to_artifact().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = CompiledScript::from_artifact(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
