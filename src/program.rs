//! Already-parsed program representation consumed by the checker.
//!
//! A program is a list of translation units. Each unit carries the
//! declarations the host compiler saw (capability types, structs, globals,
//! function prototypes with their attributes as written) and the control-flow
//! graphs of the functions it defines. The representation is read from JSON.

use crate::error::{CapCheckError, CapCheckResult};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub units: Vec<TranslationUnit>,
}

impl Program {
    pub fn from_json(source: &str) -> CapCheckResult<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn load(path: &Path) -> CapCheckResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|err| {
            CapCheckError::malformed(format!("{}: {err}", path.display()))
        })
    }

    /// Append the units of `other`; declarations are shared program-wide.
    pub fn merge(&mut self, other: Program) {
        self.units.extend(other.units);
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslationUnit {
    pub name: String,
    /// Whether the unit opted into analysis (used with `scope = "opted-in"`).
    #[serde(default = "default_true")]
    pub opted_in: bool,
    #[serde(default)]
    pub capability_types: Vec<CapabilityTypeDecl>,
    #[serde(default)]
    pub token_instances: Vec<TokenInstanceDecl>,
    #[serde(default)]
    pub structs: Vec<StructDecl>,
    #[serde(default)]
    pub globals: Vec<GlobalDecl>,
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
}

/// `struct_with_capability(name)` or, with `token`, `token_capability(name)`.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityTypeDecl {
    pub name: String,
    #[serde(default)]
    pub token: bool,
}

/// `token_capability_instance(capability, name)`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenInstanceDecl {
    pub name: String,
    pub capability: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructDecl {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty: String,
    #[serde(default)]
    pub attrs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: String,
    #[serde(default)]
    pub attrs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub ty: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default)]
    pub inline: bool,
    /// Internal linkage: the declaration is visible only in its own unit.
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default)]
    pub params: Vec<VarDecl>,
    #[serde(default)]
    pub attrs: Vec<String>,
    #[serde(default)]
    pub locals: Vec<VarDecl>,
    #[serde(default)]
    pub body: Option<Body>,
}

impl FunctionDecl {
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Body {
    #[serde(default)]
    pub entry: usize,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub stmts: Vec<Statement>,
    #[serde(default)]
    pub term: Terminator,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Statement {
    /// Source line, when the host compiler provides one.
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(flatten)]
    pub kind: StatementKind,
}

impl From<StatementKind> for Statement {
    fn from(kind: StatementKind) -> Self {
        Self { line: None, kind }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    /// Plain statement without capability relevance.
    Plain(String),
    Call(CallStmt),
    /// Read of a member access path.
    Read(String),
    /// Write through a member access path.
    Write(String),
    Assign(AssignStmt),
    /// `disable_capability_analysis()`
    SuppressBegin,
    /// `enable_capability_analysis()`
    SuppressEnd,
    /// `capability_unsafe(...)` around nested statements.
    Unsafe(Vec<Statement>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallStmt {
    pub callee: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Local that receives the return value.
    #[serde(default)]
    pub dest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignStmt {
    pub dest: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    #[default]
    Return,
    /// Return of a local or literal; used to check try-acquire contracts.
    ReturnValue(String),
    #[serde(alias = "backedge")]
    Goto(usize),
    Branch(BranchTerm),
    /// No successor and no exit obligations (`BUG()`, `panic()`).
    Unreachable,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchTerm {
    pub cond: Condition,
    pub then: usize,
    #[serde(rename = "else")]
    pub otherwise: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Branch taken when the local is true.
    Local(String),
    /// Branch taken when the local is false.
    Not(String),
    Opaque,
}

impl Terminator {
    pub fn successors(&self) -> Vec<usize> {
        match self {
            Terminator::Return | Terminator::ReturnValue(_) | Terminator::Unreachable => {
                Vec::new()
            }
            Terminator::Goto(target) => vec![*target],
            Terminator::Branch(branch) => vec![branch.then, branch.otherwise],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_forms_deserialize() {
        let body: Body = serde_json::from_str(
            r#"{
                "blocks": [
                    {"stmts": [
                        {"call": {"callee": "spin_lock", "args": ["&f->lock"]}, "line": 4},
                        {"write": "f->counter"},
                        {"suppress_begin": null},
                        {"unsafe": [{"read": "f->counter"}]},
                        {"assign": {"dest": "ret", "value": "0"}}
                     ],
                     "term": {"branch": {"cond": {"not": "ret"}, "then": 1, "else": 1}}},
                    {"term": "return"},
                    {"term": {"backedge": 0}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(body.blocks.len(), 3);
        assert_eq!(body.blocks[0].stmts[0].line, Some(4));
        assert!(matches!(body.blocks[0].stmts[2].kind, StatementKind::SuppressBegin));
        assert!(matches!(body.blocks[0].stmts[3].kind, StatementKind::Unsafe(ref s) if s.len() == 1));
        assert_eq!(body.blocks[0].term.successors(), vec![1, 1]);
        assert!(matches!(body.blocks[2].term, Terminator::Goto(0)));
    }

    #[test]
    fn test_unit_defaults() {
        let program = Program::from_json(r#"{"units": [{"name": "a.c"}]}"#).unwrap();
        assert!(program.units[0].opted_in);
        assert!(program.units[0].functions.is_empty());
    }
}
