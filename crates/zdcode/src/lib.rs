#![doc = include_str!("../../../README.md")]

mod actor;
pub mod ast;
mod compiler;
mod context;
mod error;
mod eval;
mod idgen;
mod modifier;
mod state;
mod template;
mod text;

pub use crate::{
    actor::{Actor, ActorId, Inventory, Label, Property, UserVar, UserVarSize, UserVarValue},
    compiler::{Compiler, VERSION},
    context::CtxId,
    error::{CompileError, CompileResult},
    state::{
        Frame, IfJumpNode, IfNode, JumpCall, SkipNode, SometimesNode, StateNode, Verbatim,
        WhileJumpNode, WhileNode,
    },
};
