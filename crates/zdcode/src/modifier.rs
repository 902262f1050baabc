//! The state-modifier clause engine.
//!
//! A clause pairs a selector predicate with an ordered list of effects.
//! Applying a clause to a state list rewrites matching states through the
//! effect chain (each effect sees the previous effect's outputs) and recurses
//! into the inner containers of states that do not match.

use crate::{
    ast::{EffectAst, SelectorAst},
    compiler::Compiler,
    context::{CtxId, Macro},
    error::CompileResult,
    state::StateNode,
};

/// A compiled modifier clause, bound to the context it was defined in.
#[derive(Debug, Clone)]
pub(crate) struct ModClause {
    /// The defining context; clause bodies are lowered in a scope derived
    /// from it, updated with the application site's names.
    pub ctx: CtxId,
    pub selector: SelectorAst,
    pub effects: Vec<EffectAst>,
}

/// Applies one clause to `states` in place.
pub(crate) fn apply_clause(
    comp: &mut Compiler,
    clause: &ModClause,
    at_ctx: CtxId,
    states: &mut Vec<StateNode>,
) -> CompileResult<()> {
    let clause_ctx = comp.ctxs.derive(clause.ctx, Some("mod clause"), false, false);
    comp.ctxs.update(clause_ctx, at_ctx);

    let mut result = Vec::with_capacity(states.len());
    for mut state in std::mem::take(states) {
        if eval_selector(comp, clause_ctx, &clause.selector, &state)? {
            let mut current = vec![state];
            for effect in &clause.effects {
                let mut next = Vec::with_capacity(current.len());
                for s in current {
                    next.extend(run_effect(comp, clause_ctx, effect, s)?);
                }
                current = next;
            }
            result.extend(current);
        } else {
            for container in state.state_containers() {
                apply_clause(comp, clause, at_ctx, container)?;
            }
            result.push(state);
        }
    }
    *states = result;
    Ok(())
}

/// Evaluates a selector against one state. Leaf selectors only ever match
/// plain frames; containers fall through to recursion.
fn eval_selector(
    comp: &Compiler,
    ctx: CtxId,
    selector: &SelectorAst,
    state: &StateNode,
) -> CompileResult<bool> {
    Ok(match selector {
        SelectorAst::Any => true,
        SelectorAst::Flag(name) => match state {
            StateNode::Frame(frame) if !frame.keywords.is_empty() => {
                let flag = comp.lower_state_modifier(ctx, name)?;
                frame
                    .keywords
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(&flag))
            }
            _ => false,
        },
        SelectorAst::Sprite(sprite) => match state {
            StateNode::Frame(frame) => comp.lower_state_sprite(ctx, sprite)? == frame.sprite,
            _ => false,
        },
        SelectorAst::Duration(duration) => match state {
            StateNode::Frame(frame) => frame.duration == *duration,
            _ => false,
        },
        SelectorAst::Not(inner) => !eval_selector(comp, ctx, inner, state)?,
        SelectorAst::And(a, b) => {
            eval_selector(comp, ctx, a, state)? && eval_selector(comp, ctx, b, state)?
        }
        SelectorAst::Or(a, b) => {
            eval_selector(comp, ctx, a, state)? || eval_selector(comp, ctx, b, state)?
        }
        SelectorAst::Xor(a, b) => {
            eval_selector(comp, ctx, a, state)? != eval_selector(comp, ctx, b, state)?
        }
    })
}

/// Runs one effect on one state, yielding its replacements.
fn run_effect(
    comp: &mut Compiler,
    ctx: CtxId,
    effect: &EffectAst,
    state: StateNode,
) -> CompileResult<Vec<StateNode>> {
    match effect {
        EffectAst::AddFlag(name) => {
            let flag = comp.lower_state_modifier(ctx, name)?;
            let mut state = state;
            if let StateNode::Frame(frame) = &mut state
                && !frame.keywords.iter().any(|k| k.eq_ignore_ascii_case(&flag))
            {
                frame.keywords.push(flag);
            }
            Ok(vec![state])
        }
        EffectAst::RemoveFlag(name) => {
            let flag = comp.lower_state_modifier(ctx, name)?;
            let mut state = state;
            if let StateNode::Frame(frame) = &mut state {
                frame.keywords.retain(|k| !k.eq_ignore_ascii_case(&flag));
            }
            Ok(vec![state])
        }
        EffectAst::Prefix(body) => {
            let mut out = comp.lower_state_expr(ctx, body)?;
            out.push(state);
            Ok(out)
        }
        EffectAst::Suffix(body) => {
            let mut out = vec![state];
            out.extend(comp.lower_state_expr(ctx, body)?);
            Ok(out)
        }
        EffectAst::Manipulate { macro_name, body } => {
            let manip_ctx = comp.ctxs.derive(ctx, Some("effect manipulation"), false, false);
            comp.ctxs.insert_macro(
                manip_ctx,
                macro_name,
                Macro {
                    args: Vec::new(),
                    body: vec![crate::ast::Statement::Prebuilt(state)],
                },
            );
            comp.lower_state_expr(manip_ctx, body)
        }
    }
}
