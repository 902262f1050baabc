//! The state intermediate representation.
//!
//! Lowering turns statements into a tree of [`StateNode`]s; emission
//! flattens the tree into DECORATE states. Every node knows how many target
//! states it emits, and jump offsets in the conditional and looping variants
//! are computed from those counts. The counts are load-bearing: a node's
//! `num_states` must equal the number of non-label lines it emits.

use smallvec::SmallVec;

use crate::{
    context::{ContextTree, CtxId},
    text::{TextNode, stringify},
};

/// The canonical zero-duration invisible state used as a jump landing pad.
pub(crate) const ZEROTIC: &str = "TNT1 A 0";

/// A node of the state graph.
#[derive(Debug, PartialEq)]
pub enum StateNode {
    Frame(Frame),
    Verbatim(Verbatim),
    Block(Vec<StateNode>),
    If(IfNode),
    IfJump(IfJumpNode),
    While(WhileNode),
    WhileJump(WhileJumpNode),
    Sometimes(SometimesNode),
    Skip(SkipNode),
}

/// A regular DECORATE state.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sprite: String,
    pub frame: String,
    pub duration: i64,
    pub keywords: Vec<String>,
    pub action: Option<String>,
}

impl Frame {
    /// The wildcard sprite (`####`) and frame (`#`) are stored quoted, which
    /// is also how DECORATE spells them.
    pub fn new(
        sprite: &str,
        frame: &str,
        duration: i64,
        keywords: Vec<String>,
        action: Option<String>,
    ) -> Self {
        let sprite = if sprite == "####" { "\"####\"" } else { sprite };
        let frame = if frame == "#" { "\"#\"" } else { frame };
        Self {
            sprite: sprite.to_string(),
            frame: frame.to_string(),
            duration,
            keywords,
            action,
        }
    }

    /// An invisible zero-duration state, optionally carrying an action.
    pub fn tnt1(duration: i64, action: Option<String>) -> Self {
        Self::new("TNT1", "A", duration, Vec::new(), action)
    }

    pub fn spawn_safe(&self) -> bool {
        self.sprite != "\"####\"" && self.frame != "\"#\""
    }

    fn text(&self) -> String {
        let mut out = format!(
            "{} {} {}",
            self.sprite.to_uppercase(),
            self.frame.to_uppercase(),
            self.duration
        );
        if !self.keywords.is_empty() {
            out.push(' ');
            out.push_str(&self.keywords.join(" "));
        }
        if let Some(action) = &self.action {
            out.push(' ');
            out.push_str(action);
        }
        out
    }
}

/// A literal target-text line with a declared state count (usually zero).
#[derive(Debug, Clone, PartialEq)]
pub struct Verbatim {
    pub text: String,
    pub states: u32,
}

impl Verbatim {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            states: 0,
        }
    }
}

/// An `if` block, lowered through `A_JumpIf`.
#[derive(Debug, PartialEq)]
pub struct IfNode {
    pub condition: String,
    pub body: Vec<StateNode>,
    pub else_body: Option<Vec<StateNode>>,
}

/// A jump-action call with a `$OFFSET` placeholder for the relative offset.
#[derive(Debug, Clone, PartialEq)]
pub struct JumpCall {
    pub template: String,
}

impl JumpCall {
    fn with_offset(&self, offset: &str) -> String {
        self.template.replace("$OFFSET", offset)
    }
}

/// An `ifjump` block: any DECORATE jump action used as a condition.
#[derive(Debug, PartialEq)]
pub struct IfJumpNode {
    pub jump: JumpCall,
    pub body: Vec<StateNode>,
    pub else_body: Option<Vec<StateNode>>,
}

/// A `while` loop, lowered through `A_JumpIf` and a loop label.
#[derive(Debug, PartialEq)]
pub struct WhileNode {
    pub condition: String,
    pub loop_id: String,
    pub body: Vec<StateNode>,
    pub else_body: Option<Vec<StateNode>>,
}

/// A `whilejump` loop: a jump action supplies the loop check.
#[derive(Debug, PartialEq)]
pub struct WhileJumpNode {
    pub jump: JumpCall,
    pub loop_id: String,
    pub body: Vec<StateNode>,
    pub else_body: Option<Vec<StateNode>>,
}

/// A `sometimes N%` block.
#[derive(Debug, PartialEq)]
pub struct SometimesNode {
    pub chance: String,
    pub body: Vec<StateNode>,
}

/// A jump to the end of a parse context.
///
/// Holds the target context handle and the context's running remote state
/// count captured when the skip was created; the emitted offset is the
/// difference between the final count and the captured one.
#[derive(Debug, PartialEq)]
pub struct SkipNode {
    pub ctx: CtxId,
    pub index: u32,
}

pub(crate) fn sum_states(states: &[StateNode]) -> u32 {
    states.iter().map(StateNode::num_states).sum()
}

fn clone_body(states: &[StateNode]) -> Vec<StateNode> {
    states.iter().map(StateNode::clone).collect()
}

impl Clone for StateNode {
    /// Deep copy.
    ///
    /// # Panics
    /// Panics on [`StateNode::Skip`]: a skip is bound to a context that is
    /// only alive during the lowering pass that produced it, so cloning one
    /// (for example by injecting a macro that has already been lowered) is a
    /// programmer error.
    fn clone(&self) -> Self {
        match self {
            Self::Frame(f) => Self::Frame(f.clone()),
            Self::Verbatim(v) => Self::Verbatim(v.clone()),
            Self::Block(b) => Self::Block(clone_body(b)),
            Self::If(n) => Self::If(IfNode {
                condition: n.condition.clone(),
                body: clone_body(&n.body),
                else_body: n.else_body.as_deref().map(clone_body),
            }),
            Self::IfJump(n) => Self::IfJump(IfJumpNode {
                jump: n.jump.clone(),
                body: clone_body(&n.body),
                else_body: n.else_body.as_deref().map(clone_body),
            }),
            Self::While(n) => Self::While(WhileNode {
                condition: n.condition.clone(),
                loop_id: n.loop_id.clone(),
                body: clone_body(&n.body),
                else_body: n.else_body.as_deref().map(clone_body),
            }),
            Self::WhileJump(n) => Self::WhileJump(WhileJumpNode {
                jump: n.jump.clone(),
                loop_id: n.loop_id.clone(),
                body: clone_body(&n.body),
                else_body: n.else_body.as_deref().map(clone_body),
            }),
            Self::Sometimes(n) => Self::Sometimes(SometimesNode {
                chance: n.chance.clone(),
                body: clone_body(&n.body),
            }),
            Self::Skip(_) => panic!(
                "state skips cannot be cloned; macros containing a lowered return \
                 must not be injected again"
            ),
        }
    }
}

impl StateNode {
    /// The number of target states this node emits.
    pub fn num_states(&self) -> u32 {
        match self {
            Self::Frame(_) | Self::Skip(_) => 1,
            Self::Verbatim(v) => v.states,
            Self::Block(body) => sum_states(body),
            Self::If(n) => match &n.else_body {
                Some(e) => sum_states(&n.body) + sum_states(e) + 3,
                None => sum_states(&n.body) + 2,
            },
            Self::IfJump(n) => match &n.else_body {
                Some(e) => sum_states(&n.body) + sum_states(e) + 3,
                None => sum_states(&n.body) + 3,
            },
            Self::While(n) => match &n.else_body {
                Some(e) => sum_states(&n.body) + sum_states(e) + 4,
                None => sum_states(&n.body) + 3,
            },
            Self::WhileJump(n) => match &n.else_body {
                Some(e) => sum_states(&n.body) + sum_states(e) + 4,
                None => sum_states(&n.body) + 4,
            },
            Self::Sometimes(n) => sum_states(&n.body) + 2,
        }
    }

    /// Whether this state may open a Spawn label without misbehaving at
    /// runtime. Only a frame with a concrete sprite and frame qualifies.
    pub fn spawn_safe(&self) -> bool {
        match self {
            Self::Frame(f) => f.spawn_safe(),
            _ => false,
        }
    }

    /// Mutable access to the inner state containers, for modifier recursion.
    pub(crate) fn state_containers(&mut self) -> SmallVec<[&mut Vec<StateNode>; 2]> {
        let mut out: SmallVec<[&mut Vec<StateNode>; 2]> = SmallVec::new();
        match self {
            Self::Frame(_) | Self::Verbatim(_) | Self::Skip(_) => {}
            Self::Block(body) | Self::Sometimes(SometimesNode { body, .. }) => out.push(body),
            Self::If(IfNode { body, else_body, .. })
            | Self::IfJump(IfJumpNode { body, else_body, .. })
            | Self::While(WhileNode { body, else_body, .. })
            | Self::WhileJump(WhileJumpNode { body, else_body, .. }) => {
                out.push(body);
                if let Some(e) = else_body {
                    out.push(e);
                }
            }
        }
        out
    }

    /// Emits this node as DECORATE text.
    pub(crate) fn to_decorate(&self, ctxs: &ContextTree) -> TextNode {
        match self {
            Self::Frame(f) => {
                let mut node = TextNode::new();
                node.add_line(f.text());
                node
            }
            Self::Verbatim(v) => {
                let mut node = TextNode::with_indent(0);
                node.add_line(v.text.clone());
                node
            }
            Self::Block(body) => body_node(body, ctxs),
            Self::If(n) => {
                let mut node = TextNode::new();
                let num_body = sum_states(&n.body);
                if let Some(else_body) = &n.else_body {
                    let num_else = sum_states(else_body);
                    node.add_line(format!(
                        "{ZEROTIC} A_JumpIf({}, {})",
                        n.condition,
                        num_else + 2
                    ));
                    node.add_node(body_node(else_body, ctxs));
                    node.add_line(format!("{ZEROTIC} A_Jump(256, {})", num_body + 1));
                    node.add_node(body_node(&n.body, ctxs));
                    node.add_line(ZEROTIC);
                } else {
                    node.add_line(format!(
                        "{ZEROTIC} A_JumpIf(!({}), {})",
                        n.condition,
                        num_body + 1
                    ));
                    node.add_node(body_node(&n.body, ctxs));
                    node.add_line(ZEROTIC);
                }
                node
            }
            Self::IfJump(n) => {
                let mut node = TextNode::new();
                let num_body = sum_states(&n.body);
                if let Some(else_body) = &n.else_body {
                    let num_else = sum_states(else_body);
                    node.add_line(format!(
                        "{ZEROTIC} {}",
                        n.jump.with_offset(&(num_else + 2).to_string())
                    ));
                    node.add_node(body_node(else_body, ctxs));
                    node.add_line(format!("{ZEROTIC} A_Jump(256, {})", num_body + 1));
                    node.add_node(body_node(&n.body, ctxs));
                    node.add_line(ZEROTIC);
                } else {
                    node.add_line(format!("{ZEROTIC} {}", n.jump.with_offset("2")));
                    node.add_line(format!("{ZEROTIC} A_Jump(256, {})", num_body + 1));
                    node.add_node(body_node(&n.body, ctxs));
                    node.add_line(ZEROTIC);
                }
                node
            }
            Self::While(n) => {
                let mut node = TextNode::new();
                let num_body = sum_states(&n.body);
                if let Some(else_body) = &n.else_body {
                    let num_else = sum_states(else_body);
                    node.add_line(format!(
                        "{ZEROTIC} A_JumpIf({}, {})",
                        n.condition,
                        num_else + 2
                    ));
                    node.add_node(body_node(else_body, ctxs));
                    node.add_line(format!("{ZEROTIC} A_Jump(256, {})", num_body + 2));
                } else {
                    node.add_line(format!(
                        "{ZEROTIC} A_JumpIf(!({}), {})",
                        n.condition,
                        num_body + 2
                    ));
                }
                node.add_line(format!("{}:", n.loop_id));
                node.add_node(body_node(&n.body, ctxs));
                node.add_line(format!(
                    "{ZEROTIC} A_JumpIf({}, {})",
                    n.condition,
                    stringify(&n.loop_id)
                ));
                node.add_line(ZEROTIC);
                node
            }
            Self::WhileJump(n) => {
                let mut node = TextNode::new();
                let num_body = sum_states(&n.body);
                if let Some(else_body) = &n.else_body {
                    let num_else = sum_states(else_body);
                    node.add_line(format!(
                        "{ZEROTIC} {}",
                        n.jump.with_offset(&(num_else + 2).to_string())
                    ));
                    node.add_node(body_node(else_body, ctxs));
                } else {
                    node.add_line(format!("{ZEROTIC} {}", n.jump.with_offset("2")));
                }
                node.add_line(format!("{ZEROTIC} A_Jump(256, {})", num_body + 2));
                node.add_line(format!("{}:", n.loop_id));
                node.add_node(body_node(&n.body, ctxs));
                node.add_line(format!(
                    "{ZEROTIC} {}",
                    n.jump.with_offset(&stringify(&n.loop_id))
                ));
                node.add_line(ZEROTIC);
                node
            }
            Self::Sometimes(n) => {
                let mut node = TextNode::new();
                let num_body = sum_states(&n.body);
                node.add_line(format!(
                    "{ZEROTIC} A_Jump(256-(256*({})/100), {})",
                    n.chance,
                    num_body + 1
                ));
                node.add_node(body_node(&n.body, ctxs));
                node.add_line(ZEROTIC);
                node
            }
            Self::Skip(n) => {
                let mut node = TextNode::new();
                node.add_line(format!(
                    "{ZEROTIC} A_Jump(256, {})",
                    ctxs.remote_num_states(n.ctx) - n.index
                ));
                node
            }
        }
    }
}

fn body_node(states: &[StateNode], ctxs: &ContextTree) -> TextNode {
    let mut node = TextNode::new();
    for state in states {
        node.add_node(state.to_decorate(ctxs));
    }
    node
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn frame(sprite: &str) -> StateNode {
        StateNode::Frame(Frame::new(sprite, "A", 1, Vec::new(), None))
    }

    fn lines(node: &StateNode) -> Vec<String> {
        let ctxs = ContextTree::new("global");
        node.to_decorate(&ctxs)
            .to_string_with_tab(4)
            .lines()
            .map(|l| l.trim().to_string())
            .collect()
    }

    #[test]
    fn frame_counts_one_state() {
        assert_eq!(frame("PISG").num_states(), 1);
    }

    #[test]
    fn if_without_else_adds_two_pad_states() {
        let node = StateNode::If(IfNode {
            condition: "health > 10".to_string(),
            body: vec![frame("PISG")],
            else_body: None,
        });
        assert_eq!(node.num_states(), 3);
        assert_eq!(
            lines(&node),
            vec![
                "TNT1 A 0 A_JumpIf(!(health > 10), 2)",
                "PISG A 1",
                "TNT1 A 0",
            ]
        );
    }

    #[test]
    fn if_with_else_emits_else_branch_first() {
        let node = StateNode::If(IfNode {
            condition: "health > 10".to_string(),
            body: vec![frame("PISG")],
            else_body: Some(vec![StateNode::Frame(Frame::new(
                "PISG",
                "B",
                1,
                Vec::new(),
                None,
            ))]),
        });
        assert_eq!(node.num_states(), 5);
        assert_eq!(
            lines(&node),
            vec![
                "TNT1 A 0 A_JumpIf(health > 10, 3)",
                "PISG B 1",
                "TNT1 A 0 A_Jump(256, 2)",
                "PISG A 1",
                "TNT1 A 0",
            ]
        );
    }

    #[test]
    fn while_emits_loop_label_and_recheck() {
        let node = StateNode::While(WhileNode {
            condition: "health > 0".to_string(),
            loop_id: "_loop_while_0".to_string(),
            body: vec![frame("PAIN")],
            else_body: None,
        });
        assert_eq!(node.num_states(), 4);
        assert_eq!(
            lines(&node),
            vec![
                "TNT1 A 0 A_JumpIf(!(health > 0), 3)",
                "_loop_while_0:",
                "PAIN A 1",
                "TNT1 A 0 A_JumpIf(health > 0, \"_loop_while_0\")",
                "TNT1 A 0",
            ]
        );
    }

    #[test]
    fn while_with_else_counts_four_extra() {
        let node = StateNode::While(WhileNode {
            condition: "1".to_string(),
            loop_id: "_loop_while_1".to_string(),
            body: vec![frame("PAIN")],
            else_body: Some(vec![frame("IDLE")]),
        });
        assert_eq!(node.num_states(), 6);
    }

    #[test]
    fn ifjump_substitutes_the_offset_placeholder() {
        let node = StateNode::IfJump(IfJumpNode {
            jump: JumpCall {
                template: "A_JumpIfTargetCloser(128, $OFFSET)".to_string(),
            },
            body: vec![frame("FIRE")],
            else_body: None,
        });
        assert_eq!(node.num_states(), 4);
        assert_eq!(
            lines(&node),
            vec![
                "TNT1 A 0 A_JumpIfTargetCloser(128, 2)",
                "TNT1 A 0 A_Jump(256, 2)",
                "FIRE A 1",
                "TNT1 A 0",
            ]
        );
    }

    #[test]
    fn whilejump_always_counts_four_extra() {
        let node = StateNode::WhileJump(WhileJumpNode {
            jump: JumpCall {
                template: "A_JumpIfCloser(64, $OFFSET)".to_string(),
            },
            loop_id: "_loop_while_2".to_string(),
            body: vec![frame("CHAS")],
            else_body: None,
        });
        assert_eq!(node.num_states(), 5);
        let out = lines(&node);
        assert_eq!(out[out.len() - 2], "TNT1 A 0 A_JumpIfCloser(64, \"_loop_while_2\")");
    }

    #[test]
    fn sometimes_wraps_body_in_two_states() {
        let node = StateNode::Sometimes(SometimesNode {
            chance: "25".to_string(),
            body: vec![frame("BLUR")],
        });
        assert_eq!(node.num_states(), 3);
        assert_eq!(
            lines(&node)[0],
            "TNT1 A 0 A_Jump(256-(256*(25)/100), 2)"
        );
    }

    #[test]
    fn wildcard_sprites_are_not_spawn_safe() {
        assert!(frame("PISG").spawn_safe());
        assert!(!frame("####").spawn_safe());
        let keep_frame = StateNode::Frame(Frame::new("PISG", "#", 0, Vec::new(), None));
        assert!(!keep_frame.spawn_safe());
    }

    #[test]
    #[should_panic(expected = "state skips cannot be cloned")]
    fn cloning_a_skip_panics() {
        let ctxs = ContextTree::new("global");
        let node = StateNode::Skip(SkipNode {
            ctx: ctxs.root(),
            index: 0,
        });
        let _ = node.clone();
    }
}
