//! DECORATE class assembly: actors, labels, properties, user variables.

use indexmap::IndexSet;

use crate::{
    ast::UserVarType,
    context::{ContextTree, CtxId},
    state::{Frame, StateNode, Verbatim},
    text::{TextNode, stringify},
};

/// Handle of an actor inside the program's actor arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId(u32);

impl ActorId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("actor arena overflow"))
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A named ordered sequence of states.
#[derive(Debug)]
pub struct Label {
    pub name: String,
    pub states: Vec<StateNode>,
}

impl Label {
    fn to_decorate(&self, ctxs: &ContextTree) -> TextNode {
        // Leftover from the removed function feature: label names starting
        // with F_ are emitted with a leading underscore.
        let name = if self.name.starts_with("F_") {
            format!("_{}", self.name)
        } else {
            self.name.clone()
        };

        let mut node = TextNode::new();
        node.add_line(format!("{name}:"));
        for state in &self.states {
            node.add_node(state.to_decorate(ctxs));
        }
        node
    }
}

/// A property of a DECORATE class.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub value: String,
}

/// Array size of a user variable; zero-sized means scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserVarSize {
    Scalar,
    Fixed(usize),
}

/// The lowered initial value of a user variable.
#[derive(Debug, Clone)]
pub enum UserVarValue {
    Value(String),
    Array(Vec<String>),
}

/// A user variable declaration on an actor.
#[derive(Debug, Clone)]
pub struct UserVar {
    pub name: String,
    pub var_type: UserVarType,
    pub size: UserVarSize,
    pub init: Option<UserVarValue>,
}

fn user_var_setter(var_type: UserVarType) -> &'static str {
    match var_type {
        UserVarType::Int => "A_SetUserVar",
        UserVarType::Float => "A_SetUserVarFloat",
    }
}

fn user_array_setter(var_type: UserVarType) -> &'static str {
    match var_type {
        UserVarType::Int => "A_SetUserArray",
        UserVarType::Float => "A_SetUserArrayFloat",
    }
}

/// A helper inventory actor, emitted ahead of regular classes.
#[derive(Debug, Clone)]
pub struct Inventory {
    pub name: String,
}

impl Inventory {
    pub(crate) fn to_decorate(&self) -> TextNode {
        let mut node = TextNode::with_indent(0);
        node.add_line(format!(
            "Actor {} : Inventory {{Inventory.MaxAmount 1}}",
            self.name
        ));
        node
    }
}

/// A DECORATE class under construction.
#[derive(Debug)]
pub struct Actor {
    pub name: String,
    pub id: String,
    pub inherit: Option<String>,
    pub replace: Option<String>,
    pub editor_num: Option<i32>,
    pub ctx: CtxId,
    pub labels: Vec<Label>,
    pub properties: Vec<Property>,
    pub flags: IndexSet<String>,
    pub antiflags: IndexSet<String>,
    pub uservars: Vec<UserVar>,
    pub raw: Vec<String>,
    /// Function names inherited down the class chain; functions were removed
    /// from the language, so this stays empty and only preserves the legacy
    /// ordering slot.
    pub all_funcs: Vec<String>,
}

impl Actor {
    pub(crate) fn new(
        name: String,
        id: String,
        inherit: Option<String>,
        replace: Option<String>,
        editor_num: Option<i32>,
        ctx: CtxId,
    ) -> Self {
        Self {
            name,
            id,
            inherit,
            replace,
            editor_num,
            ctx,
            labels: Vec::new(),
            properties: Vec::new(),
            flags: IndexSet::new(),
            antiflags: IndexSet::new(),
            uservars: Vec::new(),
            raw: Vec::new(),
            all_funcs: Vec::new(),
        }
    }

    fn spawn_label_index(&self) -> Option<usize> {
        self.labels
            .iter()
            .position(|l| l.name.eq_ignore_ascii_case("spawn"))
    }

    fn spawn_prelude(&self) -> Vec<StateNode> {
        let mut prelude = Vec::new();
        for var in &self.uservars {
            match &var.init {
                None => {}
                Some(UserVarValue::Value(value)) => {
                    prelude.push(StateNode::Frame(Frame::new(
                        "####",
                        "#",
                        0,
                        Vec::new(),
                        Some(format!(
                            "{}({}, {})",
                            user_var_setter(var.var_type),
                            stringify(&var.name),
                            value
                        )),
                    )));
                }
                Some(UserVarValue::Array(values)) => {
                    for (i, value) in values.iter().enumerate() {
                        prelude.push(StateNode::Frame(Frame::new(
                            "####",
                            "#",
                            0,
                            Vec::new(),
                            Some(format!(
                                "{}({}, {}, {})",
                                user_array_setter(var.var_type),
                                stringify(&var.name),
                                i,
                                value
                            )),
                        )));
                    }
                }
            }
        }
        prelude
    }

    /// Prepares the Spawn label for emission.
    ///
    /// If the actor declares user variables, a Spawn label is created when
    /// missing (`goto Super::Spawn` for inheriting actors, `stop` otherwise)
    /// and the initializer prelude is prepended. If the first state is not
    /// spawn-safe, a zero-tic invisible state is inserted ahead of it.
    pub(crate) fn prepare_spawn_label(&mut self) {
        let mut index = self.spawn_label_index();

        if !self.uservars.is_empty() {
            if index.is_none() {
                let flow = if self.inherit.is_some() {
                    "goto Super::Spawn"
                } else {
                    "stop"
                };
                self.labels.push(Label {
                    name: "Spawn".to_string(),
                    states: vec![StateNode::Verbatim(Verbatim::new(flow))],
                });
                index = Some(self.labels.len() - 1);
            }
            let prelude = self.spawn_prelude();
            let label = &mut self.labels[index.expect("spawn label was just ensured")];
            label.states.splice(0..0, prelude);
        }

        if let Some(index) = index
            && !self.labels[index].states.first().is_some_and(StateNode::spawn_safe)
        {
            log::warn!(
                "Spawn label of class '{}' is not spawn safe: auto-padding with \
                 'TNT1 A 0'. Silence this warning by manually adding a 'TNT1 A 0' \
                 at the start of the Spawn label.",
                self.name
            );
            self.labels[index]
                .states
                .insert(0, StateNode::Frame(Frame::tnt1(0, None)));
        }
    }

    /// The class header: name, inheritance, replacement, editor number.
    pub(crate) fn header(&self) -> String {
        let mut out = self.name.clone();
        if let Some(inherit) = &self.inherit {
            out.push_str(&format!(" : {inherit}"));
        }
        if let Some(replace) = &self.replace {
            out.push_str(&format!(" replaces {replace}"));
        }
        if let Some(num) = self.editor_num {
            out.push_str(&format!(" {num}"));
        }
        out
    }

    /// The top section: properties, user variable declarations, flags,
    /// anti-flags and raw combo lines.
    fn top(&self) -> TextNode {
        if self.properties.is_empty()
            && self.uservars.is_empty()
            && self.flags.is_empty()
            && self.antiflags.is_empty()
            && self.raw.is_empty()
        {
            let mut node = TextNode::with_indent(0);
            node.add_line("    ");
            return node;
        }

        let mut node = TextNode::new();

        let mut properties: Vec<&Property> = self.properties.iter().collect();
        properties.sort_by(|a, b| a.name.cmp(&b.name));
        for property in properties {
            node.add_line(format!("{} {}", property.name, property.value));
        }

        node.add_line("");

        for var in &self.uservars {
            let size = match var.size {
                UserVarSize::Scalar => String::new(),
                UserVarSize::Fixed(n) => format!("[{n}]"),
            };
            node.add_line(format!("var {} {}{};", var.var_type, var.name, size));
        }
        for flag in &self.flags {
            node.add_line(format!("+{flag}"));
        }
        for flag in &self.antiflags {
            node.add_line(format!("-{flag}"));
        }
        for line in &self.raw {
            node.add_line(line.clone());
        }
        node
    }

    fn label_code(&self, ctxs: &ContextTree) -> TextNode {
        let mut node = TextNode::new();
        for label in &self.labels {
            node.add_node(label.to_decorate(ctxs));
        }
        node
    }

    pub(crate) fn to_decorate(&self, ctxs: &ContextTree) -> TextNode {
        let mut node = TextNode::with_indent(0);
        node.add_line(format!("Actor {}", self.header()));
        node.add_line("{");
        node.add_node(self.top());
        if !self.labels.is_empty() {
            let mut states = TextNode::new();
            states.add_line("States {");
            states.add_node(self.label_code(ctxs));
            states.add_line("}");
            node.add_node(states);
        }
        node.add_line("}");
        node
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn actor(name: &str) -> Actor {
        let ctxs = ContextTree::new("global");
        Actor::new(name.to_string(), "x".repeat(30), None, None, None, ctxs.root())
    }

    fn trimmed_lines(actor: &Actor) -> Vec<String> {
        let ctxs = ContextTree::new("global");
        actor
            .to_decorate(&ctxs)
            .to_string_with_tab(4)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    #[test]
    fn header_lists_inheritance_replacement_and_editor_number() {
        let mut a = actor("ZombieTwo");
        a.inherit = Some("Zombieman".to_string());
        a.replace = Some("ShotgunGuy".to_string());
        a.editor_num = Some(3004);
        assert_eq!(a.header(), "ZombieTwo : Zombieman replaces ShotgunGuy 3004");
    }

    #[test]
    fn spawn_safe_label_is_left_alone() {
        let mut a = actor("A");
        a.labels.push(Label {
            name: "Spawn".to_string(),
            states: vec![StateNode::Frame(Frame::new("TNT1", "A", 5, Vec::new(), None))],
        });
        a.prepare_spawn_label();
        assert_eq!(a.labels[0].states.len(), 1);
    }

    #[test]
    fn unsafe_spawn_label_gets_padded() {
        let mut a = actor("A");
        a.labels.push(Label {
            name: "Spawn".to_string(),
            states: vec![
                StateNode::Frame(Frame::new("####", "#", 0, Vec::new(), None)),
                StateNode::Frame(Frame::new("TNT1", "A", 5, Vec::new(), None)),
            ],
        });
        a.prepare_spawn_label();
        assert_eq!(a.labels[0].states.len(), 3);
        assert_eq!(
            a.labels[0].states[0],
            StateNode::Frame(Frame::tnt1(0, None))
        );
    }

    #[test]
    fn uservars_get_a_prelude_and_a_pad() {
        let mut a = actor("A");
        a.uservars.push(UserVar {
            name: "user_shots".to_string(),
            var_type: UserVarType::Int,
            size: UserVarSize::Scalar,
            init: Some(UserVarValue::Value("3".to_string())),
        });
        a.labels.push(Label {
            name: "Spawn".to_string(),
            states: vec![StateNode::Frame(Frame::new("POSS", "A", 10, Vec::new(), None))],
        });
        a.prepare_spawn_label();

        let states = &a.labels[0].states;
        assert_eq!(states.len(), 3);
        // Pad first, then the initializer, then the original state.
        assert_eq!(states[0], StateNode::Frame(Frame::tnt1(0, None)));
        match &states[1] {
            StateNode::Frame(f) => assert_eq!(
                f.action.as_deref(),
                Some("A_SetUserVar(\"user_shots\", 3)")
            ),
            other => panic!("expected prelude frame, got {other:?}"),
        }
    }

    #[test]
    fn uservars_without_spawn_label_create_a_stub() {
        let mut a = actor("A");
        a.inherit = Some("Zombieman".to_string());
        a.uservars.push(UserVar {
            name: "user_mode".to_string(),
            var_type: UserVarType::Float,
            size: UserVarSize::Scalar,
            init: Some(UserVarValue::Value("0.5".to_string())),
        });
        a.prepare_spawn_label();

        assert_eq!(a.labels.len(), 1);
        assert_eq!(a.labels[0].name, "Spawn");
        let lines = trimmed_lines(&a);
        assert!(lines.iter().any(|l| l == "goto Super::Spawn"), "{lines:?}");
        assert!(
            lines
                .iter()
                .any(|l| l == "\"####\" \"#\" 0 A_SetUserVarFloat(\"user_mode\", 0.5)"),
            "{lines:?}"
        );
    }

    #[test]
    fn emission_orders_top_then_states() {
        let mut a = actor("Imp");
        a.properties.push(Property {
            name: "Health".to_string(),
            value: "60".to_string(),
        });
        a.properties.push(Property {
            name: "Damage".to_string(),
            value: "3".to_string(),
        });
        a.flags.insert("NOGRAVITY".to_string());
        a.antiflags.insert("SOLID".to_string());
        a.labels.push(Label {
            name: "Spawn".to_string(),
            states: vec![StateNode::Frame(Frame::new("TROO", "A", 10, Vec::new(), None))],
        });

        let lines = trimmed_lines(&a);
        assert_eq!(
            lines,
            vec![
                "Actor Imp",
                "{",
                "Damage 3",
                "Health 60",
                "+NOGRAVITY",
                "-SOLID",
                "States {",
                "Spawn:",
                "TROO A 10",
                "}",
                "}",
            ]
        );
    }

    #[test]
    fn function_prefixed_labels_are_renamed() {
        let mut a = actor("A");
        a.labels.push(Label {
            name: "F_Old".to_string(),
            states: vec![StateNode::Frame(Frame::new("TNT1", "A", 0, Vec::new(), None))],
        });
        let lines = trimmed_lines(&a);
        assert!(lines.iter().any(|l| l == "_F_Old:"), "{lines:?}");
    }
}
