//! Parametric class templates and their instantiation memo.

use std::collections::{BTreeMap, BTreeSet};

use ahash::{AHashMap, AHashSet};
use sha2::{Digest, Sha256};

use crate::{
    actor::ActorId,
    ast::{AbstractArraySize, ClassBodyItem, UserVarType},
    error::{CompileError, CompileResult},
    idgen::{IdSource, TEMPLATE_NONCE_LEN},
};

/// Lowercase hex encoding of a digest.
fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Handle of a template inside the program's template arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId(u32);

impl TemplateId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("template arena overflow"))
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// An abstract array slot a derivation must fill.
#[derive(Debug, Clone)]
pub(crate) struct AbstractArray {
    pub size: AbstractArraySize,
    pub var_type: UserVarType,
}

/// A parametric class description.
///
/// The body is kept as unlowered parse data; each fresh instantiation lowers
/// it (plus the derivation's own body) into a new actor through a deferred
/// task, which is what lets templates refer to classes and templates
/// introduced later in the program.
#[derive(Debug)]
pub(crate) struct ClassTemplate {
    pub name: String,
    pub id: String,
    pub inherit: Option<String>,
    pub replace: Option<String>,
    pub editor_num: Option<i32>,
    /// Uppercased group name every derivation joins, when declared.
    pub group: Option<String>,
    pub parameters: Vec<String>,
    pub parse_data: Vec<ClassBodyItem>,
    /// Uppercased abstract label names.
    pub abstract_labels: AHashSet<String>,
    /// Uppercased abstract macro names mapped to their parameter names.
    pub abstract_macros: AHashMap<String, Vec<String>>,
    /// Uppercased abstract array names.
    pub abstract_arrays: AHashMap<String, AbstractArray>,
    /// Memoized instantiations, keyed by the parameter hash.
    pub instances: AHashMap<String, ActorId>,
}

impl ClassTemplate {
    pub fn has_abstract_members(&self) -> bool {
        !self.abstract_labels.is_empty()
            || !self.abstract_macros.is_empty()
            || !self.abstract_arrays.is_empty()
    }

    /// Computes the memo key for one set of derivation inputs.
    ///
    /// Provided names are hashed in sorted order so the digest is stable. A
    /// template with abstract members mixes in a fresh nonce, forcing every
    /// derivation to become its own class.
    pub fn parameter_hash(
        &self,
        ids: &mut IdSource,
        parameter_values: &[String],
        provided_labels: &BTreeSet<String>,
        provided_macros: &BTreeMap<String, usize>,
        provided_arrays: &BTreeMap<String, usize>,
    ) -> String {
        let mut hash = Sha256::new();
        hash.update(self.name.as_bytes());
        hash.update(b"|");
        hash.update(self.id.as_bytes());
        hash.update(b"|");

        if self.has_abstract_members() {
            hash.update(ids.make_id(TEMPLATE_NONCE_LEN).as_bytes());
        } else {
            for value in parameter_values {
                hash.update(value.as_bytes());
                hash.update(b"-");
            }
            hash.update(b"|");
            for name in provided_labels.iter().chain(provided_arrays.keys()) {
                hash.update(name.as_bytes());
                hash.update(b"-");
            }
            hash.update(b"|");
            for (name, arity) in provided_macros {
                hash.update(format!("{arity:#x}").as_bytes());
                hash.update(name.as_bytes());
                hash.update(b"-");
            }
        }

        bytes_to_hex(&hash.finalize())
    }

    /// The generated class name of a derivation with the given memo key.
    pub fn derived_name(&self, hash: &str) -> String {
        format!("{}__deriv_{}", self.name, hash)
    }

    /// Checks that a derivation provides every abstract member with the
    /// declared shape. `location` is the caller context's description.
    pub fn validate_derivation(
        &self,
        location: &str,
        provided_labels: &BTreeSet<String>,
        provided_macros: &BTreeMap<String, usize>,
        provided_arrays: &BTreeMap<String, usize>,
    ) -> CompileResult<()> {
        for label in &self.abstract_labels {
            if !provided_labels.contains(label) {
                return Err(CompileError::at(
                    location,
                    format!(
                        "tried to derive template {}, but abstract label {} does not \
                         have a definition",
                        self.name, label
                    ),
                ));
            }
        }

        for (name, args) in &self.abstract_macros {
            let Some(&arity) = provided_macros.get(name) else {
                return Err(CompileError::at(
                    location,
                    format!(
                        "tried to derive template {}, but abstract macro {} does not \
                         have a definition",
                        self.name, name
                    ),
                ));
            };
            if arity != args.len() {
                return Err(CompileError::at(
                    location,
                    format!(
                        "tried to derive template {}, but abstract macro {} has the \
                         wrong number of arguments: expected {}, got {}",
                        self.name,
                        name,
                        args.len(),
                        arity
                    ),
                ));
            }
        }

        for (name, decl) in &self.abstract_arrays {
            let Some(&size) = provided_arrays.get(name) else {
                return Err(CompileError::at(
                    location,
                    format!(
                        "tried to derive template {}, but abstract array {} is not defined",
                        self.name, name
                    ),
                ));
            };
            if let AbstractArraySize::Fixed(expected) = decl.size
                && expected != size
            {
                return Err(CompileError::at(
                    location,
                    format!(
                        "tried to derive template {}, but abstract array {} has a size \
                         constraint; expected {} array elements, got {}",
                        self.name, name, expected, size
                    ),
                ));
            }
        }

        Ok(())
    }
}
