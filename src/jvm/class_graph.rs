//! Class hierarchy knowledge
//!
//! Joining two object types (when two control flow paths meet) requires finding their nearest
//! common superclass, which in turn requires knowing the superclass chain of both classes. The
//! analysis only ever needs that much of the class graph, so [`ClassHierarchy`] is deliberately
//! narrow.
//!
//! Interfaces are not tracked through the join: just like the JVM verifier, the join of anything
//! involving an interface is `java/lang/Object`.

use crate::jvm::{FieldType, RefType};
use std::collections::{HashMap, HashSet};

pub trait ClassHierarchy {
    /// Superclass of a class, or `None` for `java/lang/Object` and interfaces
    ///
    /// Classes which are not known to the hierarchy are assumed to extend `java/lang/Object`.
    fn superclass(&self, class_name: &str) -> Option<&str>;

    /// Whether the class is an interface
    fn is_interface(&self, class_name: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ClassInfo {
    superclass: Option<String>,
    is_interface: bool,
}

/// Map backed class hierarchy
///
/// A fresh tree already knows about the handful of `java.lang` types that show up implicitly in
/// method bodies (strings, classes, and the throwable hierarchy).
#[derive(Debug, Clone)]
pub struct ClassTree {
    classes: HashMap<String, ClassInfo>,
}

impl ClassTree {
    pub fn new() -> ClassTree {
        let mut tree = ClassTree {
            classes: HashMap::new(),
        };
        tree.classes.insert(
            RefType::OBJECT_NAME.to_owned(),
            ClassInfo {
                superclass: None,
                is_interface: false,
            },
        );
        for (class, superclass) in [
            ("java/lang/String", RefType::OBJECT_NAME),
            ("java/lang/Class", RefType::OBJECT_NAME),
            ("java/lang/Number", RefType::OBJECT_NAME),
            ("java/lang/Integer", "java/lang/Number"),
            ("java/lang/Long", "java/lang/Number"),
            ("java/lang/Float", "java/lang/Number"),
            ("java/lang/Double", "java/lang/Number"),
            (RefType::THROWABLE_NAME, RefType::OBJECT_NAME),
            ("java/lang/Exception", RefType::THROWABLE_NAME),
            ("java/lang/Error", RefType::THROWABLE_NAME),
            ("java/lang/RuntimeException", "java/lang/Exception"),
            ("java/lang/invoke/MethodHandle", RefType::OBJECT_NAME),
            ("java/lang/invoke/MethodType", RefType::OBJECT_NAME),
        ] {
            tree.add_class(class, superclass);
        }
        for interface in ["java/lang/Cloneable", "java/io/Serializable", "java/lang/Comparable"] {
            tree.add_interface(interface);
        }
        tree
    }

    /// Register a class along with its superclass
    pub fn add_class(&mut self, class_name: impl Into<String>, superclass: impl Into<String>) {
        self.classes.insert(
            class_name.into(),
            ClassInfo {
                superclass: Some(superclass.into()),
                is_interface: false,
            },
        );
    }

    pub fn add_interface(&mut self, interface_name: impl Into<String>) {
        self.classes.insert(
            interface_name.into(),
            ClassInfo {
                superclass: None,
                is_interface: true,
            },
        );
    }
}

impl Default for ClassTree {
    fn default() -> Self {
        ClassTree::new()
    }
}

impl ClassHierarchy for ClassTree {
    fn superclass(&self, class_name: &str) -> Option<&str> {
        if class_name == RefType::OBJECT_NAME {
            return None;
        }
        match self.classes.get(class_name) {
            Some(info) => info.superclass.as_deref(),
            None => Some(RefType::OBJECT_NAME),
        }
    }

    fn is_interface(&self, class_name: &str) -> bool {
        self.classes
            .get(class_name)
            .map_or(false, |info| info.is_interface)
    }
}

/// Superclass chain of a class, starting with the class itself
fn ancestors<'h>(hierarchy: &'h dyn ClassHierarchy, class_name: &'h str) -> Vec<&'h str> {
    let mut seen = HashSet::new();
    let mut chain = vec![];
    let mut current = Some(class_name);
    while let Some(class) = current {
        if !seen.insert(class) {
            log::warn!("Cyclic superclass chain through {}", class);
            break;
        }
        chain.push(class);
        current = hierarchy.superclass(class);
    }
    chain
}

/// Nearest common superclass of two classes
pub fn common_superclass(hierarchy: &dyn ClassHierarchy, class1: &str, class2: &str) -> String {
    if class1 == class2 {
        return class1.to_owned();
    }
    if hierarchy.is_interface(class1) || hierarchy.is_interface(class2) {
        return RefType::OBJECT_NAME.to_owned();
    }
    let ancestors1: HashSet<&str> = ancestors(hierarchy, class1).into_iter().collect();
    ancestors(hierarchy, class2)
        .into_iter()
        .find(|class| ancestors1.contains(class))
        .unwrap_or(RefType::OBJECT_NAME)
        .to_owned()
}

/// Least upper bound of two reference types
///
///   - identical types join to themselves
///   - classes join to their nearest common superclass
///   - arrays of references join to arrays of the join of their components
///   - anything else joins to `java/lang/Object`
pub fn join_ref_types(hierarchy: &dyn ClassHierarchy, ref1: &RefType, ref2: &RefType) -> RefType {
    if ref1 == ref2 {
        return ref1.clone();
    }
    match (ref1, ref2) {
        (RefType::Object(class1), RefType::Object(class2)) => {
            RefType::Object(common_superclass(hierarchy, class1, class2))
        }
        _ if ref1.is_array() && ref2.is_array() => {
            match (ref1.component_type(), ref2.component_type()) {
                (Some(FieldType::Ref(comp1)), Some(FieldType::Ref(comp2))) => {
                    let joined = join_ref_types(hierarchy, &comp1, &comp2);
                    RefType::array(FieldType::Ref(joined))
                }
                _ => RefType::object(RefType::OBJECT_NAME),
            }
        }
        _ => RefType::object(RefType::OBJECT_NAME),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::ParseDescriptor;

    fn tree() -> ClassTree {
        let mut tree = ClassTree::new();
        tree.add_class("me/Animal", RefType::OBJECT_NAME);
        tree.add_class("me/Cat", "me/Animal");
        tree.add_class("me/Dog", "me/Animal");
        tree.add_class("me/Puppy", "me/Dog");
        tree.add_interface("me/Pet");
        tree
    }

    #[test]
    fn common_superclasses() {
        let tree = tree();
        assert_eq!(common_superclass(&tree, "me/Cat", "me/Puppy"), "me/Animal");
        assert_eq!(common_superclass(&tree, "me/Dog", "me/Puppy"), "me/Dog");
        assert_eq!(common_superclass(&tree, "me/Cat", "java/lang/String"), "java/lang/Object");
        assert_eq!(common_superclass(&tree, "me/Cat", "me/Pet"), "java/lang/Object");
        assert_eq!(
            common_superclass(&tree, "java/lang/RuntimeException", "java/lang/Error"),
            "java/lang/Throwable"
        );
        assert_eq!(
            common_superclass(&tree, "me/Unknown", "me/Cat"),
            "java/lang/Object",
            "unknown classes extend Object"
        );
    }

    #[test]
    fn array_joins() {
        let tree = tree();
        let parse = |s: &str| RefType::parse(s).unwrap();
        assert_eq!(
            join_ref_types(&tree, &parse("[Lme/Cat;"), &parse("[Lme/Dog;")),
            parse("[Lme/Animal;")
        );
        assert_eq!(
            join_ref_types(&tree, &parse("[[Lme/Cat;"), &parse("[Lme/Dog;")),
            parse("[Ljava/lang/Object;")
        );
        assert_eq!(
            join_ref_types(&tree, &parse("[I"), &parse("[J")),
            parse("Ljava/lang/Object;")
        );
        assert_eq!(
            join_ref_types(&tree, &parse("[I"), &parse("Lme/Cat;")),
            parse("Ljava/lang/Object;")
        );
    }
}
