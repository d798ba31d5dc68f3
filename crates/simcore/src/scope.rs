//! Lexical scope machinery for the scenario interpreter.
//!
//! Scenario constructs nest (a storyboard holds acts, acts hold maneuvers and
//! events), and each level may bind local names while still referencing
//! outer-scope bindings or globally spawned entities by qualified path. Frames live in a single arena
//! indexed by [`FrameId`]; [`Scope`] handles are cheap shallow copies that
//! share the arena and the per-scenario [`GlobalEnvironment`].

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;

use crate::world::{EntityClassification, EntityKind};

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("cannot resolve {name:?}: not found in scope {scope:?} or any enclosing scope")]
    NotFound { name: String, scope: String },
    #[error("qualified name {name:?} is ambiguous: {matches} scope paths satisfy it")]
    AmbiguousQualifiedName { name: String, matches: usize },
    #[error("entity {0:?} has not been spawned in this scenario")]
    EntityNotSpawned(String),
}

/// Stable index of a frame within the scope arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u32);

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    String(String),
    Number(f64),
    Boolean(bool),
}

/// A spawned scenario entity as declared by the scenario, before any runtime
/// state exists for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioObject {
    pub name: String,
    pub kind: EntityKind,
    pub classification: EntityClassification,
}

/// A named group of entities acting together.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySelection {
    pub name: String,
    pub members: Vec<String>,
}

/// Resolved value bound to a name. Closed set: new construct kinds are added
/// as variants, not by open subclassing.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    ScenarioObject(ScenarioObject),
    EntitySelection(EntitySelection),
    Parameter(ParameterValue),
}

/// Per-scenario shared state: the scenario's base path (for `$(dirname)`
/// substitution) and every entity spawned so far.
#[derive(Debug)]
pub struct GlobalEnvironment {
    pathname: PathBuf,
    entities: HashMap<String, Element>,
}

impl GlobalEnvironment {
    fn new(pathname: PathBuf) -> Self {
        Self {
            pathname,
            entities: HashMap::new(),
        }
    }

    /// Resolve a top-level entity by name.
    pub fn entity_ref(&self, name: &str) -> Result<Element, ScopeError> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| ScopeError::EntityNotSpawned(name.to_string()))
    }

    /// Non-failing existence check.
    pub fn is_added_entity(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn add_entity(&mut self, name: impl Into<String>, element: Element) {
        self.entities.insert(name.into(), element);
    }

    pub fn dirname(&self) -> &Path {
        &self.pathname
    }
}

#[derive(Debug, Default)]
struct EnvironmentFrame {
    /// Empty for the root frame and for anonymous frames.
    name: String,
    parent: Option<FrameId>,
    /// Push-only: later insertions under the same name shadow earlier ones
    /// without removing them.
    bindings: HashMap<String, Vec<Element>>,
    children: Vec<FrameId>,
}

#[derive(Debug)]
struct Environment {
    frames: Vec<EnvironmentFrame>,
    global: GlobalEnvironment,
}

impl Environment {
    fn frame(&self, id: FrameId) -> &EnvironmentFrame {
        &self.frames[id.0 as usize]
    }

    fn frame_mut(&mut self, id: FrameId) -> &mut EnvironmentFrame {
        &mut self.frames[id.0 as usize]
    }

    fn push_frame(&mut self, name: &str, parent: FrameId) -> FrameId {
        let id = FrameId(self.frames.len() as u32);
        self.frames.push(EnvironmentFrame {
            name: name.to_string(),
            parent: Some(parent),
            ..EnvironmentFrame::default()
        });
        self.frame_mut(parent).children.push(id);
        id
    }

    /// Dotted path of frame names from the root, for diagnostics.
    fn qualified_name(&self, id: FrameId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(frame_id) = cursor {
            let frame = self.frame(frame_id);
            if !frame.name.is_empty() {
                names.push(frame.name.as_str());
            }
            cursor = frame.parent;
        }
        names.reverse();
        names.join(".")
    }

    /// Newest binding for `name` in this frame alone.
    fn lookup_local(&self, frame: FrameId, name: &str) -> Option<Element> {
        self.frame(frame)
            .bindings
            .get(name)
            .and_then(|candidates| candidates.last())
            .cloned()
    }

    /// Nearest-enclosing-scope lookup: this frame, then the parent chain.
    fn lookup_unqualified(&self, from: FrameId, name: &str) -> Option<Element> {
        let mut cursor = Some(from);
        while let Some(frame_id) = cursor {
            if let Some(element) = self.lookup_local(frame_id, name) {
                return Some(element);
            }
            cursor = self.frame(frame_id).parent;
        }
        None
    }

    /// Child frames reachable from `from` under the scope name `segment`.
    /// Named children win; anonymous children are transparent and searched
    /// through only when no named child matches.
    fn child_scopes(&self, from: FrameId, segment: &str) -> Vec<FrameId> {
        let mut named = Vec::new();
        for &child in &self.frame(from).children {
            if self.frame(child).name == segment {
                named.push(child);
            }
        }
        if !named.is_empty() {
            return named;
        }
        let mut through_anonymous = Vec::new();
        for &child in &self.frame(from).children {
            if self.frame(child).name.is_empty() {
                through_anonymous.extend(self.child_scopes(child, segment));
            }
        }
        through_anonymous
    }

    /// Collect every element reachable by descending `segments` from `frame`
    /// and then looking up `element_name` locally in the reached frame.
    fn collect_qualified(
        &self,
        frame: FrameId,
        segments: &[&str],
        element_name: &str,
        matches: &mut Vec<Element>,
    ) {
        match segments.split_first() {
            None => {
                if let Some(element) = self.lookup_local(frame, element_name) {
                    matches.push(element);
                }
            }
            Some((segment, rest)) => {
                for child in self.child_scopes(frame, segment) {
                    self.collect_qualified(child, rest, element_name, matches);
                }
            }
        }
    }
}

/// Handle onto one frame of the scope tree. Cloning is shallow: the clone
/// shares the frame arena and global environment with the original.
#[derive(Clone)]
pub struct Scope {
    pub name: String,
    /// Entities the current scope is allowed to act upon.
    pub actors: Vec<String>,
    frame: FrameId,
    env: Rc<RefCell<Environment>>,
}

impl Scope {
    /// Root scope for a freshly loaded scenario. `pathname` is the scenario's
    /// base path, kept for path-substitution syntax.
    pub fn new(pathname: impl Into<PathBuf>) -> Self {
        let env = Environment {
            frames: vec![EnvironmentFrame::default()],
            global: GlobalEnvironment::new(pathname.into()),
        };
        Self {
            name: String::new(),
            actors: Vec::new(),
            frame: FrameId(0),
            env: Rc::new(RefCell::new(env)),
        }
    }

    /// New frame as a child of this scope's frame, sharing the same global
    /// environment. An empty `name` creates an anonymous frame, invisible to
    /// qualified paths but searched through transparently.
    pub fn make_child_scope(&self, name: &str) -> Scope {
        let frame = self.env.borrow_mut().push_frame(name, self.frame);
        Scope {
            name: name.to_string(),
            actors: Vec::new(),
            frame,
            env: Rc::clone(&self.env),
        }
    }

    /// Bind `name` in the current frame. Never overwrites: a repeated insert
    /// shadows the earlier binding for lookups but both remain stored.
    pub fn insert(&self, name: &str, element: Element) {
        self.env
            .borrow_mut()
            .frame_mut(self.frame)
            .bindings
            .entry(name.to_string())
            .or_default()
            .push(element);
    }

    /// Resolve a bare name (nearest enclosing scope wins) or a dotted
    /// qualified path (scope segments descending from this frame, then the
    /// final element name in the reached frame only).
    pub fn find_element(&self, name: &str) -> Result<Element, ScopeError> {
        let env = self.env.borrow();
        let Some((scope_path, element_name)) = name.rsplit_once('.') else {
            return env
                .lookup_unqualified(self.frame, name)
                .ok_or_else(|| ScopeError::NotFound {
                    name: name.to_string(),
                    scope: env.qualified_name(self.frame),
                });
        };

        let segments: Vec<&str> = scope_path.split('.').collect();
        let mut matches = Vec::new();
        env.collect_qualified(self.frame, &segments, element_name, &mut matches);
        match matches.len() {
            0 => Err(ScopeError::NotFound {
                name: name.to_string(),
                scope: env.qualified_name(self.frame),
            }),
            1 => Ok(matches.remove(0)),
            found => Err(ScopeError::AmbiguousQualifiedName {
                name: name.to_string(),
                matches: found,
            }),
        }
    }

    /// Shared per-scenario global environment.
    pub fn global(&self) -> Ref<'_, GlobalEnvironment> {
        Ref::map(self.env.borrow(), |env| &env.global)
    }

    pub fn entity_ref(&self, name: &str) -> Result<Element, ScopeError> {
        self.env.borrow().global.entity_ref(name)
    }

    pub fn is_added_entity(&self, name: &str) -> bool {
        self.env.borrow().global.is_added_entity(name)
    }

    pub fn add_entity(&self, name: impl Into<String>, element: Element) {
        self.env.borrow_mut().global.add_entity(name, element);
    }

    pub fn dirname(&self) -> PathBuf {
        self.env.borrow().global.dirname().to_path_buf()
    }

    /// Dotted path of frame names from the root to this scope's frame.
    pub fn qualified_name(&self) -> String {
        self.env.borrow().qualified_name(self.frame)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("actors", &self.actors)
            .field("frame", &self.frame)
            .finish()
    }
}
