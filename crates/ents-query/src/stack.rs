//! The query stack VM.
//!
//! Programs are sequences of [`StackValue`]s consumed left to right. A
//! string naming a word runs that word; anything else is pushed.
//!
//! # Frames
//!
//! The VM keeps an arena of frames linked to their parent by index. The root
//! frame is created with the VM; `[` and `{` open quoting frames whose tokens
//! accumulate as data until the matching `]`/`}`, and `select` opens a frame
//! per pass. Bindings made by `define`/`let` live on the frame that made
//! them and are visible to every frame below it.
//!
//! # Dispatch
//!
//! Words are kept in an ordered table. Every entry with a matching name is
//! tried in registration order and the first whose type signature matches
//! the top of the stack wins:
//!
//! ```text
//! ==  [ComponentAttr, Any] -> filter
//! ==  [Any, ComponentAttr] -> filter
//! ==  [Any, Any]           -> bool
//! ```
//!
//! In structural-only mode (the first `select` pass) only structural entries
//! are tried. A word with none that fits is pushed by name and runs in the
//! second pass.

use std::fmt;

use ents_store::{EntitySet, EntityStore};
use hashbrown::HashMap;
use serde_json::Value;
use smallvec::SmallVec;
use tracing::trace;

use crate::{
    error::{QueryError, QueryResult},
    token::parse_program,
    value::{SType, StackValue, StoreRef},
    words,
};

/// Arguments popped for a word, bottom-most first.
pub type Args = SmallVec<[StackValue; 4]>;

/// A word handler.
pub type WordFn<S> = for<'a, 'b> fn(&'a mut QueryStack<'b, S>, Args) -> QueryResult<()>;

/// One overload of a word.
pub struct Word<S: EntityStore> {
    pub name: &'static str,
    /// Required types, bottom-most first; the last entry is the stack top.
    pub sig: &'static [SType],
    pub handler: WordFn<S>,
    /// Available during the first select pass.
    pub structural: bool,
}

impl<S: EntityStore> Word<S> {
    pub fn new(name: &'static str, sig: &'static [SType], handler: WordFn<S>) -> Self {
        Self {
            name,
            sig,
            handler,
            structural: false,
        }
    }

    pub fn structural(name: &'static str, sig: &'static [SType], handler: WordFn<S>) -> Self {
        Self {
            structural: true,
            ..Self::new(name, sig, handler)
        }
    }
}

impl<S: EntityStore> fmt::Debug for Word<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Word({} {:?})", self.name, self.sig)
    }
}

/// What a bound name does when it is encountered.
#[derive(Clone, Debug, PartialEq)]
pub enum Binding {
    /// Push the value.
    Push(StackValue),
    /// Run the values as a program.
    Exec(Vec<StackValue>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Root,
    List,
    Map,
    Select,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    items: Vec<StackValue>,
    parent: Option<usize>,
    bindings: HashMap<String, Binding>,
    store: Option<StoreRef>,
}

impl Frame {
    fn new(kind: FrameKind, parent: Option<usize>, store: Option<StoreRef>) -> Self {
        Self {
            kind,
            items: Vec::new(),
            parent,
            bindings: HashMap::new(),
            store,
        }
    }
}

/// How deep bound programs and `eval` bodies may nest.
pub const MAX_EXEC_DEPTH: usize = 128;

/// The query VM.
///
/// Borrows an optional host store for its lifetime; stores created with
/// `!es` are owned by the VM.
pub struct QueryStack<'s, S: EntityStore = EntitySet> {
    host: Option<&'s mut S>,
    locals: Vec<S>,
    frames: Vec<Frame>,
    current: usize,
    words: Vec<Word<S>>,
    structural_only: bool,
    exec_depth: usize,
}

impl<S: EntityStore + Default> Default for QueryStack<'_, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'s, S: EntityStore + Default> QueryStack<'s, S> {
    /// A VM with no host store. Store words fail until `!es` creates one.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A VM whose active store is `store`.
    pub fn with_store(store: &'s mut S) -> Self {
        Self::build(Some(store))
    }

    fn build(host: Option<&'s mut S>) -> Self {
        let store = host.is_some().then_some(StoreRef::Host);
        Self {
            host,
            locals: Vec::new(),
            frames: vec![Frame::new(FrameKind::Root, None, store)],
            current: 0,
            words: words::builtin_words(),
            structural_only: false,
            exec_depth: 0,
        }
    }

    /// Tokenize and run a complete program.
    pub fn run(&mut self, text: &str) -> QueryResult<()> {
        self.push_values(parse_program(text))?;
        match self.frame().kind {
            FrameKind::List => Err(QueryError::UnbalancedQuote("[".into())),
            FrameKind::Map => Err(QueryError::UnbalancedQuote("{".into())),
            FrameKind::Root | FrameKind::Select => Ok(()),
        }
    }

    /// Push (and run) each value in order.
    pub fn push_values(&mut self, values: impl IntoIterator<Item = StackValue>) -> QueryResult<()> {
        for value in values {
            self.push(value)?;
        }
        Ok(())
    }

    /// Run a bound program or list body one nesting level deeper.
    pub fn exec(&mut self, program: Vec<StackValue>) -> QueryResult<()> {
        if self.exec_depth >= MAX_EXEC_DEPTH {
            return Err(QueryError::stack(format!(
                "programs nested deeper than {MAX_EXEC_DEPTH} levels"
            )));
        }
        self.exec_depth += 1;
        let result = self.push_values(program);
        self.exec_depth -= 1;
        result
    }

    /// Push a value, running it if it names a binding or a word.
    pub fn push(&mut self, value: StackValue) -> QueryResult<()> {
        if let StackValue::Quoted(text) = value {
            // kept marked while the value may still be replayed as code
            let item = if self.is_quoting() || self.structural_only {
                StackValue::Quoted(text)
            } else {
                StackValue::string(text)
            };
            self.push_raw(item);
            return Ok(());
        }

        let StackValue::Value(Value::String(name)) = &value else {
            self.push_raw(value);
            return Ok(());
        };

        if self.is_quoting() {
            if matches!(name.as_str(), "[" | "]" | "{" | "}") {
                return self.dispatch(name);
            }
            self.push_raw(value);
            return Ok(());
        }

        if let Some(binding) = self.find_binding(name).cloned() {
            trace!(name = name.as_str(), "binding");
            return match binding {
                Binding::Push(v) => {
                    self.push_raw(v);
                    Ok(())
                }
                Binding::Exec(program) => self.exec(program),
            };
        }

        if self.has_word(name) {
            return self.dispatch(name);
        }

        self.push_raw(value);
        Ok(())
    }

    /// Push without interpreting.
    pub fn push_raw(&mut self, value: StackValue) {
        self.frame_mut().items.push(value);
    }

    pub fn pop(&mut self) -> QueryResult<StackValue> {
        self.frame_mut().items.pop().ok_or_else(|| QueryError::Arg {
            word: "pop".into(),
            needed: 1,
            found: 0,
        })
    }

    #[must_use]
    pub fn peek(&self) -> Option<&StackValue> {
        self.frame().items.last()
    }

    /// Items of the current frame, bottom first.
    #[must_use]
    pub fn items(&self) -> &[StackValue] {
        &self.frame().items
    }

    pub fn take_items(&mut self) -> Vec<StackValue> {
        std::mem::take(&mut self.frame_mut().items)
    }

    /// JSON rendering of the current frame's items.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Array(self.items().iter().map(StackValue::to_json).collect())
    }

    /// Look a binding up on the current frame, then its ancestors.
    #[must_use]
    pub fn find_binding(&self, name: &str) -> Option<&Binding> {
        let mut idx = Some(self.current);
        while let Some(i) = idx {
            let frame = &self.frames[i];
            if let Some(binding) = frame.bindings.get(name) {
                return Some(binding);
            }
            idx = frame.parent;
        }
        None
    }

    /// Bind `name` on the current frame.
    pub fn define_word(&mut self, name: impl Into<String>, binding: Binding) {
        self.frame_mut().bindings.insert(name.into(), binding);
    }

    /// Append an overload to the word table.
    pub fn add_word(&mut self, word: Word<S>) {
        self.words.push(word);
    }

    /// The store the current frame operates on.
    pub fn active_store(&self) -> QueryResult<StoreRef> {
        let mut idx = Some(self.current);
        while let Some(i) = idx {
            let frame = &self.frames[i];
            if let Some(store) = frame.store {
                return Ok(store);
            }
            idx = frame.parent;
        }
        Err(QueryError::stack("no active entity set"))
    }

    pub fn store(&self, r: StoreRef) -> QueryResult<&S> {
        match r {
            StoreRef::Host => self.host.as_deref(),
            StoreRef::Local(idx) => self.locals.get(idx),
        }
        .ok_or_else(|| QueryError::stack(format!("no entity set {r:?}")))
    }

    pub fn store_mut(&mut self, r: StoreRef) -> QueryResult<&mut S> {
        match r {
            StoreRef::Host => self.host.as_deref_mut(),
            StoreRef::Local(idx) => self.locals.get_mut(idx),
        }
        .ok_or_else(|| QueryError::stack(format!("no entity set {r:?}")))
    }

    /// Create an empty VM-owned store.
    pub fn create_store(&mut self) -> StoreRef {
        self.locals.push(S::default());
        StoreRef::Local(self.locals.len() - 1)
    }

    fn frame(&self) -> &Frame {
        &self.frames[self.current]
    }

    fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frames[self.current]
    }

    fn is_quoting(&self) -> bool {
        matches!(self.frame().kind, FrameKind::List | FrameKind::Map)
    }

    fn has_word(&self, name: &str) -> bool {
        self.words
            .iter()
            .any(|w| w.name == name && (w.structural || !self.structural_only))
    }

    fn dispatch(&mut self, name: &str) -> QueryResult<()> {
        let items = &self.frame().items;
        let depth = items.len();
        let mut min_needed: Option<usize> = None;
        let mut any_fit = false;
        let mut chosen = None;

        for (idx, word) in self.words.iter().enumerate() {
            if word.name != name || (self.structural_only && !word.structural) {
                continue;
            }
            let arity = word.sig.len();
            if arity > depth {
                min_needed = Some(min_needed.map_or(arity, |m| m.min(arity)));
                continue;
            }
            any_fit = true;
            let top = &items[depth - arity..];
            if word.sig.iter().zip(top).all(|(t, v)| t.matches(v)) {
                chosen = Some(idx);
                break;
            }
        }

        let Some(idx) = chosen else {
            if self.structural_only {
                trace!(word = name, "deferred to evaluation pass");
                self.push_raw(StackValue::string(name));
                return Ok(());
            }
            if let (false, Some(needed)) = (any_fit, min_needed) {
                return Err(QueryError::Arg {
                    word: name.to_string(),
                    needed,
                    found: depth,
                });
            }
            let top: Vec<String> = items
                .iter()
                .rev()
                .take(3)
                .map(|v| v.stype().to_string())
                .collect();
            return Err(QueryError::Stack(format!(
                "no overload of `{name}` accepts [{}]",
                top.join(", ")
            )));
        };

        let word = &self.words[idx];
        let (handler, arity) = (word.handler, word.sig.len());
        trace!(word = name, sig = ?word.sig, "dispatch");

        let items = &mut self.frame_mut().items;
        let at = items.len() - arity;
        let args: Args = items.drain(at..).collect();
        handler(self, args)
    }

    // ==================== Frame management ====================

    pub(crate) fn open_frame(&mut self, kind: FrameKind, store: Option<StoreRef>) {
        self.frames
            .push(Frame::new(kind, Some(self.current), store));
        self.current = self.frames.len() - 1;
    }

    /// Close the current frame, returning its items.
    pub(crate) fn close_frame(&mut self) -> Vec<StackValue> {
        if self.current == 0 {
            return Vec::new();
        }
        let frame = self.frames.remove(self.current);
        self.current = frame.parent.unwrap_or(0);
        frame.items
    }

    pub(crate) fn frame_kind(&self) -> FrameKind {
        self.frame().kind
    }

    pub(crate) fn frame_state(&self) -> (usize, usize, bool) {
        (self.frames.len(), self.current, self.structural_only)
    }

    /// Drop frames opened since `frame_state` and restore the mode.
    pub(crate) fn restore_frame_state(&mut self, (len, current, structural_only): (usize, usize, bool)) {
        self.frames.truncate(len);
        self.current = current;
        self.structural_only = structural_only;
    }

    pub(crate) fn set_structural_only(&mut self, on: bool) {
        self.structural_only = on;
    }
}

impl<S: EntityStore> fmt::Debug for QueryStack<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStack")
            .field("frames", &self.frames.len())
            .field("current", &self.current)
            .field("words", &self.words.len())
            .field("local_stores", &self.locals.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn run(text: &str) -> QueryResult<Vec<Value>> {
        let mut vm: QueryStack<'_> = QueryStack::new();
        vm.run(text)?;
        Ok(vm.items().iter().map(StackValue::to_json).collect())
    }

    #[test]
    fn test_unknown_words_are_pushed() {
        assert_eq!(run("hello 1 true").unwrap(), vec![json!("hello"), json!(1), json!(true)]);
    }

    #[test]
    fn test_overload_resolution_order() {
        assert_eq!(run("1 2 +").unwrap(), vec![json!(3)]);
        assert_eq!(run("a b +").unwrap(), vec![json!("ab")]);
        assert_eq!(run("1 1 ==").unwrap(), vec![json!(true)]);
    }

    #[test]
    fn test_arg_error_when_stack_too_shallow() {
        let err = run("1 swap").unwrap_err();
        assert!(
            matches!(err, QueryError::Arg { ref word, needed: 2, found: 1 } if word == "swap"),
            "{err}"
        );
    }

    #[test]
    fn test_stack_error_on_type_mismatch() {
        let err = run("[ 1 ] 3 *").unwrap_err();
        assert!(matches!(err, QueryError::Stack(_)), "{err}");
    }

    #[test]
    fn test_quoting_collects_data() {
        assert_eq!(
            run("[ 1 2 + [ swap ] ]").unwrap(),
            vec![json!([1, 2, "+", ["swap"]])]
        );
        assert_eq!(
            run("{ name bob age 3 }").unwrap(),
            vec![json!({"name": "bob", "age": 3})]
        );
    }

    #[test]
    fn test_unbalanced_brackets() {
        assert!(matches!(run("1 ]"), Err(QueryError::UnbalancedQuote(q)) if q == "]"));
        assert!(matches!(run("[ 1"), Err(QueryError::UnbalancedQuote(q)) if q == "["));
        assert!(matches!(run("[ 1 }"), Err(QueryError::UnbalancedQuote(q)) if q == "}"));
    }

    #[test]
    fn test_define_and_let() {
        assert_eq!(run("[ 1 2 + ] sum define sum sum +").unwrap(), vec![json!(6)]);
        assert_eq!(
            run("[ 1 2 + ] quoted let quoted").unwrap(),
            vec![json!([1, 2, "+"])]
        );
        assert_eq!(run("5 five let five five *").unwrap(), vec![json!(25)]);
    }

    #[test]
    fn test_bindings_visible_through_parent_frames() {
        let mut vm: QueryStack<'_> = QueryStack::new();
        vm.define_word("x", Binding::Push(StackValue::from(7_u32)));
        vm.open_frame(FrameKind::Select, None);
        assert!(vm.find_binding("x").is_some());
        vm.push(StackValue::string("x")).unwrap();
        assert_eq!(vm.close_frame(), vec![StackValue::from(7_u32)]);
        assert!(vm.items().is_empty());
    }

    #[test]
    fn test_runaway_recursion_is_an_error() {
        let mut vm: QueryStack<'_> = QueryStack::new();
        let err = vm.run("[ f ] f define f").unwrap_err();
        assert!(matches!(err, QueryError::Stack(ref msg) if msg.contains("nested")), "{err}");

        let err = vm.run("[ dup eval ] dup eval").unwrap_err();
        assert!(matches!(err, QueryError::Stack(_)), "{err}");

        // the depth counter unwinds, so bounded nesting still runs
        vm.run("clear [ 2 ] two define [ two two * ] four define four").unwrap();
        assert_eq!(vm.to_json(), json!([4]));
    }

    #[test]
    fn test_quoted_brackets_are_text() {
        assert_eq!(run(r#""]" size"#).unwrap(), vec![json!(1)]);
        assert_eq!(run(r#"[ "]" "{" ]"#).unwrap(), vec![json!(["]", "{"])]);
        assert_eq!(run(r#"[ "[" ] eval"#).unwrap(), vec![json!("[")]);
        assert_eq!(run(r#"[ "}" ] close let close close"#).unwrap(), vec![json!(["}"])]);
    }

    #[test]
    fn test_store_words_need_a_store() {
        let err = run("@es").unwrap_err();
        assert!(matches!(err, QueryError::Stack(_)));
    }
}
