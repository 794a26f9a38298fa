//! Two-pass `select`.
//!
//! The first pass runs only structural words (quoting, bindings, filter
//! construction) so that a program's shape is settled before anything
//! touches the store. The second pass replays the result with every word
//! enabled; each filter left by the first pass is executed in place.

use ents_store::{EntitySet, EntityStore};
use tracing::debug;

use crate::{
    error::{QueryError, QueryResult},
    stack::{FrameKind, QueryStack},
    token::parse_program,
    value::{StackValue, StoreRef},
};

impl<S: EntityStore + Default> QueryStack<'_, S> {
    /// Run `program` against `store` in a fresh frame and return what it
    /// leaves behind. The VM's frames and mode are restored whether or not
    /// the program fails.
    pub fn select(
        &mut self,
        store: StoreRef,
        program: Vec<StackValue>,
    ) -> QueryResult<Vec<StackValue>> {
        let saved = self.frame_state();
        let result = self.run_passes(store, program);
        self.restore_frame_state(saved);
        result
    }

    fn run_passes(
        &mut self,
        store: StoreRef,
        program: Vec<StackValue>,
    ) -> QueryResult<Vec<StackValue>> {
        let depth = self.frame_state().0;

        self.set_structural_only(true);
        self.open_frame(FrameKind::Select, Some(store));
        self.push_values(program)?;
        if self.frame_state().0 != depth + 1 || self.frame_kind() != FrameKind::Select {
            return Err(QueryError::UnbalancedQuote("[".into()));
        }
        let shaped = self.close_frame();
        debug!(?store, values = shaped.len(), "select structural pass");

        self.set_structural_only(false);
        self.open_frame(FrameKind::Select, Some(store));
        for value in shaped {
            let is_filter = matches!(value, StackValue::Filter(_));
            self.push(value)?;
            if is_filter {
                self.push(StackValue::string("!fil"))?;
            }
        }
        let results = self.close_frame();
        debug!(?store, results = results.len(), "select evaluation pass");
        Ok(results)
    }
}

/// Run a select program over `store`.
pub fn select<S: EntityStore + Default>(store: &mut S, program: &str) -> QueryResult<Vec<StackValue>> {
    let mut vm = QueryStack::with_store(store);
    vm.select(StoreRef::Host, parse_program(program))
}

/// Run a plain program over `store` and return the stack.
pub fn query<S: EntityStore + Default>(store: &mut S, text: &str) -> QueryResult<Vec<StackValue>> {
    let mut vm = QueryStack::with_store(store);
    vm.run(text)?;
    Ok(vm.take_items())
}

/// Query methods on [`EntitySet`].
pub trait SelectExt {
    fn select(&mut self, program: &str) -> QueryResult<Vec<StackValue>>;

    fn query(&mut self, text: &str) -> QueryResult<Vec<StackValue>>;
}

impl SelectExt for EntitySet {
    fn select(&mut self, program: &str) -> QueryResult<Vec<StackValue>> {
        select(self, program)
    }

    fn query(&mut self, text: &str) -> QueryResult<Vec<StackValue>> {
        query(self, text)
    }
}
