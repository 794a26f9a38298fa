#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::missing_fields_in_debug)]

//! ents-query - stack-based query language over entity sets
//!
//! Programs are whitespace-separated tokens evaluated left to right on a
//! stack. Literals are pushed; names of words pop their arguments, do
//! something, and push results.
//!
//! # Example
//!
//! ```
//! use ents_query::SelectExt;
//! use ents_store::EntitySet;
//! use serde_json::json;
//!
//! let mut es = EntitySet::new();
//! es.import_json(&json!({
//!     "defs": [["/component/title", ["text"]]],
//!     "components": [{"@e": 1, "@d": "/component/title", "text": "buy milk"}]
//! }))
//! .unwrap();
//!
//! let out = es.select("/component/title !bf @c text pluck").unwrap();
//! assert_eq!(out[0].to_json(), json!(["buy milk"]));
//! ```
//!
//! # Words
//!
//! | word | effect |
//! |------|--------|
//! | `[ ]` `{ }` | quote a list / map |
//! | `define` `let` | bind a name on the current frame |
//! | `!bf` `!ca` | build a def bitfield / attribute reference |
//! | `==` `!=` `and` `or` `not` | compare, or build filters from attribute references |
//! | `@e` `@c` `@eid` `pluck` `limit` | fetch and shape records |
//! | `!d` `!c` `!e` `+` `-` | define, build, add and remove records |
//! | `select` | run a quoted program in two passes |

mod error;
mod select;
mod stack;
mod token;
mod value;
mod words;

pub use error::{QueryError, QueryResult};
pub use select::{SelectExt, query, select};
pub use stack::{Args, Binding, MAX_EXEC_DEPTH, QueryStack, Word, WordFn};
pub use token::{Token, TokenKind, Tokenizer, parse_program, tokenize};
pub use value::{SType, StackValue, StoreRef};
pub use words::builtin_words;
