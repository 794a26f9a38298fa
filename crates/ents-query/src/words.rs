//! Built-in words.
//!
//! Overloads are registered in the order they should be tried; the first
//! whose signature matches the stack top wins. Words marked structural are
//! the only ones available in the first `select` pass.

use std::{cmp::Ordering, collections::BTreeMap};

use ents_store::{
    BitField, CompareOp, Component, ComponentDef, ComponentId, Entity, EntityId, EntityStore,
    Filter, Operand, Populate, StoreError, values_equal,
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    error::{QueryError, QueryResult},
    stack::{Args, Binding, FrameKind, QueryStack, Word},
    value::{SType, StackValue, StoreRef},
};

use SType::{
    Any, Bitfield, Component as Com, ComponentAttr, ComponentDef as Def, Entity as Ent,
    EntitySet as Es, Filter as Fil, List, Map as MapT, Value as Val,
};

/// The default word table.
pub fn builtin_words<S: EntityStore + Default>() -> Vec<Word<S>> {
    vec![
        // quoting and bindings
        Word::structural("[", &[], open_list),
        Word::structural("]", &[], close_list),
        Word::structural("{", &[], open_map),
        Word::structural("}", &[], close_map),
        Word::structural("define", &[Any, Val], define),
        Word::structural("let", &[Any, Val], bind_value),
        // stack
        Word::new("swap", &[Any, Any], swap),
        Word::new("dup", &[Any], dup),
        Word::new("drop", &[Any], drop_top),
        Word::new("clear", &[], clear),
        Word::new("rot", &[Any, Any, Any], rot),
        Word::new("gather", &[], gather),
        Word::new("spread", &[List], spread),
        Word::new("eval", &[List], eval),
        // store writes
        Word::new("+", &[Es, List], add_to_store),
        Word::new("+", &[Es, Com], add_to_store),
        Word::new("+", &[Es, Ent], add_to_store),
        Word::new("+", &[Val, Val], add),
        Word::new("+", &[List], add_to_active),
        Word::new("+", &[Com], add_to_active),
        Word::new("+", &[Ent], add_to_active),
        Word::new("-", &[Es, List], remove_from_store),
        Word::new("-", &[Es, Com], remove_from_store),
        Word::new("-", &[Es, Ent], remove_from_store),
        Word::new("-", &[Es, Val], remove_from_store),
        Word::new("-", &[Val, Val], sub),
        Word::new("-", &[List], remove_from_active),
        Word::new("-", &[Com], remove_from_active),
        Word::new("-", &[Ent], remove_from_active),
        // arithmetic and comparison
        Word::new("*", &[Val, Val], mul),
        Word::new("/", &[Val, Val], div),
        Word::new("%", &[Val, Val], rem),
        Word::new("<", &[Val, Val], lt),
        Word::new(">", &[Val, Val], gt),
        Word::new("<=", &[Val, Val], le),
        Word::new(">=", &[Val, Val], ge),
        // filters and logic
        Word::structural("==", &[ComponentAttr, Any], filter_eq),
        Word::structural("==", &[Any, ComponentAttr], filter_eq),
        Word::new("==", &[Any, Any], eq),
        Word::structural("!=", &[ComponentAttr, Any], filter_ne),
        Word::structural("!=", &[Any, ComponentAttr], filter_ne),
        Word::new("!=", &[Any, Any], ne),
        Word::structural("and", &[Fil, Fil], filter_and),
        Word::structural("and", &[Fil, Bitfield], filter_and),
        Word::structural("and", &[Bitfield, Fil], filter_and),
        Word::structural("and", &[Bitfield, Bitfield], filter_and),
        Word::new("and", &[Any, Any], and),
        Word::structural("or", &[Fil, Fil], filter_or),
        Word::structural("or", &[Fil, Bitfield], filter_or),
        Word::structural("or", &[Bitfield, Fil], filter_or),
        Word::structural("or", &[Bitfield, Bitfield], filter_or),
        Word::new("or", &[Any, Any], or),
        Word::structural("not", &[Fil], filter_not),
        Word::structural("not", &[Bitfield], filter_not),
        Word::new("not", &[Any], not),
        // values
        Word::new("size", &[Any], size),
        Word::new("to_str", &[Any], to_str),
        Word::new("concat", &[List, List], concat),
        Word::new("concat", &[Val, Val], concat),
        Word::new("@", &[List, Val], get),
        Word::new("@", &[MapT, Val], get),
        Word::new("@", &[Com, Val], get),
        Word::new("@", &[Val, Val], get),
        Word::new("push", &[List, Any], push),
        Word::new("pop", &[List], pop),
        Word::new("keys", &[MapT], keys),
        Word::new("keys", &[Com], keys),
        Word::new("keys", &[Val], keys),
        // store
        Word::new("!es", &[], create_store),
        Word::new("@es", &[], active_store),
        Word::new("!d", &[Val], register_def),
        Word::new("!d", &[List], register_def),
        Word::new("!d", &[MapT], register_def),
        Word::new("@d", &[Val], get_def),
        Word::new("@d", &[], get_defs),
        Word::new("!c", &[Def, MapT], create_component),
        Word::new("!c", &[Val, MapT], create_component),
        Word::new("!c", &[Def], create_component),
        Word::new("!c", &[Val], create_component),
        Word::new("!e", &[List], create_entity),
        Word::new("!e", &[Val], create_entity),
        Word::structural("!bf", &[List], bit_field),
        Word::structural("!bf", &[Val], bit_field),
        Word::structural("!ca", &[Val], attr_ref),
        Word::new("!fil", &[Fil], apply_filter),
        Word::new("@e", &[List], fetch_entities),
        Word::new("@e", &[Bitfield], fetch_entities),
        Word::new("@e", &[Val], fetch_entities),
        Word::new("@e", &[], fetch_all_entities),
        Word::new("@eid", &[List], entity_ids),
        Word::new("@eid", &[Ent], entity_ids),
        Word::new("@c", &[List, Bitfield], fetch_components),
        Word::new("@c", &[Bitfield], fetch_components),
        Word::new("@c", &[List], fetch_components),
        Word::new("@c", &[Ent], fetch_components),
        Word::new("@c", &[], fetch_all_components),
        Word::new("pluck", &[List, List], pluck),
        Word::new("pluck", &[List, Val], pluck),
        Word::new("pluck", &[Com, Val], pluck),
        Word::new("pluck", &[MapT, Val], pluck),
        Word::new("limit", &[List, Val, Val], limit),
        Word::new("limit", &[List, Val], limit),
        Word::new("select", &[Es, List], select),
        Word::new("select", &[List], select),
    ]
}

// ==================== Helpers ====================

fn unpack<const N: usize>(args: Args) -> QueryResult<[StackValue; N]> {
    let found = args.len();
    <[StackValue; N]>::try_from(args.into_vec()).map_err(|_| QueryError::Arg {
        word: String::new(),
        needed: N,
        found,
    })
}

fn mismatch(word: &str, args: &[&StackValue]) -> QueryError {
    let types: Vec<String> = args.iter().map(|v| v.stype().to_string()).collect();
    QueryError::Stack(format!("`{word}` cannot take [{}]", types.join(", ")))
}

/// A key given as a string or a number.
fn key_of(value: &StackValue) -> Option<String> {
    match value {
        StackValue::Value(Value::String(s)) | StackValue::Quoted(s) => Some(s.clone()),
        StackValue::Value(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn map_to_json(map: &BTreeMap<String, StackValue>) -> Map<String, Value> {
    map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
}

/// Entity ids named by ids, entities or components in a list.
fn ids_of(items: &[StackValue]) -> Vec<EntityId> {
    items
        .iter()
        .filter_map(|item| match item {
            StackValue::Entity(e) => Some(e.id()),
            StackValue::Component(c) => Some(c.entity_id),
            other => other.as_u32(),
        })
        .collect()
}

fn to_filter(value: StackValue) -> Option<Filter> {
    match value {
        StackValue::Filter(f) => Some(f),
        StackValue::Bitfield(bf) => Some(Filter::Defs(bf)),
        _ => None,
    }
}

fn to_operand(value: StackValue) -> Operand {
    match value {
        StackValue::ComponentAttr(attr) => Operand::Attr(attr),
        other => Operand::Value(other.to_json()),
    }
}

/// Build a component from `{ "@d": uri|id, "@e"?: id, ...attrs }`.
fn component_from_json<S: EntityStore>(store: &S, value: &Value) -> QueryResult<Component> {
    let Value::Object(obj) = value else {
        return Err(StoreError::InvalidComponent(format!("expected an object, got {value}")).into());
    };
    let def = obj
        .get("@d")
        .ok_or_else(|| StoreError::InvalidComponent(format!("missing @d in {value}")))?;
    let attrs = obj
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "@e" | "@d"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut com = store.create_component(def, attrs)?;
    com.entity_id = obj
        .get("@e")
        .and_then(Value::as_u64)
        .and_then(|id| EntityId::try_from(id).ok())
        .unwrap_or(0);
    Ok(com)
}

// ==================== Quoting and bindings ====================

fn open_list<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    vm.open_frame(FrameKind::List, None);
    Ok(())
}

fn close_list<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    if vm.frame_kind() != FrameKind::List {
        return Err(QueryError::UnbalancedQuote("]".into()));
    }
    let items = vm.close_frame();
    vm.push_raw(StackValue::List(items));
    Ok(())
}

fn open_map<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    vm.open_frame(FrameKind::Map, None);
    Ok(())
}

fn close_map<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    if vm.frame_kind() != FrameKind::Map {
        return Err(QueryError::UnbalancedQuote("}".into()));
    }
    let items = vm.close_frame();
    let count = items.len();
    let mut map = BTreeMap::new();
    let mut items = items.into_iter();
    while let Some(key) = items.next() {
        let Some(value) = items.next() else {
            return Err(QueryError::Arg {
                word: "}".into(),
                needed: count + 1,
                found: count,
            });
        };
        let key = key_of(&key).ok_or_else(|| mismatch("}", &[&key, &value]))?;
        map.insert(key, value);
    }
    vm.push_raw(StackValue::Map(map));
    Ok(())
}

fn binding_name(word: &str, name: &StackValue, value: &StackValue) -> QueryResult<String> {
    name.as_str()
        .map(str::to_string)
        .ok_or_else(|| mismatch(word, &[value, name]))
}

/// `value name define`: a list becomes an executable word.
fn define<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [value, name] = unpack(args)?;
    let name = binding_name("define", &name, &value)?;
    let binding = match value {
        StackValue::List(program) => Binding::Exec(program),
        other => Binding::Push(other),
    };
    vm.define_word(name, binding);
    Ok(())
}

/// `value name let`: always push-only.
fn bind_value<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [value, name] = unpack(args)?;
    let name = binding_name("let", &name, &value)?;
    vm.define_word(name, Binding::Push(value));
    Ok(())
}

// ==================== Stack ====================

fn swap<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a, b] = unpack(args)?;
    vm.push_raw(b);
    vm.push_raw(a);
    Ok(())
}

fn dup<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a] = unpack(args)?;
    vm.push_raw(a.clone());
    vm.push_raw(a);
    Ok(())
}

fn drop_top<S: EntityStore + Default>(_: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    Ok(())
}

fn clear<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    vm.take_items();
    Ok(())
}

/// `a b c rot` -> `b c a`
fn rot<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a, b, c] = unpack(args)?;
    vm.push_raw(b);
    vm.push_raw(c);
    vm.push_raw(a);
    Ok(())
}

fn gather<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    let items = vm.take_items();
    vm.push_raw(StackValue::List(items));
    Ok(())
}

fn spread<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [StackValue::List(items)] = unpack(args)? else {
        return Err(QueryError::stack("spread expects a list"));
    };
    for item in items {
        vm.push_raw(item);
    }
    Ok(())
}

fn eval<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [StackValue::List(items)] = unpack(args)? else {
        return Err(QueryError::stack("eval expects a list"));
    };
    vm.exec(items)
}

// ==================== Arithmetic and comparison ====================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

fn arith<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    args: Args,
    op: Arith,
) -> QueryResult<()> {
    let [a, b] = unpack(args)?;

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            Arith::Add => x.checked_add(y),
            Arith::Sub => x.checked_sub(y),
            Arith::Mul => x.checked_mul(y),
            Arith::Div => x.checked_rem(y).filter(|r| *r == 0).and_then(|_| x.checked_div(y)),
            Arith::Rem => x.checked_rem(y),
        };
        if let Some(n) = exact {
            vm.push_raw(StackValue::from(n));
            return Ok(());
        }
    }

    if op == Arith::Add {
        if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
            vm.push_raw(StackValue::string(format!("{x}{y}")));
            return Ok(());
        }
    }

    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return Err(QueryError::Stack(format!("cannot apply {op:?} to {a} and {b}")));
    };
    if matches!(op, Arith::Div | Arith::Rem) && y == 0.0 {
        return Err(QueryError::stack("division by zero"));
    }
    let n = match op {
        Arith::Add => x + y,
        Arith::Sub => x - y,
        Arith::Mul => x * y,
        Arith::Div => x / y,
        Arith::Rem => x % y,
    };
    vm.push_raw(StackValue::number(n));
    Ok(())
}

fn add<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    arith(vm, args, Arith::Add)
}

fn sub<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    arith(vm, args, Arith::Sub)
}

fn mul<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    arith(vm, args, Arith::Mul)
}

fn div<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    arith(vm, args, Arith::Div)
}

fn rem<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    arith(vm, args, Arith::Rem)
}

fn ordering(a: &StackValue, b: &StackValue) -> QueryResult<Ordering> {
    let ord = match (a.as_f64(), b.as_f64(), a.as_str(), b.as_str()) {
        (Some(x), Some(y), _, _) => x.partial_cmp(&y),
        (_, _, Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    };
    ord.ok_or_else(|| QueryError::Stack(format!("cannot compare {a} and {b}")))
}

fn compare<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    args: Args,
    accept: fn(Ordering) -> bool,
) -> QueryResult<()> {
    let [a, b] = unpack(args)?;
    let ord = ordering(&a, &b)?;
    vm.push_raw(StackValue::bool(accept(ord)));
    Ok(())
}

fn lt<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    compare(vm, args, Ordering::is_lt)
}

fn gt<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    compare(vm, args, Ordering::is_gt)
}

fn le<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    compare(vm, args, Ordering::is_le)
}

fn ge<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    compare(vm, args, Ordering::is_ge)
}

// ==================== Filters and logic ====================

fn build_compare<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    args: Args,
    op: CompareOp,
) -> QueryResult<()> {
    let [a, b] = unpack(args)?;
    let filter = Filter::compare(op, to_operand(a), to_operand(b))?;
    vm.push_raw(StackValue::Filter(filter));
    Ok(())
}

fn filter_eq<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    build_compare(vm, args, CompareOp::Eq)
}

fn filter_ne<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    build_compare(vm, args, CompareOp::Ne)
}

fn eq<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a, b] = unpack(args)?;
    vm.push_raw(StackValue::bool(values_equal(&a.to_json(), &b.to_json())));
    Ok(())
}

fn ne<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a, b] = unpack(args)?;
    vm.push_raw(StackValue::bool(!values_equal(&a.to_json(), &b.to_json())));
    Ok(())
}

fn combine<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    args: Args,
    join: fn(Filter, Filter) -> Filter,
) -> QueryResult<()> {
    let [a, b] = unpack(args)?;
    let (Some(a), Some(b)) = (to_filter(a), to_filter(b)) else {
        return Err(QueryError::stack("filters can only combine filters and bitfields"));
    };
    vm.push_raw(StackValue::Filter(join(a, b)));
    Ok(())
}

fn filter_and<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    combine(vm, args, Filter::and)
}

fn filter_or<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    combine(vm, args, Filter::or)
}

fn filter_not<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a] = unpack(args)?;
    let filter = to_filter(a).ok_or_else(|| QueryError::stack("not expects a filter"))?;
    vm.push_raw(StackValue::Filter(filter.negate()));
    Ok(())
}

fn and<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a, b] = unpack(args)?;
    vm.push_raw(StackValue::bool(a.is_truthy() && b.is_truthy()));
    Ok(())
}

fn or<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a, b] = unpack(args)?;
    vm.push_raw(StackValue::bool(a.is_truthy() || b.is_truthy()));
    Ok(())
}

fn not<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a] = unpack(args)?;
    vm.push_raw(StackValue::bool(!a.is_truthy()));
    Ok(())
}

// ==================== Values ====================

fn size<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a] = unpack(args)?;
    let n = match &a {
        StackValue::EntitySet(r) => vm.store(*r)?.size(),
        StackValue::List(items) => items.len(),
        StackValue::Map(map) => map.len(),
        StackValue::Entity(e) => e.size() as usize,
        StackValue::Bitfield(bf) => bf.count() as usize,
        StackValue::Component(c) => c.attrs.len(),
        StackValue::Value(Value::String(s)) | StackValue::Quoted(s) => s.chars().count(),
        StackValue::Value(Value::Array(a)) => a.len(),
        StackValue::Value(Value::Object(o)) => o.len(),
        other => return Err(mismatch("size", &[other])),
    };
    vm.push_raw(StackValue::Value(Value::from(n)));
    Ok(())
}

fn to_str<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a] = unpack(args)?;
    vm.push_raw(StackValue::string(a.to_string()));
    Ok(())
}

fn concat<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let joined = match unpack(args)? {
        [StackValue::List(mut a), StackValue::List(b)] => {
            a.extend(b);
            StackValue::List(a)
        }
        [a, b] => StackValue::string(format!("{a}{b}")),
    };
    vm.push_raw(joined);
    Ok(())
}

/// Index or key lookup. Missing entries yield null.
fn get<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [container, key] = unpack(args)?;
    let found = match &container {
        StackValue::List(items) => key.as_u32().and_then(|i| items.get(i as usize)).cloned(),
        StackValue::Map(map) => key_of(&key).and_then(|k| map.get(&k)).cloned(),
        StackValue::Component(com) => key_of(&key)
            .and_then(|k| component_attr(com, &k))
            .map(StackValue::Value),
        StackValue::Value(value) => match &key {
            StackValue::Value(Value::Number(n)) => n
                .as_u64()
                .and_then(|i| value.get(i as usize))
                .cloned()
                .map(StackValue::Value),
            StackValue::Value(Value::String(k)) => value.get(k).cloned().map(StackValue::Value),
            _ => None,
        },
        _ => return Err(mismatch("@", &[&container, &key])),
    };
    vm.push_raw(found.unwrap_or(StackValue::Value(Value::Null)));
    Ok(())
}

fn push<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [StackValue::List(mut items), item] = unpack(args)? else {
        return Err(QueryError::stack("push expects a list"));
    };
    items.push(item);
    vm.push_raw(StackValue::List(items));
    Ok(())
}

fn pop<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [StackValue::List(mut items)] = unpack(args)? else {
        return Err(QueryError::stack("pop expects a list"));
    };
    let item = items
        .pop()
        .ok_or_else(|| QueryError::stack("pop from an empty list"))?;
    vm.push_raw(StackValue::List(items));
    vm.push_raw(item);
    Ok(())
}

fn keys<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [a] = unpack(args)?;
    let names: Vec<String> = match &a {
        StackValue::Map(map) => map.keys().cloned().collect(),
        StackValue::Component(com) => com.attrs.keys().cloned().collect(),
        StackValue::Value(Value::Object(obj)) => obj.keys().cloned().collect(),
        other => return Err(mismatch("keys", &[other])),
    };
    vm.push_raw(StackValue::List(
        names.into_iter().map(StackValue::string).collect(),
    ));
    Ok(())
}

// ==================== Store ====================

fn create_store<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    let r = vm.create_store();
    vm.push_raw(StackValue::EntitySet(r));
    Ok(())
}

fn active_store<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    let r = vm.active_store()?;
    vm.push_raw(StackValue::EntitySet(r));
    Ok(())
}

fn register_def<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [spec] = unpack(args)?;
    let def = ComponentDef::from_json(&spec.to_json())?;
    let r = vm.active_store()?;
    let def = vm.store_mut(r)?.register(def);
    vm.push_raw(StackValue::ComponentDef(def));
    Ok(())
}

fn get_def<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [key] = unpack(args)?;
    let store = vm.store(vm.active_store()?)?;
    let def = match &key {
        StackValue::Value(Value::String(uri)) => store.get_by_uri(uri),
        other => other.as_u32().and_then(|id| store.get_by_def_id(id)),
    }
    .ok_or_else(|| StoreError::DefNotFound(key.to_string()))?;
    vm.push_raw(StackValue::ComponentDef(def));
    Ok(())
}

fn get_defs<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    let defs = vm.store(vm.active_store()?)?.component_defs();
    vm.push_raw(StackValue::List(
        defs.into_iter().map(StackValue::ComponentDef).collect(),
    ));
    Ok(())
}

/// `def {attrs} !c` or `def !c`, where def is a def, uri or id.
fn create_component<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    args: Args,
) -> QueryResult<()> {
    let (def, attrs) = match args.len() {
        2 => {
            let [def, attrs] = unpack(args)?;
            let StackValue::Map(attrs) = attrs else {
                return Err(mismatch("!c", &[&def, &attrs]));
            };
            (def, map_to_json(&attrs))
        }
        _ => {
            let [def] = unpack(args)?;
            (def, Map::new())
        }
    };
    let key = match def {
        StackValue::ComponentDef(def) => Value::from(def.id()),
        other => other.to_json(),
    };

    let mut doc = attrs;
    doc.insert("@d".into(), key);
    let store = vm.store(vm.active_store()?)?;
    let com = component_from_json(store, &Value::Object(doc))?;
    vm.push_raw(StackValue::Component(com));
    Ok(())
}

fn create_entity<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [arg] = unpack(args)?;
    let entity = match arg {
        StackValue::List(items) => {
            let mut entity = Entity::new(0);
            for item in items {
                match item {
                    StackValue::Component(com) => entity.add_component(com),
                    item @ (StackValue::Map(_) | StackValue::Value(Value::Object(_))) => {
                        let store = vm.store(vm.active_store()?)?;
                        entity.add_component(component_from_json(store, &item.to_json())?);
                    }
                    other => return Err(mismatch("!e", &[&other])),
                }
            }
            entity
        }
        other => Entity::new(
            other
                .as_u32()
                .ok_or_else(|| mismatch("!e", &[&other]))?,
        ),
    };
    vm.push_raw(StackValue::Entity(entity));
    Ok(())
}

fn stage<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    r: StoreRef,
    items: Vec<StackValue>,
) -> QueryResult<()> {
    let mut batch = Vec::new();
    let mut entities = Vec::new();
    {
        let store = vm.store(r)?;
        for item in items {
            match item {
                StackValue::Component(com) => batch.push(com),
                StackValue::Entity(e) => entities.push(e),
                StackValue::Value(v @ Value::Object(_)) => batch.push(component_from_json(store, &v)?),
                map @ StackValue::Map(_) => batch.push(component_from_json(store, &map.to_json())?),
                other => return Err(mismatch("+", &[&other])),
            }
        }
    }

    let store = vm.store_mut(r)?;
    let (components, added_entities) = (batch.len(), entities.len());
    store.begin_changes();
    for entity in entities {
        store.add_entity(entity)?;
    }
    store.add_components(batch)?;
    store.apply_updates();
    debug!(?r, components, entities = added_entities, "added to entity set");
    Ok(())
}

fn unstage<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    r: StoreRef,
    items: Vec<StackValue>,
) -> QueryResult<()> {
    let store = vm.store_mut(r)?;
    store.begin_changes();
    let mut ids: Vec<ComponentId> = Vec::new();
    let mut marked = 0;
    for item in items {
        match item {
            StackValue::Component(com) => ids.extend(com.id()),
            StackValue::Entity(e) => marked += store.remove_entity(e.id()),
            other => match other.as_u32() {
                Some(eid) => marked += store.remove_entity(eid),
                None => return Err(mismatch("-", &[&other])),
            },
        }
    }
    marked += store.remove_components(ids);
    store.apply_remove_changes();
    debug!(?r, components = marked, "removed from entity set");
    Ok(())
}

fn into_items(value: StackValue) -> Vec<StackValue> {
    match value {
        StackValue::List(items) => items,
        other => vec![other],
    }
}

/// `es x +`: add to an explicit store, leaving the store on the stack.
fn add_to_store<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [StackValue::EntitySet(r), items] = unpack(args)? else {
        return Err(QueryError::stack("+ expects an entity set"));
    };
    stage(vm, r, into_items(items))?;
    vm.push_raw(StackValue::EntitySet(r));
    Ok(())
}

fn add_to_active<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [items] = unpack(args)?;
    let r = vm.active_store()?;
    stage(vm, r, into_items(items))
}

fn remove_from_store<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    args: Args,
) -> QueryResult<()> {
    let [StackValue::EntitySet(r), items] = unpack(args)? else {
        return Err(QueryError::stack("- expects an entity set"));
    };
    unstage(vm, r, into_items(items))?;
    vm.push_raw(StackValue::EntitySet(r));
    Ok(())
}

fn remove_from_active<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    args: Args,
) -> QueryResult<()> {
    let [items] = unpack(args)?;
    let r = vm.active_store()?;
    unstage(vm, r, into_items(items))
}

/// `[uris] !bf`, `uri !bf`, or `all !bf` for the match-all field.
fn bit_field<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [arg] = unpack(args)?;
    let bf = if arg.as_str() == Some("all") {
        BitField::all()
    } else {
        let keys: Vec<Value> = into_items(arg).iter().map(StackValue::to_json).collect();
        vm.store(vm.active_store()?)?.resolve_bit_field(&keys)
    };
    vm.push_raw(StackValue::Bitfield(bf));
    Ok(())
}

fn attr_ref<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [arg] = unpack(args)?;
    let text = arg.as_str().ok_or_else(|| mismatch("!ca", &[&arg]))?;
    let attr = vm.store(vm.active_store()?)?.attr_ref(text)?;
    vm.push_raw(StackValue::ComponentAttr(attr));
    Ok(())
}

/// Run a filter against the active store, leaving the matching entity ids.
fn apply_filter<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [StackValue::Filter(filter)] = unpack(args)? else {
        return Err(QueryError::stack("!fil expects a filter"));
    };
    let ids = vm.store(vm.active_store()?)?.apply_filter(&filter)?;
    vm.push_raw(StackValue::List(ids.into_iter().map(StackValue::from).collect()));
    Ok(())
}

fn fetch<S: EntityStore>(store: &S, ids: &[EntityId]) -> Vec<StackValue> {
    ids.iter()
        .filter_map(|&id| store.get_entity(id, Populate::All))
        .map(StackValue::Entity)
        .collect()
}

/// `[ids] @e` and `bf @e` leave a list; `id @e` leaves the entity, or
/// nothing when it does not exist.
fn fetch_entities<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let [arg] = unpack(args)?;
    let store = vm.store(vm.active_store()?)?;
    let out = match arg {
        StackValue::List(items) => Some(StackValue::List(fetch(store, &ids_of(&items)))),
        StackValue::Bitfield(bf) => Some(StackValue::List(fetch(store, &store.match_entities(&bf)))),
        StackValue::Value(Value::String(uri)) => {
            let bf = store.resolve_bit_field(&[Value::String(uri)]);
            Some(StackValue::List(fetch(store, &store.match_entities(&bf))))
        }
        other => {
            let id = other.as_u32().ok_or_else(|| mismatch("@e", &[&other]))?;
            store.get_entity(id, Populate::All).map(StackValue::Entity)
        }
    };
    if let Some(out) = out {
        vm.push_raw(out);
    }
    Ok(())
}

fn fetch_all_entities<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, _: Args) -> QueryResult<()> {
    let store = vm.store(vm.active_store()?)?;
    let all: Vec<StackValue> = store.entities().map(StackValue::Entity).collect();
    vm.push_raw(StackValue::List(all));
    Ok(())
}

fn entity_ids<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let out = match unpack(args)? {
        [StackValue::Entity(e)] => StackValue::from(e.id()),
        [StackValue::List(items)] => {
            StackValue::List(ids_of(&items).into_iter().map(StackValue::from).collect())
        }
        [other] => return Err(mismatch("@eid", &[&other])),
    };
    vm.push_raw(out);
    Ok(())
}

/// Components by def field and/or entities, ordered by entity then def.
fn fetch_components<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    args: Args,
) -> QueryResult<()> {
    let store = vm.store(vm.active_store()?)?;
    let coms = match args.len() {
        2 => {
            let [StackValue::List(items), StackValue::Bitfield(bf)] = unpack(args)? else {
                return Err(QueryError::stack("@c expects a list and a bitfield"));
            };
            store.match_components(&bf, Some(&ids_of(&items)))
        }
        _ => match unpack(args)? {
            [StackValue::Bitfield(bf)] => store.match_components(&bf, None),
            [StackValue::List(items)] => {
                store.match_components(&BitField::all(), Some(&ids_of(&items)))
            }
            [StackValue::Entity(e)] => e.components().cloned().collect(),
            [other] => return Err(mismatch("@c", &[&other])),
        },
    };
    vm.push_raw(StackValue::List(
        coms.into_iter().map(StackValue::Component).collect(),
    ));
    Ok(())
}

fn fetch_all_components<S: EntityStore + Default>(
    vm: &mut QueryStack<'_, S>,
    _: Args,
) -> QueryResult<()> {
    let store = vm.store(vm.active_store()?)?;
    let coms = store.match_components(&BitField::all(), None);
    vm.push_raw(StackValue::List(
        coms.into_iter().map(StackValue::Component).collect(),
    ));
    Ok(())
}

/// Attribute of a component; `@e`/`@d` name the reserved fields and a key
/// starting with `/` is a JSON pointer.
fn component_attr(com: &Component, key: &str) -> Option<Value> {
    match key {
        "@e" => Some(Value::from(com.entity_id)),
        "@d" => Some(Value::from(com.def_id)),
        k if k.starts_with('/') => com.pointer(k).cloned(),
        k => com.get(k).cloned(),
    }
}

fn pluck_one(item: &StackValue, key: &str) -> Option<StackValue> {
    match item {
        StackValue::Component(com) => component_attr(com, key).map(StackValue::Value),
        StackValue::Map(map) => map.get(key).cloned(),
        StackValue::Entity(e) if key == "@e" => Some(StackValue::from(e.id())),
        StackValue::Value(Value::Object(obj)) => obj.get(key).cloned().map(StackValue::Value),
        _ => None,
    }
}

/// `[items] key pluck` leaves the values found; `[items] [keys] pluck`
/// leaves one map per item.
fn pluck<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let out = match unpack(args)? {
        [StackValue::List(items), StackValue::List(keys)] => {
            let keys: Vec<String> = keys.iter().filter_map(key_of).collect();
            StackValue::List(
                items
                    .iter()
                    .map(|item| {
                        StackValue::Map(
                            keys.iter()
                                .filter_map(|k| pluck_one(item, k).map(|v| (k.clone(), v)))
                                .collect(),
                        )
                    })
                    .collect(),
            )
        }
        [StackValue::List(items), key] => {
            let key = key_of(&key).ok_or_else(|| mismatch("pluck", &[&key]))?;
            StackValue::List(items.iter().filter_map(|item| pluck_one(item, &key)).collect())
        }
        [item, key] => {
            let k = key_of(&key).ok_or_else(|| mismatch("pluck", &[&item, &key]))?;
            pluck_one(&item, &k).unwrap_or(StackValue::Value(Value::Null))
        }
    };
    vm.push_raw(out);
    Ok(())
}

/// `[items] count limit` or `[items] offset count limit`.
fn limit<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let (items, offset, count) = match args.len() {
        3 => {
            let [StackValue::List(items), offset, count] = unpack(args)? else {
                return Err(QueryError::stack("limit expects a list"));
            };
            (items, offset.as_u32(), count.as_u32())
        }
        _ => {
            let [StackValue::List(items), count] = unpack(args)? else {
                return Err(QueryError::stack("limit expects a list"));
            };
            (items, Some(0), count.as_u32())
        }
    };
    let (Some(offset), Some(count)) = (offset, count) else {
        return Err(QueryError::stack("limit expects non-negative integers"));
    };
    vm.push_raw(StackValue::List(
        items
            .into_iter()
            .skip(offset as usize)
            .take(count as usize)
            .collect(),
    ));
    Ok(())
}

/// `[program] select` or `es [program] select`: results are pushed
/// individually.
fn select<S: EntityStore + Default>(vm: &mut QueryStack<'_, S>, args: Args) -> QueryResult<()> {
    let (r, program) = match args.len() {
        2 => {
            let [StackValue::EntitySet(r), StackValue::List(program)] = unpack(args)? else {
                return Err(QueryError::stack("select expects an entity set and a list"));
            };
            (r, program)
        }
        _ => {
            let [StackValue::List(program)] = unpack(args)? else {
                return Err(QueryError::stack("select expects a list"));
            };
            (vm.active_store()?, program)
        }
    };
    for value in vm.select(r, program)? {
        vm.push_raw(value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ents_store::EntitySet;
    use serde_json::json;

    use super::*;

    fn store() -> EntitySet {
        let mut es = EntitySet::new();
        es.import_json(&json!({
            "defs": [
                ["/component/title", ["text"]],
                ["/component/status", ["is"]],
                "/component/tag"
            ],
            "components": [
                {"@e": 1, "@d": "/component/title", "text": "first"},
                {"@e": 1, "@d": "/component/status", "is": "active"},
                {"@e": 2, "@d": "/component/title", "text": "second"},
                {"@e": 2, "@d": "/component/tag"},
                {"@e": 3, "@d": "/component/title", "text": "third"},
                {"@e": 3, "@d": "/component/status", "is": "done"}
            ]
        }))
        .unwrap();
        es
    }

    fn run(es: &mut EntitySet, text: &str) -> Vec<Value> {
        let mut vm = QueryStack::with_store(es);
        vm.run(text).unwrap();
        vm.items().iter().map(StackValue::to_json).collect()
    }

    #[test]
    fn test_stack_words() {
        let mut es = EntitySet::new();
        assert_eq!(run(&mut es, "1 2 swap"), vec![json!(2), json!(1)]);
        assert_eq!(run(&mut es, "1 dup"), vec![json!(1), json!(1)]);
        assert_eq!(run(&mut es, "1 2 drop"), vec![json!(1)]);
        assert_eq!(run(&mut es, "1 2 3 rot"), vec![json!(2), json!(3), json!(1)]);
        assert_eq!(run(&mut es, "1 2 gather"), vec![json!([1, 2])]);
        assert_eq!(run(&mut es, "[ 1 2 ] spread"), vec![json!(1), json!(2)]);
        assert_eq!(run(&mut es, "[ 1 2 + ] eval"), vec![json!(3)]);
        assert!(run(&mut es, "1 2 clear").is_empty());
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let mut es = EntitySet::new();
        assert_eq!(run(&mut es, "7 2 -"), vec![json!(5)]);
        assert_eq!(run(&mut es, "7 2 /"), vec![json!(3.5)]);
        assert_eq!(run(&mut es, "8 2 /"), vec![json!(4)]);
        assert_eq!(run(&mut es, "7 2 %"), vec![json!(1)]);
        assert_eq!(run(&mut es, "1.5 2 *"), vec![json!(3)]);
        assert_eq!(run(&mut es, "1 2 <"), vec![json!(true)]);
        assert_eq!(run(&mut es, "b a <="), vec![json!(false)]);
        assert_eq!(run(&mut es, "1 1.0 =="), vec![json!(true)]);
        assert_eq!(run(&mut es, "1 0 and 1 0 or"), vec![json!(false), json!(true)]);

        let mut vm = QueryStack::with_store(&mut es);
        assert!(matches!(vm.run("1 0 /"), Err(QueryError::Stack(_))));
    }

    #[test]
    fn test_value_words() {
        let mut es = EntitySet::new();
        assert_eq!(run(&mut es, "[ 1 2 3 ] size"), vec![json!(3)]);
        assert_eq!(run(&mut es, "[ a b ] 1 @"), vec![json!("b")]);
        assert_eq!(run(&mut es, "{ a 1 } a @"), vec![json!(1)]);
        assert_eq!(run(&mut es, "[ 1 ] [ 2 ] concat"), vec![json!([1, 2])]);
        assert_eq!(run(&mut es, "[ 1 ] 2 push"), vec![json!([1, 2])]);
        assert_eq!(run(&mut es, "[ 1 2 ] pop"), vec![json!([1]), json!(2)]);
        assert_eq!(run(&mut es, "{ b 1 a 2 } keys"), vec![json!(["a", "b"])]);
        assert_eq!(run(&mut es, "12 to_str"), vec![json!("12")]);
    }

    #[test]
    fn test_fetch_entities() {
        let mut es = store();
        let out = run(&mut es, "2 @e @eid");
        assert_eq!(out, vec![json!(2)]);

        let out = run(&mut es, "99 @e");
        assert!(out.is_empty());

        let out = run(&mut es, "/component/status !bf @e @eid");
        assert_eq!(out, vec![json!([1, 3])]);

        let out = run(&mut es, "[ 3 1 ] @e @eid");
        assert_eq!(out, vec![json!([3, 1])]);
    }

    #[test]
    fn test_fetch_components_and_pluck() {
        let mut es = store();
        let out = run(&mut es, "/component/title !bf @c text pluck");
        assert_eq!(out, vec![json!(["first", "second", "third"])]);

        let out = run(&mut es, "[ 3 ] /component/title !bf @c [ @e text ] pluck");
        assert_eq!(out, vec![json!([{"@e": 3, "text": "third"}])]);

        let out = run(&mut es, "[ 1 ] @c size");
        assert_eq!(out, vec![json!(2)]);

        let out = run(&mut es, "@c 1 4 limit size");
        assert_eq!(out, vec![json!(4)]);
    }

    #[test]
    fn test_filters() {
        let mut es = store();
        let out = run(&mut es, "/component/status#/is !ca active == !fil");
        assert_eq!(out, vec![json!([1])]);

        let out = run(&mut es, "done /component/status#is !ca == /component/tag !bf or !fil");
        assert_eq!(out, vec![json!([2, 3])]);

        let out = run(&mut es, "/component/status !bf not !fil");
        assert_eq!(out, vec![json!([2])]);

        let mut vm = QueryStack::with_store(&mut es);
        let err = vm.run("/component/nope#/x !ca").unwrap_err();
        assert!(matches!(err, QueryError::Store(StoreError::DefNotFound(_))));
    }

    #[test]
    fn test_defs_and_components() {
        let mut es = EntitySet::new();
        let out = run(
            &mut es,
            "[ /component/note [ body ] ] !d drop /component/note { body hi } !c + @e @eid",
        );
        assert_eq!(out, vec![json!([1])]);
        assert_eq!(es.size(), 1);

        let out = run(&mut es, "/component/note @d @d");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["uri"], json!("/component/note"));

        let mut vm = QueryStack::with_store(&mut es);
        let err = vm.run("/component/missing @d").unwrap_err();
        assert!(matches!(err, QueryError::Store(StoreError::DefNotFound(_))));
    }

    #[test]
    fn test_add_and_remove_through_stack() {
        let mut es = store();
        run(&mut es, "[ { @d /component/tag @e 1 } ] +");
        assert_eq!(es.get_entity(1, true).unwrap().size(), 3);

        run(&mut es, "1 @e -");
        assert!(!es.has_entity(1));

        run(&mut es, "@es 2 -");
        assert!(!es.has_entity(2));
        assert_eq!(es.size(), 1);
    }

    #[test]
    fn test_each_write_word_starts_a_change_cycle() {
        let mut es = store();
        run(&mut es, "1 @e -");
        run(&mut es, "@es 2 -");

        let ents: Vec<_> = es.entity_changes().removed().collect();
        assert_eq!(ents, vec![2]);
        assert_eq!(es.entity_changes().len(), 1);
        assert_eq!(es.component_changes().removed().count(), 2);
        assert!(es.component_changes().removed().all(|id| id.entity_id == 2));

        run(&mut es, "[ { @d /component/tag @e 3 } ] +");
        assert_eq!(es.entity_changes().op(&3), Some(ents_store::ChangeSetOp::Update));
        assert_eq!(es.component_changes().removed().count(), 0);
    }

    #[test]
    fn test_local_entity_sets() {
        let mut es = store();
        let out = run(
            &mut es,
            "!es [ /component/note !d drop [ { @d /component/note @e 5 } ] + @es size ] select",
        );
        assert_eq!(out, vec![json!(1)]);

        // the host store is untouched
        assert_eq!(es.size(), 3);
        assert!(es.get_by_uri("/component/note").is_none());
    }
}
