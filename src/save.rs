/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Save state registration.
//!
//! Devices register their mutable state while starting. A [StateSnapshot] captures the values of
//! all registered items and can be serialized with any `serde` format.
use core::cell::Cell;
use core::fmt;
use std::collections::BTreeMap;
use std::rc::Rc;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

#[cfg(feature = "serde")] use serde::{Serialize, Deserialize};

use crate::error::{ConfigError, StateError};
use crate::memory::MemoryShare;

/// A registered piece of device state.
#[derive(Clone)]
pub enum StateItem {
    U8(Rc<Cell<u8>>),
    U16(Rc<Cell<u16>>),
    U32(Rc<Cell<u32>>),
    U64(Rc<Cell<u64>>),
    I32(Rc<Cell<i32>>),
    I64(Rc<Cell<i64>>),
    Bool(Rc<Cell<bool>>),
    Block(MemoryShare),
}

/// A captured value of a [StateItem].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StateValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    Bool(bool),
    Block(Vec<u8>),
}

/// Values of all registered items by their full names: `"{tag}/{name}"`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateSnapshot {
    pub items: BTreeMap<String, StateValue>,
}

macro_rules! impl_state_item {
    ($($ty:ty => $variant:ident),*) => {$(
        impl From<Rc<Cell<$ty>>> for StateItem {
            #[inline]
            fn from(cell: Rc<Cell<$ty>>) -> Self {
                StateItem::$variant(cell)
            }
        }

        impl From<&Rc<Cell<$ty>>> for StateItem {
            #[inline]
            fn from(cell: &Rc<Cell<$ty>>) -> Self {
                StateItem::$variant(Rc::clone(cell))
            }
        }
    )*};
}

impl_state_item!(u8 => U8, u16 => U16, u32 => U32, u64 => U64, i32 => I32, i64 => I64, bool => Bool);

impl From<MemoryShare> for StateItem {
    fn from(share: MemoryShare) -> Self {
        StateItem::Block(share)
    }
}

impl From<&MemoryShare> for StateItem {
    fn from(share: &MemoryShare) -> Self {
        StateItem::Block(share.clone())
    }
}

impl StateItem {
    pub fn kind(&self) -> &'static str {
        match self {
            StateItem::U8(..) => "u8",
            StateItem::U16(..) => "u16",
            StateItem::U32(..) => "u32",
            StateItem::U64(..) => "u64",
            StateItem::I32(..) => "i32",
            StateItem::I64(..) => "i64",
            StateItem::Bool(..) => "bool",
            StateItem::Block(..) => "block",
        }
    }

    pub fn value(&self) -> StateValue {
        match self {
            StateItem::U8(cell) => StateValue::U8(cell.get()),
            StateItem::U16(cell) => StateValue::U16(cell.get()),
            StateItem::U32(cell) => StateValue::U32(cell.get()),
            StateItem::U64(cell) => StateValue::U64(cell.get()),
            StateItem::I32(cell) => StateValue::I32(cell.get()),
            StateItem::I64(cell) => StateValue::I64(cell.get()),
            StateItem::Bool(cell) => StateValue::Bool(cell.get()),
            StateItem::Block(share) => StateValue::Block(share.to_vec()),
        }
    }

    fn check(&self, name: &str, value: &StateValue) -> Result<(), StateError> {
        match (self, value) {
            (StateItem::Block(share), StateValue::Block(data)) if share.len() != data.len() => {
                Err(StateError::SizeMismatch { name: name.into(), expected: share.len(), found: data.len() })
            }
            _ if self.kind() != value.kind() => {
                Err(StateError::KindMismatch { name: name.into(), expected: self.kind(), found: value.kind() })
            }
            _ => Ok(())
        }
    }

    fn apply(&self, value: &StateValue) {
        match (self, value) {
            (StateItem::U8(cell), &StateValue::U8(v)) => cell.set(v),
            (StateItem::U16(cell), &StateValue::U16(v)) => cell.set(v),
            (StateItem::U32(cell), &StateValue::U32(v)) => cell.set(v),
            (StateItem::U64(cell), &StateValue::U64(v)) => cell.set(v),
            (StateItem::I32(cell), &StateValue::I32(v)) => cell.set(v),
            (StateItem::I64(cell), &StateValue::I64(v)) => cell.set(v),
            (StateItem::Bool(cell), &StateValue::Bool(v)) => cell.set(v),
            (StateItem::Block(share), StateValue::Block(data)) => share.copy_from_slice(0, data),
            _ => {}
        }
    }
}

impl fmt::Debug for StateItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateItem({:?})", self.value())
    }
}

impl StateValue {
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::U8(..) => "u8",
            StateValue::U16(..) => "u16",
            StateValue::U32(..) => "u32",
            StateValue::U64(..) => "u64",
            StateValue::I32(..) => "i32",
            StateValue::I64(..) => "i64",
            StateValue::Bool(..) => "bool",
            StateValue::Block(..) => "block",
        }
    }
}

/// The registry of all save state items of a machine.
#[derive(Debug, Default)]
pub struct SaveRegistry {
    items: BTreeMap<String, StateItem>,
}

impl SaveRegistry {
    pub fn new() -> Self {
        SaveRegistry::default()
    }

    /// Register `item` as `"{tag}/{name}"`.
    pub fn register<I: Into<StateItem>>(&mut self, tag: &str, name: &str, item: I) -> Result<(), ConfigError> {
        let full = format!("{}/{}", tag, name);
        if self.items.contains_key(&full) {
            return Err(ConfigError::DuplicateSaveItem(full))
        }
        let item = item.into();
        trace!("save item `{}`: {}", full, item.kind());
        self.items.insert(full, item);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item=&str> {
        self.items.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&StateItem> {
        self.items.get(name)
    }

    /// Capture the current values of all items.
    pub fn snapshot(&self) -> StateSnapshot {
        let items = self.items.iter().map(|(name, item)| (name.clone(), item.value())).collect();
        StateSnapshot { items }
    }

    /// Restore all items from `snapshot`.
    ///
    /// The snapshot is verified before any item is modified: it must contain exactly the
    /// registered items with matching kinds and sizes.
    pub fn restore(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        if let Some(name) = snapshot.items.keys().find(|name| !self.items.contains_key(*name)) {
            return Err(StateError::UnknownItem(name.clone()))
        }
        for (name, item) in self.items.iter() {
            match snapshot.items.get(name) {
                Some(value) => item.check(name, value)?,
                None => return Err(StateError::MissingItem(name.clone()))
            }
        }
        for (name, item) in self.items.iter() {
            if let Some(value) = snapshot.items.get(name) {
                item.apply(value);
            }
        }
        Ok(())
    }
}
