/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
use core::any::{Any, TypeId, type_name};
use core::cell::RefCell;
use core::fmt;
use std::rc::Rc;

/// The capabilities of a single device.
///
/// Each capability is a handle to the device as a trait object (e.g. `dyn ExecuteUnit`)
/// or as its concrete type, keyed by the [TypeId] of the capability type.
#[derive(Default)]
pub struct InterfaceSet {
    entries: Vec<(TypeId, &'static str, Box<dyn Any>)>,
}

impl InterfaceSet {
    pub fn new() -> Self {
        InterfaceSet::default()
    }

    /// Register `handle` as the capability `I`, replacing a previous registration.
    ///
    /// ```
    /// use std::{cell::RefCell, rc::Rc};
    /// use emucore::device::InterfaceSet;
    ///
    /// trait Beeper { fn beep(&mut self) -> u32; }
    /// struct Speaker(u32);
    /// impl Beeper for Speaker { fn beep(&mut self) -> u32 { self.0 += 1; self.0 } }
    ///
    /// let speaker = Rc::new(RefCell::new(Speaker(0)));
    /// let mut set = InterfaceSet::new();
    /// set.add::<dyn Beeper>(speaker.clone());
    /// assert_eq!(set.get::<dyn Beeper>().unwrap().borrow_mut().beep(), 1);
    /// assert!(set.get::<Speaker>().is_none());
    /// ```
    pub fn add<I: ?Sized + 'static>(&mut self, handle: Rc<RefCell<I>>) {
        let id = TypeId::of::<I>();
        let boxed: Box<dyn Any> = Box::new(handle);
        match self.entries.iter_mut().find(|(tid, ..)| *tid == id) {
            Some(entry) => entry.2 = boxed,
            None => self.entries.push((id, type_name::<I>(), boxed))
        }
    }

    pub fn get<I: ?Sized + 'static>(&self) -> Option<Rc<RefCell<I>>> {
        let id = TypeId::of::<I>();
        self.entries.iter()
            .find(|(tid, ..)| *tid == id)
            .and_then(|(.., boxed)| boxed.downcast_ref::<Rc<RefCell<I>>>())
            .cloned()
    }

    pub fn has<I: ?Sized + 'static>(&self) -> bool {
        let id = TypeId::of::<I>();
        self.entries.iter().any(|(tid, ..)| *tid == id)
    }

    /// The type names of the registered capabilities.
    pub fn names(&self) -> impl Iterator<Item=&'static str> + '_ {
        self.entries.iter().map(|&(_, name, _)| name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for InterfaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Counter {
        fn count(&mut self) -> u32;
    }

    trait Named {
        fn name(&self) -> &str;
    }

    struct Dev(u32);

    impl Counter for Dev {
        fn count(&mut self) -> u32 {
            self.0 += 1;
            self.0
        }
    }

    #[test]
    fn interface_set() {
        let dev = Rc::new(RefCell::new(Dev(0)));
        let mut set = InterfaceSet::new();
        assert!(set.is_empty());
        set.add(Rc::clone(&dev));
        set.add::<dyn Counter>(dev.clone());
        assert_eq!(set.len(), 2);
        assert!(set.has::<Dev>());
        assert!(set.has::<dyn Counter>());
        assert!(!set.has::<dyn Named>());
        assert!(set.get::<dyn Named>().is_none());
        assert_eq!(set.get::<dyn Counter>().unwrap().borrow_mut().count(), 1);
        assert_eq!(set.get::<Dev>().unwrap().borrow().0, 1);
        set.add::<dyn Counter>(dev);
        assert_eq!(set.len(), 2);
        assert!(set.names().any(|name| name.ends_with("Counter")));
    }
}
