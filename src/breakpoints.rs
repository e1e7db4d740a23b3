//! Breakpoint/watchpoint router: multiplexes the interpreter's
//! single event callback per address out to every registered observer
//! (device models arming a one-shot watchpoint, the IPC snoop arming a
//! return-address breakpoint, etc).

use crate::cpu::Interpreter;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

type ExecCallback = Box<dyn FnMut(u32)>;
type DataCallback = Box<dyn FnMut(u32, bool)>;

struct Observer<T> {
    id: u64,
    callback: T,
}

pub struct BreakpointRouter {
    interpreter: Rc<RefCell<dyn Interpreter>>,
    exec: HashMap<u32, Vec<Observer<ExecCallback>>>,
    data: HashMap<u32, Vec<Observer<DataCallback>>>,
    next_id: u64,
}

impl BreakpointRouter {
    pub fn new(interpreter: Rc<RefCell<dyn Interpreter>>) -> Self {
        Self { interpreter, exec: HashMap::new(), data: HashMap::new(), next_id: 0 }
    }

    /// Arms an execution breakpoint at `addr`, returning an id usable with
    /// [`Self::remove_exec`].
    pub fn add_exec(&mut self, addr: u32, callback: impl FnMut(u32) + 'static) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let observers = self.exec.entry(addr).or_insert_with(|| {
            self.interpreter.borrow_mut().add_exec_breakpoint(addr);
            Vec::new()
        });
        observers.push(Observer { id, callback: Box::new(callback) });
        id
    }

    pub fn remove_exec(&mut self, addr: u32, id: u64) {
        if let Some(observers) = self.exec.get_mut(&addr) {
            observers.retain(|o| o.id != id);
            if observers.is_empty() {
                self.exec.remove(&addr);
                self.interpreter.borrow_mut().remove_exec_breakpoint(addr);
            }
        }
    }

    pub fn add_watch(&mut self, addr: u32, write: bool, callback: impl FnMut(u32, bool) + 'static) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let observers = self.data.entry(addr).or_insert_with(|| {
            self.interpreter.borrow_mut().add_watchpoint(addr, write);
            Vec::new()
        });
        observers.push(Observer { id, callback: Box::new(callback) });
        id
    }

    pub fn remove_watch(&mut self, addr: u32, write: bool, id: u64) {
        if let Some(observers) = self.data.get_mut(&addr) {
            observers.retain(|o| o.id != id);
            if observers.is_empty() {
                self.data.remove(&addr);
                self.interpreter.borrow_mut().remove_watchpoint(addr, write);
            }
        }
    }

    /// The interpreter calls this (indirectly, through the embedder's glue)
    /// when execution reaches an armed address.
    pub fn dispatch_exec(&mut self, addr: u32) {
        if let Some(observers) = self.exec.get_mut(&addr) {
            for observer in observers.iter_mut() {
                (observer.callback)(addr);
            }
        }
    }

    pub fn dispatch_data(&mut self, addr: u32, is_write: bool) {
        if let Some(observers) = self.data.get_mut(&addr) {
            for observer in observers.iter_mut() {
                (observer.callback)(addr, is_write);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Signal;
    use std::cell::Cell;
    use std::rc::Rc;

    struct FakeInterpreter {
        exec_registered: Vec<u32>,
    }
    impl Interpreter for FakeInterpreter {
        fn step(&mut self, _quantum: u32) -> Signal {
            Signal::Continue
        }
        fn add_exec_breakpoint(&mut self, addr: u32) {
            self.exec_registered.push(addr);
        }
        fn remove_exec_breakpoint(&mut self, addr: u32) {
            self.exec_registered.retain(|&a| a != addr);
        }
        fn add_watchpoint(&mut self, _addr: u32, _write: bool) {}
        fn remove_watchpoint(&mut self, _addr: u32, _write: bool) {}
    }

    #[test]
    fn fan_out_to_multiple_observers_and_deregister_on_empty() {
        let interp = Rc::new(RefCell::new(FakeInterpreter { exec_registered: Vec::new() }));
        let mut router = BreakpointRouter::new(interp.clone());
        let hits = Rc::new(Cell::new(0));
        let h1 = hits.clone();
        let h2 = hits.clone();
        let id1 = router.add_exec(0x1000, move |_| h1.set(h1.get() + 1));
        let id2 = router.add_exec(0x1000, move |_| h2.set(h2.get() + 1));
        assert_eq!(interp.borrow().exec_registered, vec![0x1000]);

        router.dispatch_exec(0x1000);
        assert_eq!(hits.get(), 2);

        router.remove_exec(0x1000, id1);
        router.remove_exec(0x1000, id2);
        assert!(interp.borrow().exec_registered.is_empty());
    }
}
