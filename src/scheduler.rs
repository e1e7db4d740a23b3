//! Round-robin cycle scheduler.
//!
//! Two alarm flavours are kept: one global alarm (interval 1, advanced once
//! per full rotation) and one per-core alarm (interval 1250/5000, advanced
//! once per that core's own quantum).

use crate::cpu::{Interpreter, Signal};
use std::cell::RefCell;
use std::rc::Rc;

struct Alarm {
    period: u32,
    remaining: u32,
    callback: Box<dyn FnMut()>,
}

impl Alarm {
    fn new(period: u32, callback: Box<dyn FnMut()>) -> Self {
        Self { period, remaining: period, callback }
    }

    fn tick(&mut self) {
        if self.remaining <= 1 {
            (self.callback)();
            self.remaining = self.period;
        } else {
            self.remaining -= 1;
        }
    }
}

struct CoreEntry {
    interpreter: Rc<RefCell<dyn Interpreter>>,
    quantum: u32,
    running: bool,
    retired: u64,
    check_interrupts: Box<dyn FnMut()>,
    alarms: Vec<Alarm>,
}

pub struct Scheduler {
    cores: Vec<CoreEntry>,
    global_alarms: Vec<Alarm>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { cores: Vec::new(), global_alarms: Vec::new() }
    }

    /// `check_interrupts` is the embedder's closure that polls this core's
    /// aggregator/processor-interface and injects an exception via the
    /// `CpuCore` handle if one is pending.
    pub fn add(&mut self, interpreter: Rc<RefCell<dyn Interpreter>>, quantum: u32, check_interrupts: impl FnMut() + 'static) -> usize {
        self.cores.push(CoreEntry {
            interpreter,
            quantum,
            running: false,
            retired: 0,
            check_interrupts: Box::new(check_interrupts),
            alarms: Vec::new(),
        });
        self.cores.len() - 1
    }

    pub fn resume(&mut self, core: usize) {
        self.cores[core].running = true;
    }

    pub fn pause(&mut self, core: usize) {
        self.cores[core].running = false;
    }

    pub fn retired(&self, core: usize) -> u64 {
        self.cores[core].retired
    }

    pub fn add_global_alarm(&mut self, period: u32, callback: impl FnMut() + 'static) {
        self.global_alarms.push(Alarm::new(period, Box::new(callback)));
    }

    pub fn add_core_alarm(&mut self, core: usize, period: u32, callback: impl FnMut() + 'static) {
        self.cores[core].alarms.push(Alarm::new(period, Box::new(callback)));
    }

    /// Runs until the running set is empty or a core's quantum returns
    /// [`Signal::Quit`] (cancellation).
    pub fn run(&mut self) -> Signal {
        loop {
            match self.run_rotation() {
                RotationOutcome::Quit => return Signal::Quit,
                RotationOutcome::Idle => return Signal::Continue,
                RotationOutcome::Ran => {}
            }
        }
    }

    /// Runs exactly `n` rotations (one quantum per running core, per
    /// rotation), or until a core quits. Used by scheduler-fairness tests
    /// and by embedders that want to interleave their own bookkeeping
    /// between rotations.
    pub fn run_rotations(&mut self, n: u32) -> Signal {
        for _ in 0..n {
            if self.run_rotation() == RotationOutcome::Quit {
                return Signal::Quit;
            }
        }
        Signal::Continue
    }

    fn run_rotation(&mut self) -> RotationOutcome {
        let mut any_running = false;
        for core in self.cores.iter_mut() {
            if !core.running {
                continue;
            }
            any_running = true;
            (core.check_interrupts)();
            if core.interpreter.borrow_mut().step(core.quantum) == Signal::Quit {
                return RotationOutcome::Quit;
            }
            core.retired += core.quantum as u64;
            for alarm in core.alarms.iter_mut() {
                alarm.tick();
            }
        }
        if !any_running {
            return RotationOutcome::Idle;
        }
        for alarm in self.global_alarms.iter_mut() {
            alarm.tick();
        }
        RotationOutcome::Ran
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(PartialEq, Eq)]
enum RotationOutcome {
    Ran,
    Idle,
    Quit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct NoopInterpreter;
    impl Interpreter for NoopInterpreter {
        fn step(&mut self, _quantum: u32) -> Signal {
            Signal::Continue
        }
        fn add_exec_breakpoint(&mut self, _addr: u32) {}
        fn remove_exec_breakpoint(&mut self, _addr: u32) {}
        fn add_watchpoint(&mut self, _addr: u32, _write: bool) {}
        fn remove_watchpoint(&mut self, _addr: u32, _write: bool) {}
    }

    #[test]
    fn fairness_across_one_rotation() {
        let mut sched = Scheduler::new();
        let quanta = [1000u32, 2000, 500];
        let mut indices = Vec::new();
        for &q in &quanta {
            let interp = Rc::new(RefCell::new(NoopInterpreter));
            let idx = sched.add(interp, q, || {});
            sched.resume(idx);
            indices.push(idx);
        }
        sched.run_rotations(1);
        for (i, &idx) in indices.iter().enumerate() {
            assert_eq!(sched.retired(idx), quanta[i] as u64);
        }
        sched.run_rotations(3);
        for (i, &idx) in indices.iter().enumerate() {
            assert_eq!(sched.retired(idx), quanta[i] as u64 * 4);
        }
    }

    #[test]
    fn global_alarm_fires_once_per_rotation() {
        let mut sched = Scheduler::new();
        let interp = Rc::new(RefCell::new(NoopInterpreter));
        let idx = sched.add(interp, 100, || {});
        sched.resume(idx);
        let fired = Rc::new(Cell::new(0));
        let fired_clone = fired.clone();
        sched.add_global_alarm(1, move || fired_clone.set(fired_clone.get() + 1));
        sched.run_rotations(3);
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn per_core_alarm_advances_only_on_its_own_quantum() {
        let mut sched = Scheduler::new();
        let interp_a = Rc::new(RefCell::new(NoopInterpreter));
        let a = sched.add(interp_a, 10, || {});
        sched.resume(a);
        let interp_b = Rc::new(RefCell::new(NoopInterpreter));
        let b = sched.add(interp_b, 10, || {});
        // b is never resumed: its alarm must never fire.
        let fired_a = Rc::new(Cell::new(0));
        let fired_a_clone = fired_a.clone();
        sched.add_core_alarm(a, 2, move || fired_a_clone.set(fired_a_clone.get() + 1));
        let fired_b = Rc::new(Cell::new(0));
        let fired_b_clone = fired_b.clone();
        sched.add_core_alarm(b, 2, move || fired_b_clone.set(fired_b_clone.get() + 1));
        sched.run_rotations(4);
        assert_eq!(fired_a.get(), 2);
        assert_eq!(fired_b.get(), 0);
    }
}
