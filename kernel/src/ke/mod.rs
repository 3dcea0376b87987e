// SPDX-License-Identifier: MPL-2.0

//! The nanokernel: IPL, spinlocks, DPCs and timers, dispatcher objects,
//! the scheduler, and RCU.

pub mod cpu;
pub mod dpc;
pub mod event;
pub mod ipl;
pub mod msgqueue;
pub mod mutex;
pub mod object;
pub mod port;
pub mod rcu;
pub mod rwmutex;
pub mod sched;
pub mod semaphore;
pub mod spinlock;
pub mod thread;
pub mod timer;
pub mod wait;

pub use event::Event;
pub use ipl::Ipl;
pub use msgqueue::MsgQueue;
pub use mutex::{Mutex, MutexGuard};
pub use object::Dispatcher;
pub use port::{Port, PortMsg};
pub use rwmutex::RwMutex;
pub use semaphore::Semaphore;
pub use spinlock::{RawSpinlock, SpinLock};
pub use thread::Thread;
pub use timer::Timer;
pub use wait::{wait_multi, wait_one, TIMEOUT_INFINITE};
