//! A mostly-concurrent generational mark-sweep collector for the old
//! generation of a managed heap. Marking and sweeping run on a background
//! thread with short stop-the-world checkpoints; latency-sensitive
//! operations suspend the background work cooperatively, and a synchronous
//! full collection takes over when the concurrent cycle cannot keep up.

pub mod flags;
pub mod gc;
pub mod heap;
pub mod mem;
pub mod object;
pub mod os;
pub mod safepoint;

pub use crate::flags::Flags;
pub use crate::gc::cms::{CmsCollector, CollectorState};
pub use crate::gc::{Address, GcReason, Region, Slot};
pub use crate::heap::Heap;
