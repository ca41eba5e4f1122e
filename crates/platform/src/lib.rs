//! The 64K I/O port space.

mod io;

pub use io::{IoPortSpace, PortIoHandler, PortRangeInfo, OPEN_BUS_PORT};
