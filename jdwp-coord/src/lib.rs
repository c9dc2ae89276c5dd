// Controller-side coordination engine for JDWP debuggees
//
// Layers, bottom up:
// - wire: packets, readers, the event loop and the TCP connection
// - engine: suspension bookkeeping, frame pops, trap requests, the event channel
// - session: rendezvous with the controlled process and the test-case driver
//
// The engine talks to the controlled process through the Transport trait;
// a real JVM sits behind JdwpConnection, the in-process simulator behind SimVm.

pub mod connection;
pub mod protocol;
pub mod commands;
pub mod events;
pub mod types;
pub mod reader;
pub mod eventloop;
pub mod vm;
pub mod reftype;
pub mod method;
pub mod eventrequest;
pub mod thread;
pub mod stackframe;
pub mod transport;

pub mod suspension;
pub mod framepop;
pub mod registry;
pub mod channel;

pub mod rendezvous;
pub mod process;
pub mod config;
pub mod driver;
pub mod sim;

pub use channel::EventChannel;
pub use config::{DriverConfig, TestCase};
pub use connection::JdwpConnection;
pub use driver::{CaseReport, DriverOptions, Session, SessionDriver, SessionReport};
pub use eventrequest::{RequestKind, RequestTarget};
pub use events::{Event, EventKind, EventSet};
pub use framepop::{FrameHandle, FramePopCoordinator};
pub use process::{ChildProcess, Debuggee, LaunchSpec};
pub use protocol::{CoordError, CoordResult};
pub use registry::{Filters, RequestKey, RequestRegistry, Tag, WatchRequest};
pub use rendezvous::{Rendezvous, Token};
pub use sim::{ClassDef, Program, SimLaunch, SimProcess, SimVm, Step};
pub use suspension::{SuspensionController, ThreadHandle, ThreadState};
pub use transport::{Command, Reply, Transport};
pub use types::{Location, SuspendPolicy, ThreadId};
