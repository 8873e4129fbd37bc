// SPDX-License-Identifier: Apache-2.0 OR MIT
// Lockless in-process logging for the proxy daemon.
//
// Writers push entries into a shared bounded ring; a consumer task drains the
// ring and formats entries to a sink. Writers never block: when the ring is
// full the entry is dropped and counted.

mod facility;
mod logger;
#[macro_use]
mod macros;
mod severity;

pub use facility::Facility;
pub use logger::{LogConsumer, LogEntry, LogRegistry, LogSink, Logger, StderrSink, VecSink};
pub use severity::Severity;
